//! Device information service values (ASCII strings on the edge)

use uuid::Uuid;

use gatelink_proto::{MIN_MTU, gatt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceInfoField {
    AfrVersion,
    BrokerEndpoint,
    Mtu,
    Platform,
    DeviceId,
}

impl DeviceInfoField {
    /// In the order they are read after the session is established
    pub const ALL: [DeviceInfoField; 5] = [
        DeviceInfoField::Mtu,
        DeviceInfoField::Platform,
        DeviceInfoField::DeviceId,
        DeviceInfoField::AfrVersion,
        DeviceInfoField::BrokerEndpoint,
    ];

    pub fn characteristic(self) -> Uuid {
        match self {
            DeviceInfoField::AfrVersion => gatt::AFR_VERSION,
            DeviceInfoField::BrokerEndpoint => gatt::BROKER_ENDPOINT,
            DeviceInfoField::Mtu => gatt::MTU,
            DeviceInfoField::Platform => gatt::PLATFORM,
            DeviceInfoField::DeviceId => gatt::DEVICE_ID,
        }
    }

    pub fn from_characteristic(characteristic: Uuid) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.characteristic() == characteristic)
    }
}

impl std::fmt::Display for DeviceInfoField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeviceInfoField::AfrVersion => "afr-version",
            DeviceInfoField::BrokerEndpoint => "broker-endpoint",
            DeviceInfoField::Mtu => "mtu",
            DeviceInfoField::Platform => "platform",
            DeviceInfoField::DeviceId => "device-id",
        })
    }
}

/// What the edge has told us about itself so far
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub afr_version: Option<String>,
    pub broker_endpoint: Option<String>,
    pub mtu: Option<usize>,
    pub platform: Option<String>,
    pub device_id: Option<String>,
}

impl DeviceInfo {
    /// Record a read value, returning it as text.
    ///
    /// An MTU that does not parse as decimal, or is below the ATT minimum, is
    /// logged and the previous one kept.
    pub fn update(&mut self, field: DeviceInfoField, raw: &[u8]) -> String {
        let value = String::from_utf8_lossy(raw).trim_end_matches('\0').trim().to_string();
        match field {
            DeviceInfoField::AfrVersion => self.afr_version = Some(value.clone()),
            DeviceInfoField::BrokerEndpoint => self.broker_endpoint = Some(value.clone()),
            DeviceInfoField::Platform => self.platform = Some(value.clone()),
            DeviceInfoField::DeviceId => self.device_id = Some(value.clone()),
            DeviceInfoField::Mtu => match value.parse::<usize>() {
                Ok(mtu) if mtu >= MIN_MTU => self.mtu = Some(mtu),
                Ok(mtu) => log::warn!("ignoring device MTU {mtu}, below {MIN_MTU}"),
                Err(e) => log::warn!("ignoring device MTU {value:?}: {e}"),
            },
        }
        value
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
