//! btleplug plumbing: adapter lookup, scanning and GATT command execution

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use gatelink_gateway::{Link, LinkError, LinkEvent, Operation, PendingCommand, gatt};

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct EdgeDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the mutual authentication service
    pub is_edge: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, Box<dyn std::error::Error>> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or_else(|| "No Bluetooth adapter found".into())
}

/// Scan for BLE devices
pub async fn scan(adapter: &Adapter, duration_secs: u64) -> Result<Vec<EdgeDevice>, Box<dyn std::error::Error>> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(duration_secs)).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            let is_edge = props.services.contains(&gatt::MUTUAL_AUTH_SERVICE);
            devices.push(EdgeDevice {
                name,
                address,
                rssi: props.rssi,
                is_edge,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

/// Find a device by name/address pattern, or any device advertising the
/// mutual authentication service
pub async fn find_device(
    adapter: &Adapter,
    target: Option<&str>,
    duration_secs: u64,
) -> Result<Peripheral, Box<dyn std::error::Error>> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(duration_secs)).await;

    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_default();
            let addr = peripheral.address().to_string();

            let matches = match target {
                Some(t) => name.contains(t) || addr.contains(t),
                None => props.services.contains(&gatt::MUTUAL_AUTH_SERVICE),
            };

            if matches {
                adapter.stop_scan().await?;
                log::info!("found edge {name} ({addr})");
                return Ok(peripheral);
            }
        }
    }

    adapter.stop_scan().await?;
    Err("No edge device found".into())
}

/// [`Link`] half living inside the session: commands go to the driver,
/// which runs them against btleplug and feeds the outcome back
#[derive(Debug, Clone)]
pub struct BleLink {
    commands: mpsc::UnboundedSender<PendingCommand>,
}

impl BleLink {
    pub fn new(commands: mpsc::UnboundedSender<PendingCommand>) -> Self {
        Self { commands }
    }
}

impl Link for BleLink {
    fn dispatch(&mut self, command: &PendingCommand) -> Result<(), LinkError> {
        self.commands
            .send(command.clone())
            .map_err(|_| LinkError::Disconnected)
    }
}

/// Run one command and describe its completion
pub async fn execute(peripheral: &Peripheral, command: &PendingCommand) -> LinkEvent {
    match run(peripheral, command).await {
        Ok(event) => event,
        Err(error) => {
            log::warn!("{:?} on {} failed: {error}", command.operation, command.characteristic);
            LinkEvent::OperationFailed { error }
        }
    }
}

async fn run(peripheral: &Peripheral, command: &PendingCommand) -> Result<LinkEvent, LinkError> {
    let uuid = command.characteristic;
    let rejected = |e: btleplug::Error| LinkError::Rejected(uuid, e.to_string());

    match command.operation {
        Operation::DiscoverServices => {
            peripheral.discover_services().await.map_err(rejected)?;
            let services = peripheral.services().into_iter().map(|s| s.uuid).collect();
            Ok(LinkEvent::ServicesDiscovered { services })
        }
        Operation::RequestMtu(mtu) => {
            // btleplug negotiates the ATT MTU itself; report the edge's value
            log::debug!("MTU {mtu} requested");
            Ok(LinkEvent::MtuChanged { mtu: mtu as usize })
        }
        Operation::Read => {
            let characteristic = find(peripheral, command.service, uuid)?;
            let value = peripheral.read(&characteristic).await.map_err(rejected)?;
            Ok(LinkEvent::CharacteristicRead {
                characteristic: uuid,
                value,
            })
        }
        Operation::Write => {
            let characteristic = find(peripheral, command.service, uuid)?;
            let payload = command.payload.as_deref().unwrap_or_default();
            peripheral
                .write(&characteristic, payload, WriteType::WithResponse)
                .await
                .map_err(rejected)?;
            Ok(LinkEvent::CharacteristicWritten {
                characteristic: uuid,
            })
        }
        Operation::WriteDescriptor => {
            let characteristic = find(peripheral, command.service, uuid)?;
            let descriptors = characteristic.descriptors.iter().map(|d| d.uuid);
            if !characteristic.descriptors.is_empty() && !has_cccd(descriptors) {
                return Err(LinkError::Rejected(uuid, "no client configuration descriptor".into()));
            }
            peripheral.subscribe(&characteristic).await.map_err(rejected)?;
            Ok(LinkEvent::DescriptorWritten {
                characteristic: uuid,
            })
        }
    }
}

/// Whether the client characteristic configuration descriptor is among `descriptors`
fn has_cccd(mut descriptors: impl Iterator<Item = Uuid>) -> bool {
    descriptors.any(|uuid| uuid == gatt::CCCD_UUID)
}

fn find(peripheral: &Peripheral, service: Uuid, uuid: Uuid) -> Result<Characteristic, LinkError> {
    let characteristics = peripheral.characteristics();
    if !characteristics.iter().any(|c| c.service_uuid == service) {
        return Err(LinkError::ServiceNotFound(service));
    }
    characteristics
        .into_iter()
        .find(|c| c.uuid == uuid && c.service_uuid == service)
        .ok_or(LinkError::CharacteristicNotFound(uuid))
}
