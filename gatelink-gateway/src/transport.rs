//! Encrypted application transport over the MQTT proxy and network services
//!
//! Active only once the handshake is established. Every payload is AES-CFB8
//! encrypted with the session key and the fixed protocol IV. Anything that
//! does not fit one write goes out over the channel's RXLarge characteristic
//! in `mtu - 3` sized chunks; a chunk shorter than that ends the object, so an
//! exact multiple is closed with an empty write. Inbound large objects work
//! the same way in reverse, driven by reads of TXLarge.

use uuid::Uuid;
use zeroize::Zeroizing;

use gatelink_crypto::{CryptoError, SESSION_IV, aes_cfb8_decrypt, aes_cfb8_encrypt};
use gatelink_proto::{MIN_MTU, ProtocolError, ReassemblyBuffer, ReassemblyState, gatt, max_payload, split};

use crate::link::PendingCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Mqtt,
    Network,
}

impl Channel {
    pub fn service(self) -> Uuid {
        match self {
            Channel::Mqtt => gatt::MQTT_PROXY_SERVICE,
            Channel::Network => gatt::NETWORK_SERVICE,
        }
    }

    pub fn control(self) -> Uuid {
        match self {
            Channel::Mqtt => gatt::MQTT_PROXY_CONTROL,
            Channel::Network => gatt::NETWORK_CONTROL,
        }
    }

    pub fn tx(self) -> Uuid {
        match self {
            Channel::Mqtt => gatt::MQTT_PROXY_TX,
            Channel::Network => gatt::NETWORK_TX,
        }
    }

    pub fn tx_large(self) -> Uuid {
        match self {
            Channel::Mqtt => gatt::MQTT_PROXY_TX_LARGE,
            Channel::Network => gatt::NETWORK_TX_LARGE,
        }
    }

    pub fn rx(self) -> Uuid {
        match self {
            Channel::Mqtt => gatt::MQTT_PROXY_RX,
            Channel::Network => gatt::NETWORK_RX,
        }
    }

    pub fn rx_large(self) -> Uuid {
        match self {
            Channel::Mqtt => gatt::MQTT_PROXY_RX_LARGE,
            Channel::Network => gatt::NETWORK_RX_LARGE,
        }
    }

    /// Channel a TX or TXLarge characteristic belongs to, and whether it is the large one
    pub fn from_tx(characteristic: Uuid) -> Option<(Channel, bool)> {
        [Channel::Mqtt, Channel::Network]
            .into_iter()
            .find_map(|channel| {
                if characteristic == channel.tx() {
                    Some((channel, false))
                } else if characteristic == channel.tx_large() {
                    Some((channel, true))
                } else {
                    None
                }
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session is not established")]
    NotEstablished,

    #[error("session cipher failed: {0}")]
    Cipher(#[from] CryptoError),

    #[error("large object stream is malformed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outcome of feeding one inbound value
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A complete decrypted message
    Message(Channel, Vec<u8>),
    /// More of a large object is pending; issue this read
    Read(PendingCommand),
    Nothing,
}

pub struct SessionTransport {
    key: Option<Zeroizing<Vec<u8>>>,
    mtu: usize,
    mqtt: ReassemblyBuffer,
    network: ReassemblyBuffer,
}

impl SessionTransport {
    pub fn new(mtu: usize) -> Self {
        let mut transport = Self {
            key: None,
            mtu: MIN_MTU,
            mqtt: ReassemblyBuffer::short_chunk(max_payload(MIN_MTU)),
            network: ReassemblyBuffer::short_chunk(max_payload(MIN_MTU)),
        };
        transport.set_mtu(mtu);
        transport
    }

    /// Switch encryption on with the derived session key
    pub fn activate(&mut self, key: &[u8]) {
        self.key = Some(Zeroizing::new(key.to_vec()));
    }

    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }

    /// Forget the key and any partial large objects
    pub fn clear(&mut self) {
        self.key = None;
        self.mqtt.reset();
        self.network.reset();
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn max_payload(&self) -> usize {
        max_payload(self.mtu)
    }

    /// MTUs below the ATT minimum are raised to it
    pub fn set_mtu(&mut self, mtu: usize) {
        if mtu < MIN_MTU {
            log::warn!("MTU {mtu} is below the ATT minimum, using {MIN_MTU}");
        }
        self.mtu = mtu.max(MIN_MTU);
        let max = self.max_payload();
        self.mqtt.set_max_chunk(max);
        self.network.set_max_chunk(max);
    }

    fn buffer(&mut self, channel: Channel) -> &mut ReassemblyBuffer {
        match channel {
            Channel::Mqtt => &mut self.mqtt,
            Channel::Network => &mut self.network,
        }
    }

    /// Encrypt `payload` and return the writes that carry it, in order.
    ///
    /// The scheduler keeps them single-flight, so each chunk only goes out
    /// once the previous write has completed.
    pub fn wrap(&self, channel: Channel, payload: &[u8]) -> Result<Vec<PendingCommand>, TransportError> {
        let key = self.key.as_ref().ok_or(TransportError::NotEstablished)?;
        let encrypted = aes_cfb8_encrypt(payload, key, &SESSION_IV)?;
        let max = self.max_payload();

        if encrypted.len() < max {
            return Ok(vec![PendingCommand::write(
                channel.service(),
                channel.rx(),
                encrypted,
            )]);
        }

        let mut writes: Vec<PendingCommand> = split(&encrypted, max)
            .map(|chunk| PendingCommand::write(channel.service(), channel.rx_large(), chunk.to_vec()))
            .collect();
        if max > 0 && encrypted.len() % max == 0 {
            writes.push(PendingCommand::write(channel.service(), channel.rx_large(), Vec::new()));
        }
        log::debug!(
            "{channel:?}: {} byte object in {} writes",
            encrypted.len(),
            writes.len()
        );
        Ok(writes)
    }

    /// Feed a notification from a TX or TXLarge characteristic
    pub fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) -> Result<Inbound, TransportError> {
        let Some((channel, large)) = Channel::from_tx(characteristic) else {
            return Ok(Inbound::Nothing);
        };
        if !self.is_active() {
            log::warn!("dropping {} bytes on {channel:?} before the session is established", value.len());
            return Ok(Inbound::Nothing);
        }
        if !large {
            return Ok(Inbound::Message(channel, self.unwrap(value)?));
        }

        log::debug!("{channel:?}: large object started");
        self.buffer(channel).begin();
        self.feed_large(channel, value)
    }

    /// Feed the result of a TXLarge read
    pub fn on_read(&mut self, characteristic: Uuid, value: &[u8]) -> Result<Inbound, TransportError> {
        match Channel::from_tx(characteristic) {
            Some((channel, true)) if self.is_active() => self.feed_large(channel, value),
            Some((channel, _)) => {
                log::warn!("dropping {} byte {channel:?} read before the session is established", value.len());
                Ok(Inbound::Nothing)
            }
            None => Ok(Inbound::Nothing),
        }
    }

    fn feed_large(&mut self, channel: Channel, chunk: &[u8]) -> Result<Inbound, TransportError> {
        match self.buffer(channel).feed(chunk) {
            Ok(ReassemblyState::NeedMore) => Ok(Inbound::Read(PendingCommand::read(
                channel.service(),
                channel.tx_large(),
            ))),
            Ok(ReassemblyState::Complete(encrypted)) => {
                log::debug!("{channel:?}: large object of {} bytes complete", encrypted.len());
                Ok(Inbound::Message(channel, self.unwrap(&encrypted)?))
            }
            Err(ProtocolError::NoActiveRead) => {
                log::warn!("dropping {} byte {channel:?} chunk with no active read", chunk.len());
                Ok(Inbound::Nothing)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unwrap(&self, encrypted: &[u8]) -> Result<Vec<u8>, TransportError> {
        let key = self.key.as_ref().ok_or(TransportError::NotEstablished)?;
        Ok(aes_cfb8_decrypt(encrypted, key, &SESSION_IV)?)
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("active", &self.is_active())
            .field("mtu", &self.mtu)
            .finish()
    }
}
