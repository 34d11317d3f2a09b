//! The seam between the gateway state machines and a BLE stack

use uuid::Uuid;

use gatelink_proto::gatt;

use crate::LinkError;

/// Kinds of GATT operation the scheduler can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    /// Enable notifications through the characteristic's CCCD
    WriteDescriptor,
    DiscoverServices,
    RequestMtu(u16),
}

/// One queued link operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub operation: Operation,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: Option<Vec<u8>>,
    /// Dispatches already spent on this command
    pub attempts: u32,
}

impl PendingCommand {
    pub fn read(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(Operation::Read, service, characteristic, None)
    }

    pub fn write(service: Uuid, characteristic: Uuid, payload: Vec<u8>) -> Self {
        Self::new(Operation::Write, service, characteristic, Some(payload))
    }

    pub fn enable_notifications(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(
            Operation::WriteDescriptor,
            service,
            characteristic,
            Some(gatt::ENABLE_NOTIFICATION.to_vec()),
        )
    }

    pub fn discover_services() -> Self {
        Self::new(Operation::DiscoverServices, Uuid::nil(), Uuid::nil(), None)
    }

    pub fn request_mtu(mtu: u16) -> Self {
        Self::new(Operation::RequestMtu(mtu), Uuid::nil(), Uuid::nil(), None)
    }

    fn new(operation: Operation, service: Uuid, characteristic: Uuid, payload: Option<Vec<u8>>) -> Self {
        Self {
            operation,
            service,
            characteristic,
            payload,
            attempts: 0,
        }
    }

    /// MQTT proxy traffic has its own queue, everything else shares one
    pub fn queue(&self) -> Queue {
        if self.service == gatt::MQTT_PROXY_SERVICE {
            Queue::Mqtt
        } else {
            Queue::Network
        }
    }

    /// Whether `event` is the completion of this command
    pub fn completed_by(&self, event: &LinkEvent) -> bool {
        match (self.operation, event) {
            (Operation::Read, LinkEvent::CharacteristicRead { characteristic, .. })
            | (Operation::Write, LinkEvent::CharacteristicWritten { characteristic })
            | (Operation::WriteDescriptor, LinkEvent::DescriptorWritten { characteristic }) => {
                *characteristic == self.characteristic
            }
            (Operation::DiscoverServices, LinkEvent::ServicesDiscovered { .. })
            | (Operation::RequestMtu(_), LinkEvent::MtuChanged { .. })
            | (_, LinkEvent::OperationFailed { .. }) => true,
            _ => false,
        }
    }
}

/// Priority queues arbitrated by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Handshake, network config and device info
    Network,
    Mqtt,
}

/// Everything a BLE stack reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionChanged { connected: bool },
    ServicesDiscovered { services: Vec<Uuid> },
    MtuChanged { mtu: usize },
    CharacteristicRead { characteristic: Uuid, value: Vec<u8> },
    CharacteristicWritten { characteristic: Uuid },
    DescriptorWritten { characteristic: Uuid },
    /// Notification or indication, never a command completion
    ValueChanged { characteristic: Uuid, value: Vec<u8> },
    /// The in-flight command failed at the link layer
    OperationFailed { error: LinkError },
}

impl LinkEvent {
    pub fn is_completion(&self) -> bool {
        !matches!(
            self,
            LinkEvent::ConnectionChanged { .. } | LinkEvent::ValueChanged { .. }
        )
    }
}

/// A BLE stack able to start one GATT operation.
///
/// `dispatch` only starts the operation. Its outcome comes back later as a
/// completion [`LinkEvent`] fed to the session.
pub trait Link {
    fn dispatch(&mut self, command: &PendingCommand) -> Result<(), LinkError>;
}

impl<L: Link + ?Sized> Link for &mut L {
    fn dispatch(&mut self, command: &PendingCommand) -> Result<(), LinkError> {
        (**self).dispatch(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing() {
        let mqtt = PendingCommand::read(gatt::MQTT_PROXY_SERVICE, gatt::MQTT_PROXY_TX_LARGE);
        let auth = PendingCommand::read(gatt::MUTUAL_AUTH_SERVICE, gatt::EDGE_PARAM_VALUE);
        let net = PendingCommand::write(gatt::NETWORK_SERVICE, gatt::NETWORK_RX, vec![1]);
        assert_eq!(mqtt.queue(), Queue::Mqtt);
        assert_eq!(auth.queue(), Queue::Network);
        assert_eq!(net.queue(), Queue::Network);
        assert_eq!(PendingCommand::discover_services().queue(), Queue::Network);
    }

    #[test]
    fn completion_matching() {
        let read = PendingCommand::read(gatt::MUTUAL_AUTH_SERVICE, gatt::EDGE_PARAM_VALUE);
        assert!(read.completed_by(&LinkEvent::CharacteristicRead {
            characteristic: gatt::EDGE_PARAM_VALUE,
            value: vec![],
        }));
        assert!(!read.completed_by(&LinkEvent::CharacteristicRead {
            characteristic: gatt::GATEWAY_STATUS,
            value: vec![],
        }));
        assert!(!read.completed_by(&LinkEvent::CharacteristicWritten {
            characteristic: gatt::EDGE_PARAM_VALUE,
        }));
        assert!(read.completed_by(&LinkEvent::OperationFailed {
            error: LinkError::Disconnected,
        }));
    }
}
