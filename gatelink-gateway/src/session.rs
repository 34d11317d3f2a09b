//! One connected edge device
//!
//! `DeviceSession` owns the link, the scheduler, the handshake and the
//! transport. The BLE stack feeds it [`LinkEvent`]s through
//! [`DeviceSession::handle_event`]; the session answers with new commands on
//! the link and with [`SessionEvent`]s for the application. Nothing here
//! blocks or spawns: time comes in as `now`, and the driver is expected to
//! call [`DeviceSession::poll_timeout`] at [`DeviceSession::next_deadline`].

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use gatelink_proto::{MIN_MTU, gatt};

use crate::device_info::{DeviceInfo, DeviceInfoField};
use crate::handshake::{FailureReason, HandshakeStage, HandshakeStateMachine};
use crate::link::{Link, LinkEvent, PendingCommand};
use crate::scheduler::{DrainOutcome, LinkScheduler};
use crate::transport::{Channel, Inbound, SessionTransport, TransportError};
use crate::{Credentials, GatewayConfig, LinkError};

/// What the application hears about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionChanged(bool),
    StageChanged(HandshakeStage),
    Established { secret_hash: [u8; 32] },
    Failed { reason: FailureReason },
    MqttMessage(Vec<u8>),
    NetworkMessage(Vec<u8>),
    DeviceInfo(DeviceInfoField, String),
    MtuChanged(usize),
    /// The link dropped on its own and auto-reconnect is on
    ReconnectRequested,
}

pub struct DeviceSession<L: Link> {
    link: L,
    scheduler: LinkScheduler,
    handshake: HandshakeStateMachine,
    transport: SessionTransport,
    info: DeviceInfo,
    connected: bool,
    user_disconnect: bool,
    auto_reconnect: bool,
    default_mtu: usize,
}

impl<L: Link> DeviceSession<L> {
    pub fn new(link: L, credentials: Arc<Credentials>, config: &GatewayConfig) -> Self {
        Self {
            link,
            scheduler: LinkScheduler::new(config.command_timeout(), config.retry_limit),
            handshake: HandshakeStateMachine::new(credentials, config.handshake_chunk_size),
            transport: SessionTransport::new(config.default_mtu),
            info: DeviceInfo::default(),
            connected: false,
            user_disconnect: false,
            auto_reconnect: config.auto_reconnect,
            default_mtu: config.default_mtu,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn stage(&self) -> &HandshakeStage {
        self.handshake.stage()
    }

    pub fn is_established(&self) -> bool {
        *self.handshake.stage() == HandshakeStage::Established
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn mtu(&self) -> usize {
        self.transport.mtu()
    }

    /// When `poll_timeout` should next be called
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.deadline()
    }

    pub fn handle_event(&mut self, event: LinkEvent, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let before = self.handshake.stage().clone();

        if event.is_completion() {
            let solicited = self
                .scheduler
                .in_flight()
                .is_some_and(|command| command.completed_by(&event));
            if solicited {
                if let (Some(command), LinkEvent::OperationFailed { error }) =
                    (self.scheduler.complete(), &event)
                {
                    self.command_failed(command, error.clone());
                }
            } else if !matches!(event, LinkEvent::MtuChanged { .. }) {
                log::debug!("ignoring unsolicited {event:?}");
                self.settle(before, now, &mut events);
                return events;
            }
        }

        match event {
            LinkEvent::ConnectionChanged { connected: true } => {
                log::info!("connected, discovering services");
                self.connected = true;
                self.user_disconnect = false;
                events.push(SessionEvent::ConnectionChanged(true));
                self.scheduler.enqueue(PendingCommand::discover_services());
            }
            LinkEvent::ConnectionChanged { connected: false } => {
                self.on_disconnected(&mut events);
            }
            LinkEvent::ServicesDiscovered { services } => {
                if services.contains(&gatt::MUTUAL_AUTH_SERVICE) {
                    self.scheduler.enqueue(PendingCommand::enable_notifications(
                        gatt::MUTUAL_AUTH_SERVICE,
                        gatt::GATEWAY_STATUS,
                    ));
                    self.handshake.start();
                } else {
                    log::warn!("edge has no mutual authentication service");
                    self.handshake.abort(FailureReason::ServiceNotFound);
                }
            }
            LinkEvent::MtuChanged { mtu } => {
                self.transport.set_mtu(mtu);
                log::info!("MTU is now {}", self.transport.mtu());
                events.push(SessionEvent::MtuChanged(self.transport.mtu()));
            }
            LinkEvent::CharacteristicRead {
                characteristic,
                value,
            } => self.on_read(characteristic, &value, &mut events),
            LinkEvent::CharacteristicWritten { characteristic } => {
                if is_handshake(characteristic) {
                    self.handshake.on_written(characteristic);
                }
            }
            LinkEvent::ValueChanged {
                characteristic,
                value,
            } => {
                if is_handshake(characteristic) {
                    self.handshake.on_notification(characteristic, &value);
                } else {
                    let inbound = self.transport.on_notification(characteristic, &value);
                    self.on_inbound(inbound, &mut events);
                }
            }
            LinkEvent::DescriptorWritten { .. } | LinkEvent::OperationFailed { .. } => {}
        }

        self.settle(before, now, &mut events);
        events
    }

    /// Expire the in-flight command if its deadline has passed
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let before = self.handshake.stage().clone();
        if let Some(command) = self.scheduler.expire(now) {
            let characteristic = command.characteristic;
            self.command_failed(command, LinkError::Timeout(characteristic));
        }
        self.settle(before, now, &mut events);
        events
    }

    pub fn send_mqtt(&mut self, payload: &[u8], now: Instant) -> Result<Vec<SessionEvent>, TransportError> {
        self.send(Channel::Mqtt, payload, now)
    }

    pub fn send_network(&mut self, payload: &[u8], now: Instant) -> Result<Vec<SessionEvent>, TransportError> {
        self.send(Channel::Network, payload, now)
    }

    pub fn send(
        &mut self,
        channel: Channel,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, TransportError> {
        if !self.is_established() {
            return Err(TransportError::NotEstablished);
        }
        let before = self.handshake.stage().clone();
        for write in self.transport.wrap(channel, payload)? {
            self.scheduler.enqueue(write);
        }
        let mut events = Vec::new();
        self.settle(before, now, &mut events);
        Ok(events)
    }

    /// Start over from stage 1 on the current connection, e.g. after a failure
    pub fn restart_handshake(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if !self.connected {
            log::warn!("not connected, cannot restart the handshake");
            return events;
        }
        let before = self.handshake.stage().clone();
        self.scheduler.clear();
        self.transport.clear();
        self.handshake.start();
        self.settle(before, now, &mut events);
        events
    }

    /// User-requested disconnect. Drops all state; the driver tears the link down
    /// and the resulting `ConnectionChanged(false)` will not trigger a reconnect.
    pub fn disconnect(&mut self) {
        log::info!("disconnect requested");
        self.user_disconnect = true;
        self.reset();
    }

    fn reset(&mut self) {
        self.scheduler.clear();
        self.handshake.reset();
        self.transport.clear();
        self.transport.set_mtu(self.default_mtu);
        self.info.clear();
    }

    fn on_disconnected(&mut self, events: &mut Vec<SessionEvent>) {
        log::info!("disconnected");
        self.connected = false;
        self.reset();
        events.push(SessionEvent::ConnectionChanged(false));
        if self.auto_reconnect && !self.user_disconnect {
            events.push(SessionEvent::ReconnectRequested);
        }
    }

    fn on_read(&mut self, characteristic: Uuid, value: &[u8], events: &mut Vec<SessionEvent>) {
        if is_handshake(characteristic) {
            self.handshake.on_read(characteristic, value);
        } else if let Some(field) = DeviceInfoField::from_characteristic(characteristic) {
            let text = self.info.update(field, value);
            log::info!("device {field}: {text}");
            if field == DeviceInfoField::Mtu {
                match text.parse::<u16>() {
                    Ok(mtu) if usize::from(mtu) >= MIN_MTU => {
                        self.scheduler.enqueue(PendingCommand::request_mtu(mtu));
                    }
                    _ => log::warn!("not requesting device MTU {text:?}"),
                }
            }
            events.push(SessionEvent::DeviceInfo(field, text));
        } else {
            let inbound = self.transport.on_read(characteristic, value);
            self.on_inbound(inbound, events);
        }
    }

    fn on_inbound(&mut self, inbound: Result<Inbound, TransportError>, events: &mut Vec<SessionEvent>) {
        match inbound {
            Ok(Inbound::Message(Channel::Mqtt, message)) => {
                events.push(SessionEvent::MqttMessage(message));
            }
            Ok(Inbound::Message(Channel::Network, message)) => {
                events.push(SessionEvent::NetworkMessage(message));
            }
            Ok(Inbound::Read(command)) => self.scheduler.enqueue(command),
            Ok(Inbound::Nothing) => {}
            Err(e) => log::warn!("dropping inbound message: {e}"),
        }
    }

    fn command_failed(&mut self, command: PendingCommand, error: LinkError) {
        if let Some(command) = self.scheduler.retry(command) {
            log::warn!(
                "giving up on {:?} on {} after {} attempts: {error}",
                command.operation,
                command.characteristic,
                command.attempts
            );
            self.handshake.on_link_failure(&command, error);
        }
    }

    /// Queue what the handshake asked for, report stage changes, and keep the
    /// link busy
    fn settle(&mut self, mut before: HandshakeStage, now: Instant, events: &mut Vec<SessionEvent>) {
        loop {
            self.collect_handshake(&before, events);
            before = self.handshake.stage().clone();
            match self.scheduler.drain_one(&mut self.link, now) {
                DrainOutcome::Rejected(command, error) => self.command_failed(command, error),
                DrainOutcome::Idle | DrainOutcome::Busy | DrainOutcome::Dispatched => break,
            }
        }
    }

    fn collect_handshake(&mut self, before: &HandshakeStage, events: &mut Vec<SessionEvent>) {
        for command in self.handshake.take_commands() {
            self.scheduler.enqueue(command);
        }

        let stage = self.handshake.stage().clone();
        if stage == *before {
            return;
        }
        events.push(SessionEvent::StageChanged(stage.clone()));
        match stage {
            HandshakeStage::Established => {
                let keys = self.handshake.keys();
                if let (Some(raw), Some(hash)) = (keys.shared_secret_raw(), keys.shared_secret_hash()) {
                    self.transport.activate(raw);
                    events.push(SessionEvent::Established { secret_hash: *hash });
                }
                self.start_application_transport();
            }
            HandshakeStage::Failed(reason) => {
                events.push(SessionEvent::Failed { reason });
            }
            _ => {}
        }
    }

    fn start_application_transport(&mut self) {
        log::info!("session established, enabling MQTT and network transport");
        for channel in [Channel::Mqtt, Channel::Network] {
            self.scheduler
                .enqueue(PendingCommand::enable_notifications(channel.service(), channel.tx()));
            self.scheduler
                .enqueue(PendingCommand::enable_notifications(channel.service(), channel.tx_large()));
            self.scheduler.enqueue(PendingCommand::write(
                channel.service(),
                channel.control(),
                vec![gatt::CONTROL_ENABLE],
            ));
        }
        for field in DeviceInfoField::ALL {
            self.scheduler.enqueue(PendingCommand::read(
                gatt::DEVICE_INFO_SERVICE,
                field.characteristic(),
            ));
        }
    }
}

fn is_handshake(characteristic: Uuid) -> bool {
    [
        gatt::WRITE_DATA_INDICATION,
        gatt::WRITE_DATA_PARAM_VALUE,
        gatt::GATEWAY_STATUS,
        gatt::EDGE_PARAM_VALUE,
        gatt::EDGE_STATUS,
    ]
    .contains(&characteristic)
}
