//! Async loop that keeps a `DeviceSession` fed from btleplug

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use btleplug::api::{Peripheral as _, ValueNotification};
use btleplug::platform::Peripheral;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use gatelink_gateway::{Credentials, DeviceSession, GatewayConfig, Link, LinkEvent, PendingCommand, SessionEvent};

use crate::ble::{self, BleLink};

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// A connected edge and its session
pub struct EdgeConnection {
    peripheral: Peripheral,
    session: DeviceSession<BleLink>,
    commands: mpsc::UnboundedReceiver<PendingCommand>,
    notifications: Notifications,
}

impl EdgeConnection {
    /// Connect and kick off discovery. The handshake then runs as `step` is called.
    pub async fn open(
        peripheral: Peripheral,
        credentials: Arc<Credentials>,
        config: &GatewayConfig,
    ) -> Result<(Self, Vec<SessionEvent>), Box<dyn std::error::Error>> {
        peripheral.connect().await?;
        let notifications = peripheral.notifications().await?;

        let (tx, commands) = mpsc::unbounded_channel();
        let mut session = DeviceSession::new(BleLink::new(tx), credentials, config);
        let events = session.handle_event(LinkEvent::ConnectionChanged { connected: true }, Instant::now());

        Ok((
            Self {
                peripheral,
                session,
                commands,
                notifications,
            },
            events,
        ))
    }

    pub fn session(&self) -> &DeviceSession<BleLink> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession<BleLink> {
        &mut self.session
    }

    /// Wait for the next thing to happen on the link: a command to run, a
    /// notification, or the in-flight command's deadline
    pub async fn step(&mut self) -> Vec<SessionEvent> {
        let deadline = self.session.next_deadline();
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            Some(command) = self.commands.recv() => {
                complete(&mut self.session, ble::execute(&self.peripheral, &command)).await
            }
            notification = self.notifications.next(), if self.session.is_connected() => {
                let event = match notification {
                    Some(notification) => LinkEvent::ValueChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    },
                    None => {
                        log::info!("notification stream ended, treating as disconnect");
                        LinkEvent::ConnectionChanged { connected: false }
                    }
                };
                self.session.handle_event(event, Instant::now())
            }
            _ = timeout => self.session.poll_timeout(Instant::now()),
        }
    }

    /// Connect again after `ReconnectRequested`; the handshake restarts from stage 1
    pub async fn reconnect(&mut self) -> Result<Vec<SessionEvent>, Box<dyn std::error::Error>> {
        log::info!("reconnecting");
        self.peripheral.connect().await?;
        self.notifications = self.peripheral.notifications().await?;
        Ok(self
            .session
            .handle_event(LinkEvent::ConnectionChanged { connected: true }, Instant::now()))
    }

    pub async fn disconnect(mut self) -> Result<Vec<SessionEvent>, Box<dyn std::error::Error>> {
        self.session.disconnect();
        self.peripheral.disconnect().await?;
        Ok(self
            .session
            .handle_event(LinkEvent::ConnectionChanged { connected: false }, Instant::now()))
    }
}

/// Feed the outcome of the in-flight command to the session, or expire it if
/// `operation` outlives the command's deadline. An operation cut short is
/// dropped, so a late answer never reaches the session.
async fn complete<L: Link>(
    session: &mut DeviceSession<L>,
    operation: impl Future<Output = LinkEvent>,
) -> Vec<SessionEvent> {
    let Some(deadline) = session.next_deadline() else {
        let event = operation.await;
        return session.handle_event(event, Instant::now());
    };

    match tokio::time::timeout_at(deadline.into(), operation).await {
        Ok(event) => session.handle_event(event, Instant::now()),
        Err(_) => {
            log::warn!("link operation still running at its deadline");
            // tokio's clock may run ahead of std's when paused
            session.poll_timeout(Instant::now().max(deadline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_gateway::{IdentityKeys, LinkError, gatt};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<PendingCommand>,
    }

    impl Link for Recorder {
        fn dispatch(&mut self, command: &PendingCommand) -> Result<(), LinkError> {
            self.sent.push(command.clone());
            Ok(())
        }
    }

    fn connected() -> DeviceSession<Recorder> {
        let config = GatewayConfig {
            command_timeout_ms: 50,
            ..GatewayConfig::default()
        };
        let credentials = Credentials::new(IdentityKeys::generate(), vec![0x30, 0x00], Vec::new());
        let mut session = DeviceSession::new(Recorder::default(), Arc::new(credentials), &config);
        session.handle_event(LinkEvent::ConnectionChanged { connected: true }, Instant::now());
        session
    }

    #[tokio::test(start_paused = true)]
    async fn hung_operation_is_expired_at_the_deadline() {
        let mut session = connected();
        assert!(session.next_deadline().is_some());

        let late_answer = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            LinkEvent::ServicesDiscovered {
                services: vec![gatt::MUTUAL_AUTH_SERVICE],
            }
        };
        let started = tokio::time::Instant::now();
        complete(&mut session, late_answer).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(session.is_idle());
        assert_eq!(session.next_deadline(), None);
        // discovery never completed, so the handshake never started
        assert_eq!(session.link().sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_operation_is_delivered() {
        let mut session = connected();
        let answer = async {
            LinkEvent::ServicesDiscovered {
                services: vec![gatt::MUTUAL_AUTH_SERVICE],
            }
        };
        complete(&mut session, answer).await;

        let last = session.link().sent.last().unwrap();
        assert_eq!(last.characteristic, gatt::GATEWAY_STATUS);
    }
}
