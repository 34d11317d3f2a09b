//! Gatelink Gateway - the gateway side of the edge mutual-authentication protocol
//!
//! The crate is link-agnostic. A BLE stack plugs in through the [`Link`]
//! trait and reports what happened as [`LinkEvent`]s; everything else is
//! plain state driven by those events:
//!
//! ```ignore
//! let mut session = DeviceSession::new(link, credentials, &config);
//! for event in session.handle_event(LinkEvent::ConnectionChanged { connected: true }, Instant::now()) {
//!     println!("{event:?}");
//! }
//! ```

mod config;
mod device_info;
mod error;
mod handshake;
mod link;
mod scheduler;
mod session;
mod transport;

pub use config::{Credentials, GatewayConfig, gatelink_home};
pub use device_info::{DeviceInfo, DeviceInfoField};
pub use error::{Error, LinkError, Result};
pub use handshake::{FailureReason, HandshakeStage, HandshakeStateMachine, KeyMaterial, NONCE_LEN};
pub use link::{Link, LinkEvent, Operation, PendingCommand, Queue};
pub use scheduler::{DrainOutcome, LinkScheduler};
pub use session::{DeviceSession, SessionEvent};
pub use transport::{Channel, Inbound, SessionTransport, TransportError};

pub use gatelink_crypto::{IdentityKeys, PeerKey};
pub use gatelink_proto::gatt;
