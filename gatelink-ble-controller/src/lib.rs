//! Gatelink BLE Controller
//!
//! Runs a gatelink [`DeviceSession`](gatelink_gateway::DeviceSession) over a
//! real Bluetooth adapter using btleplug.
//!
//! # Example
//!
//! ```ignore
//! use gatelink_ble_controller::{ble, EdgeConnection};
//! use gatelink_gateway::{Credentials, GatewayConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::load(None)?;
//!     let credentials = std::sync::Arc::new(Credentials::load(&config)?);
//!
//!     let adapter = ble::get_adapter().await?;
//!     let device = ble::find_device(&adapter, None, 5).await?;
//!     let (mut connection, mut events) = EdgeConnection::open(device, credentials, &config).await?;
//!     loop {
//!         for event in events {
//!             if let SessionEvent::Established { .. } = event {
//!                 connection.session_mut().send_mqtt(b"hello", std::time::Instant::now())?;
//!             }
//!         }
//!         events = connection.step().await;
//!     }
//! }
//! ```

pub mod ble;
mod driver;

pub use ble::BleLink;
pub use driver::EdgeConnection;
