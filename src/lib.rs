//! # tinkamo
//!
//! A Rust client library for Tinkamo modular hardware: handheld cores that
//! talk over Bluetooth Low Energy, with swappable sensor and actuator tops.
//!
//! The library decodes the core's packet protocol into typed readings,
//! tracks which top is attached, sends motor/servo/LED commands back (with
//! retries until the module confirms them), and keeps per-device sessions
//! alive across dropouts.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Event-driven architecture with callback listeners and async subscriptions
//! - Pluggable transport; an in-memory transport ships for tests and demos
//! - OSC message mapping for creative-coding tools
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tinkamo::{
//!     ConnectCriteria, DeviceRegistry, Event, EventKind, MemoryTransport, OscBridge, SessionConfig,
//!     Topic, osc,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tinkamo::Error> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     transport.add_device("AA:BB:CC:DD:EE:FF", "Tinkamo Core");
//!
//!     let registry = DeviceRegistry::new(transport, SessionConfig::default());
//!     registry.events().on(
//!         Topic::Kind(EventKind::Reading),
//!         Arc::new(|event: &Event| println!("{event:?}")),
//!     );
//!
//!     let mut osc_feed = OscBridge::default().attach(registry.events(), osc::DEFAULT_CHANNEL_CAPACITY);
//!
//!     let session = registry.discover(&ConnectCriteria::new()).await?;
//!     println!("connected as {}", session.display_name());
//!
//!     while let Some(message) = osc_feed.recv().await {
//!         println!("{} {:?}", message.address, message.args);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Packet codec, module type ids and command builders
//! - [`top`] - Per-top interpretation of payloads and actuator commands
//! - [`types`] - Device ids, readings and battery status
//! - [`event`] - Event types and the listener hub
//! - [`transport`] - Transport trait and the in-memory transport
//! - [`session`] - Per-device connection state machine
//! - [`registry`] - Set of known devices with reconnection
//! - [`osc`] - Event to OSC message mapping

pub mod error;
pub mod event;
pub mod osc;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod top;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ProtocolError, Result};
pub use event::{DisconnectReason, Event, EventHub, EventKind, Subscription, Topic};
pub use osc::{OscArg, OscBridge, OscMessage};
pub use protocol::{Command, DecodedPacket, ModuleType, PacketHeader, decode};
pub use registry::{DeviceIds, DeviceRegistry};
pub use session::{ModuleSession, SessionConfig};
pub use top::{Sensed, SuppressReason, Top};
pub use transport::{ConnectCriteria, MemoryDevice, MemoryTransport, Transport};
pub use types::{BatteryLevel, ConnectionState, DeviceId, Reading};
