// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # concure-ble
//!
//! The Bluetooth Low Energy session core of the ConCure concrete-curing
//! monitor. It discovers the curing sensor, keeps one link to it, decodes
//! its temperature/humidity/battery frames and fans events out to any
//! number of consumers.
//!
//! ## Features
//!
//! - **Discovery**: Ordered fallback through scan configurations, with
//!   per-address deduplication and a bounded scan window
//! - **Connection lifecycle**: Explicit state machine from `Connecting`
//!   through service negotiation to `Ready`, never retried behind the
//!   caller's back
//! - **Sensor protocol**: Total decoding of `T:`/`H:`/`B:` text frames
//! - **Chunked writes**: Outbound payloads split to the transport's
//!   write size
//! - **Event fan-out**: Typed events dispatched to subscribers per kind
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use concure_ble::platform::{drive, BtleplugTransport, DEFAULT_TICK};
//! use concure_ble::{BleSession, EventKind, GrantAll, Result, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (transport, events) = BtleplugTransport::new().await?;
//!     let session = Arc::new(BleSession::new(SessionConfig::default(), GrantAll, transport)?);
//!
//!     session.subscribe(EventKind::DataReceived, |event| {
//!         if let SessionEvent::DataReceived { frame, .. } = event {
//!             println!("{}", frame);
//!         }
//!     });
//!
//!     tokio::spawn(drive(session.clone(), events, DEFAULT_TICK));
//!     session.start_scan(true)?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     if let Some(sensor) = session.discovered_peripherals().into_iter().next() {
//!         session.connect(sensor)?;
//!     }
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     session.cleanup();
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! The core never spawns threads. Transport callbacks are handled
//! synchronously on whatever thread delivers them, serialized by one lock
//! shared with caller-initiated operations.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and data types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod events;
pub mod platform;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use events::{
    DisconnectReason, EventKind, FailureReason, ListenerRegistry, SessionEvent,
    SubscriptionHandle,
};
pub use session::BleSession;

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use ble::permissions::{Capability, GrantAll, PermissionGate};
pub use ble::scanner::PeripheralHandle;
pub use ble::transport::{TransportAdapter, TransportEvent};
pub use protocol::{TelemetryFrame, TelemetrySnapshot};
