//! BLE communication module.
//!
//! This module provides the discovery, connection and transport seams
//! used to talk to a ConCure sensor peripheral.

pub mod connection;
pub mod permissions;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use connection::{Connection, ConnectionState, ConnectionStateMachine};
pub use permissions::{Capability, GrantAll, PermissionGate};
pub use scanner::{PeripheralHandle, ScanCoordinator, ScanSession};
pub use transport::{
    Advertisement, Endpoint, GattCharacteristic, GattService, ScanConfiguration, TransportAdapter,
    TransportEvent,
};
pub use uuids::*;
