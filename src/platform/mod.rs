//! Platform transports.
//!
//! The session core only knows [`TransportAdapter`](crate::ble::TransportAdapter);
//! this module provides the desktop implementation on top of btleplug.

pub mod btleplug_transport;

pub use btleplug_transport::{advertisement_from, drive, BtleplugTransport, DEFAULT_TICK};
