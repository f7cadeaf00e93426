//! Error types for the concure-ble crate.

use thiserror::Error;

use crate::ble::permissions::Capability;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// A capability required for the operation has not been granted.
    #[error("Permission denied: {capability} capability missing")]
    PermissionDenied {
        /// The first missing capability.
        capability: Capability,
    },

    /// The radio is switched off or absent.
    #[error("Bluetooth transport not available or disabled")]
    TransportUnavailable,

    /// Every scan configuration in the fallback list was rejected.
    #[error("All scan configurations failed to start")]
    AllConfigurationsFailed,

    /// Link-level failure while connecting.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The peripheral does not expose the configured service.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The configured service lacks the configured characteristic.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Operation requires a ready connection.
    #[error("Peripheral not connected")]
    NotConnected,

    /// A chunked write was rejected partway through.
    #[error("Send failed after {partial_chunks_written} chunk(s) were written")]
    SendFailed {
        /// Number of chunks accepted by the transport before the rejection.
        partial_chunks_written: usize,
    },

    /// A transport primitive was rejected.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session configuration is unusable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
