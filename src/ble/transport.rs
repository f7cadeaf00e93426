//! Transport abstraction over a platform BLE central.
//!
//! The session only ever talks to the radio through [`TransportAdapter`].
//! Every primitive initiates an operation and returns immediately; results
//! come back later as [`TransportEvent`]s.

use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// Radio duty cycle requested for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Lowest duty cycle, easiest on the battery.
    LowPower,
    /// Platform default duty cycle.
    Balanced,
    /// Continuous scanning.
    LowLatency,
}

/// How eagerly the controller reports weak or sparse advertisers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MatchMode {
    /// Require a strong, repeated signal before reporting.
    Sticky,
    /// Report on the first weak sighting.
    Aggressive,
}

/// One entry in the ordered scan fallback list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanConfiguration {
    /// Radio duty cycle.
    pub mode: ScanMode,
    /// Batched report delay; `Some(ZERO)` forces immediate delivery.
    pub report_delay: Option<Duration>,
    /// Controller match mode, if the platform supports setting it.
    pub match_mode: Option<MatchMode>,
}

impl ScanConfiguration {
    /// Low-power scan with no further settings.
    pub const fn low_power() -> Self {
        Self {
            mode: ScanMode::LowPower,
            report_delay: None,
            match_mode: None,
        }
    }

    /// Balanced scan with immediate result delivery.
    pub const fn balanced() -> Self {
        Self {
            mode: ScanMode::Balanced,
            report_delay: Some(Duration::ZERO),
            match_mode: None,
        }
    }

    /// Low-latency scan with aggressive matching.
    pub const fn low_latency() -> Self {
        Self {
            mode: ScanMode::LowLatency,
            report_delay: Some(Duration::ZERO),
            match_mode: Some(MatchMode::Aggressive),
        }
    }
}

impl std::fmt::Display for ScanConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.mode)?;
        if let Some(match_mode) = self.match_mode {
            write!(f, "/{:?}", match_mode)?;
        }
        Ok(())
    }
}

/// The default fallback order: battery first, compatibility last.
pub fn default_scan_configurations() -> Vec<ScanConfiguration> {
    vec![
        ScanConfiguration::low_power(),
        ScanConfiguration::balanced(),
        ScanConfiguration::low_latency(),
    ]
}

/// A single advertisement report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Transport-stable peripheral address.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Advertised service UUIDs as presented by the platform.
    pub service_uuids: Vec<String>,
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Descriptor UUIDs attached to the characteristic.
    pub descriptors: Vec<Uuid>,
}

/// A service found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

/// Opaque handle to the negotiated characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Owning service.
    pub service: Uuid,
    /// The characteristic itself.
    pub characteristic: Uuid,
}

/// Callbacks reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An advertisement was received.
    Advertisement(Advertisement),
    /// The scan failed to start after `start_scan` returned.
    ScanStartFailed {
        /// Platform reason.
        reason: String,
    },
    /// The link to `address` came up.
    LinkUp {
        /// Peripheral address.
        address: String,
    },
    /// The link to `address` went down.
    LinkDown {
        /// Peripheral address.
        address: String,
        /// Platform reason, if any.
        reason: Option<String>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Peripheral address.
        address: String,
        /// Discovered services.
        services: Vec<GattService>,
    },
    /// Service discovery itself failed.
    ServiceDiscoveryFailed {
        /// Peripheral address.
        address: String,
        /// Platform reason.
        reason: String,
    },
    /// A characteristic value was pushed by the peripheral.
    Notification {
        /// Peripheral address.
        address: String,
        /// Characteristic that changed.
        characteristic: Uuid,
        /// New value.
        value: Vec<u8>,
    },
    /// Notifications could not be enabled, or their delivery broke.
    NotifyFailed {
        /// Peripheral address.
        address: String,
        /// Platform reason.
        reason: String,
    },
    /// The peripheral acknowledged the last written chunk.
    WriteConfirmed {
        /// Peripheral address.
        address: String,
    },
    /// The last written chunk was rejected.
    WriteRejected {
        /// Peripheral address.
        address: String,
        /// Platform reason.
        reason: String,
    },
}

/// Capability set of a platform BLE central.
///
/// Implementations must not call back into the session from inside these
/// methods; results are delivered as [`TransportEvent`]s.
#[cfg_attr(test, mockall::automock)]
pub trait TransportAdapter: Send + Sync {
    /// Whether the radio is present and powered.
    fn is_available(&self) -> bool;

    /// Start scanning with the given configuration.
    fn start_scan(&self, config: &ScanConfiguration) -> Result<()>;

    /// Stop scanning.
    fn stop_scan(&self) -> Result<()>;

    /// Open a link to the peripheral at `address`.
    fn connect(&self, address: &str) -> Result<()>;

    /// Close the current link and release it.
    fn disconnect(&self) -> Result<()>;

    /// Discover services on the current link.
    fn discover_services(&self) -> Result<()>;

    /// Write one chunk to the endpoint.
    ///
    /// `Ok` means the chunk was accepted for writing; the outcome arrives as
    /// [`TransportEvent::WriteConfirmed`] or [`TransportEvent::WriteRejected`].
    /// The session never has more than one chunk outstanding.
    fn write(&self, endpoint: &Endpoint, chunk: &[u8]) -> Result<()>;

    /// Enable or disable local delivery of notifications.
    ///
    /// Failures after this returns are reported as
    /// [`TransportEvent::NotifyFailed`].
    fn set_notify(&self, endpoint: &Endpoint, enabled: bool) -> Result<()>;

    /// Write a descriptor of the endpoint's characteristic.
    fn write_descriptor(&self, endpoint: &Endpoint, descriptor: Uuid, value: &[u8]) -> Result<()>;

    /// Negotiated maximum write payload, if known.
    fn max_write_len(&self) -> Option<usize>;
}
