//! Session configuration.
//!
//! The target identity lives here rather than in the state machine so the
//! same code can be pointed at another firmware revision.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::transport::{default_scan_configurations, ScanConfiguration};
use crate::ble::uuids::{DEFAULT_NAME_SIGNATURE, SENSOR_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID};
use crate::error::{Error, Result};

/// Default scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Default time allowed from `connect` to `Ready`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Conservative write size when the transport does not advertise one.
pub const DEFAULT_WRITE_LEN: usize = 20;

/// Configuration for a [`BleSession`](crate::BleSession).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Service exposing the sensor characteristic.
    pub service_uuid: Uuid,
    /// Notify/write characteristic carrying sensor frames.
    pub characteristic_uuid: Uuid,
    /// Case-insensitive name substring identifying the sensor.
    pub name_signature: String,
    /// How long a scan runs before stopping itself.
    pub scan_window: Duration,
    /// How long a connection attempt may take to reach `Ready`.
    pub connect_timeout: Duration,
    /// Write size used when the transport reports none.
    pub default_write_len: usize,
    /// Scan configurations in fallback order.
    pub scan_configurations: Vec<ScanConfiguration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: SENSOR_SERVICE_UUID,
            characteristic_uuid: SENSOR_CHARACTERISTIC_UUID,
            name_signature: DEFAULT_NAME_SIGNATURE.to_string(),
            scan_window: DEFAULT_SCAN_WINDOW,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_write_len: DEFAULT_WRITE_LEN,
            scan_configurations: default_scan_configurations(),
        }
    }
}

impl SessionConfig {
    /// Target a different service/characteristic pair.
    pub fn with_target(mut self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self.characteristic_uuid = characteristic_uuid;
        self
    }

    /// Set the advertised-name signature.
    pub fn with_name_signature(mut self, signature: impl Into<String>) -> Self {
        self.name_signature = signature.into();
        self
    }

    /// Set the scan window.
    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the fallback write size.
    pub fn with_default_write_len(mut self, len: usize) -> Self {
        self.default_write_len = len;
        self
    }

    /// Replace the scan fallback list.
    pub fn with_scan_configurations(mut self, configurations: Vec<ScanConfiguration>) -> Self {
        self.scan_configurations = configurations;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.default_write_len == 0 {
            return invalid("default_write_len must be at least 1");
        }
        if self.scan_window.is_zero() {
            return invalid("scan_window must be non-zero");
        }
        if self.scan_configurations.is_empty() {
            return invalid("at least one scan configuration is required");
        }

        Ok(())
    }
}
