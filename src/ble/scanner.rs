//! BLE scanning functionality.
//!
//! Provides the coordinator that discovers ConCure sensor peripherals,
//! falling back through an ordered list of scan configurations when the
//! platform rejects one.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{Advertisement, ScanConfiguration, TransportAdapter};
use crate::ble::uuids::{name_matches, uuid_matches};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{FailureReason, SessionEvent};

/// A discovered remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    /// Transport-stable unique identifier.
    pub address: String,
    /// Advertised local name.
    pub advertised_name: Option<String>,
    /// Signal strength of the latest advertisement in dBm.
    pub last_seen_signal_strength: i16,
    /// Whether the advertisement matched the target signature.
    pub matches_target: bool,
}

impl PeripheralHandle {
    /// Create a handle for a peripheral known only by address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            advertised_name: None,
            last_seen_signal_strength: i16::MIN,
            matches_target: false,
        }
    }

    /// Display name, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.advertised_name.as_deref().unwrap_or(&self.address)
    }
}

/// One bounded discovery attempt.
#[derive(Debug, Clone, Default)]
pub struct ScanSession {
    /// Whether the scan is running.
    pub active: bool,
    /// Index of the configuration in use.
    pub configuration_index: usize,
    /// Discovered peripherals by address.
    pub discovered: HashMap<String, PeripheralHandle>,
    /// When the scan window closes.
    pub deadline: Option<Instant>,
    /// Whether non-matching advertisements are dropped.
    pub use_service_filter: bool,
    /// Whether any advertisement arrived under the current configuration.
    results_seen: bool,
}

impl ScanSession {
    /// Forget every discovered peripheral.
    pub fn clear(&mut self) {
        self.discovered.clear();
    }
}

/// Runs scan sessions against a transport.
pub struct ScanCoordinator {
    configurations: Vec<ScanConfiguration>,
    service_uuid: Uuid,
    name_signature: String,
    scan_window: Duration,
    session: ScanSession,
}

impl ScanCoordinator {
    /// Create a coordinator for the configured target.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            configurations: config.scan_configurations.clone(),
            service_uuid: config.service_uuid,
            name_signature: config.name_signature.clone(),
            scan_window: config.scan_window,
            session: ScanSession::default(),
        }
    }

    /// The current (or last) scan session.
    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.session.active
    }

    /// The configuration in use, if scanning.
    pub fn active_configuration(&self) -> Option<&ScanConfiguration> {
        if self.session.active {
            self.configurations.get(self.session.configuration_index)
        } else {
            None
        }
    }

    /// Look up a discovered peripheral.
    pub fn peripheral(&self, address: &str) -> Option<PeripheralHandle> {
        self.session.discovered.get(address).cloned()
    }

    /// Discovered peripherals, strongest signal first.
    pub fn discovered(&self) -> Vec<PeripheralHandle> {
        let mut peripherals: Vec<_> = self.session.discovered.values().cloned().collect();
        peripherals.sort_by(|a, b| {
            b.last_seen_signal_strength
                .cmp(&a.last_seen_signal_strength)
                .then_with(|| a.address.cmp(&b.address))
        });
        peripherals
    }

    /// Start a new scan session, terminating any active one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllConfigurationsFailed`] if the transport rejects
    /// every configuration; no session is left active in that case.
    pub fn start(
        &mut self,
        transport: &dyn TransportAdapter,
        use_service_filter: bool,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        if self.session.active {
            debug!("Already scanning, stopping previous scan");
            self.stop(transport, events);
        }

        info!(
            "Starting BLE scan (service filter: {})",
            if use_service_filter { "on" } else { "off" }
        );

        self.session.clear();
        self.session.use_service_filter = use_service_filter;
        self.session.results_seen = false;

        match self.try_configurations(transport, 0) {
            Some(index) => {
                self.session.active = true;
                self.session.configuration_index = index;
                self.session.deadline = Some(now + self.scan_window);
                events.push(SessionEvent::ScanStarted {
                    configuration: self.configurations[index].clone(),
                });
                Ok(())
            }
            None => {
                self.fail_all(events);
                Err(Error::AllConfigurationsFailed)
            }
        }
    }

    /// Stop the active session. Safe to call when none is active.
    pub fn stop(&mut self, transport: &dyn TransportAdapter, events: &mut Vec<SessionEvent>) {
        if !self.session.active {
            debug!("Not scanning, ignoring stop request");
            return;
        }

        info!("Stopping BLE scan");

        if let Err(e) = transport.stop_scan() {
            warn!("Transport rejected stop_scan: {}", e);
        }

        self.session.active = false;
        self.session.deadline = None;
        events.push(SessionEvent::ScanStopped {
            discovered: self.session.discovered.len(),
        });
    }

    /// Stop the session if its window has closed.
    pub fn poll_timeout(
        &mut self,
        transport: &dyn TransportAdapter,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        match self.session.deadline {
            Some(deadline) if self.session.active && now >= deadline => {
                debug!("Scan window elapsed");
                self.stop(transport, events);
            }
            _ => {}
        }
    }

    /// Handle a scan start failure reported after `start` returned.
    ///
    /// Before any advertisement has arrived this counts as a start failure
    /// of the current configuration and the next one is tried.
    pub fn on_start_failed(
        &mut self,
        transport: &dyn TransportAdapter,
        reason: &str,
        events: &mut Vec<SessionEvent>,
    ) {
        if !self.session.active {
            trace!("Scan failure with no active session: {}", reason);
            return;
        }

        if self.session.results_seen {
            error!("Scan failed: {}", reason);
            self.session.active = false;
            self.session.deadline = None;
            events.push(SessionEvent::ScanError {
                reason: FailureReason::Transport(reason.to_string()),
            });
            return;
        }

        warn!(
            "Scan configuration {} failed to start: {}",
            self.configurations[self.session.configuration_index], reason
        );

        match self.try_configurations(transport, self.session.configuration_index + 1) {
            Some(index) => self.session.configuration_index = index,
            None => {
                self.session.active = false;
                self.session.deadline = None;
                self.fail_all(events);
            }
        }
    }

    /// Handle one advertisement report.
    pub fn on_advertisement(&mut self, advertisement: Advertisement, events: &mut Vec<SessionEvent>) {
        if !self.session.active {
            trace!("Advertisement outside a scan session: {}", advertisement.address);
            return;
        }
        self.session.results_seen = true;

        let matches_target = self.matches_target(&advertisement);
        trace!(
            "Advertisement {} ({:?}) rssi {} match {}",
            advertisement.address,
            advertisement.name,
            advertisement.rssi,
            matches_target
        );

        if self.session.use_service_filter && !matches_target {
            return;
        }

        match self.session.discovered.get_mut(&advertisement.address) {
            Some(existing) => {
                existing.last_seen_signal_strength = advertisement.rssi;
                if advertisement.name.is_some() {
                    existing.advertised_name = advertisement.name;
                }
                existing.matches_target |= matches_target;
                events.push(SessionEvent::DeviceUpdated(existing.clone()));
            }
            None => {
                let handle = PeripheralHandle {
                    address: advertisement.address.clone(),
                    advertised_name: advertisement.name,
                    last_seen_signal_strength: advertisement.rssi,
                    matches_target,
                };

                debug!(
                    "Discovered new peripheral: {} ({})",
                    handle.display_name(),
                    handle.address
                );

                self.session
                    .discovered
                    .insert(advertisement.address, handle.clone());
                events.push(SessionEvent::DeviceFound(handle));
            }
        }
    }

    /// Name substring or service UUID containment; either suffices.
    fn matches_target(&self, advertisement: &Advertisement) -> bool {
        let by_name = advertisement
            .name
            .as_deref()
            .map(|name| name_matches(name, &self.name_signature))
            .unwrap_or(false);

        by_name
            || advertisement
                .service_uuids
                .iter()
                .any(|uuid| uuid_matches(uuid, &self.service_uuid))
    }

    fn try_configurations(&self, transport: &dyn TransportAdapter, from: usize) -> Option<usize> {
        for (index, configuration) in self.configurations.iter().enumerate().skip(from) {
            debug!("Trying scan configuration {}: {}", index, configuration);

            match transport.start_scan(configuration) {
                Ok(()) => {
                    info!("Scan started with configuration {}", configuration);
                    return Some(index);
                }
                Err(e) => warn!("Scan configuration {} failed: {}", configuration, e),
            }
        }

        None
    }

    fn fail_all(&self, events: &mut Vec<SessionEvent>) {
        error!("All scan configurations failed");
        events.push(SessionEvent::ScanError {
            reason: FailureReason::AllConfigurationsFailed,
        });
    }
}
