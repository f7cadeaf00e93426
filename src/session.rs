//! Session manager for one ConCure sensor peripheral.
//!
//! [`BleSession`] is constructed explicitly by the host's composition root
//! and owns the scan coordinator, the connection state machine and the
//! listener registry. All mutation goes through one reentrant lock: an
//! operation, its transport calls and the dispatch of the events it
//! produced run to completion before another thread may start the next
//! one, while a listener on the dispatching thread may still call back in.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::connection::{ConnectionState, ConnectionStateMachine};
use crate::ble::permissions::{require_capabilities, PermissionGate};
use crate::ble::scanner::{PeripheralHandle, ScanCoordinator, ScanSession};
use crate::ble::transport::{Advertisement, GattService, TransportAdapter, TransportEvent};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventKind, FailureReason, ListenerRegistry, SessionEvent, SubscriptionHandle};
use crate::protocol::TelemetrySnapshot;

struct SessionState {
    scanner: ScanCoordinator,
    connection: ConnectionStateMachine,
    telemetry: TelemetrySnapshot,
}

/// BLE session core: discovery, one connection, and event fan-out.
pub struct BleSession {
    config: SessionConfig,
    gate: Box<dyn PermissionGate>,
    transport: Box<dyn TransportAdapter>,
    listeners: ListenerRegistry,
    state: ReentrantMutex<RefCell<SessionState>>,
}

impl BleSession {
    /// Create a session over the given gate and transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is unusable.
    pub fn new<G, T>(config: SessionConfig, gate: G, transport: T) -> Result<Self>
    where
        G: PermissionGate + 'static,
        T: TransportAdapter + 'static,
    {
        config.validate()?;

        let state = SessionState {
            scanner: ScanCoordinator::new(&config),
            connection: ConnectionStateMachine::new(&config),
            telemetry: TelemetrySnapshot::default(),
        };

        Ok(Self {
            config,
            gate: Box::new(gate),
            transport: Box::new(transport),
            listeners: ListenerRegistry::new(),
            state: ReentrantMutex::new(RefCell::new(state)),
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(kind, handler)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.listeners.unsubscribe(handle)
    }

    /// Start a scan session, replacing any active one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`], [`Error::TransportUnavailable`]
    /// or [`Error::AllConfigurationsFailed`]; a `ScanError` event is
    /// dispatched as well.
    pub fn start_scan(&self, use_service_filter: bool) -> Result<()> {
        self.run(|state, transport, events| {
            if let Err(err) = self.check_transport() {
                events.push(SessionEvent::ScanError {
                    reason: FailureReason::from(&err),
                });
                return Err(err);
            }

            state
                .scanner
                .start(transport, use_service_filter, Instant::now(), events)
        })
    }

    /// Stop the active scan. Safe to call when not scanning.
    pub fn stop_scan(&self) {
        self.run(|state, transport, events| state.scanner.stop(transport, events))
    }

    /// Begin connecting to `peripheral`, tearing down any existing link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] or [`Error::TransportUnavailable`]
    /// without touching the current connection, or
    /// [`Error::ConnectionFailed`] if the transport rejects the request.
    pub fn connect(&self, peripheral: PeripheralHandle) -> Result<()> {
        self.run(|state, transport, events| {
            if let Err(err) = self.check_transport() {
                events.push(SessionEvent::ConnectionFailed {
                    address: peripheral.address.clone(),
                    reason: FailureReason::from(&err),
                });
                return Err(err);
            }

            state
                .connection
                .connect(transport, peripheral, Instant::now(), events)
        })
    }

    /// Connect by address, using the discovered handle when there is one.
    pub fn connect_to(&self, address: &str) -> Result<()> {
        let peripheral = self
            .discovered_peripheral(address)
            .unwrap_or_else(|| PeripheralHandle::new(address));
        self.connect(peripheral)
    }

    /// Disconnect the current link. Safe to call when not connected.
    pub fn disconnect(&self) {
        self.run(|state, transport, events| state.connection.disconnect(transport, events))
    }

    /// Send `payload` over the ready link in transport-sized chunks.
    ///
    /// Returns once the send is queued; `WriteCompleted` or `WriteFailed`
    /// follows when the transport has confirmed or rejected its chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] outside `Ready` or
    /// [`Error::SendFailed`] when the transport refuses the first chunk.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.run(|state, transport, events| state.connection.send(transport, payload, events))
    }

    /// Stop scanning and force the connection to `Idle`.
    ///
    /// Call from the owner's shutdown path.
    pub fn cleanup(&self) {
        info!("Cleaning up BLE session");

        self.run(|state, transport, events| {
            state.scanner.stop(transport, events);
            state.connection.cleanup(transport, events);
        })
    }

    /// Expire the scan window and pending connection attempts.
    pub fn poll_timeouts(&self, now: Instant) {
        self.run(|state, transport, events| {
            state.scanner.poll_timeout(transport, now, events);
            state.connection.poll_timeout(transport, now, events);
        })
    }

    /// Feed a transport callback into the session.
    pub fn handle_transport_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Advertisement(advertisement) => {
                self.on_advertisement(advertisement);
                Ok(())
            }
            TransportEvent::ScanStartFailed { reason } => {
                self.on_scan_start_failed(&reason);
                Ok(())
            }
            TransportEvent::LinkUp { address } => self.on_link_up(&address),
            TransportEvent::LinkDown { address, reason } => {
                self.on_link_down(&address, reason);
                Ok(())
            }
            TransportEvent::ServicesDiscovered { address, services } => {
                self.on_services_discovered(&address, &services)
            }
            TransportEvent::ServiceDiscoveryFailed { address, reason } => {
                self.on_service_discovery_failed(&address, &reason)
            }
            TransportEvent::Notification {
                address,
                characteristic,
                value,
            } => {
                self.on_notification(&address, characteristic, &value);
                Ok(())
            }
            TransportEvent::NotifyFailed { address, reason } => {
                self.on_notify_failed(&address, &reason);
                Ok(())
            }
            TransportEvent::WriteConfirmed { address } => {
                self.on_write_confirmed(&address);
                Ok(())
            }
            TransportEvent::WriteRejected { address, reason } => {
                self.on_write_rejected(&address, &reason);
                Ok(())
            }
        }
    }

    /// An advertisement was received.
    pub fn on_advertisement(&self, advertisement: Advertisement) {
        self.run(|state, _, events| state.scanner.on_advertisement(advertisement, events))
    }

    /// The scan failed after it was started.
    pub fn on_scan_start_failed(&self, reason: &str) {
        self.run(|state, transport, events| {
            state.scanner.on_start_failed(transport, reason, events)
        })
    }

    /// The link to `address` came up.
    pub fn on_link_up(&self, address: &str) -> Result<()> {
        self.run(|state, transport, events| state.connection.on_link_up(transport, address, events))
    }

    /// The link to `address` went down.
    pub fn on_link_down(&self, address: &str, reason: Option<String>) {
        self.run(|state, transport, events| {
            state.connection.on_link_down(transport, address, reason, events)
        })
    }

    /// Service discovery on `address` completed.
    pub fn on_services_discovered(&self, address: &str, services: &[GattService]) -> Result<()> {
        self.run(|state, transport, events| {
            state
                .connection
                .on_services_discovered(transport, address, services, events)
        })
    }

    /// Service discovery on `address` failed.
    pub fn on_service_discovery_failed(&self, address: &str, reason: &str) -> Result<()> {
        self.run(|state, transport, events| {
            state
                .connection
                .on_service_discovery_failed(transport, address, reason, events)
        })
    }

    /// A notification arrived from `address`.
    pub fn on_notification(&self, address: &str, characteristic: Uuid, value: &[u8]) {
        self.run(|state, _, events| {
            state
                .connection
                .on_notification(address, characteristic, value, events)
        })
    }

    /// Notifications on `address` could not be enabled or stopped flowing.
    pub fn on_notify_failed(&self, address: &str, reason: &str) {
        self.run(|state, transport, events| {
            state
                .connection
                .on_notify_failed(transport, address, reason, events)
        })
    }

    /// The in-flight chunk to `address` was acknowledged.
    pub fn on_write_confirmed(&self, address: &str) {
        self.run(|state, transport, events| {
            state.connection.on_write_confirmed(transport, address, events)
        })
    }

    /// The in-flight chunk to `address` was rejected.
    pub fn on_write_rejected(&self, address: &str, reason: &str) {
        self.run(|state, transport, events| {
            state
                .connection
                .on_write_rejected(transport, address, reason, events)
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.read(|state| state.connection.state())
    }

    /// Why the last connection attempt failed, while in `Failed`.
    pub fn connection_failure(&self) -> Option<FailureReason> {
        self.read(|state| state.connection.connection().and_then(|c| c.failure.clone()))
    }

    /// The peripheral of the `Ready` connection.
    pub fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.read(|state| state.connection.connected_peripheral().cloned())
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.read(|state| state.scanner.is_scanning())
    }

    /// Snapshot of the current (or last) scan session.
    pub fn scan_session(&self) -> ScanSession {
        self.read(|state| state.scanner.session().clone())
    }

    /// Discovered peripherals, strongest signal first.
    pub fn discovered_peripherals(&self) -> Vec<PeripheralHandle> {
        self.read(|state| state.scanner.discovered())
    }

    /// Look up a discovered peripheral by address.
    pub fn discovered_peripheral(&self, address: &str) -> Option<PeripheralHandle> {
        self.read(|state| state.scanner.peripheral(address))
    }

    /// Most recent value of each telemetry kind.
    pub fn latest_readings(&self) -> TelemetrySnapshot {
        self.read(|state| state.telemetry.clone())
    }

    fn check_transport(&self) -> Result<()> {
        require_capabilities(self.gate.as_ref())?;

        if !self.transport.is_available() {
            return Err(Error::TransportUnavailable);
        }

        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state)
    }

    /// Run one serialized operation and dispatch the events it produced.
    fn run<R>(
        &self,
        f: impl FnOnce(&mut SessionState, &dyn TransportAdapter, &mut Vec<SessionEvent>) -> R,
    ) -> R {
        let guard = self.state.lock();
        let mut events = Vec::new();

        let result = {
            let mut state = guard.borrow_mut();
            let result = f(&mut state, self.transport.as_ref(), &mut events);

            for event in &events {
                if let SessionEvent::DataReceived { frame, received_at, .. } = event {
                    state.telemetry.apply(frame, *received_at);
                }
            }
            result
        };

        if !events.is_empty() {
            debug!("Dispatching {} session event(s)", events.len());
        }
        for event in &events {
            self.listeners.dispatch(event);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::permissions::{Capability, GrantAll, MockPermissionGate};
    use crate::ble::transport::MockTransportAdapter;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn unavailable_transport() -> MockTransportAdapter {
        let mut transport = MockTransportAdapter::new();
        transport.expect_is_available().return_const(false);
        transport.expect_start_scan().never();
        transport.expect_connect().never();
        transport
    }

    #[test]
    fn test_session_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BleSession>();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig::default().with_default_write_len(0);
        let result = BleSession::new(config, GrantAll, MockTransportAdapter::new());
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_permission_denied_never_touches_transport() {
        let mut gate = MockPermissionGate::new();
        gate.expect_has_capability()
            .returning(|capability| capability != Capability::Location);

        let mut transport = MockTransportAdapter::new();
        transport.expect_is_available().never();
        transport.expect_start_scan().never();
        transport.expect_connect().never();

        let session = BleSession::new(SessionConfig::default(), gate, transport).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        session.subscribe(EventKind::ScanError, move |event| sink.lock().push(event.clone()));

        assert!(matches!(
            session.start_scan(false),
            Err(Error::PermissionDenied {
                capability: Capability::Location
            })
        ));
        assert!(matches!(
            session.connect_to("AA:BB:CC:DD:EE:FF"),
            Err(Error::PermissionDenied { .. })
        ));
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_transport_unavailable() {
        let session =
            BleSession::new(SessionConfig::default(), GrantAll, unavailable_transport()).unwrap();

        assert!(matches!(session.start_scan(true), Err(Error::TransportUnavailable)));
        assert!(matches!(
            session.connect_to("AA:BB:CC:DD:EE:FF"),
            Err(Error::TransportUnavailable)
        ));
        assert!(!session.is_scanning());
    }

    #[test]
    fn test_listener_may_query_session_during_dispatch() {
        let mut transport = MockTransportAdapter::new();
        transport.expect_is_available().return_const(true);
        transport.expect_start_scan().returning(|_| Ok(()));

        let session = Arc::new(
            BleSession::new(SessionConfig::default(), GrantAll, transport).unwrap(),
        );
        let observed = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&session);
        let slot = observed.clone();
        session.subscribe(EventKind::ScanStarted, move |_| {
            if let Some(session) = weak.upgrade() {
                *slot.lock() = Some(session.is_scanning());
            }
        });

        session.start_scan(false).unwrap();
        assert_eq!(*observed.lock(), Some(true));
    }
}
