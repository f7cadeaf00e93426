//! BLE connection management.
//!
//! Drives the single link to a sensor peripheral from `connect` through
//! GATT negotiation to a data-ready state, and back to idle from any point.
//! Connection attempts are never retried here; every failure is reported
//! once and left to the caller.

use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::scanner::PeripheralHandle;
use crate::ble::transport::{Endpoint, GattService, TransportAdapter};
use crate::ble::uuids::{CLIENT_CHARACTERISTIC_CONFIG_UUID, NOTIFY_ENABLE_VALUE};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{DisconnectReason, FailureReason, SessionEvent};
use crate::protocol::codec;

/// Connection state of the session's single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Idle,
    /// Waiting for the transport to bring the link up.
    Connecting,
    /// Link up, looking for the sensor service and characteristic.
    ServiceDiscovery,
    /// Notifications enabled, ready to send and receive.
    Ready,
    /// Tearing the link down.
    Disconnecting,
    /// The last attempt failed.
    Failed,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if an attempt is in progress.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting | Self::ServiceDiscovery)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// The live or pending link to one peripheral.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Current state.
    pub state: ConnectionState,
    /// Target peripheral.
    pub peripheral: PeripheralHandle,
    /// Negotiated characteristic; present only while `Ready`.
    pub writable_endpoint: Option<Endpoint>,
    /// Consecutive caller retries against this peripheral after failures.
    pub retry_count: u32,
    /// Why the attempt failed, once `Failed`.
    pub failure: Option<FailureReason>,
    deadline: Option<Instant>,
    link_open: bool,
    outbound: VecDeque<OutboundWrite>,
    write_in_flight: bool,
}

impl Connection {
    /// Sends accepted but not yet fully confirmed.
    pub fn pending_writes(&self) -> usize {
        self.outbound.len()
    }
}

/// One caller payload, written a chunk at a time.
#[derive(Debug, Clone)]
struct OutboundWrite {
    bytes: usize,
    remaining: VecDeque<Bytes>,
    written: usize,
}

/// Owns the lifecycle of the session's one connection.
pub struct ConnectionStateMachine {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    connect_timeout: Duration,
    default_write_len: usize,
    connection: Option<Connection>,
}

impl ConnectionStateMachine {
    /// Create an idle state machine for the configured target.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
            connect_timeout: config.connect_timeout,
            default_write_len: config.default_write_len,
            connection: None,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Idle)
    }

    /// The current connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// The peripheral of a `Ready` connection.
    pub fn connected_peripheral(&self) -> Option<&PeripheralHandle> {
        self.connection
            .as_ref()
            .filter(|c| c.state.is_ready())
            .map(|c| &c.peripheral)
    }

    /// Begin connecting to `peripheral`, tearing down any existing link.
    ///
    /// Returns once the transport has accepted the request; progress is
    /// reported through events.
    pub fn connect(
        &mut self,
        transport: &dyn TransportAdapter,
        peripheral: PeripheralHandle,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let retry_count = match &self.connection {
            Some(previous)
                if previous.state == ConnectionState::Failed
                    && previous.peripheral.address == peripheral.address =>
            {
                previous.retry_count + 1
            }
            _ => 0,
        };

        if matches!(&self.connection, Some(c) if c.state != ConnectionState::Failed) {
            debug!("Tearing down existing connection before connecting");
            self.teardown(transport, DisconnectReason::Superseded, events);
        }

        info!(
            "Connecting to {} ({})",
            peripheral.display_name(),
            peripheral.address
        );

        let address = peripheral.address.clone();
        self.connection = Some(Connection {
            state: ConnectionState::Idle,
            peripheral,
            writable_endpoint: None,
            retry_count,
            failure: None,
            deadline: Some(now + self.connect_timeout),
            link_open: false,
            outbound: VecDeque::new(),
            write_in_flight: false,
        });
        self.set_state(ConnectionState::Connecting);

        match transport.connect(&address) {
            Ok(()) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.link_open = true;
                }
                Ok(())
            }
            Err(e) => {
                let err = Error::ConnectionFailed {
                    reason: e.to_string(),
                };
                self.fail(transport, FailureReason::from(&err), events);
                Err(err)
            }
        }
    }

    /// Caller-initiated disconnect. Idempotent.
    pub fn disconnect(&mut self, transport: &dyn TransportAdapter, events: &mut Vec<SessionEvent>) {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Disconnecting => {
                debug!("Not connected, ignoring disconnect request");
            }
            _ => self.teardown(transport, DisconnectReason::Requested, events),
        }
    }

    /// Force the machine to `Idle` from any state, closing any open link.
    pub fn cleanup(&mut self, transport: &dyn TransportAdapter, events: &mut Vec<SessionEvent>) {
        if self.connection.is_some() {
            self.teardown(transport, DisconnectReason::Shutdown, events);
        }
    }

    /// Split `payload` to the transport's write size and queue it.
    ///
    /// Chunks go out one at a time; each waits for the transport to confirm
    /// the previous one. `WriteCompleted` follows the last confirmation and
    /// a rejected chunk ends that send with `WriteFailed`. Sends made while
    /// another is in flight are written after it, in call order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] outside `Ready`, or
    /// [`Error::SendFailed`] if the transport refuses the first chunk
    /// outright.
    pub fn send(
        &mut self,
        transport: &dyn TransportAdapter,
        payload: &[u8],
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let max_len = transport
            .max_write_len()
            .filter(|len| *len > 0)
            .unwrap_or(self.default_write_len);

        let connection = self
            .connection
            .as_mut()
            .filter(|c| c.state.is_ready() && c.writable_endpoint.is_some())
            .ok_or(Error::NotConnected)?;

        let chunks = codec::chunk(payload, max_len);
        debug!("Queueing {} bytes as {} chunk(s)", payload.len(), chunks.len());

        connection.outbound.push_back(OutboundWrite {
            bytes: payload.len(),
            remaining: chunks.into(),
            written: 0,
        });

        if connection.write_in_flight {
            return Ok(());
        }
        self.pump_writes(transport, events)
    }

    /// The transport confirmed the in-flight chunk.
    pub fn on_write_confirmed(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        events: &mut Vec<SessionEvent>,
    ) {
        if !self.is_current(address, ConnectionState::Ready) {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if !connection.write_in_flight {
            debug!("Write confirmation from {} with nothing in flight", address);
            return;
        }

        connection.write_in_flight = false;
        if let Some(write) = connection.outbound.front_mut() {
            write.written += 1;
        }

        if let Err(e) = self.pump_writes(transport, events) {
            debug!("Queued send failed: {}", e);
        }
    }

    /// The transport rejected the in-flight chunk.
    pub fn on_write_rejected(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        reason: &str,
        events: &mut Vec<SessionEvent>,
    ) {
        if !self.is_current(address, ConnectionState::Ready) {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if !connection.write_in_flight {
            debug!("Write rejection from {} with nothing in flight", address);
            return;
        }

        connection.write_in_flight = false;
        if let Some(write) = connection.outbound.pop_front() {
            warn!(
                "Write rejected after {} chunk(s) of a {} byte send: {}",
                write.written, write.bytes, reason
            );
            events.push(SessionEvent::WriteFailed {
                partial_chunks_written: write.written,
                reason: FailureReason::Transport(reason.to_string()),
            });
        }

        if let Err(e) = self.pump_writes(transport, events) {
            debug!("Queued send failed: {}", e);
        }
    }

    /// The transport brought the link up.
    pub fn on_link_up(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        if !self.is_current(address, ConnectionState::Connecting) {
            return Ok(());
        }

        info!("Link up to {}", address);
        self.set_state(ConnectionState::ServiceDiscovery);

        if let Err(e) = transport.discover_services() {
            let err = Error::ConnectionFailed {
                reason: format!("service discovery request rejected: {}", e),
            };
            self.fail(transport, FailureReason::from(&err), events);
            return Err(err);
        }

        Ok(())
    }

    /// The transport reported the link down.
    pub fn on_link_down(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        reason: Option<String>,
        events: &mut Vec<SessionEvent>,
    ) {
        let state = match &self.connection {
            Some(c) if c.peripheral.address == address => c.state,
            _ => {
                debug!("Ignoring link down for stale peripheral {}", address);
                return;
            }
        };

        match state {
            ConnectionState::Connecting | ConnectionState::ServiceDiscovery => {
                let reason = reason.unwrap_or_else(|| "link lost".to_string());
                self.fail(transport, FailureReason::Link(reason), events);
            }
            ConnectionState::Ready => {
                warn!("Connection to {} lost", address);
                self.teardown(transport, DisconnectReason::Remote(reason), events);
            }
            _ => debug!("Link down in state {}, nothing to do", state),
        }
    }

    /// Service discovery completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] or [`Error::CharacteristicNotFound`]
    /// when the peripheral does not expose the configured target.
    pub fn on_services_discovered(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        services: &[GattService],
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        if !self.is_current(address, ConnectionState::ServiceDiscovery) {
            return Ok(());
        }

        debug!("Discovered {} service(s) on {}", services.len(), address);

        let service = match services.iter().find(|s| s.uuid == self.service_uuid) {
            Some(service) => service,
            None => {
                self.fail(transport, FailureReason::ServiceNotFound(self.service_uuid), events);
                return Err(Error::ServiceNotFound {
                    uuid: self.service_uuid.to_string(),
                });
            }
        };

        let characteristic = match service
            .characteristics
            .iter()
            .find(|c| c.uuid == self.characteristic_uuid)
        {
            Some(characteristic) => characteristic,
            None => {
                self.fail(
                    transport,
                    FailureReason::CharacteristicNotFound(self.characteristic_uuid),
                    events,
                );
                return Err(Error::CharacteristicNotFound {
                    uuid: self.characteristic_uuid.to_string(),
                });
            }
        };

        let endpoint = Endpoint {
            service: service.uuid,
            characteristic: characteristic.uuid,
        };

        let descriptor = characteristic
            .descriptors
            .iter()
            .copied()
            .find(|d| *d == CLIENT_CHARACTERISTIC_CONFIG_UUID)
            .or_else(|| characteristic.descriptors.first().copied());

        let enabled = transport.set_notify(&endpoint, true).and_then(|()| match descriptor {
            Some(descriptor) => transport.write_descriptor(&endpoint, descriptor, &NOTIFY_ENABLE_VALUE),
            None => {
                warn!("Characteristic {} has no descriptors", characteristic.uuid);
                Ok(())
            }
        });

        if let Err(e) = enabled {
            let err = Error::Transport(format!("enabling notifications failed: {}", e));
            self.fail(transport, FailureReason::from(&err), events);
            return Err(err);
        }

        if let Some(connection) = self.connection.as_mut() {
            connection.writable_endpoint = Some(endpoint);
            connection.deadline = None;
        }
        self.set_state(ConnectionState::Ready);

        if let Some(peripheral) = self.connected_peripheral() {
            info!(
                "Connected to {} with notifications enabled",
                peripheral.display_name()
            );
            events.push(SessionEvent::Connected(peripheral.clone()));
        }

        Ok(())
    }

    /// Service discovery itself failed.
    pub fn on_service_discovery_failed(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        reason: &str,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        if !self.is_current(address, ConnectionState::ServiceDiscovery) {
            return Ok(());
        }

        let err = Error::ConnectionFailed {
            reason: format!("service discovery failed: {}", reason),
        };
        self.fail(transport, FailureReason::from(&err), events);
        Err(err)
    }

    /// A characteristic value was pushed by the peripheral.
    pub fn on_notification(
        &mut self,
        address: &str,
        characteristic: Uuid,
        value: &[u8],
        events: &mut Vec<SessionEvent>,
    ) {
        if !self.is_current(address, ConnectionState::Ready) {
            return;
        }
        if characteristic != self.characteristic_uuid {
            debug!("Ignoring notification from characteristic {}", characteristic);
            return;
        }

        events.push(SessionEvent::DataReceived {
            frame: codec::decode(value),
            raw: Bytes::copy_from_slice(value),
            received_at: Utc::now(),
        });
    }

    /// The transport could not keep notifications flowing on `address`.
    ///
    /// A `Ready` link is closed and reported as both `Disconnected` and
    /// `ConnectionFailed`.
    pub fn on_notify_failed(
        &mut self,
        transport: &dyn TransportAdapter,
        address: &str,
        reason: &str,
        events: &mut Vec<SessionEvent>,
    ) {
        match &self.connection {
            Some(c)
                if c.peripheral.address == address
                    && (c.state.is_ready() || c.state == ConnectionState::ServiceDiscovery) => {}
            _ => {
                debug!("Ignoring notify failure for {}", address);
                return;
            }
        }

        let err = Error::Transport(format!("enabling notifications failed: {}", reason));
        self.fail(transport, FailureReason::from(&err), events);
    }

    /// Fail a pending attempt whose deadline has passed.
    pub fn poll_timeout(
        &mut self,
        transport: &dyn TransportAdapter,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        let expired = self
            .connection
            .as_ref()
            .filter(|c| c.state.is_pending())
            .and_then(|c| c.deadline)
            .map(|deadline| now >= deadline)
            .unwrap_or(false);

        if expired {
            self.fail(transport, FailureReason::Timeout, events);
        }
    }

    fn is_current(&self, address: &str, expected: ConnectionState) -> bool {
        match &self.connection {
            Some(c) if c.peripheral.address == address && c.state == expected => true,
            Some(c) => {
                debug!(
                    "Ignoring transport event for {} in state {} (current {} {})",
                    address, expected, c.peripheral.address, c.state
                );
                false
            }
            None => {
                debug!("Ignoring transport event for {} with no connection", address);
                false
            }
        }
    }

    /// Issue the next chunk unless one is in flight, finishing sends whose
    /// chunks are all confirmed.
    fn pump_writes(
        &mut self,
        transport: &dyn TransportAdapter,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let mut result = Ok(());
        let Some(connection) = self.connection.as_mut() else {
            return result;
        };
        let Some(endpoint) = connection.writable_endpoint else {
            return result;
        };

        while !connection.write_in_flight {
            let Some(write) = connection.outbound.front_mut() else {
                break;
            };

            match write.remaining.pop_front() {
                None => {
                    debug!("Sent {} bytes in {} chunk(s)", write.bytes, write.written);
                    events.push(SessionEvent::WriteCompleted {
                        bytes: write.bytes,
                        chunks: write.written,
                    });
                    connection.outbound.pop_front();
                }
                Some(chunk) => match transport.write(&endpoint, &chunk) {
                    Ok(()) => connection.write_in_flight = true,
                    Err(e) => {
                        let written = write.written;
                        warn!("Write rejected after {} chunk(s): {}", written, e);
                        connection.outbound.pop_front();
                        events.push(SessionEvent::WriteFailed {
                            partial_chunks_written: written,
                            reason: FailureReason::from(&e),
                        });
                        if result.is_ok() {
                            result = Err(Error::SendFailed {
                                partial_chunks_written: written,
                            });
                        }
                    }
                },
            }
        }

        result
    }

    /// Fail every queued send; the link they were meant for is going away.
    fn abandon_writes(&mut self, events: &mut Vec<SessionEvent>) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        connection.write_in_flight = false;

        for write in connection.outbound.drain(..) {
            debug!("Dropping {} byte send on link close", write.bytes);
            events.push(SessionEvent::WriteFailed {
                partial_chunks_written: write.written,
                reason: FailureReason::Link("link closed".to_string()),
            });
        }
    }

    /// Close the transport link if still open. Never closes twice.
    fn close_link(&mut self, transport: &dyn TransportAdapter) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        connection.writable_endpoint = None;

        if !connection.link_open {
            return;
        }
        connection.link_open = false;

        if let Err(e) = transport.disconnect() {
            warn!("Failed to close link to {}: {}", connection.peripheral.address, e);
        }
    }

    fn teardown(
        &mut self,
        transport: &dyn TransportAdapter,
        reason: DisconnectReason,
        events: &mut Vec<SessionEvent>,
    ) {
        let was_ready = self.state().is_ready();

        self.set_state(ConnectionState::Disconnecting);
        self.abandon_writes(events);
        self.close_link(transport);

        let address = self
            .connection
            .as_ref()
            .map(|c| c.peripheral.address.clone())
            .unwrap_or_default();
        self.set_state(ConnectionState::Idle);

        if was_ready {
            info!("Disconnected from {} ({:?})", address, reason);
            events.push(SessionEvent::Disconnected { address, reason });
        }
    }

    fn fail(
        &mut self,
        transport: &dyn TransportAdapter,
        reason: FailureReason,
        events: &mut Vec<SessionEvent>,
    ) {
        let was_ready = self.state().is_ready();
        self.abandon_writes(events);
        self.close_link(transport);

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        error!(
            "Connection to {} failed: {}",
            connection.peripheral.address, reason
        );

        connection.deadline = None;
        connection.failure = Some(reason.clone());
        let address = connection.peripheral.address.clone();
        self.set_state(ConnectionState::Failed);

        if was_ready {
            events.push(SessionEvent::Disconnected {
                address: address.clone(),
                reason: DisconnectReason::Failed(reason.clone()),
            });
        }
        events.push(SessionEvent::ConnectionFailed { address, reason });
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = self.state();

        if new_state == ConnectionState::Idle {
            self.connection = None;
        } else if let Some(connection) = self.connection.as_mut() {
            connection.state = new_state;
        }

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::{GattCharacteristic, MockTransportAdapter};
    use crate::ble::uuids::{SENSOR_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const OTHER: &str = "11:22:33:44:55:66";

    fn sensor_services() -> Vec<GattService> {
        vec![GattService {
            uuid: SENSOR_SERVICE_UUID,
            characteristics: vec![GattCharacteristic {
                uuid: SENSOR_CHARACTERISTIC_UUID,
                descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
            }],
        }]
    }

    fn transport_with(max_write_len: Option<usize>) -> MockTransportAdapter {
        let mut transport = MockTransportAdapter::new();
        transport.expect_connect().returning(|_| Ok(()));
        transport.expect_discover_services().returning(|| Ok(()));
        transport.expect_set_notify().returning(|_, _| Ok(()));
        transport
            .expect_write_descriptor()
            .withf(|_, descriptor, value| {
                *descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID && value == &NOTIFY_ENABLE_VALUE[..]
            })
            .returning(|_, _, _| Ok(()));
        transport.expect_max_write_len().return_const(max_write_len);
        transport
    }

    fn permissive_transport() -> MockTransportAdapter {
        transport_with(None)
    }

    fn ready_machine(transport: &MockTransportAdapter) -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        machine
            .connect(transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
            .unwrap();
        machine.on_link_up(transport, ADDRESS, &mut events).unwrap();
        machine
            .on_services_discovered(transport, ADDRESS, &sensor_services(), &mut events)
            .unwrap();
        machine
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Idle.is_ready());
        assert!(ConnectionState::Ready.is_ready());
        assert!(ConnectionState::Connecting.is_pending());
        assert!(ConnectionState::ServiceDiscovery.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Failed.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(format!("{}", ConnectionState::ServiceDiscovery), "ServiceDiscovery");
    }

    #[test]
    fn test_happy_path_reaches_ready() {
        let transport = permissive_transport();
        let machine = ready_machine(&transport);
        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(
            machine.connection().and_then(|c| c.writable_endpoint),
            Some(Endpoint {
                service: SENSOR_SERVICE_UUID,
                characteristic: SENSOR_CHARACTERISTIC_UUID,
            })
        );
    }

    #[test]
    fn test_service_not_found() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        machine
            .connect(&transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
            .unwrap();
        machine.on_link_up(&transport, ADDRESS, &mut events).unwrap();

        let result = machine.on_services_discovered(&transport, ADDRESS, &[], &mut events);
        assert!(matches!(result, Err(Error::ServiceNotFound { .. })));
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(
            machine.connection().and_then(|c| c.failure.clone()),
            Some(FailureReason::ServiceNotFound(SENSOR_SERVICE_UUID))
        );
    }

    #[test]
    fn test_service_discovery_failure() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        machine
            .connect(&transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
            .unwrap();
        machine.on_link_up(&transport, ADDRESS, &mut events).unwrap();

        let result =
            machine.on_service_discovery_failed(&transport, ADDRESS, "gatt error 133", &mut events);
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::ConnectionFailed { reason: FailureReason::Link(_), .. })
        ));

        // A late duplicate is stale once Failed.
        assert!(machine
            .on_service_discovery_failed(&transport, ADDRESS, "again", &mut events)
            .is_ok());
    }

    #[test]
    fn test_link_down_while_connecting_fails_without_retry() {
        let mut transport = MockTransportAdapter::new();
        transport.expect_connect().times(1).returning(|_| Ok(()));
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        machine
            .connect(&transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
            .unwrap();
        machine.on_link_down(&transport, ADDRESS, Some("status 133".into()), &mut events);

        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(
            events,
            vec![SessionEvent::ConnectionFailed {
                address: ADDRESS.into(),
                reason: FailureReason::Link("status 133".into()),
            }]
        );
    }

    #[test]
    fn test_connect_timeout() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        let start = Instant::now();
        machine
            .connect(&transport, PeripheralHandle::new(ADDRESS), start, &mut events)
            .unwrap();

        machine.poll_timeout(&transport, start + Duration::from_secs(1), &mut events);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        machine.poll_timeout(&transport, start + Duration::from_secs(30), &mut events);
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(
            machine.connection().and_then(|c| c.failure.clone()),
            Some(FailureReason::Timeout)
        );
    }

    #[test]
    fn test_retry_count_tracks_caller_retries() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();

        for expected in 0..3 {
            machine
                .connect(&transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
                .unwrap();
            assert_eq!(machine.connection().map(|c| c.retry_count), Some(expected));
            machine.on_link_down(&transport, ADDRESS, None, &mut events);
        }
    }

    #[test]
    fn test_send_requires_ready() {
        let transport = permissive_transport();
        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();

        let result = machine.send(&transport, b"T:1", &mut events);
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(events.is_empty());
    }

    fn recording_writes(transport: &mut MockTransportAdapter) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        transport.expect_write().returning(move |_, chunk| {
            sink.lock().push(chunk.to_vec());
            Ok(())
        });
        written
    }

    #[test]
    fn test_send_waits_for_each_confirmation() {
        let mut transport = permissive_transport();
        let written = recording_writes(&mut transport);

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        machine.send(&transport, &[1u8; 45], &mut events).unwrap();

        assert_eq!(written.lock().len(), 1);
        assert!(events.is_empty());

        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        assert_eq!(written.lock().len(), 2);
        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        assert_eq!(written.lock().len(), 3);
        assert!(events.is_empty());

        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        assert_eq!(
            written.lock().iter().map(Vec::len).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
        assert_eq!(events, vec![SessionEvent::WriteCompleted { bytes: 45, chunks: 3 }]);
        assert_eq!(machine.connection().map(|c| c.pending_writes()), Some(0));
    }

    #[test]
    fn test_rejected_chunk_ends_send() {
        let mut transport = permissive_transport();
        let written = recording_writes(&mut transport);

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        machine.send(&transport, &[0u8; 50], &mut events).unwrap();
        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        machine.on_write_rejected(&transport, ADDRESS, "gatt error 3", &mut events);

        // The third chunk is never attempted.
        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        assert_eq!(written.lock().len(), 2);
        assert_eq!(
            events,
            vec![SessionEvent::WriteFailed {
                partial_chunks_written: 1,
                reason: FailureReason::Transport("gatt error 3".into()),
            }]
        );
        assert_eq!(machine.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_refused_first_chunk_fails_send() {
        let mut transport = permissive_transport();
        transport
            .expect_write()
            .times(1)
            .returning(|_, _| Err(Error::Transport("busy".into())));

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        let result = machine.send(&transport, &[0u8; 50], &mut events);

        assert!(matches!(
            result,
            Err(Error::SendFailed {
                partial_chunks_written: 0
            })
        ));
        assert_eq!(
            events,
            vec![SessionEvent::WriteFailed {
                partial_chunks_written: 0,
                reason: FailureReason::Transport("busy".into()),
            }]
        );
    }

    #[test]
    fn test_sends_are_written_in_call_order() {
        let mut transport = permissive_transport();
        let written = recording_writes(&mut transport);

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        machine.send(&transport, b"FIRST", &mut events).unwrap();
        machine.send(&transport, b"SECOND", &mut events).unwrap();
        assert_eq!(*written.lock(), vec![b"FIRST".to_vec()]);
        assert_eq!(machine.connection().map(|c| c.pending_writes()), Some(2));

        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        machine.on_write_confirmed(&transport, ADDRESS, &mut events);

        assert_eq!(*written.lock(), vec![b"FIRST".to_vec(), b"SECOND".to_vec()]);
        assert_eq!(
            events,
            vec![
                SessionEvent::WriteCompleted { bytes: 5, chunks: 1 },
                SessionEvent::WriteCompleted { bytes: 6, chunks: 1 },
            ]
        );
    }

    #[test]
    fn test_disconnect_fails_pending_sends() {
        let mut transport = permissive_transport();
        recording_writes(&mut transport);
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        machine.send(&transport, &[0u8; 30], &mut events).unwrap();
        machine.on_write_confirmed(&transport, ADDRESS, &mut events);
        machine.disconnect(&transport, &mut events);

        assert_eq!(
            events,
            vec![
                SessionEvent::WriteFailed {
                    partial_chunks_written: 1,
                    reason: FailureReason::Link("link closed".into()),
                },
                SessionEvent::Disconnected {
                    address: ADDRESS.into(),
                    reason: DisconnectReason::Requested,
                },
            ]
        );
    }

    #[test]
    fn test_negotiated_write_len_is_used() {
        let mut transport = transport_with(Some(64));
        transport
            .expect_write()
            .withf(|_, chunk| chunk.len() == 50)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        machine.send(&transport, &[7u8; 50], &mut events).unwrap();
        machine.on_write_confirmed(&transport, ADDRESS, &mut events);

        assert_eq!(events, vec![SessionEvent::WriteCompleted { bytes: 50, chunks: 1 }]);
    }

    #[test]
    fn test_notify_enable_refused() {
        let mut transport = MockTransportAdapter::new();
        transport.expect_connect().returning(|_| Ok(()));
        transport.expect_discover_services().returning(|| Ok(()));
        transport
            .expect_set_notify()
            .returning(|_, _| Err(Error::Transport("not permitted".into())));
        transport.expect_write_descriptor().never();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        machine
            .connect(&transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
            .unwrap();
        machine.on_link_up(&transport, ADDRESS, &mut events).unwrap();

        let result =
            machine.on_services_discovered(&transport, ADDRESS, &sensor_services(), &mut events);

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::ConnectionFailed { reason: FailureReason::Transport(_), .. }]
        ));
    }

    #[test]
    fn test_notify_failure_on_ready_link() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();
        machine.on_notify_failed(&transport, ADDRESS, "subscribe failed", &mut events);

        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(machine.connected_peripheral(), None);
        let reason =
            FailureReason::Transport("enabling notifications failed: subscribe failed".into());
        assert_eq!(
            events,
            vec![
                SessionEvent::Disconnected {
                    address: ADDRESS.into(),
                    reason: DisconnectReason::Failed(reason.clone()),
                },
                SessionEvent::ConnectionFailed {
                    address: ADDRESS.into(),
                    reason,
                },
            ]
        );

        // Nothing further once failed.
        machine.on_notify_failed(&transport, ADDRESS, "again", &mut events);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_connect_supersedes_pending_attempt() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ConnectionStateMachine::new(&SessionConfig::default());
        let mut events = Vec::new();
        machine
            .connect(&transport, PeripheralHandle::new(ADDRESS), Instant::now(), &mut events)
            .unwrap();
        machine.on_link_up(&transport, ADDRESS, &mut events).unwrap();

        machine
            .connect(&transport, PeripheralHandle::new(OTHER), Instant::now(), &mut events)
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(
            machine.connection().map(|c| c.peripheral.address.as_str()),
            Some(OTHER)
        );

        machine
            .on_services_discovered(&transport, ADDRESS, &sensor_services(), &mut events)
            .unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(events.is_empty());
    }

    #[test]
    fn test_remote_drop_emits_single_disconnect() {
        let mut transport = permissive_transport();
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();

        machine.on_link_down(&transport, ADDRESS, None, &mut events);
        machine.on_link_down(&transport, ADDRESS, None, &mut events);
        machine.disconnect(&transport, &mut events);

        assert_eq!(machine.state(), ConnectionState::Idle);
        assert_eq!(
            events,
            vec![SessionEvent::Disconnected {
                address: ADDRESS.into(),
                reason: DisconnectReason::Remote(None),
            }]
        );
    }

    #[test]
    fn test_notification_from_other_characteristic_ignored() {
        let transport = permissive_transport();
        let mut machine = ready_machine(&transport);
        let mut events = Vec::new();

        machine.on_notification(ADDRESS, Uuid::from_u128(9), b"T:20", &mut events);
        assert!(events.is_empty());

        machine.on_notification(ADDRESS, SENSOR_CHARACTERISTIC_UUID, b"T:20", &mut events);
        assert_eq!(events.len(), 1);
    }
}
