//! [`TransportAdapter`] backed by the btleplug central API.
//!
//! btleplug is async; the adapter spawns each operation on the tokio
//! runtime it was created in and reports completions as
//! [`TransportEvent`]s on an unbounded channel. Scan commands and chunk
//! writes each go through a single task so they reach the adapter in the
//! order they were issued. [`drive`] pumps the event channel (and a timer
//! for deadlines) into a [`BleSession`].

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    Advertisement, Endpoint, GattCharacteristic, GattService, ScanConfiguration,
    TransportAdapter, TransportEvent,
};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result};
use crate::session::BleSession;

/// How often [`drive`] checks deadlines by default.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Signal strength reported when the platform gives none.
const UNKNOWN_RSSI: i16 = i16::MIN;

type WriteRequest = (Characteristic, Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanCommand {
    Start,
    Stop,
}

/// The one open (or opening) link.
struct Link {
    address: String,
    peripheral: Peripheral,
    writer: mpsc::UnboundedSender<WriteRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Shared {
    available: AtomicBool,
    scanning: AtomicBool,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    link: Mutex<Option<Link>>,
}

/// btleplug implementation of [`TransportAdapter`].
pub struct BtleplugTransport {
    runtime: Handle,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Shared>,
    scan_tx: mpsc::UnboundedSender<ScanCommand>,
    central_task: JoinHandle<()>,
    scan_task: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// Returns the transport and the receiver its events arrive on.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let manager = Manager::new().await.map_err(|e| {
            warn!("Bluetooth manager unavailable: {}", e);
            Error::TransportUnavailable
        })?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::TransportUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter)
    }

    /// Wrap a specific adapter. Must be called inside a tokio runtime.
    pub fn with_adapter(adapter: Adapter) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let runtime = Handle::try_current().map_err(|e| Error::Transport(e.to_string()))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared::default());
        shared.available.store(true, Ordering::SeqCst);

        let central_task = runtime.spawn(Self::central_events(
            adapter.clone(),
            shared.clone(),
            event_tx.clone(),
        ));

        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let scan_task = runtime.spawn(Self::scan_loop(
            adapter,
            shared.clone(),
            event_tx.clone(),
            scan_rx,
        ));

        Ok((
            Self {
                runtime,
                event_tx,
                shared,
                scan_tx,
                central_task,
                scan_task,
            },
            event_rx,
        ))
    }

    /// Forward adapter events for the lifetime of the transport.
    async fn central_events(
        adapter: Adapter,
        shared: Arc<Shared>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    if !shared.scanning.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(advertisement) = Self::advertisement(&adapter, &shared, &id).await {
                        let _ = event_tx.send(TransportEvent::Advertisement(advertisement));
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let address = id.to_string();
                    let is_link = shared
                        .link
                        .lock()
                        .as_ref()
                        .map(|link| link.address == address)
                        .unwrap_or(false);

                    if is_link {
                        let _ = event_tx.send(TransportEvent::LinkDown {
                            address,
                            reason: Some("peripheral disconnected".to_string()),
                        });
                    }
                }
                CentralEvent::StateUpdate(state) => {
                    let powered = !matches!(state, CentralState::PoweredOff);
                    debug!("Adapter state update: {:?}", state);
                    shared.available.store(powered, Ordering::SeqCst);
                }
                _ => {}
            }
        }

        debug!("Adapter event stream ended");
    }

    async fn advertisement(
        adapter: &Adapter,
        shared: &Shared,
        id: &PeripheralId,
    ) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = peripheral.properties().await.ok().flatten()?;
        let address = id.to_string();
        shared.peripherals.write().insert(address.clone(), peripheral);

        Some(advertisement_from(
            address,
            properties.local_name,
            properties.rssi,
            &properties.services,
        ))
    }

    async fn scan_loop(
        adapter: Adapter,
        shared: Arc<Shared>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        commands: mpsc::UnboundedReceiver<ScanCommand>,
    ) {
        run_scan_commands(commands, |command| {
            let adapter = adapter.clone();
            let shared = shared.clone();
            let event_tx = event_tx.clone();
            async move {
                match command {
                    ScanCommand::Start => {
                        if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                            shared.scanning.store(false, Ordering::SeqCst);
                            let _ = event_tx.send(TransportEvent::ScanStartFailed {
                                reason: e.to_string(),
                            });
                        }
                    }
                    ScanCommand::Stop => {
                        if let Err(e) = adapter.stop_scan().await {
                            warn!("Failed to stop scan: {}", e);
                        }
                    }
                }
            }
        })
        .await;
    }

    /// Write chunks in order, reporting each outcome.
    async fn write_loop(
        address: String,
        peripheral: Peripheral,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    ) {
        while let Some((characteristic, data)) = requests.recv().await {
            let event = match peripheral
                .write(&characteristic, &data, WriteType::WithResponse)
                .await
            {
                Ok(()) => TransportEvent::WriteConfirmed {
                    address: address.clone(),
                },
                Err(e) => {
                    warn!("Characteristic write failed: {}", e);
                    TransportEvent::WriteRejected {
                        address: address.clone(),
                        reason: e.to_string(),
                    }
                }
            };
            if event_tx.send(event).is_err() {
                break;
            }
        }
    }

    fn current_link(&self) -> Result<(String, Peripheral)> {
        self.shared
            .link
            .lock()
            .as_ref()
            .map(|link| (link.address.clone(), link.peripheral.clone()))
            .ok_or(Error::NotConnected)
    }

    /// Attach a task to the current link so disconnect cancels it.
    fn track(&self, task: JoinHandle<()>) {
        match self.shared.link.lock().as_mut() {
            Some(link) => link.tasks.push(task),
            None => task.abort(),
        }
    }

    fn find_characteristic(peripheral: &Peripheral, endpoint: &Endpoint) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == endpoint.characteristic && c.service_uuid == endpoint.service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: endpoint.characteristic.to_string(),
            })
    }
}

impl TransportAdapter for BtleplugTransport {
    fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    fn start_scan(&self, config: &ScanConfiguration) -> Result<()> {
        if !self.is_available() {
            return Err(Error::TransportUnavailable);
        }

        // btleplug leaves duty cycle and match mode to the platform.
        debug!("Starting btleplug scan for configuration {}", config);
        self.shared.scanning.store(true, Ordering::SeqCst);

        self.scan_tx
            .send(ScanCommand::Start)
            .map_err(|_| Error::Transport("scan task stopped".to_string()))
    }

    fn stop_scan(&self) -> Result<()> {
        self.shared.scanning.store(false, Ordering::SeqCst);

        self.scan_tx
            .send(ScanCommand::Stop)
            .map_err(|_| Error::Transport("scan task stopped".to_string()))
    }

    fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self
            .shared
            .peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown peripheral {}", address)))?;

        let (writer, requests) = mpsc::unbounded_channel();
        let writer_task = self.runtime.spawn(Self::write_loop(
            address.to_string(),
            peripheral.clone(),
            self.event_tx.clone(),
            requests,
        ));

        let connecting = peripheral.clone();
        let event_tx = self.event_tx.clone();
        let link_address = address.to_string();
        let connect_task = self.runtime.spawn(async move {
            let event = match connecting.connect().await {
                Ok(()) => TransportEvent::LinkUp {
                    address: link_address,
                },
                Err(e) => TransportEvent::LinkDown {
                    address: link_address,
                    reason: Some(e.to_string()),
                },
            };
            let _ = event_tx.send(event);
        });

        let previous = self.shared.link.lock().replace(Link {
            address: address.to_string(),
            peripheral,
            writer,
            tasks: vec![writer_task, connect_task],
        });
        if let Some(previous) = previous {
            warn!("Replacing open link to {}", previous.address);
            previous.abort();
        }

        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let Some(link) = self.shared.link.lock().take() else {
            return Ok(());
        };

        let peripheral = link.peripheral.clone();
        let address = link.address.clone();
        link.abort();

        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {}", address, e);
            }
        });

        Ok(())
    }

    fn discover_services(&self) -> Result<()> {
        let (address, peripheral) = self.current_link()?;
        let event_tx = self.event_tx.clone();

        let task = self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => TransportEvent::ServicesDiscovered {
                    address,
                    services: peripheral.services().into_iter().map(gatt_service).collect(),
                },
                Err(e) => TransportEvent::ServiceDiscoveryFailed {
                    address,
                    reason: e.to_string(),
                },
            };
            let _ = event_tx.send(event);
        });
        self.track(task);

        Ok(())
    }

    fn write(&self, endpoint: &Endpoint, chunk: &[u8]) -> Result<()> {
        let guard = self.shared.link.lock();
        let link = guard.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = Self::find_characteristic(&link.peripheral, endpoint)?;

        link.writer
            .send((characteristic, chunk.to_vec()))
            .map_err(|_| Error::Transport("write queue closed".to_string()))
    }

    fn set_notify(&self, endpoint: &Endpoint, enabled: bool) -> Result<()> {
        let (address, peripheral) = self.current_link()?;
        let characteristic = Self::find_characteristic(&peripheral, endpoint)?;
        let event_tx = self.event_tx.clone();

        let task = self.runtime.spawn(async move {
            if !enabled {
                if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                    warn!("Failed to unsubscribe: {}", e);
                }
                return;
            }

            if let Err(e) = peripheral.subscribe(&characteristic).await {
                warn!("Failed to subscribe to {}: {}", characteristic.uuid, e);
                let _ = event_tx.send(TransportEvent::NotifyFailed {
                    address,
                    reason: format!("subscribe failed: {}", e),
                });
                return;
            }

            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notification stream: {}", e);
                    let _ = event_tx.send(TransportEvent::NotifyFailed {
                        address,
                        reason: format!("notification stream unavailable: {}", e),
                    });
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::Notification {
                    address: address.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }

            debug!("Notification stream for {} ended", address);
        });
        self.track(task);

        Ok(())
    }

    fn write_descriptor(&self, endpoint: &Endpoint, descriptor: Uuid, value: &[u8]) -> Result<()> {
        if descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID {
            // subscribe() already wrote the CCCD.
            trace!("CCCD write for {} handled by subscribe", endpoint.characteristic);
            return Ok(());
        }

        let (address, peripheral) = self.current_link()?;
        let characteristic = Self::find_characteristic(&peripheral, endpoint)?;
        let event_tx = self.event_tx.clone();
        let target = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("descriptor {} not found", descriptor)))?;
        let value = value.to_vec();

        let task = self.runtime.spawn(async move {
            if let Err(e) = peripheral.write_descriptor(&target, &value).await {
                warn!("Descriptor write failed: {}", e);
                let _ = event_tx.send(TransportEvent::NotifyFailed {
                    address,
                    reason: format!("descriptor write failed: {}", e),
                });
            }
        });
        self.track(task);

        Ok(())
    }

    fn max_write_len(&self) -> Option<usize> {
        None
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.central_task.abort();
        self.scan_task.abort();
        if let Some(link) = self.shared.link.lock().take() {
            link.abort();
        }
    }
}

/// Run scan commands one at a time, in issue order. Each command finishes
/// before the next one starts.
async fn run_scan_commands<F, Fut>(mut commands: mpsc::UnboundedReceiver<ScanCommand>, mut apply: F)
where
    F: FnMut(ScanCommand) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while let Some(command) = commands.recv().await {
        apply(command).await;
    }
}

/// Build an [`Advertisement`] from advertised properties.
pub fn advertisement_from(
    address: String,
    local_name: Option<String>,
    rssi: Option<i16>,
    services: &[Uuid],
) -> Advertisement {
    Advertisement {
        address,
        name: local_name,
        rssi: rssi.unwrap_or(UNKNOWN_RSSI),
        service_uuids: services.iter().map(Uuid::to_string).collect(),
    }
}

fn gatt_service(service: Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}

/// Feed transport events and deadline ticks into `session`.
///
/// Only a weak reference is kept, so the loop ends once the caller drops
/// its last handle to the session (which drops the transport and closes
/// the channel), or when every sender of `events` is gone.
pub async fn drive(
    session: Arc<BleSession>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    tick: Duration,
) {
    let weak: Weak<BleSession> = Arc::downgrade(&session);
    drop(session);
    let session = weak;
    let mut interval = tokio::time::interval(tick);

    loop {
        tokio::select! {
            event = events.recv() => match (event, session.upgrade()) {
                (Some(event), Some(session)) => {
                    if let Err(e) = session.handle_transport_event(event) {
                        warn!("Transport event handling failed: {}", e);
                    }
                }
                (None, _) => {
                    debug!("Transport event channel closed");
                    break;
                }
                (_, None) => {
                    debug!("Session dropped");
                    break;
                }
            },
            _ = interval.tick() => match session.upgrade() {
                Some(session) => session.poll_timeouts(Instant::now()),
                None => {
                    debug!("Session dropped");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::permissions::GrantAll;
    use crate::ble::transport::MockTransportAdapter;
    use crate::ble::uuids::SENSOR_SERVICE_UUID;
    use crate::config::SessionConfig;

    #[test]
    fn test_advertisement_from_properties() {
        let advertisement = advertisement_from(
            "hci0/dev_AA".to_string(),
            Some("ESP32-ConCure".to_string()),
            None,
            &[SENSOR_SERVICE_UUID],
        );

        assert_eq!(advertisement.rssi, UNKNOWN_RSSI);
        assert_eq!(
            advertisement.service_uuids,
            vec!["4fafc201-1fb5-459e-8fcc-c5c9c331914b".to_string()]
        );
    }

    #[test]
    fn test_drive_feeds_session_until_channel_closes() {
        let mut transport = MockTransportAdapter::new();
        transport.expect_is_available().return_const(true);
        transport.expect_start_scan().returning(|_| Ok(()));

        let session = Arc::new(
            BleSession::new(SessionConfig::default(), GrantAll, transport).unwrap(),
        );
        session.start_scan(false).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Advertisement(advertisement_from(
            "AA:BB:CC:DD:EE:FF".to_string(),
            Some("ESP32-ConCure".to_string()),
            Some(-62),
            &[],
        )))
        .unwrap();
        drop(tx);

        tokio_test::block_on(drive(session.clone(), rx, Duration::from_millis(10)));

        let discovered = session.discovered_peripherals();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].last_seen_signal_strength, -62);
    }

    #[test]
    fn test_scan_commands_run_in_issue_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ScanCommand::Start).unwrap();
        tx.send(ScanCommand::Stop).unwrap();
        tx.send(ScanCommand::Start).unwrap();
        drop(tx);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        tokio_test::block_on(run_scan_commands(rx, move |command| {
            let sink = sink.clone();
            async move {
                sink.lock().push(("begin", command));
                // A slow start must not let the stop overtake it.
                if command == ScanCommand::Start {
                    for _ in 0..3 {
                        tokio::task::yield_now().await;
                    }
                }
                sink.lock().push(("end", command));
            }
        }));

        assert_eq!(
            *log.lock(),
            vec![
                ("begin", ScanCommand::Start),
                ("end", ScanCommand::Start),
                ("begin", ScanCommand::Stop),
                ("end", ScanCommand::Stop),
                ("begin", ScanCommand::Start),
                ("end", ScanCommand::Start),
            ]
        );
    }

    #[test]
    fn test_drive_ends_when_session_dropped() {
        let session = Arc::new(
            BleSession::new(SessionConfig::default(), GrantAll, MockTransportAdapter::new())
                .unwrap(),
        );
        let (_tx, rx) = mpsc::unbounded_channel();

        // The only strong handle goes to the loop; the sender stays open.
        tokio_test::block_on(drive(session, rx, Duration::from_millis(10)));
    }
}
