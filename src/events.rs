//! Session events and the listener registry.
//!
//! Consumers (UI, persistence, prediction) subscribe per [`EventKind`] and
//! are called synchronously, in subscription order, on the thread that
//! observed the underlying transport event.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::permissions::Capability;
use crate::ble::scanner::PeripheralHandle;
use crate::ble::transport::ScanConfiguration;
use crate::error::Error;
use crate::protocol::TelemetryFrame;

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceFound,
    DeviceUpdated,
    ScanStarted,
    ScanStopped,
    ScanError,
    Connected,
    Disconnected,
    ConnectionFailed,
    DataReceived,
    WriteCompleted,
    WriteFailed,
}

impl EventKind {
    /// Every kind, for consumers that observe everything.
    pub const ALL: [EventKind; 11] = [
        EventKind::DeviceFound,
        EventKind::DeviceUpdated,
        EventKind::ScanStarted,
        EventKind::ScanStopped,
        EventKind::ScanError,
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::ConnectionFailed,
        EventKind::DataReceived,
        EventKind::WriteCompleted,
        EventKind::WriteFailed,
    ];
}

/// Why a link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked for it.
    Requested,
    /// A connect to another peripheral replaced this link.
    Superseded,
    /// The session was cleaned up.
    Shutdown,
    /// The transport reported the drop.
    Remote(Option<String>),
    /// A failure on the ready link forced it closed.
    Failed(FailureReason),
}

/// Cloneable failure description carried by error events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied(Capability),
    TransportUnavailable,
    AllConfigurationsFailed,
    Link(String),
    Timeout,
    ServiceNotFound(Uuid),
    CharacteristicNotFound(Uuid),
    Transport(String),
}

impl From<&Error> for FailureReason {
    fn from(err: &Error) -> Self {
        match err {
            Error::PermissionDenied { capability } => Self::PermissionDenied(*capability),
            Error::TransportUnavailable => Self::TransportUnavailable,
            Error::AllConfigurationsFailed => Self::AllConfigurationsFailed,
            Error::ConnectionFailed { reason } => Self::Link(reason.clone()),
            Error::ServiceNotFound { uuid } => {
                Self::ServiceNotFound(Uuid::parse_str(uuid).unwrap_or_default())
            }
            Error::CharacteristicNotFound { uuid } => {
                Self::CharacteristicNotFound(Uuid::parse_str(uuid).unwrap_or_default())
            }
            Error::Transport(reason) => Self::Transport(reason.clone()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied(capability) => write!(f, "{} permission denied", capability),
            Self::TransportUnavailable => write!(f, "transport unavailable"),
            Self::AllConfigurationsFailed => write!(f, "all scan configurations failed"),
            Self::Link(reason) => write!(f, "link failure: {}", reason),
            Self::Timeout => write!(f, "timed out"),
            Self::ServiceNotFound(uuid) => write!(f, "service {} not found", uuid),
            Self::CharacteristicNotFound(uuid) => write!(f, "characteristic {} not found", uuid),
            Self::Transport(reason) => write!(f, "transport error: {}", reason),
        }
    }
}

/// An event dispatched to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A peripheral was seen for the first time in this scan.
    DeviceFound(PeripheralHandle),
    /// A known peripheral advertised again.
    DeviceUpdated(PeripheralHandle),
    /// A scan configuration started successfully.
    ScanStarted {
        /// The configuration in use for the rest of the session.
        configuration: ScanConfiguration,
    },
    /// The scan session ended.
    ScanStopped {
        /// Number of unique peripherals seen.
        discovered: usize,
    },
    /// The scan could not run.
    ScanError {
        /// Why.
        reason: FailureReason,
    },
    /// The connection reached `Ready`.
    Connected(PeripheralHandle),
    /// An established or pending link ended.
    Disconnected {
        /// Peripheral address.
        address: String,
        /// Why the link ended.
        reason: DisconnectReason,
    },
    /// A connection attempt failed.
    ConnectionFailed {
        /// Peripheral address.
        address: String,
        /// Why.
        reason: FailureReason,
    },
    /// A notification was decoded.
    DataReceived {
        /// The decoded frame.
        frame: TelemetryFrame,
        /// The notification payload exactly as received.
        raw: Bytes,
        /// Receive timestamp.
        received_at: DateTime<Utc>,
    },
    /// A chunked send completed.
    WriteCompleted {
        /// Total payload length.
        bytes: usize,
        /// Number of transport writes.
        chunks: usize,
    },
    /// A chunk of a send was rejected; the rest of that send was dropped.
    WriteFailed {
        /// Chunks confirmed before the rejection.
        partial_chunks_written: usize,
        /// Why.
        reason: FailureReason,
    },
}

impl SessionEvent {
    /// The kind this event is dispatched under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceFound(_) => EventKind::DeviceFound,
            Self::DeviceUpdated(_) => EventKind::DeviceUpdated,
            Self::ScanStarted { .. } => EventKind::ScanStarted,
            Self::ScanStopped { .. } => EventKind::ScanStopped,
            Self::ScanError { .. } => EventKind::ScanError,
            Self::Connected(_) => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            Self::DataReceived { .. } => EventKind::DataReceived,
            Self::WriteCompleted { .. } => EventKind::WriteCompleted,
            Self::WriteFailed { .. } => EventKind::WriteFailed,
        }
    }
}

/// Handle returned by [`ListenerRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Get the subscription ID.
    pub fn id(&self) -> u64 {
        self.0
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscriber {
    handle: SubscriptionHandle,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of session events to independent consumers.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<RegistryInner>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let handle = SubscriptionHandle(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            handle,
            kind,
            handler: Arc::new(handler),
        });
        handle
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.handle != handle);
        inner.subscribers.len() != before
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Call every subscriber of the event's kind, in subscription order.
    ///
    /// The subscriber list is snapshotted first, so handlers may subscribe
    /// or unsubscribe while being called.
    pub fn dispatch(&self, event: &SessionEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.handler.clone())
            .collect();

        trace!("Dispatching {:?} to {} listener(s)", kind, handlers.len());

        for handler in handlers {
            handler(event);
        }
    }
}
