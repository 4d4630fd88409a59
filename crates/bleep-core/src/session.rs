//! Device sessions and their lifecycle state.
//!
//! A [`DeviceSession`] is what the connection engine hands back: one remote
//! device bound to one transport handle. Its lifecycle state lives behind a
//! cloneable [`SessionHandle`] so the reconnection monitor (which owns a
//! clone inside its task) and the foreground caller see the same state.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::classifier::ErrorClassification;
use crate::monitor::{MonitorConfig, MonitorStats, ReconnectOutcome, ReconnectionMonitor};
use crate::transport::{Transport, TransportResult};
use crate::types::DeviceAddress;

/// Lifecycle of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Nothing attempted yet.
    Idle,
    /// Discovery bursts running.
    Scanning,
    /// Target seen by the adapter.
    Visible,
    /// Connect in flight.
    Connecting,
    /// Peer asked for pairing.
    PairingRequired,
    /// Pairing and trust done.
    Paired,
    /// Link up.
    Connected,
    /// Waiting for the GATT database.
    ResolvingServices,
    /// Fully enumerated and usable.
    Ready,
    /// Link dropped after having been up.
    Disconnected,
    /// Target never became visible.
    NotFound,
    /// Connect budget exhausted.
    ConnectFailed,
    /// Connect failed after stall mitigation.
    StallFailed,
    /// Services never resolved.
    ServicesUnresolved,
}

impl ConnectionState {
    /// `true` for the failure states that end an attempt.
    #[must_use]
    pub const fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::ConnectFailed | Self::StallFailed | Self::ServicesUnresolved
        )
    }

    /// Position along the happy path; states off the path share the end rank.
    const fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Scanning => 1,
            Self::Visible => 2,
            Self::Connecting => 3,
            Self::PairingRequired => 4,
            Self::Paired => 5,
            Self::Connected => 6,
            Self::ResolvingServices => 7,
            Self::Ready => 8,
            Self::Disconnected
            | Self::NotFound
            | Self::ConnectFailed
            | Self::StallFailed
            | Self::ServicesUnresolved => 9,
        }
    }

    /// Whether moving to `next` keeps the attempt monotonic.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal_failure() || matches!(self, Self::Disconnected) {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct SessionCore {
    address: DeviceAddress,
    adapter_id: String,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    connect_attempts: AtomicU32,
    last_error: Mutex<Option<ErrorClassification>>,
}

/// Shared view of a session: transport handle plus lifecycle state.
///
/// Cloning is cheap. Only the connection engine and the attached monitor
/// drive state changes.
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("address", &self.core.address)
            .field("adapter_id", &self.core.adapter_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Binds a transport handle in the `Idle` state.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, adapter_id: String) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            core: Arc::new(SessionCore {
                address: transport.address(),
                adapter_id,
                transport,
                state,
                connect_attempts: AtomicU32::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Device address.
    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.core.address
    }

    /// Adapter the session runs on.
    #[must_use]
    pub fn adapter_id(&self) -> &str {
        &self.core.adapter_id
    }

    /// The external transport handle.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.core.transport
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.core.state.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Moves to `next` if that keeps the attempt monotonic.
    ///
    /// Returns `false` (and leaves the state alone) otherwise.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut advanced = false;
        self.core.state.send_if_modified(|state| {
            if state.can_advance_to(next) {
                debug!(address = %self.core.address, from = %state, to = %next, "Session state transition");
                *state = next;
                advanced = true;
            } else {
                warn!(address = %self.core.address, from = %state, to = %next, "Rejected non-monotonic state transition");
            }
            advanced
        });
        advanced
    }

    /// Starts a new connection attempt from `Idle`.
    pub fn begin_attempt(&self) {
        self.core.state.send_replace(ConnectionState::Idle);
    }

    /// Records that the link went down.
    pub fn mark_disconnected(&self) {
        self.core.state.send_replace(ConnectionState::Disconnected);
    }

    /// Counts one transport connect call.
    pub fn record_connect_attempt(&self) -> u32 {
        self.core.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Transport connect calls made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.core.connect_attempts.load(Ordering::Relaxed)
    }

    /// Stores the latest classified error.
    pub fn record_error(&self, classification: ErrorClassification) {
        *self
            .core
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(classification);
    }

    /// The latest classified error.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorClassification> {
        *self
            .core
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live, enumerated binding to one remote device.
///
/// At most one [`ReconnectionMonitor`] is attached at a time; attaching
/// another stops the previous one first.
#[derive(Debug)]
pub struct DeviceSession {
    handle: SessionHandle,
    monitor: Option<ReconnectionMonitor>,
}

impl DeviceSession {
    /// Wraps a handle with no monitor attached.
    #[must_use]
    pub const fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            monitor: None,
        }
    }

    /// Shared handle (state, transport, counters).
    #[must_use]
    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Device address in canonical form.
    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.handle.address()
    }

    /// Adapter identifier.
    #[must_use]
    pub fn adapter_id(&self) -> &str {
        self.handle.adapter_id()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.subscribe_state()
    }

    /// Transport connect calls made for this session.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.handle.connect_attempts()
    }

    /// Latest classified error.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorClassification> {
        self.handle.last_error()
    }

    /// The transport handle.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.handle.transport()
    }

    /// Starts a reconnection monitor, stopping any existing one first.
    pub async fn attach_monitor(
        &mut self,
        config: MonitorConfig,
        on_result: Option<mpsc::UnboundedSender<ReconnectOutcome>>,
    ) {
        self.detach_monitor().await;
        info!(address = %self.address(), max_attempts = config.max_attempts, "Attaching reconnection monitor");
        self.monitor = Some(ReconnectionMonitor::start(
            self.handle.clone(),
            config,
            on_result,
        ));
    }

    /// Stops and removes the attached monitor, if any.
    pub async fn detach_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }

    /// `true` while a monitor is attached.
    #[must_use]
    pub const fn is_monitored(&self) -> bool {
        self.monitor.is_some()
    }

    /// Statistics of the attached monitor.
    pub async fn monitor_stats(&self) -> Option<MonitorStats> {
        match &self.monitor {
            Some(monitor) => Some(monitor.stats().await),
            None => None,
        }
    }

    /// Stops monitoring and drops the link.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the disconnect call fails; the monitor
    /// is stopped regardless.
    pub async fn disconnect(&mut self) -> TransportResult<()> {
        self.detach_monitor().await;
        let result = self.handle.transport().disconnect().await;
        self.handle.mark_disconnected();
        info!(address = %self.address(), ok = result.is_ok(), "Session disconnected");
        result
    }
}
