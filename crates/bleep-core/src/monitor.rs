//! Background reconnection monitor.
//!
//! One supervised tokio task per session polls connectivity once per second.
//! When the link drops it runs an exponential back-off reconnection episode,
//! re-drives service resolution, and reports exactly one
//! [`ReconnectOutcome`] per episode on the caller's channel.
//!
//! The task owns a clone of the [`SessionHandle`]; the stop signal travels
//! over a `watch` channel and is observed within one polling tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::classify;
use crate::session::{ConnectionState, SessionHandle};

/// Interval between connectivity polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Back-off after an unexpected error inside the watcher loop.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(2);
/// Attempt counter resets when the last reconnection is older than this.
pub const ATTEMPT_RESET_WINDOW: Duration = Duration::from_secs(60);
/// How long to poll for service resolution after a reconnect.
pub const RESOLUTION_POLL_WINDOW: Duration = Duration::from_secs(5);
/// Interval of the post-reconnect resolution poll.
pub const RESOLUTION_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Timeout of the forced re-resolution fallback.
pub const FORCED_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `stop` waits for the task before aborting it.
pub const STOP_JOIN_WINDOW: Duration = Duration::from_secs(1);

/// Back-off parameters of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Reconnection attempts per disconnect episode.
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Delay before the first attempt, in seconds.
    pub initial_delay_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_factor: 1.5,
            initial_delay_secs: 1.0,
        }
    }
}

impl MonitorConfig {
    /// Delay before attempt `attempt` (1-indexed):
    /// `initial_delay * backoff_factor^(attempt - 1)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay_secs * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectionEvent {
    /// Link loss detected.
    Disconnected,
    /// Link restored.
    Reconnected,
}

/// One entry of the append-only monitor history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectionRecord {
    /// When the event was observed.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event: ReconnectionEvent,
}

/// Result of one disconnect episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectOutcome {
    /// The link was restored.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Attempts made in this episode.
    pub attempts: u32,
}

/// Snapshot of a monitor's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Attempts made since the counter was last reset.
    ///
    /// The counter is reset when an episode starts more than
    /// [`ATTEMPT_RESET_WINDOW`] after the last successful reconnection, and
    /// otherwise keeps accumulating across episodes. It is reported only and
    /// never caps the attempts of an episode, which always gets up to
    /// `max_attempts` tries.
    pub reconnection_attempts: u32,
    /// Successful reconnections over the monitor's lifetime.
    pub successful_reconnections: u32,
    /// Last detected disconnect.
    pub last_disconnect: Option<DateTime<Utc>>,
    /// Last successful reconnection.
    pub last_reconnect: Option<DateTime<Utc>>,
    /// Append-only event history.
    pub history: Vec<ReconnectionRecord>,
    /// Link state at the last poll.
    pub currently_connected: bool,
    /// Resolution state at the last poll.
    pub services_resolved: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    stats: MonitorStats,
    last_reconnect_at: Option<Instant>,
}

impl MonitorState {
    fn push(&mut self, event: ReconnectionEvent) -> DateTime<Utc> {
        let timestamp = Utc::now();
        self.stats.history.push(ReconnectionRecord { timestamp, event });
        timestamp
    }
}

/// Handle to a running monitor task.
///
/// Dropping the handle aborts the task.
#[derive(Debug)]
pub struct ReconnectionMonitor {
    shared: Arc<Mutex<MonitorState>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReconnectionMonitor {
    /// Spawns the watcher task for `session`.
    ///
    /// Must be called from within a tokio runtime. Sessions start their
    /// monitor through [`DeviceSession::attach_monitor`](crate::session::DeviceSession::attach_monitor),
    /// which keeps at most one watcher per session.
    #[must_use]
    pub(crate) fn start(
        session: SessionHandle,
        config: MonitorConfig,
        on_result: Option<mpsc::UnboundedSender<ReconnectOutcome>>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(MonitorState::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Watcher {
            session,
            config,
            on_result,
            shared: Arc::clone(&shared),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());
        Self {
            shared,
            shutdown,
            task: Some(task),
        }
    }

    /// Stops the watcher, waiting up to [`STOP_JOIN_WINDOW`] before aborting it.
    ///
    /// Safe to call repeatedly and after the task has exited.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(STOP_JOIN_WINDOW, &mut task).await.is_err() {
            warn!("Reconnection monitor did not stop in time, aborting");
            task.abort();
        }
    }

    /// `true` while the watcher task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Snapshot of the counters and history.
    pub async fn stats(&self) -> MonitorStats {
        self.shared.lock().await.stats.clone()
    }
}

impl Drop for ReconnectionMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Raised inside the watcher when the stop signal arrives.
struct Stopped;

struct Watcher {
    session: SessionHandle,
    config: MonitorConfig,
    on_result: Option<mpsc::UnboundedSender<ReconnectOutcome>>,
    shared: Arc<Mutex<MonitorState>>,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    async fn run(mut self) {
        let address = self.session.address();
        info!(%address, "Reconnection monitor started");
        let mut was_connected = true;

        loop {
            if self.pause(POLL_INTERVAL).await.is_err() {
                break;
            }

            let connected = match self.session.transport().is_connected().await {
                Ok(connected) => connected,
                Err(e) => {
                    error!(%address, error = %e, "Connectivity poll failed");
                    if self.pause(ERROR_BACKOFF).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let resolved = if connected {
                self.session
                    .transport()
                    .is_services_resolved()
                    .await
                    .unwrap_or(false)
            } else {
                false
            };
            {
                let mut state = self.shared.lock().await;
                state.stats.currently_connected = connected;
                state.stats.services_resolved = resolved;
            }

            if connected {
                was_connected = true;
                continue;
            }
            if !was_connected {
                continue;
            }
            was_connected = false;

            match self.episode().await {
                Ok(outcome) => {
                    if outcome.success {
                        was_connected = true;
                    }
                    if let Some(tx) = &self.on_result {
                        let _ = tx.send(outcome);
                    }
                }
                Err(Stopped) => break,
            }
        }

        info!(%address, "Reconnection monitor stopped");
    }

    /// Sleeps for `duration` unless a stop is requested first.
    async fn pause(&mut self, duration: Duration) -> Result<(), Stopped> {
        if *self.shutdown.borrow() {
            return Err(Stopped);
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.changed() => Err(Stopped),
        }
    }

    async fn episode(&mut self) -> Result<ReconnectOutcome, Stopped> {
        let address = self.session.address();
        self.session.mark_disconnected();
        {
            let mut state = self.shared.lock().await;
            let at = state.push(ReconnectionEvent::Disconnected);
            state.stats.last_disconnect = Some(at);
            state.stats.currently_connected = false;
            state.stats.services_resolved = false;
            let stale = state
                .last_reconnect_at
                .map_or(true, |t| t.elapsed() > ATTEMPT_RESET_WINDOW);
            if stale {
                state.stats.reconnection_attempts = 0;
            }
        }
        warn!(%address, "Device disconnected, starting reconnection");

        for attempt in 1..=self.config.max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            debug!(%address, attempt, delay_ms = delay.as_millis(), "Waiting before reconnect attempt");
            self.pause(delay).await?;

            self.shared.lock().await.stats.reconnection_attempts += 1;
            self.session.begin_attempt();
            self.session.advance(ConnectionState::Connecting);
            self.session.record_connect_attempt();

            let transport = Arc::clone(self.session.transport());
            let result = tokio::select! {
                r = transport.connect(1) => r,
                _ = self.shutdown.changed() => return Err(Stopped),
            };

            match result {
                Ok(()) => {
                    self.session.advance(ConnectionState::Connected);
                    {
                        let mut state = self.shared.lock().await;
                        let at = state.push(ReconnectionEvent::Reconnected);
                        state.stats.last_reconnect = Some(at);
                        state.stats.successful_reconnections += 1;
                        state.stats.currently_connected = true;
                        state.last_reconnect_at = Some(Instant::now());
                    }
                    info!(%address, attempt, "Reconnected");

                    let resolved = self.restore_services().await?;
                    self.shared.lock().await.stats.services_resolved = resolved;
                    let message = if resolved {
                        self.session.advance(ConnectionState::Ready);
                        format!("Reconnected to {address} on attempt {attempt}")
                    } else {
                        warn!(%address, "Reconnected but services did not resolve");
                        format!("Reconnected to {address} on attempt {attempt}, services unresolved")
                    };
                    return Ok(ReconnectOutcome {
                        success: true,
                        message,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    self.session.record_error(classify(&e.kind));
                    warn!(%address, attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        self.session.mark_disconnected();
        error!(%address, attempts = self.config.max_attempts, "Reconnection failed");
        Ok(ReconnectOutcome {
            success: false,
            message: format!(
                "Failed to reconnect to {address} after {} attempts",
                self.config.max_attempts
            ),
            attempts: self.config.max_attempts,
        })
    }

    /// Polls for resolution, then forces a re-resolution as a fallback.
    async fn restore_services(&mut self) -> Result<bool, Stopped> {
        self.session.advance(ConnectionState::ResolvingServices);
        let deadline = Instant::now() + RESOLUTION_POLL_WINDOW;
        loop {
            if let Ok(true) = self.session.transport().is_services_resolved().await {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                break;
            }
            self.pause(RESOLUTION_POLL_INTERVAL).await?;
        }

        debug!(address = %self.session.address(), "Forcing service re-resolution");
        let transport = Arc::clone(self.session.transport());
        let forced = tokio::select! {
            r = transport.force_service_resolution(FORCED_RESOLUTION_TIMEOUT) => r,
            _ = self.shutdown.changed() => return Err(Stopped),
        };
        Ok(forced.unwrap_or_else(|e| {
            warn!(address = %self.session.address(), error = %e, "Forced re-resolution failed");
            false
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, ScriptedConnect};
    use crate::transport::TransportErrorKind;

    fn setup() -> (Arc<MockTransport>, SessionHandle) {
        let transport = Arc::new(MockTransport::new("AA:BB:CC:DD:EE:30".parse().unwrap()));
        transport.set_connected(true);
        transport.set_services_resolved(true);
        let session = SessionHandle::new(transport.clone(), "hci0".into());
        (transport, session)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(diff <= Duration::from_millis(10), "{actual:?} vs {expected:?}");
    }

    #[test]
    fn test_backoff_schedule() {
        let config = MonitorConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(2250));
        assert_eq!(config.delay_for_attempt(4), Duration::from_micros(3_375_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_on_second_attempt() {
        let (transport, session) = setup();
        transport.script_connects([
            ScriptedConnect::fail(TransportErrorKind::Failed),
            ScriptedConnect::ok(),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReconnectionMonitor::start(session.clone(), MonitorConfig::default(), Some(tx));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        transport.drop_link();

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);

        let stats = monitor.stats().await;
        let events: Vec<_> = stats.history.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![ReconnectionEvent::Disconnected, ReconnectionEvent::Reconnected]
        );
        assert_eq!(stats.successful_reconnections, 1);
        assert_eq!(stats.reconnection_attempts, 2);
        assert!(stats.currently_connected);
        assert!(stats.services_resolved);
        assert!(stats.last_disconnect <= stats.last_reconnect);
        assert_eq!(session.state(), ConnectionState::Ready);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_counter_resets_after_quiet_window() {
        let (transport, session) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReconnectionMonitor::start(session, MonitorConfig::default(), Some(tx));

        transport.script_connects([
            ScriptedConnect::fail(TransportErrorKind::Failed),
            ScriptedConnect::ok(),
        ]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        transport.drop_link();
        assert!(rx.recv().await.unwrap().success);
        assert_eq!(monitor.stats().await.reconnection_attempts, 2);

        // A second drop right after a reconnection keeps counting.
        transport.script_connects([
            ScriptedConnect::fail(TransportErrorKind::Failed),
            ScriptedConnect::ok(),
        ]);
        transport.drop_link();
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(monitor.stats().await.reconnection_attempts, 4);

        // After a quiet minute the next episode starts from zero.
        tokio::time::sleep(ATTEMPT_RESET_WINDOW + Duration::from_secs(1)).await;
        transport.script_connects([ScriptedConnect::ok()]);
        transport.drop_link();
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);

        let stats = monitor.stats().await;
        assert_eq!(stats.reconnection_attempts, 1);
        assert_eq!(stats.successful_reconnections, 3);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_attempts() {
        let (transport, session) = setup();
        let config = MonitorConfig {
            max_attempts: 4,
            ..MonitorConfig::default()
        };
        transport.script_connects((0..4).map(|_| ScriptedConnect::fail(TransportErrorKind::NotAvailable)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReconnectionMonitor::start(session, config, Some(tx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        transport.drop_link();
        let dropped_at = Instant::now();

        let outcome = rx.recv().await.unwrap();
        assert!(!outcome.success);

        let calls = transport.connect_instants();
        assert_eq!(calls.len(), 4);
        // The drop is noticed on the next 1 s poll tick, 500 ms later.
        let detected_at = dropped_at + Duration::from_millis(500);
        assert_close(calls[0] - detected_at, config.delay_for_attempt(1));
        for i in 1..calls.len() {
            let attempt = u32::try_from(i + 1).unwrap();
            assert_close(calls[i] - calls[i - 1], config.delay_for_attempt(attempt));
        }
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_episode_reports_once_and_keeps_running() {
        let (transport, session) = setup();
        let config = MonitorConfig {
            max_attempts: 3,
            ..MonitorConfig::default()
        };
        transport.script_connects((0..3).map(|_| ScriptedConnect::fail(TransportErrorKind::Failed)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReconnectionMonitor::start(session.clone(), config, Some(tx));

        transport.drop_link();
        let outcome = rx.recv().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_calls(), 3);
        assert!(rx.try_recv().is_err());
        assert!(monitor.is_running());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // The link comes back by other means and drops again: a new episode.
        transport.set_connected(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        transport.drop_link();
        let second = rx.recv().await.unwrap();
        assert!(second.success);
        let stats = monitor.stats().await;
        assert_eq!(stats.history.len(), 3);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_forces_resolution_when_poll_window_expires() {
        let (transport, session) = setup();
        transport.script_connects([ScriptedConnect::ok_unresolved()]);
        transport.resolve_on_force(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReconnectionMonitor::start(session, MonitorConfig::default(), Some(tx));

        transport.drop_link();
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.success);
        assert_eq!(transport.forced_resolutions(), 1);
        assert!(monitor.stats().await.services_resolved);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_do_not_kill_the_watcher() {
        let (transport, session) = setup();
        transport.fail_connectivity_polls(2);
        let mut monitor = ReconnectionMonitor::start(session, MonitorConfig::default(), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(monitor.is_running());
        assert!(monitor.stats().await.currently_connected);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_prompt_and_idempotent() {
        let (transport, session) = setup();
        transport.script_connects([ScriptedConnect::hang()]);
        let mut monitor = ReconnectionMonitor::start(session, MonitorConfig::default(), None);

        transport.drop_link();
        // Let the episode reach the hanging connect.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.connect_calls(), 1);

        let start = Instant::now();
        monitor.stop().await;
        assert!(start.elapsed() <= STOP_JOIN_WINDOW);
        assert!(!monitor.is_running());

        monitor.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_calls(), 1);
    }
}
