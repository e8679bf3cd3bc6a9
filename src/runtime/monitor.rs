//! Connection liveness monitoring with bounded exponential backoff.
//!
//! One `ConnectionMonitor` per backend server connection. The orchestrator
//! reports transport events (`mark_connecting`, `mark_connected`,
//! `handle_connection_lost`, `handle_error`) and the monitor drives the
//! reconnect loop: schedule a delay, invoke the orchestrator-supplied
//! reconnect callback, and either settle into `Connected` or retry until
//! attempts are exhausted and the state flips to `Failed`.
//!
//! `Failed` is terminal; the monitor never retries past it. Recovery from
//! exhaustion requires external action (user-triggered reconnect), which the
//! orchestrator surfaces after observing the `Failed` transition.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::types::{ConnectionState, MonitorConfig};

// ─── Callback types ──────────────────────────────────────────────────────────

/// Invoked on every state transition (and on each retry round re-entering
/// `Reconnecting`), so the orchestrator can update UI/telemetry.
pub type StateChangeFn = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Attempts to re-establish the backend transport. `Ok(true)` means the
/// connection is back up; `Ok(false)` or `Err` means the attempt failed and
/// the backoff loop continues.
pub type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

// ─── ConnectionMonitor ───────────────────────────────────────────────────────

struct MonitorInner {
    state: ConnectionState,
    /// Reconnect attempts since the last successful connection.
    retry_count: u32,
    /// The running retry loop, if any. At most one per monitor; aborting it
    /// cancels the pending backoff timer.
    retry_task: Option<JoinHandle<()>>,
    /// Most recent error reported via `handle_error`.
    last_error: Option<String>,
    /// Once set, every mutating operation is an inert no-op.
    disposed: bool,
}

struct Shared {
    server_id: String,
    config: MonitorConfig,
    on_state_change: StateChangeFn,
    on_reconnect: ReconnectFn,
    inner: Mutex<MonitorInner>,
}

/// Per-connection state machine and retry scheduler.
///
/// All operations are synchronous and non-blocking; the backoff loop runs on
/// a spawned task owned by the monitor.
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
}

impl ConnectionMonitor {
    /// Create a monitor for `server_id` in the `Disconnected` state.
    pub fn new(
        server_id: impl Into<String>,
        config: MonitorConfig,
        on_state_change: impl Fn(ConnectionState) + Send + Sync + 'static,
        on_reconnect: impl Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                server_id: server_id.into(),
                config,
                on_state_change: Arc::new(on_state_change),
                on_reconnect: Arc::new(on_reconnect),
                inner: Mutex::new(MonitorInner {
                    state: ConnectionState::Disconnected,
                    retry_count: 0,
                    retry_task: None,
                    last_error: None,
                    disposed: false,
                }),
            }),
        }
    }

    /// The id of the backend server this monitor tracks.
    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Reconnect attempts since the last successful connection.
    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retry_count
    }

    /// Most recent error reported via [`handle_error`](Self::handle_error).
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Record that a connection attempt has started.
    ///
    /// A fresh attempt supersedes any backoff loop in progress, so a pending
    /// reconnect timer is cancelled. No callback fires if the state is
    /// already `Connecting`.
    pub fn mark_connecting(&self) {
        let (task, emit) = {
            let mut inner = self.shared.lock();
            if inner.disposed || inner.state == ConnectionState::Connecting {
                (None, None)
            } else {
                inner.state = ConnectionState::Connecting;
                (inner.retry_task.take(), Some(ConnectionState::Connecting))
            }
        };
        if let Some(task) = task {
            task.abort();
        }
        self.shared.emit(emit);
    }

    /// Record a successful connection: cancels any pending reconnect timer
    /// and resets the retry counter.
    pub fn mark_connected(&self) {
        self.shared.settle_connected(true);
    }

    /// Record that the transport dropped and start the reconnect loop.
    ///
    /// No-op if disposed, already reconnecting, or terminally failed.
    pub fn handle_connection_lost(&self) {
        let mut emits: Vec<ConnectionState> = Vec::new();
        {
            let mut inner = self.shared.lock();
            if inner.disposed
                || matches!(
                    inner.state,
                    ConnectionState::Reconnecting | ConnectionState::Failed
                )
            {
                return;
            }
            inner.state = ConnectionState::Reconnecting;
            emits.push(ConnectionState::Reconnecting);

            // Exhaustion is checked at scheduling time, before any delay.
            if inner.retry_count >= self.shared.config.max_retries {
                tracing::warn!(
                    server = %self.shared.server_id,
                    max_retries = self.shared.config.max_retries,
                    "reconnect attempts exhausted"
                );
                inner.state = ConnectionState::Failed;
                emits.push(ConnectionState::Failed);
            } else {
                // Stored under the same lock as the transition so no other
                // operation can observe `Reconnecting` without a timer.
                debug_assert!(inner.retry_task.is_none());
                inner.retry_task = Some(Shared::spawn_retry_loop(&self.shared));
            }
        }
        for state in emits {
            self.shared.emit(Some(state));
        }
    }

    /// Record an error from the transport or protocol layer.
    ///
    /// If currently `Connected`, the error is treated as a connection loss;
    /// otherwise it is logged only (a reconnect loop may already be running).
    pub fn handle_error(&self, err: &anyhow::Error) {
        let state = {
            let mut inner = self.shared.lock();
            if inner.disposed {
                return;
            }
            inner.last_error = Some(format!("{err:#}"));
            inner.state
        };

        if state == ConnectionState::Connected {
            tracing::warn!(
                server = %self.shared.server_id,
                error = %err,
                "connection error, treating as connection loss"
            );
            self.handle_connection_lost();
        } else {
            tracing::debug!(
                server = %self.shared.server_id,
                state = %state,
                error = %err,
                "error while not connected, ignoring"
            );
        }
    }

    /// Permanently retire the monitor: cancels any pending reconnect timer
    /// and makes every subsequent operation an inert no-op.
    pub fn dispose(&self) {
        let task = {
            let mut inner = self.shared.lock();
            inner.disposed = true;
            inner.retry_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(server = %self.shared.server_id, "connection monitor disposed");
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            if let Some(task) = inner.retry_task.take() {
                task.abort();
            }
        }
    }
}

// ─── Retry loop ──────────────────────────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire the state-change callback outside any lock.
    fn emit(&self, state: Option<ConnectionState>) {
        if let Some(state) = state {
            (self.on_state_change)(state);
        }
    }

    /// Transition into `Connected`, resetting the retry counter.
    ///
    /// `cancel_timer` is false when called from inside the retry loop, which
    /// is about to return on its own.
    fn settle_connected(&self, cancel_timer: bool) {
        let (task, emit) = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            let task = inner.retry_task.take();
            inner.retry_count = 0;
            let emit = if inner.state != ConnectionState::Connected {
                inner.state = ConnectionState::Connected;
                Some(ConnectionState::Connected)
            } else {
                None
            };
            (task, emit)
        };
        if cancel_timer {
            if let Some(task) = task {
                task.abort();
            }
        }
        self.emit(emit);
    }

    /// Delay before the attempt at index `retry_count` (pre-increment).
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.config
            .initial_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Drive the reconnect loop: sleep, attempt, and either settle or retry.
    ///
    /// A single looping task (never recursive) so there is exactly one
    /// pending timer per monitor; aborting the task cancels the timer.
    fn spawn_retry_loop(shared: &Arc<Shared>) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            loop {
                let delay = {
                    let inner = shared.lock();
                    if inner.disposed {
                        return;
                    }
                    shared.backoff_delay(inner.retry_count)
                };
                tracing::debug!(
                    server = %shared.server_id,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect attempt"
                );
                sleep(delay).await;

                let attempt = {
                    let mut inner = shared.lock();
                    if inner.disposed {
                        return;
                    }
                    inner.retry_count += 1;
                    inner.retry_count
                };

                let result = (shared.on_reconnect)().await;

                match result {
                    Ok(true) => {
                        tracing::info!(
                            server = %shared.server_id,
                            attempt,
                            "reconnected"
                        );
                        shared.settle_connected(false);
                        return;
                    }
                    Ok(false) | Err(_) => {
                        if let Err(e) = &result {
                            tracing::warn!(
                                server = %shared.server_id,
                                attempt,
                                error = %e,
                                "reconnect attempt failed"
                            );
                        } else {
                            tracing::warn!(
                                server = %shared.server_id,
                                attempt,
                                "reconnect attempt failed"
                            );
                        }

                        let emit = {
                            let mut inner = shared.lock();
                            if inner.disposed {
                                return;
                            }
                            if inner.retry_count >= shared.config.max_retries {
                                inner.retry_task = None;
                                inner.state = ConnectionState::Failed;
                                Some(ConnectionState::Failed)
                            } else {
                                // Re-announce the retry round so the
                                // orchestrator sees each backoff cycle.
                                Some(ConnectionState::Reconnecting)
                            }
                        };
                        let failed = emit == Some(ConnectionState::Failed);
                        shared.emit(emit);
                        if failed {
                            tracing::warn!(
                                server = %shared.server_id,
                                attempts = attempt,
                                "reconnect attempts exhausted"
                            );
                            return;
                        }
                    }
                }
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;
    use tokio::time::{advance, Instant};

    use super::*;

    fn test_config(max_retries: u32, initial_ms: u64, max_ms: u64) -> MonitorConfig {
        MonitorConfig {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    /// Monitor whose reconnect callback always fails, recording attempt times.
    fn failing_monitor(
        config: MonitorConfig,
    ) -> (
        ConnectionMonitor,
        Arc<Mutex<Vec<Instant>>>,
        Arc<Mutex<Vec<ConnectionState>>>,
    ) {
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
        let attempts_cb = Arc::clone(&attempts);
        let states_cb = Arc::clone(&states);
        let monitor = ConnectionMonitor::new(
            "stub",
            config,
            move |s| states_cb.lock().unwrap().push(s),
            move || {
                attempts_cb.lock().unwrap().push(Instant::now());
                async { anyhow::Ok(false) }.boxed()
            },
        );
        (monitor, attempts, states)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delay_sequence_with_defaults() {
        let (monitor, attempts, _) = failing_monitor(MonitorConfig::default());
        let start = Instant::now();
        monitor.handle_connection_lost();

        // Paused time auto-advances through every scheduled sleep.
        sleep(Duration::from_secs(120)).await;

        let at: Vec<u64> = attempts
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_millis() as u64)
            .collect();
        // Cumulative firing times for delays 1000, 2000, 4000, 8000, 16000.
        assert_eq!(at, vec![1000, 3000, 7000, 15_000, 31_000]);
        assert_eq!(monitor.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_max_delay() {
        let (monitor, attempts, _) = failing_monitor(test_config(4, 1000, 2000));
        let start = Instant::now();
        monitor.handle_connection_lost();
        sleep(Duration::from_secs(60)).await;

        let at: Vec<u64> = attempts
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_millis() as u64)
            .collect();
        // Delays 1000, 2000, then capped at 2000 for the rest.
        assert_eq!(at, vec![1000, 3000, 5000, 7000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_terminal_and_stops_scheduling() {
        let (monitor, attempts, _) = failing_monitor(test_config(2, 100, 1000));
        monitor.handle_connection_lost();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert_eq!(monitor.retry_count(), 2);
        assert_eq!(attempts.lock().unwrap().len(), 2);

        // Terminal: further connection-lost reports change nothing.
        monitor.handle_connection_lost();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.lock().unwrap().len(), 2);
        assert_eq!(monitor.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_sequence_on_exhaustion() {
        let (monitor, _, states) = failing_monitor(test_config(2, 100, 1000));
        monitor.mark_connecting();
        monitor.handle_connection_lost();
        sleep(Duration::from_secs(10)).await;

        let seq = states.lock().unwrap().clone();
        assert_eq!(
            seq,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Failed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_connecting_is_idempotent() {
        let (monitor, _, states) = failing_monitor(MonitorConfig::default());
        monitor.mark_connecting();
        monitor.mark_connecting();
        assert_eq!(monitor.state(), ConnectionState::Connecting);
        assert_eq!(states.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_connected_resets_retry_count_and_cancels_timer() {
        let (monitor, attempts, _) = failing_monitor(test_config(10, 100, 1000));
        monitor.handle_connection_lost();

        // Let two attempts fail, then declare success externally.
        sleep(Duration::from_millis(350)).await;
        assert_eq!(monitor.retry_count(), 2);

        monitor.mark_connected();
        assert_eq!(monitor.state(), ConnectionState::Connected);
        assert_eq!(monitor.retry_count(), 0);

        // The pending timer was cancelled, so no further attempts fire.
        let seen = attempts.lock().unwrap().len();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.lock().unwrap().len(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_settles_connected() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_cb = Arc::clone(&calls);
        let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
        let states_cb = Arc::clone(&states);
        // Fail twice, then succeed.
        let monitor = ConnectionMonitor::new(
            "stub",
            test_config(5, 100, 1000),
            move |s| states_cb.lock().unwrap().push(s),
            move || {
                let n = calls_cb.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::Ok(n >= 2) }.boxed()
            },
        );
        monitor.handle_connection_lost();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(monitor.state(), ConnectionState::Connected);
        assert_eq!(monitor.retry_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            states.lock().unwrap().clone(),
            vec![
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_callback_error_counts_as_failure() {
        let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
        let states_cb = Arc::clone(&states);
        let monitor = ConnectionMonitor::new(
            "stub",
            test_config(1, 100, 1000),
            move |s| states_cb.lock().unwrap().push(s),
            || async { Err(anyhow::anyhow!("transport refused")) }.boxed(),
        );
        monitor.handle_connection_lost();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert_eq!(monitor.retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_prevents_scheduling_and_state_changes() {
        let (monitor, attempts, states) = failing_monitor(MonitorConfig::default());
        monitor.dispose();

        monitor.handle_connection_lost();
        monitor.mark_connecting();
        monitor.mark_connected();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert!(attempts.lock().unwrap().is_empty());
        assert!(states.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_timer() {
        let (monitor, attempts, _) = failing_monitor(MonitorConfig::default());
        monitor.handle_connection_lost();

        // Dispose before the first 1000ms timer fires.
        advance(Duration::from_millis(500)).await;
        monitor.dispose();
        sleep(Duration::from_secs(60)).await;

        assert!(attempts.lock().unwrap().is_empty());
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_while_connected_triggers_reconnect() {
        let (monitor, attempts, _) = failing_monitor(test_config(3, 100, 1000));
        monitor.mark_connected();
        monitor.handle_error(&anyhow::anyhow!("broken pipe"));

        assert_eq!(monitor.state(), ConnectionState::Reconnecting);
        assert_eq!(monitor.last_error().as_deref(), Some("broken pipe"));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_while_reconnecting_is_logged_only() {
        let (monitor, _, states) = failing_monitor(test_config(5, 1000, 30_000));
        monitor.handle_connection_lost();
        let before = states.lock().unwrap().len();

        monitor.handle_error(&anyhow::anyhow!("still down"));
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);
        assert_eq!(states.lock().unwrap().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_while_reconnecting_is_noop() {
        let (monitor, attempts, _) = failing_monitor(MonitorConfig::default());
        monitor.handle_connection_lost();
        monitor.handle_connection_lost();
        monitor.handle_connection_lost();

        sleep(Duration::from_millis(1100)).await;
        // Only one retry loop exists; exactly one attempt after 1000ms.
        assert_eq!(attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_connecting_supersedes_backoff_loop() {
        let (monitor, attempts, _) = failing_monitor(MonitorConfig::default());
        monitor.handle_connection_lost();

        // The orchestrator starts a manual connection attempt before the
        // backoff timer fires; the pending reconnect must be cancelled.
        advance(Duration::from_millis(500)).await;
        monitor.mark_connecting();
        sleep(Duration::from_secs(60)).await;
        assert!(attempts.lock().unwrap().is_empty());
        assert_eq!(monitor.state(), ConnectionState::Connecting);

        // A later loss starts a fresh loop from the Connecting state.
        monitor.handle_connection_lost();
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_retries_fails_immediately() {
        let (monitor, attempts, states) = failing_monitor(test_config(0, 100, 1000));
        monitor.handle_connection_lost();

        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert!(attempts.lock().unwrap().is_empty());
        assert_eq!(
            states.lock().unwrap().clone(),
            vec![ConnectionState::Reconnecting, ConnectionState::Failed]
        );
    }
}
