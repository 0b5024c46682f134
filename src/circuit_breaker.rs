//! Circuit Breaker
//!
//! Guards calls to one logical dependency (e.g. the remote cache) and fails fast
//! once failures cross a threshold. Three states:
//!
//! ```text
//! Closed ──(failures >= threshold, volume >= volume_threshold)──► Open
//! Open ──(now >= next_attempt)──► HalfOpen
//! HalfOpen ──(one failure)──► Open
//! HalfOpen ──(success_threshold consecutive successes)──► Closed
//! ```
//!
//! Counters live in a time window. When a call arrives after `window_size` has
//! elapsed since the window began, all counters are zeroed before the call is
//! counted. This happens in every state, including `Open`.
//!
//! The breaker publishes [`CircuitBreakerEvent`]s on a broadcast channel. Observers
//! (a metrics collector) are optional; sending with no receivers is a no-op.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow observers lag instead of blocking the breaker
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - calls fail fast until `next_attempt`
    Open,
    /// Probing - calls are let through to test whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

/// Immutable configuration of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Unique breaker name
    pub name: String,
    /// Failures within the window required to open
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
    /// How long to stay open before probing
    pub timeout: Duration,
    /// Duration over which counters accumulate before being reset
    pub window_size: Duration,
    /// Minimum requests in the window before the breaker may open
    pub volume_threshold: u32,
}

impl CircuitBreakerConfig {
    /// Default configuration under the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            window_size: Duration::from_secs(60),
            volume_threshold: 10,
        }
    }
}

/// Errors returned by [`CircuitBreaker::execute`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker is open; the operation was not attempted
    #[error("circuit breaker '{name}' is open, next attempt in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed; this is its original error
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if the operation ran
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::Open { .. } => None,
        }
    }
}

/// Notifications emitted by a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    StateChange {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
    Open {
        name: String,
        failures: u64,
    },
    Close {
        name: String,
    },
    HalfOpen {
        name: String,
    },
    Success {
        name: String,
    },
    Failure {
        name: String,
        failures: u64,
    },
    Rejected {
        name: String,
    },
    WindowReset {
        name: String,
    },
}

impl CircuitBreakerEvent {
    /// Name of the breaker that emitted the event
    pub fn breaker(&self) -> &str {
        match self {
            Self::StateChange { name, .. }
            | Self::Open { name, .. }
            | Self::Close { name }
            | Self::HalfOpen { name }
            | Self::Success { name }
            | Self::Failure { name, .. }
            | Self::Rejected { name }
            | Self::WindowReset { name } => name,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub total_requests: u64,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    /// Only set while `Open`
    pub next_attempt: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    total_requests: u64,
    window_start: Instant,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    next_attempt: Option<Instant>,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            total_requests: 0,
            window_start: now,
            last_failure_time: None,
            last_success_time: None,
            next_attempt: None,
        }
    }
}

/// Named circuit breaker
///
/// Counters are mutated only inside [`execute`](Self::execute) and [`reset`](Self::reset).
/// The state lock is never held while the guarded operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: broadcast::Sender<CircuitBreakerEvent>,
}

impl CircuitBreaker {
    /// Create a breaker in the `Closed` state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            breaker = %config.name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            volume_threshold = config.volume_threshold,
            timeout_ms = u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX),
            "Circuit breaker initialized"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BreakerState::new(Instant::now())),
            config,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitBreakerEvent> {
        self.events.subscribe()
    }

    /// Run `operation` under breaker protection
    ///
    /// While open and before `next_attempt`, the operation is never invoked and
    /// [`CircuitBreakerError::Open`] is returned. Otherwise the operation runs and
    /// its error, if any, is returned unchanged inside
    /// [`CircuitBreakerError::Operation`] after bookkeeping.
    ///
    /// # Errors
    ///
    /// `Open` when the call was rejected, `Operation` when the operation failed.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_after) = self.admit() {
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
                retry_after,
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(err))
            }
        }
    }

    /// Force `Closed` and clear every counter and timestamp
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let previous = state.state;
        *state = BreakerState::new(now);

        if previous != CircuitState::Closed {
            self.emit(|name| CircuitBreakerEvent::StateChange {
                name,
                from: previous,
                to: CircuitState::Closed,
            });
        }
        info!(breaker = %self.config.name, previous = %previous, "Circuit breaker reset");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            total_requests: state.total_requests,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            next_attempt: state.next_attempt,
        }
    }

    /// Window bookkeeping and the open-state gate. `Err` carries the remaining wait.
    fn admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if now.duration_since(state.window_start) > self.config.window_size {
            state.failures = 0;
            state.successes = 0;
            state.total_requests = 0;
            state.window_start = now;
            self.emit(|name| CircuitBreakerEvent::WindowReset { name });
            debug!(breaker = %self.config.name, state = %state.state, "Circuit breaker window reset");
        }

        state.total_requests += 1;

        if state.state == CircuitState::Open {
            match state.next_attempt {
                Some(next_attempt) if now < next_attempt => {
                    self.emit(|name| CircuitBreakerEvent::Rejected { name });
                    debug!(breaker = %self.config.name, "Circuit breaker rejected call");
                    return Err(next_attempt.duration_since(now));
                }
                _ => self.transition_to_half_open(&mut state),
            }
        }

        Ok(())
    }

    fn record_success(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.successes += 1;
        state.failures = 0;
        state.last_success_time = Some(now);
        self.emit(|name| CircuitBreakerEvent::Success { name });

        if state.state == CircuitState::HalfOpen
            && state.successes >= u64::from(self.config.success_threshold)
        {
            self.transition_to_closed(&mut state);
        }
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.failures += 1;
        state.last_failure_time = Some(now);
        let failures = state.failures;
        self.emit(|name| CircuitBreakerEvent::Failure { name, failures });

        match state.state {
            CircuitState::HalfOpen => self.transition_to_open(&mut state, now),
            CircuitState::Closed
                if state.total_requests >= u64::from(self.config.volume_threshold)
                    && state.failures >= u64::from(self.config.failure_threshold) =>
            {
                self.transition_to_open(&mut state, now);
            }
            _ => {}
        }
    }

    fn transition_to_open(&self, state: &mut BreakerState, now: Instant) {
        let previous = state.state;
        state.state = CircuitState::Open;
        state.next_attempt = Some(retry_deadline(now, self.config.timeout));
        let failures = state.failures;

        self.emit(|name| CircuitBreakerEvent::StateChange {
            name,
            from: previous,
            to: CircuitState::Open,
        });
        self.emit(|name| CircuitBreakerEvent::Open { name, failures });
        warn!(
            breaker = %self.config.name,
            from = %previous,
            failures = failures,
            total_requests = state.total_requests,
            timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
            "Circuit breaker opened (failing fast)"
        );
    }

    fn transition_to_half_open(&self, state: &mut BreakerState) {
        state.state = CircuitState::HalfOpen;
        state.successes = 0;

        self.emit(|name| CircuitBreakerEvent::StateChange {
            name,
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        });
        self.emit(|name| CircuitBreakerEvent::HalfOpen { name });
        info!(breaker = %self.config.name, "Circuit breaker half-open (probing)");
    }

    fn transition_to_closed(&self, state: &mut BreakerState) {
        state.state = CircuitState::Closed;
        state.failures = 0;
        state.next_attempt = None;

        self.emit(|name| CircuitBreakerEvent::StateChange {
            name,
            from: CircuitState::HalfOpen,
            to: CircuitState::Closed,
        });
        self.emit(|name| CircuitBreakerEvent::Close { name });
        info!(
            breaker = %self.config.name,
            successes = state.successes,
            "Circuit breaker closed (recovered)"
        );
    }

    fn emit(&self, event: impl FnOnce(String) -> CircuitBreakerEvent) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(event(self.config.name.clone()));
        }
    }
}

/// `now + timeout`, clamped to roughly 30 years when the sum leaves the clock's range
fn retry_deadline(now: Instant, timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure: u32, volume: u32, success: u32, timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: "test".to_string(),
            failure_threshold: failure,
            success_threshold: success,
            timeout: Duration::from_millis(timeout_ms),
            window_size: Duration::from_secs(60),
            volume_threshold: volume,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<String>> {
        breaker
            .execute(|| async { Err::<(), _>("boom".to_string()) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<String>> {
        breaker.execute(|| async { Ok::<_, String>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_closed_and_passes_through() {
        let breaker = CircuitBreaker::new(config(3, 3, 2, 1000));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let value = breaker
            .execute(|| async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let stats = breaker.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.total_requests, 1);
        assert!(stats.last_success_time.is_some());
        assert!(stats.next_attempt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_is_returned_verbatim() {
        let breaker = CircuitBreaker::new(config(3, 3, 2, 1000));
        let err = fail(&breaker).await.unwrap_err();
        assert!(!err.is_open());
        assert_eq!(err.into_operation(), Some("boom".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let breaker = CircuitBreaker::new(config(3, 3, 2, 1000));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.stats().next_attempt.is_some());

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_threshold_prevents_opening() {
        let breaker = CircuitBreaker::new(config(2, 5, 2, 1000));
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failures, 4);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(config(3, 1, 2, 1000));
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_invokes_once_then_closes() {
        let breaker = CircuitBreaker::new(config(3, 3, 2, 1000));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert!(fail(&breaker).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_millis(1000)).await;

        let calls = AtomicU32::new(0);
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failures, 0);
        assert!(breaker.stats().next_attempt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_regardless_of_successes() {
        let breaker = CircuitBreaker::new(config(1, 1, 3, 500));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let err = fail(&breaker).await.unwrap_err();
        assert!(!err.is_open());
        assert_eq!(breaker.state(), CircuitState::Open);

        let next_attempt = breaker.stats().next_attempt.unwrap();
        assert!(next_attempt > Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_forgets_stale_failures() {
        let mut cfg = config(3, 3, 2, 1000);
        cfg.window_size = Duration::from_secs(1);
        let breaker = CircuitBreaker::new(cfg);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        let _ = fail(&breaker).await;

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_while_open_keeps_open_state() {
        let mut cfg = config(1, 1, 1, 10_000);
        cfg.window_size = Duration::from_secs(1);
        let breaker = CircuitBreaker::new(cfg);

        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(succeed(&breaker).await.unwrap_err().is_open());
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_stays_open() {
        let mut cfg = config(1, 1, 1, 0);
        cfg.timeout = Duration::MAX;
        let breaker = CircuitBreaker::new(cfg);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
        assert!(succeed(&breaker).await.unwrap_err().is_open());
        assert!(breaker.stats().next_attempt.unwrap() > Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_everything() {
        let breaker = CircuitBreaker::new(config(1, 1, 2, 1000));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.total_requests, 0);
        assert!(stats.last_failure_time.is_none());
        assert!(stats.next_attempt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_state_machine() {
        let breaker = CircuitBreaker::new(config(1, 1, 1, 100));
        let mut events = breaker.subscribe();

        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        succeed(&breaker).await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        let name = "test".to_string();
        assert_eq!(
            received,
            vec![
                CircuitBreakerEvent::Failure { name: name.clone(), failures: 1 },
                CircuitBreakerEvent::StateChange {
                    name: name.clone(),
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                },
                CircuitBreakerEvent::Open { name: name.clone(), failures: 1 },
                CircuitBreakerEvent::Rejected { name: name.clone() },
                CircuitBreakerEvent::StateChange {
                    name: name.clone(),
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                },
                CircuitBreakerEvent::HalfOpen { name: name.clone() },
                CircuitBreakerEvent::Success { name: name.clone() },
                CircuitBreakerEvent::StateChange {
                    name: name.clone(),
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                },
                CircuitBreakerEvent::Close { name },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_scenario() {
        let breaker = CircuitBreaker::new(config(3, 3, 2, 1000));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(rejected.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
