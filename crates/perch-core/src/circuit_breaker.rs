//! Circuit breaker guarding calls to the external provider.
//!
//! Each guarded call site owns its own breaker, so a high-volume search
//! call and a low-volume profile lookup can be tuned independently.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cool-down]--> HALF_OPEN (probing)
//!                                                                          |
//!                                        <--[failure]--                    |
//!                                                                          |
//! CLOSED <----------------------------[success]----------------------------+
//! ```
//!
//! State and counters are atomics. Every transition is a compare-exchange,
//! so when several callers race for the same transition exactly one wins.
//! Time is measured against a monotonic clock anchored at construction.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a trial request decides the next state.
    HalfOpen,
}

impl CircuitState {
    const fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of failures while closed before opening the circuit.
    pub failure_threshold: u64,

    /// Time to wait in Open before a trial call is let through.
    pub retry_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retry_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

/// Outcome of [`CircuitBreaker::call_started`] when the call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed.
    Closed,
    /// This caller moved the breaker from Open to HalfOpen; its call is the probe.
    Probe,
    /// Breaker is already half-open; the call goes through alongside the first one.
    HalfOpen,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open - request was rejected without calling the service.
    Open {
        name: String,
        retry_after: Duration,
        /// The failure that opened the circuit, re-raised to the caller.
        last_error: Option<E>,
    },
    /// The inner operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::Open {
                name,
                retry_after,
                last_error,
            } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )?;
                if let Some(e) = last_error {
                    write!(f, " Last error: {e}")?;
                }
                Ok(())
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// Snapshot of breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub blocked_count: u64,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Recovery statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStatistics {
    /// Mean time spent open before a probe was admitted.
    ///
    /// `None` until the breaker has completed a full open -> closed cycle,
    /// and while it is not currently closed.
    pub avg_recovery_time: Option<Duration>,
    /// Number of completed open -> closed cycles.
    pub completed_cycles: u64,
}

struct Shared<E> {
    origin: Instant,
    state: AtomicU8,
    failed_calls: AtomicU64,
    blocked_calls: AtomicU64,
    /// Nanos since `origin` at which an open breaker admits a probe.
    next_try_at: AtomicU64,
    /// Nanos since `origin` at which the breaker last opened.
    opened_at: AtomicU64,
    recovery_total: AtomicU64,
    recovery_samples: AtomicU64,
    completed_cycles: AtomicU64,
    last_error: Mutex<Option<E>>,
}

/// Thread-safe circuit breaker for one guarded call site.
///
/// Cloning is cheap and clones share the same state.
pub struct CircuitBreaker<E = AppError> {
    name: String,
    config: CircuitBreakerConfig,
    shared: Arc<Shared<E>>,
}

impl<E> Clone for CircuitBreaker<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

impl<E> CircuitBreaker<E> {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            shared: Arc::new(Shared {
                origin: Instant::now(),
                state: AtomicU8::new(CircuitState::Closed.as_u8()),
                failed_calls: AtomicU64::new(0),
                blocked_calls: AtomicU64::new(0),
                next_try_at: AtomicU64::new(0),
                opened_at: AtomicU64::new(0),
                recovery_total: AtomicU64::new(0),
                recovery_samples: AtomicU64::new(0),
                completed_cycles: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, read-only.
    pub fn status(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u64 {
        self.shared.failed_calls.load(Ordering::Acquire)
    }

    pub fn blocked_count(&self) -> u64 {
        self.shared.blocked_calls.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let completed_cycles = self.shared.completed_cycles.load(Ordering::Acquire);
        let samples = self.shared.recovery_samples.load(Ordering::Acquire);
        let avg_recovery_time = if self.status() == CircuitState::Closed
            && completed_cycles > 0
            && samples > 0
        {
            let total = self.shared.recovery_total.load(Ordering::Acquire);
            Some(Duration::from_nanos(total / samples))
        } else {
            None
        };

        RecoveryStatistics {
            avg_recovery_time,
            completed_cycles,
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.shared.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn cooldown_nanos(&self) -> u64 {
        u64::try_from(self.config.retry_cooldown.as_nanos()).unwrap_or(u64::MAX)
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.shared
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquires the last-error slot, recovering from poison if necessary.
    fn lock_last_error(&self) -> MutexGuard<'_, Option<E>> {
        self.shared.last_error.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            PoisonError::into_inner(poisoned)
        })
    }

    fn record_error_if_absent(&self, error: E) {
        let mut slot = self.lock_last_error();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn arm_retry_window(&self) {
        let now = self.now();
        self.shared.opened_at.store(now, Ordering::Release);
        self.shared
            .next_try_at
            .store(now.saturating_add(self.cooldown_nanos()), Ordering::Release);
    }

    fn avg_recovery_nanos(&self) -> u64 {
        let samples = self.shared.recovery_samples.load(Ordering::Acquire);
        if samples == 0 {
            return 0;
        }
        self.shared.recovery_total.load(Ordering::Acquire) / samples
    }

    /// Call after a successful guarded operation.
    ///
    /// Resets the breaker from any state: closed, zero failures, zero
    /// blocked calls, no recorded error.
    pub fn call_succeeded(&self) {
        let previous = CircuitState::from_u8(
            self.shared
                .state
                .swap(CircuitState::Closed.as_u8(), Ordering::AcqRel),
        );
        self.shared.failed_calls.store(0, Ordering::Release);
        self.shared.blocked_calls.store(0, Ordering::Release);
        *self.lock_last_error() = None;

        if previous != CircuitState::Closed {
            self.shared.completed_cycles.fetch_add(1, Ordering::AcqRel);
            tracing::info!(
                circuit = %self.name,
                from = %previous,
                avg_recovery_ms = Duration::from_nanos(self.avg_recovery_nanos()).as_millis() as u64,
                "Circuit breaker closed"
            );
        }
    }

    /// Snapshot of the current breaker state.
    pub fn stats(&self) -> CircuitBreakerStats
    where
        E: fmt::Display,
    {
        let state = self.status();
        let time_until_half_open = if state == CircuitState::Open {
            let next = self.shared.next_try_at.load(Ordering::Acquire);
            Some(Duration::from_nanos(next.saturating_sub(self.now())))
        } else {
            None
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state,
            failure_count: self.failure_count(),
            blocked_count: self.blocked_count(),
            last_error: self.lock_last_error().as_ref().map(|e| e.to_string()),
            time_until_half_open,
        }
    }
}

impl<E: Clone + fmt::Display> CircuitBreaker<E> {
    /// Call before invoking the guarded operation.
    ///
    /// While open and inside the cool-down, the call is counted as blocked
    /// and rejected with the recorded error. Once the cool-down has elapsed
    /// the first caller to arrive moves the breaker to half-open and gets
    /// [`Admission::Probe`].
    pub fn call_started(&self) -> Result<Admission, CircuitBreakerError<E>> {
        match self.status() {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::HalfOpen => Ok(Admission::HalfOpen),
            CircuitState::Open => {
                let now = self.now();
                let next_try_at = self.shared.next_try_at.load(Ordering::Acquire);

                if now < next_try_at {
                    let blocked = self.shared.blocked_calls.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::debug!(circuit = %self.name, blocked, "Call rejected by open circuit");
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::from_nanos(next_try_at - now),
                        last_error: self.lock_last_error().clone(),
                    });
                }

                if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                    let opened_at = self.shared.opened_at.load(Ordering::Acquire);
                    self.shared
                        .recovery_total
                        .fetch_add(now.saturating_sub(opened_at), Ordering::AcqRel);
                    self.shared.recovery_samples.fetch_add(1, Ordering::AcqRel);
                    tracing::info!(
                        circuit = %self.name,
                        blocked_calls = self.blocked_count(),
                        avg_recovery_ms = Duration::from_nanos(self.avg_recovery_nanos()).as_millis() as u64,
                        "Circuit breaker transitioning to half-open state"
                    );
                    return Ok(Admission::Probe);
                }

                // Lost the race: someone else already moved the breaker on.
                match self.status() {
                    CircuitState::Closed => Ok(Admission::Closed),
                    _ => Ok(Admission::HalfOpen),
                }
            }
        }
    }

    /// Call after a failed guarded operation.
    ///
    /// Do not report [`CircuitBreakerError::Open`] rejections here; they are
    /// not new failures.
    pub fn call_failed(&self, error: E) {
        match self.status() {
            CircuitState::HalfOpen => {
                self.arm_retry_window();
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    cooldown_secs = self.config.retry_cooldown.as_secs(),
                    "Circuit breaker probe failed, returning to open state"
                );
                self.record_error_if_absent(error);
                self.transition(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Closed => {
                let failed = self.shared.failed_calls.fetch_add(1, Ordering::AcqRel) + 1;
                if failed >= self.config.failure_threshold {
                    self.arm_retry_window();
                    self.record_error_if_absent(error.clone());
                    if self.transition(CircuitState::Closed, CircuitState::Open) {
                        tracing::warn!(
                            circuit = %self.name,
                            failures = failed,
                            error = %error,
                            cooldown_secs = self.config.retry_cooldown.as_secs(),
                            "Circuit breaker opening after {} failures",
                            failed
                        );
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed / HalfOpen: executes operation, records success or failure
    /// - Open: returns `CircuitBreakerError::Open` immediately
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_started()?;

        match operation().await {
            Ok(value) => {
                self.call_succeeded();
                Ok(value)
            }
            Err(e) => {
                self.call_failed(e.clone());
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }
}
