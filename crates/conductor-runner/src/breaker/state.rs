//! Per-backend circuit breaker state machine.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time spent open before the next call is let through as a probe.
    pub open_timeout: Duration,
    /// Concurrent probes allowed while half-open.
    pub max_half_open: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&conductor_core::config::BreakerConfig::default())
    }
}

impl From<&conductor_core::config::BreakerConfig> for BreakerConfig {
    fn from(cfg: &conductor_core::config::BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            open_timeout: Duration::from_secs(cfg.open_timeout_secs),
            max_half_open: cfg.max_half_open.max(1),
        }
    }
}

/// Invoked as `(name, from, to)` whenever a breaker changes state.
pub type StateChangeCallback = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Errors returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The call was rejected without running.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_calls: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            half_open_calls: 0,
            opened_at: None,
            last_failure: None,
            last_state_change: Utc::now(),
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
        }
    }

    /// Move to `to`, resetting per-state counters. Returns the previous state.
    fn transition(&mut self, to: BreakerState) -> BreakerState {
        let from = self.state;
        self.state = to;
        self.failures = 0;
        self.successes = 0;
        self.half_open_calls = 0;
        self.opened_at = (to == BreakerState::Open).then(Instant::now);
        self.last_state_change = Utc::now();
        from
    }
}

/// Failure-tracking state machine guarding calls to one backend.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: RwLock<Inner>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(Inner::new()),
            on_state_change: None,
        }
    }

    /// Attach a callback fired after every state change.
    #[must_use]
    pub fn with_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An elapsed open timeout is only acted on by [`Self::allow`].
    pub fn state(&self) -> BreakerState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Whether a call may proceed. Allowed half-open calls count as probes.
    pub fn allow(&self) -> bool {
        let mut inner = self.write();
        let mut changed = None;

        let allowed = match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_timeout);
                if elapsed {
                    let from = inner.transition(BreakerState::HalfOpen);
                    changed = Some((from, BreakerState::HalfOpen));
                    inner.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.max_half_open {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            inner.total_rejected += 1;
        }
        drop(inner);

        if !allowed {
            debug!(breaker = %self.name, "Call rejected by open circuit");
        }
        self.notify(changed);
        allowed
    }

    pub fn record_success(&self) {
        let mut inner = self.write();
        inner.total_successes += 1;
        let mut changed = None;

        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.successes += 1;
                inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
                if inner.successes >= self.config.success_threshold {
                    let from = inner.transition(BreakerState::Closed);
                    changed = Some((from, BreakerState::Closed));
                }
            }
            BreakerState::Open => {}
        }
        drop(inner);
        self.notify(changed);
    }

    pub fn record_failure(&self) {
        let mut inner = self.write();
        inner.total_failures += 1;
        inner.last_failure = Some(Utc::now());
        let mut changed = None;

        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    changed = Some((inner.transition(BreakerState::Open), BreakerState::Open));
                }
            }
            BreakerState::HalfOpen => {
                changed = Some((inner.transition(BreakerState::Open), BreakerState::Open));
            }
            BreakerState::Open => {}
        }
        drop(inner);
        self.notify(changed);
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            consecutive_successes: inner.successes,
            half_open_calls: inner.half_open_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            last_failure: inner.last_failure,
            last_state_change: inner.last_state_change,
        }
    }

    /// Run `f` if the circuit allows it and record its outcome.
    pub fn execute<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerError<E>> {
        if !self.allow() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }
        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Async variant of [`Self::execute`].
    pub async fn execute_async<T, E, Fut>(
        &self,
        f: impl FnOnce() -> Fut,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a state change. Called with the state lock released.
    fn notify(&self, changed: Option<(BreakerState, BreakerState)>) {
        let Some((from, to)) = changed else {
            return;
        };
        if to == BreakerState::Open {
            warn!(breaker = %self.name, %from, %to, "Circuit breaker opened");
        } else {
            info!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
        }

        if let Some(callback) = &self.on_state_change {
            let callback = Arc::clone(callback);
            let name = self.name.clone();
            std::thread::spawn(move || callback(&name, from, to));
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn config(open_timeout: Duration) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout,
            max_half_open: 1,
        }
    }

    fn open_breaker(open_timeout: Duration) -> CircuitBreaker {
        let breaker = CircuitBreaker::new("claude", config(open_timeout));
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker
    }

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::new("claude", BreakerConfig::default());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn defaults_follow_config_file_defaults() {
        let cfg = BreakerConfig::default();
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.success_threshold, 2);
        assert_eq!(cfg.open_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_half_open, 1);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("claude", config(Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
        assert_eq!(breaker.stats().total_rejected, 1);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("claude", config(Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[test]
    fn allow_after_timeout_moves_to_half_open() {
        let breaker = open_breaker(Duration::from_millis(20));
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(30));

        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // The transitioning call was the only permitted probe.
        assert!(!breaker.allow());
    }

    #[test]
    fn half_open_successes_close_circuit() {
        let breaker = open_breaker(Duration::ZERO);
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = open_breaker(Duration::ZERO);
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn execute_skips_closure_when_open() {
        let breaker = open_breaker(Duration::from_secs(60));
        let mut ran = false;
        let result: Result<(), BreakerError<String>> = breaker.execute(|| {
            ran = true;
            Ok(())
        });
        assert!(!ran);
        assert!(result.unwrap_err().is_open());
    }

    #[test]
    fn execute_records_outcome() {
        let breaker = CircuitBreaker::new("codex", config(Duration::from_secs(60)));
        let ok: Result<u8, BreakerError<&str>> = breaker.execute(|| Ok(1));
        assert_eq!(ok.unwrap(), 1);
        let err: Result<u8, BreakerError<&str>> = breaker.execute(|| Err("boom"));
        assert!(matches!(err, Err(BreakerError::Inner("boom"))));

        let stats = breaker.stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 1);
        assert!(stats.last_failure.is_some());
    }

    #[tokio::test]
    async fn execute_async_records_failure() {
        let breaker = CircuitBreaker::new("gemini", config(Duration::from_secs(60)));
        let result: Result<(), BreakerError<&str>> =
            breaker.execute_async(|| async { Err("down") }).await;
        assert!(matches!(result, Err(BreakerError::Inner("down"))));
        assert_eq!(breaker.stats().consecutive_failures, 1);
    }

    #[test]
    fn callback_reports_transitions() {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let breaker = CircuitBreaker::new("claude", config(Duration::from_secs(60))).with_callback(
            Arc::new(move |name: &str, from, to| {
                tx.lock()
                    .unwrap()
                    .send((name.to_string(), from, to))
                    .unwrap();
            }),
        );

        for _ in 0..3 {
            breaker.record_failure();
        }
        let (name, from, to) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name, "claude");
        assert_eq!(from, BreakerState::Closed);
        assert_eq!(to, BreakerState::Open);
    }

    #[test]
    fn state_display_is_kebab_case() {
        assert_eq!(BreakerState::HalfOpen.to_string(), "half-open");
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"half-open\"");
    }
}
