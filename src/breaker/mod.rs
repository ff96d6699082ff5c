//! Circuit breaker and registry guarding database/cache/external calls.
//!
//! State machine (consecutive-failure count, not a rate-over-window):
//!
//! | From | Event | To | Condition |
//! |---|---|---|---|
//! | closed | success | closed | — |
//! | closed | failure | closed | consecutive_failures < threshold |
//! | closed | failure | open | consecutive_failures >= threshold |
//! | open | call attempt | half-open | now - last_failure >= recovery_timeout |
//! | open | call attempt | reject | otherwise |
//! | half-open | success | half-open | consecutive_successes < success_threshold |
//! | half-open | success | closed | consecutive_successes >= success_threshold |
//! | half-open | failure | open | any failure |

use crate::config::CircuitBreakerConfig;
use crate::error::{CoreError, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Failures detected; calls are rejected without invoking the op.
    Open,
    /// Probing for recovery; a bounded number of calls are let through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: AtomicU64,
    consecutive_successes: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
}

/// Point-in-time view of a breaker, for `GET /circuit-breakers`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u64,
    /// Consecutive successes since the last failure.
    pub consecutive_successes: u64,
    /// Lifetime failure count.
    pub total_failures: u64,
    /// Lifetime success count.
    pub total_successes: u64,
}

/// A named circuit breaker guarding calls to a single dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
    counters: Counters,
    last_failure_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new breaker in the `Closed` state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitState::Closed),
            counters: Counters::default(),
            last_failure_at: Mutex::new(None),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, resolving any pending `Open -> HalfOpen` transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn maybe_transition_to_half_open(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != CircuitState::Open {
            return;
        }
        let last_failure = *self
            .last_failure_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(at) = last_failure {
            if at.elapsed() >= Duration::from_secs(self.config.recovery_timeout_secs) {
                *state = CircuitState::HalfOpen;
                self.counters.consecutive_successes.store(0, Ordering::SeqCst);
                tracing::info!(breaker = %self.name, "circuit breaker moved to half_open");
            }
        }
    }

    /// Guard an async operation with this breaker.
    ///
    /// Applies `call_timeout_ms`; a timeout counts as a failure. Rejects
    /// immediately with [`CoreError::BreakerOpen`] while the breaker is
    /// open and the recovery timeout has not elapsed.
    ///
    /// # Errors
    /// Returns [`CoreError::BreakerOpen`] if the breaker rejects the call,
    /// or the underlying operation's error otherwise.
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
    {
        match self.state() {
            CircuitState::Open => Err(CoreError::BreakerOpen {
                name: self.name.clone(),
            }),
            CircuitState::Closed | CircuitState::HalfOpen => {
                let timeout = Duration::from_millis(self.config.call_timeout_ms);
                match tokio::time::timeout(timeout, op()).await {
                    Ok(Ok(value)) => {
                        self.record_success();
                        Ok(value)
                    }
                    Ok(Err(err)) => {
                        self.record_failure();
                        Err(err)
                    }
                    Err(_) => {
                        self.record_failure();
                        Err(CoreError::Transient {
                            reason: format!("operation timed out after {}ms", timeout.as_millis()),
                        })
                    }
                }
            }
        }
    }

    fn record_success(&self) {
        self.counters.total_successes.fetch_add(1, Ordering::SeqCst);
        self.counters.consecutive_failures.store(0, Ordering::SeqCst);
        let successes = self.counters.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state == CircuitState::HalfOpen && successes >= u64::from(self.config.success_threshold) {
            *state = CircuitState::Closed;
            self.counters.consecutive_failures.store(0, Ordering::SeqCst);
            tracing::info!(breaker = %self.name, "circuit breaker moved to closed");
        }
    }

    fn record_failure(&self) {
        self.counters.total_failures.fetch_add(1, Ordering::SeqCst);
        self.counters.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = self.counters.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .last_failure_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());

        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *state {
            CircuitState::Closed if failures >= u64::from(self.config.failure_threshold) => {
                *state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures,
                    "circuit breaker moved to open"
                );
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                tracing::warn!(breaker = %self.name, "circuit breaker moved back to open");
            }
            _ => {}
        }
    }

    /// Reset this breaker to `Closed` with zeroed counters.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = CircuitState::Closed;
        self.counters.consecutive_failures.store(0, Ordering::SeqCst);
        self.counters.consecutive_successes.store(0, Ordering::SeqCst);
        *self
            .last_failure_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Point-in-time snapshot for observability.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::SeqCst),
            consecutive_successes: self.counters.consecutive_successes.load(Ordering::SeqCst),
            total_failures: self.counters.total_failures.load(Ordering::SeqCst),
            total_successes: self.counters.total_successes.load(Ordering::SeqCst),
        }
    }
}

/// Owns every named breaker for the process.
#[derive(Default)]
pub struct Registry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the named breaker, creating it with `config` on first
    /// reference.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Snapshot every registered breaker.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|b| b.snapshot())
            .collect()
    }

    /// Reset a named breaker. Returns `false` if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(breaker) = breakers.get(name) {
            breaker.reset();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, recovery_timeout_secs: u64, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout_secs,
            success_threshold,
            call_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new("db", config(3, 1, 2));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new("db", config(3, 60, 2));
        for _ in 0..3 {
            let result: Result<()> = cb
                .call(|| Box::pin(async { Err(CoreError::Transient { reason: "x".into() }) }))
                .await;
            assert!(result.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn rejects_fast_while_open() {
        let cb = CircuitBreaker::new("db", config(1, 60, 2));
        let _: Result<()> = cb
            .call(|| Box::pin(async { Err(CoreError::Transient { reason: "x".into() }) }))
            .await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result: Result<()> = cb.call(|| Box::pin(async { Ok(()) })).await;
        assert!(matches!(result, Err(CoreError::BreakerOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout_then_closes_on_successes() {
        let cb = CircuitBreaker::new("db", config(1, 0, 2));
        let _: Result<()> = cb
            .call(|| Box::pin(async { Err(CoreError::Transient { reason: "x".into() }) }))
            .await;
        assert_eq!(cb.state(), CircuitState::Open);

        // recovery_timeout_secs = 0, so the next probe is admitted immediately.
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _: Result<()> = cb.call(|| Box::pin(async { Ok(()) })).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _: Result<()> = cb.call(|| Box::pin(async { Ok(()) })).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("db", config(1, 0, 2));
        let _: Result<()> = cb
            .call(|| Box::pin(async { Err(CoreError::Transient { reason: "x".into() }) }))
            .await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _: Result<()> = cb
            .call(|| Box::pin(async { Err(CoreError::Transient { reason: "x".into() }) }))
            .await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let mut cfg = config(1, 60, 2);
        cfg.call_timeout_ms = 5;
        let cb = CircuitBreaker::new("db", cfg);
        let result: Result<()> = cb
            .call(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_returns_same_instance_by_name() {
        let registry = Registry::new();
        let a = registry.get_or_create("database", config(3, 60, 2));
        let b = registry.get_or_create("database", config(5, 30, 1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn registry_reset_clears_state() {
        let registry = Registry::new();
        let cb = registry.get_or_create("database", config(1, 60, 2));
        let _: Result<()> = cb
            .call(|| Box::pin(async { Err(CoreError::Transient { reason: "x".into() }) }))
            .await;
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(registry.reset("database"));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!registry.reset("unknown"));
    }
}
