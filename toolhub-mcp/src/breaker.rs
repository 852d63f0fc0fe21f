//! Circuit breakers: per-target failure accounting and fast-fail gating.
//!
//! A [`CircuitBreakerRegistry`] holds one [`CircuitBreaker`] per target name
//! (a tool server, or the external LLM), created lazily on first use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while Closed before the breaker opens.
    pub failure_threshold: u32,
    /// How long to stay Open before allowing a HalfOpen probe.
    pub recovery_timeout: Duration,
    /// Concurrent probes permitted while HalfOpen.
    pub half_open_max_calls: u32,
    /// Consecutive HalfOpen successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
}

impl CircuitBreakerMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests > 0 {
            (self.total_failures as f64 / self.total_requests as f64) * 100.0
        } else {
            0.0
        }
    }
}

struct State {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    total_requests: u64,
    total_failures: u64,
}

impl State {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_in_flight: 0,
            total_requests: 0,
            total_failures: 0,
        }
    }
}

/// A single named breaker. `name` is kept only for log/error context; the
/// registry owns the keying.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::closed()),
        }
    }

    /// Permit or reject a call. On reject, the error carries `retry_after`.
    pub async fn check(&self) -> Result<(), RouterError> {
        let mut s = self.state.lock().await;

        if s.state == CircuitState::Open {
            let opened_at = s.opened_at.expect("Open state always carries opened_at");
            if opened_at.elapsed() >= self.config.recovery_timeout {
                info!(target: "breaker", name = %self.name, "OPEN -> HALF-OPEN");
                s.state = CircuitState::HalfOpen;
                s.opened_at = None;
                s.half_open_in_flight = 0;
                s.consecutive_successes = 0;
            }
        }

        match s.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(self.reject(&s)),
            CircuitState::HalfOpen => {
                if s.half_open_in_flight < self.config.half_open_max_calls {
                    s.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(self.reject(&s))
                }
            }
        }
    }

    fn reject(&self, s: &State) -> RouterError {
        let retry_after = match s.opened_at {
            Some(opened_at) => self
                .config
                .recovery_timeout
                .saturating_sub(opened_at.elapsed()),
            None => Duration::ZERO,
        };
        RouterError::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    pub async fn record_success(&self) {
        let mut s = self.state.lock().await;
        s.total_requests += 1;

        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                s.consecutive_successes += 1;
                if s.consecutive_successes >= self.config.success_threshold {
                    info!(target: "breaker", name = %self.name, "HALF-OPEN -> CLOSED");
                    s.state = CircuitState::Closed;
                    s.consecutive_failures = 0;
                    s.consecutive_successes = 0;
                    s.half_open_in_flight = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut s = self.state.lock().await;
        s.total_requests += 1;
        s.total_failures += 1;

        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    warn!(target: "breaker", name = %self.name, failures = s.consecutive_failures, "CLOSED -> OPEN");
                    s.state = CircuitState::Open;
                    s.opened_at = Some(Instant::now());
                    s.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                warn!(target: "breaker", name = %self.name, "HALF-OPEN -> OPEN (probe failed)");
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
                s.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn reset(&self) {
        let mut s = self.state.lock().await;
        *s = State::closed();
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let s = self.state.lock().await;
        CircuitBreakerMetrics {
            state: s.state,
            total_requests: s.total_requests,
            total_failures: s.total_failures,
            consecutive_failures: s.consecutive_failures,
        }
    }
}

/// Registry of breakers keyed by target name. Breakers are created lazily.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone()))),
        )
    }

    pub async fn check(&self, name: &str) -> Result<(), RouterError> {
        self.get_or_create(name).await.check().await
    }

    pub async fn record_success(&self, name: &str) {
        self.get_or_create(name).await.record_success().await;
    }

    pub async fn record_failure(&self, name: &str) {
        self.get_or_create(name).await.record_failure().await;
    }

    /// Force a breaker Closed. Errors if the breaker has never been used.
    pub async fn reset(&self, name: &str) -> Result<(), RouterError> {
        let breakers = self.breakers.read().await;
        match breakers.get(name) {
            Some(breaker) => {
                breaker.reset().await;
                Ok(())
            }
            None => Err(RouterError::UnknownServer(name.to_string())),
        }
    }

    pub async fn snapshot(&self) -> Vec<(String, CircuitBreakerMetrics)> {
        let breakers = self.breakers.read().await;
        let mut out = Vec::with_capacity(breakers.len());
        for (name, breaker) in breakers.iter() {
            out.push((name.clone(), breaker.metrics().await));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new("echo", CircuitBreakerConfig::default());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.check().await.is_ok());
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new("echo", config(3, Duration::from_secs(30)));
        for _ in 0..2 {
            cb.record_failure().await;
            assert_eq!(cb.state().await, CircuitState::Closed);
        }
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(matches!(
            cb.check().await,
            Err(RouterError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let cb = CircuitBreaker::new("echo", config(3, Duration::from_secs(30)));
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;
        // only 2 consecutive failures since the reset, below threshold of 3
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new("echo", config(1, Duration::from_millis(20)));
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.check().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes_the_circuit() {
        let cb = CircuitBreaker::new("echo", config(1, Duration::from_millis(10)));
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        cb.check().await.unwrap();
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_the_circuit() {
        let cb = CircuitBreaker::new("echo", config(1, Duration::from_millis(10)));
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        cb.check().await.unwrap();
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let cb = Arc::new(CircuitBreaker::new(
            "echo",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
                half_open_max_calls: 1,
                success_threshold: 1,
            },
        ));
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        let mut permitted = 0;
        let mut rejected = 0;
        for _ in 0..3 {
            match cb.check().await {
                Ok(()) => permitted += 1,
                Err(RouterError::CircuitOpen { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(permitted, 1);
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn registry_creates_breakers_lazily_and_keys_by_name() {
        let registry = CircuitBreakerRegistry::new(config(2, Duration::from_secs(30)));
        assert!(registry.check("echo").await.is_ok());
        registry.record_failure("echo").await;
        registry.record_failure("echo").await;
        assert!(matches!(
            registry.check("echo").await,
            Err(RouterError::CircuitOpen { .. })
        ));
        // a different target is unaffected
        assert!(registry.check("other").await.is_ok());
    }

    #[tokio::test]
    async fn registry_reset_forces_closed() {
        let registry = CircuitBreakerRegistry::new(config(1, Duration::from_secs(30)));
        registry.record_failure("echo").await;
        assert!(registry.check("echo").await.is_err());
        registry.reset("echo").await.unwrap();
        assert!(registry.check("echo").await.is_ok());
    }

    #[tokio::test]
    async fn reset_on_unknown_target_is_an_error() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        assert!(matches!(
            registry.reset("ghost").await,
            Err(RouterError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        registry.check("zeta").await.unwrap();
        registry.check("alpha").await.unwrap();
        let snapshot = registry.snapshot().await;
        let names: Vec<_> = snapshot.iter().map(|(name, _)| name.clone()).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
