//! Circuit breaker for chain RPC pools.
//!
//! Fast-fails requests while a remote node is unhealthy instead of letting
//! every scanner iteration ride out its full deadline.
//!
//! # States
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: node unhealthy, requests rejected immediately
//! - **HalfOpen**: open window elapsed, the next call acts as a probe

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for the breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes before the failure counter fully resets
    pub success_threshold: u32,
    /// How long the circuit stays open before the next call may probe
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(5),
        }
    }
}

struct InternalState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

impl Default for InternalState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probe_started_at: None,
        }
    }
}

/// Failure-count circuit breaker guarding one RPC pool.
pub struct CircuitBreaker {
    pool: String,
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
}

impl CircuitBreaker {
    pub fn new(pool: impl Into<String>) -> Self {
        Self::with_config(pool, CircuitBreakerConfig::default())
    }

    pub fn with_config(pool: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            pool: pool.into(),
            config,
            state: RwLock::new(InternalState::default()),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Current state, applying the open-window transition first.
    pub async fn state(&self) -> CircuitState {
        let mut state = self.state.write().await;
        self.maybe_transition(&mut state);
        state.state
    }

    /// Whether a request may proceed. In half-open only one probe is
    /// admitted; concurrent callers are rejected until it settles.
    pub async fn is_allowed(&self) -> bool {
        let mut state = self.state.write().await;
        self.maybe_transition(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.probe_started_at.is_some() {
                    false
                } else {
                    state.probe_started_at = Some(Instant::now());
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => {
                // Only consecutive failures count toward the threshold.
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.probe_started_at = None;
                state.success_count += 1;
                self.transition_to_closed(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => {
                state.success_count = 0;
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                state.probe_started_at = None;
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    /// Seconds the circuit has currently been open, 0 when not open.
    /// Feeds the `cb_open_seconds{pool}` gauge.
    pub async fn open_seconds(&self) -> u64 {
        let state = self.state.read().await;
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(at)) => at.elapsed().as_secs(),
            _ => 0,
        }
    }

    fn maybe_transition(&self, state: &mut InternalState) {
        match state.state {
            CircuitState::Open => {
                if let Some(opened_at) = state.opened_at {
                    if opened_at.elapsed() >= self.config.open_timeout {
                        tracing::info!(pool = %self.pool, "circuit breaker half-open, probing");
                        state.state = CircuitState::HalfOpen;
                        state.probe_started_at = None;
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A probe whose caller was cancelled would hold the slot
                // forever; release it after the open window.
                if let Some(started) = state.probe_started_at {
                    if started.elapsed() >= self.config.open_timeout {
                        state.probe_started_at = None;
                    }
                }
            }
            CircuitState::Closed => {}
        }
    }

    fn transition_to_open(&self, state: &mut InternalState) {
        tracing::warn!(
            pool = %self.pool,
            failures = state.failure_count,
            "circuit breaker opened"
        );
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
    }

    fn transition_to_closed(&self, state: &mut InternalState) {
        tracing::info!(pool = %self.pool, "circuit breaker closed");
        state.state = CircuitState::Closed;
        state.opened_at = None;
        // One probe success is not yet enough to forgive past failures.
        if state.success_count >= self.config.success_threshold {
            state.failure_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new("read");
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.is_allowed().await);
    }

    #[tokio::test]
    async fn opens_at_failure_threshold() {
        let cb = CircuitBreaker::with_config("read", fast_config());

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test]
    async fn probes_after_open_window() {
        let cb = CircuitBreaker::with_config("read", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // Exactly one probe is admitted.
        assert!(cb.is_allowed().await);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let cb = CircuitBreaker::with_config("read", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.is_allowed().await);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn probe_success_closes_and_second_success_resets_failures() {
        let cb = CircuitBreaker::with_config("read", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.is_allowed().await);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        // The second consecutive success clears the pre-open tally, so two
        // fresh failures stay under the threshold of three.
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn closed_success_breaks_a_failure_streak() {
        let cb = CircuitBreaker::with_config("read", fast_config());

        // Alternating failures and successes never open the circuit, no
        // matter how many failures accumulate in total.
        for _ in 0..8 {
            cb.record_failure().await;
            cb.record_success().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        // Only a truly consecutive run reaches the threshold.
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_seconds_reports_only_while_open() {
        let cb = CircuitBreaker::with_config("write", fast_config());
        assert_eq!(cb.open_seconds().await, 0);

        for _ in 0..3 {
            cb.record_failure().await;
        }
        // Just opened; sub-second.
        assert_eq!(cb.open_seconds().await, 0);
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
