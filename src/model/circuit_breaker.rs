//! Circuit breaker protecting model adapter calls.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; reject all requests until the recovery timeout elapses.
    Open,
    /// Probing: limited traffic allowed to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (within `failure_window`) before opening.
    pub failure_threshold: u32,
    /// Time to stay open before probing.
    pub recovery_timeout: Duration,
    /// Successes needed in half-open to close again.
    pub success_threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            failure_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
    total_requests: u64,
    total_failures: u64,
}

/// State machine guarding one upstream dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_transition: Instant::now(),
                total_requests: 0,
                total_failures: 0,
            })),
        }
    }

    /// Whether a request may proceed right now. An open breaker whose
    /// recovery timeout elapsed transitions to half-open and lets the
    /// request through as a probe.
    pub fn allow_request(&self) -> bool {
        let mut s = self.state.lock().expect("breaker lock poisoned");
        s.total_requests += 1;
        match s.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if s.last_transition.elapsed() >= self.config.recovery_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.last_transition = Instant::now();
                    s.success_count = 0;
                    s.failure_count = 0;
                    info!("Model circuit breaker half-open, probing recovery");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.state.lock().expect("breaker lock poisoned");
        match s.state {
            CircuitState::HalfOpen => {
                s.success_count += 1;
                if s.success_count >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.last_transition = Instant::now();
                    s.failure_count = 0;
                    info!("Model circuit breaker closed, upstream recovered");
                }
            }
            CircuitState::Closed => {
                s.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.state.lock().expect("breaker lock poisoned");
        s.total_failures += 1;
        let now = Instant::now();
        match s.state {
            CircuitState::Closed => {
                // Failures outside the window restart the count.
                let within_window = s
                    .last_failure
                    .map(|t| now.duration_since(t) <= self.config.failure_window)
                    .unwrap_or(false);
                s.failure_count = if within_window { s.failure_count + 1 } else { 1 };
                s.last_failure = Some(now);
                if s.failure_count >= self.config.failure_threshold {
                    s.state = CircuitState::Open;
                    s.last_transition = now;
                    s.success_count = 0;
                    warn!(
                        "Model circuit breaker opened after {} failures",
                        s.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                // One failed probe reopens immediately.
                s.state = CircuitState::Open;
                s.last_transition = now;
                s.last_failure = Some(now);
                warn!("Model circuit breaker reopened, probe failed");
            }
            CircuitState::Open => {
                s.last_failure = Some(now);
            }
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock poisoned").state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let s = self.state.lock().expect("breaker lock poisoned");
        CircuitBreakerMetrics {
            state: s.state,
            failure_count: s.failure_count,
            total_requests: s.total_requests,
            total_failures: s.total_failures,
            seconds_in_state: s.last_transition.elapsed().as_secs(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub seconds_in_state: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(30),
            success_threshold: 2,
            failure_window: Duration::from_secs(10),
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(breaker.allow_request());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }
}
