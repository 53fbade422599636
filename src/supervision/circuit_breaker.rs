// =============================================================================
// Circuit Breaker — three-state failure protection for a downstream dependency
// =============================================================================
//
// State machine:
//   CLOSED    — normal operation; consecutive failures are counted.
//   OPEN      — calls are rejected without touching the dependency until the
//               recovery timeout elapses.
//   HALF_OPEN — a bounded number of probe calls are allowed through; the
//               first success closes the breaker, any failure re-opens it.
//
// All transitions happen inside `may_execute` / `record_*` under one mutex,
// so concurrent callers observe a serialized state machine. `may_execute`
// never suspends.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Observable breaker state, exposed through health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_attempts: u32,
}

/// Three-state circuit breaker guarding one downstream dependency.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_attempts: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_attempts: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            half_open_max_attempts: half_open_max_attempts.max(1),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_attempts: 0,
            }),
        }
    }

    /// Advance the state machine and, if the current state permits a call,
    /// consume a permit.
    ///
    /// Returns `false` while OPEN (fast-path reject) and once the HALF_OPEN
    /// probe budget is exhausted.
    pub fn may_execute(&self) -> bool {
        let mut s = self.inner.lock();

        match s.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    s.state = BreakerState::HalfOpen;
                    s.half_open_attempts = 1;
                    info!(
                        breaker = %self.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "recovery timeout elapsed — breaker half-open, probe permitted"
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if s.half_open_attempts < self.half_open_max_attempts {
                    s.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. In HALF_OPEN, the first success closes the
    /// breaker; in CLOSED, the failure streak resets.
    pub fn record_success(&self) {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::HalfOpen => {
                s.state = BreakerState::Closed;
                s.consecutive_failures = 0;
                s.opened_at = None;
                s.half_open_attempts = 0;
                info!(breaker = %self.name, "probe succeeded — breaker closed");
            }
            BreakerState::Closed => {
                s.consecutive_failures = 0;
            }
            BreakerState::Open => {
                // Late success from a call issued before the breaker opened.
                debug!(breaker = %self.name, "success recorded while open — ignored");
            }
        }
    }

    /// Record a failed call. In CLOSED, opens once the consecutive-failure
    /// threshold is reached; in HALF_OPEN, re-opens immediately.
    pub fn record_failure(&self) {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.failure_threshold {
                    s.state = BreakerState::Open;
                    s.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = s.consecutive_failures,
                        threshold = self.failure_threshold,
                        "failure threshold reached — breaker open"
                    );
                }
            }
            BreakerState::HalfOpen => {
                s.state = BreakerState::Open;
                s.opened_at = Some(Instant::now());
                s.half_open_attempts = 0;
                warn!(breaker = %self.name, "probe failed — breaker re-opened");
            }
            BreakerState::Open => {
                // Already open; nothing to count.
            }
        }
    }

    /// Current state without advancing the machine.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_millis(recovery_ms), 1)
    }

    #[test]
    fn opens_at_exactly_the_threshold() {
        let cb = breaker(3, 10_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.may_execute());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.may_execute());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(3, 10_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_recovery_then_closes_on_success() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // Zero recovery timeout: the next permit check transitions.
        assert!(cb.may_execute());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.may_execute());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn recovery_permit_granted_to_exactly_one_caller() {
        let cb = breaker(1, 0);
        cb.record_failure();

        // First caller gets the probe permit; the second is rejected while
        // the probe is outstanding (half_open_max_attempts = 1).
        assert!(cb.may_execute());
        assert!(!cb.may_execute());
    }

    #[test]
    fn open_rejects_until_timeout() {
        let cb = breaker(1, 60_000);
        cb.record_failure();
        assert!(!cb.may_execute());
        assert!(!cb.may_execute());
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
