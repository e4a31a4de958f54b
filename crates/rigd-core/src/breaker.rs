//! Per-peripheral circuit breaker.
//!
//! Wraps every transport operation a daemon performs. After a run of
//! consecutive failures the breaker opens and operations fail fast without
//! touching hardware; after a cooldown exactly one probe is admitted. A
//! successful probe closes the breaker, a failed probe re-opens it with the
//! cooldown grown by the configured backoff multiplier (capped).
//!
//! Transitions are driven solely by operation outcomes and elapsed time —
//! never by external command. Each daemon owns its breaker and is the sole
//! writer, so no synchronization is needed beyond that single-writer
//! invariant; [`CircuitBreaker::snapshot`] gives read-only status for
//! reporting.

use std::time::Duration;

use rigd_config::BreakerConfig;
use tokio::time::Instant;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Operations pass through; failures are counted.
    Closed,
    /// Operations fail fast until the cooldown elapses.
    Open,
    /// Cooldown elapsed; exactly one probe is in flight.
    HalfOpen,
}

/// Returned by [`CircuitBreaker::preflight`] while the breaker is open.
#[derive(Debug, thiserror::Error)]
#[error("circuit open; retry in {retry_in:?}")]
pub struct BreakerOpen {
    /// Time until the next probe will be admitted.
    pub retry_in: Duration,
}

/// The per-peripheral failure-isolation state machine.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker with the given thresholds.
    pub fn new(config: BreakerConfig) -> Self {
        let current_cooldown = config.cooldown();
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            current_cooldown,
        }
    }

    /// Gate an operation.
    ///
    /// Closed: admitted. Open: fails fast until the cooldown elapses, at
    /// which point the breaker moves to half-open and admits this single
    /// probe. Half-open with a probe already admitted: fails fast.
    pub fn preflight(&mut self) -> Result<(), BreakerOpen> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.current_cooldown {
                    debug!("cooldown elapsed, admitting probe");
                    self.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(BreakerOpen {
                        retry_in: self.current_cooldown - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => Err(BreakerOpen {
                retry_in: Duration::ZERO,
            }),
        }
    }

    /// Record a successful operation: closes the breaker and resets the
    /// failure count and cooldown schedule.
    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("circuit closed");
        }
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.current_cooldown = self.config.cooldown();
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = self.failure_count,
                        cooldown = ?self.current_cooldown,
                        "circuit opened"
                    );
                    self.open();
                }
            }
            BreakerState::HalfOpen => {
                // Failed probe: back off before the next one.
                self.failure_count += 1;
                let grown = self.current_cooldown.as_secs_f64() * self.config.backoff_multiplier;
                self.current_cooldown =
                    Duration::from_secs_f64(grown).min(self.config.max_cooldown());
                warn!(cooldown = ?self.current_cooldown, "probe failed, circuit re-opened");
                self.open();
            }
            BreakerState::Open => {}
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Status snapshot for `<daemon>.status` reporting.
    pub fn snapshot(&self) -> Value {
        let retry_in_ms = match self.state {
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Some(self.current_cooldown.saturating_sub(elapsed).as_millis() as u64)
            }
            _ => None,
        };
        serde_json::json!({
            "state": self.state,
            "failure_count": self.failure_count,
            "retry_in_ms": retry_in_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 50,
            backoff_multiplier: 2.0,
            max_cooldown_ms: 200,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..2 {
            breaker.preflight().unwrap();
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.preflight().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.preflight().is_err());
    }

    #[test]
    fn test_success_resets_count() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_probe_after_cooldown() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.preflight().is_err());

        tokio::time::advance(Duration::from_millis(60)).await;
        breaker.preflight().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Second caller while the probe is in flight fails fast.
        assert!(breaker.preflight().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_backs_off_exponentially() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_millis(60)).await;
        breaker.preflight().unwrap();
        breaker.record_failure(); // probe failed → cooldown doubles to 100ms

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(breaker.preflight().is_err(), "still inside grown cooldown");
        tokio::time::advance(Duration::from_millis(50)).await;
        breaker.preflight().unwrap();
        breaker.record_failure(); // 200ms (capped)

        tokio::time::advance(Duration::from_millis(210)).await;
        breaker.preflight().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        // Cooldown schedule reset along with the close.
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(breaker.preflight().is_ok());
    }

    #[test]
    fn test_snapshot_shape() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        let snap = breaker.snapshot();
        assert_eq!(snap["state"], "open");
        assert_eq!(snap["failure_count"], 3);
        assert!(snap["retry_in_ms"].is_u64());
    }
}
