//! Resiliency primitives: retry with jittered backoff and a three-state
//! circuit breaker. Used by the remote pipeline and available to
//! lifecycle hooks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{counters, BreakerStateTag, Event, ObservabilitySink};

/// Exponential backoff with multiplicative jitter.
///
/// Delay for attempt `n` (1-based) is
/// `min(max_delay, base · factor^(n−1)) · (1 ± jitter)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Jitter fraction in `[0, 1]`; `0.1` spreads delays ±10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given 1-based failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = (self.base_delay_ms as f64) * self.factor.powi(exponent as i32);
        let bounded = raw.min(self.max_delay_ms as f64);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            rand::rng().random_range(-jitter..=jitter)
        } else {
            0.0
        };
        Duration::from_millis((bounded * (1.0 + spread)).max(0.0) as u64)
    }
}

/// Error returned when the breaker refuses a call.
#[derive(Debug, Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpen {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn tag(self) -> BreakerStateTag {
        match self {
            BreakerState::Closed => BreakerStateTag::Closed,
            BreakerState::Open => BreakerStateTag::Open,
            BreakerState::HalfOpen => BreakerStateTag::HalfOpen,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Whether the single half-open probe slot is taken.
    probe_in_flight: bool,
}

/// Three-state failure guard: closed → open → half-open → closed.
///
/// Opens after `failure_threshold` consecutive failures, stays open for
/// `reset_timeout`, then admits a single probe; the probe's outcome closes
/// or re-opens the breaker. Every transition emits an event.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: parking_lot::Mutex<BreakerInner>,
    sink: Arc<dyn ObservabilitySink>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: parking_lot::Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            sink,
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Asks permission to run one call.
    ///
    /// # Errors
    /// Returns [`CircuitOpen`] while the breaker is open (or half-open with
    /// the probe slot already taken).
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    self.sink.incr(counters::BREAKER_OPEN);
                    Err(CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    self.sink.incr(counters::BREAKER_OPEN);
                    Err(CircuitOpen {
                        name: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            inner.opened_at = None;
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        tracing::info!(
            breaker = %self.name,
            from = ?from,
            to = ?to,
            failures = inner.consecutive_failures,
            "Circuit breaker transition"
        );
        self.sink.emit(&Event::BreakerTransition {
            name: self.name.clone(),
            from: from.tag(),
            to: to.tag(),
        });
    }
}
