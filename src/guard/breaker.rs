//! Circuit breaker for the upstream dependency.
//!
//! One breaker guards the whole register integration; it is not split per
//! document, so a flapping upstream cannot hide behind document isolation.
//!
//! # State Machine
//!
//! ```text
//! Closed --[consecutive failures == threshold]--> Open
//! Open --[cooldown elapsed, next caller becomes the probe]--> HalfOpen
//! HalfOpen --[probe succeeds]--> Closed
//! HalfOpen --[probe fails]--> Open (openedAt reset)
//! ```
//!
//! Only one probe is in flight while half-open; other callers are rejected
//! as if the breaker were open.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{GatewayError, Result};

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unavailable(&self) -> GatewayError {
        GatewayError::DependencyUnavailable(format!("{} circuit breaker is open", self.name))
    }

    /// Current state, as last recorded (an elapsed cooldown is only acted on
    /// by the next caller)
    pub fn state(&self) -> BreakerState {
        self.inner().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner().consecutive_failures
    }

    /// Fail fast if a call would be rejected right now, without reserving
    /// anything
    pub fn check(&self) -> Result<()> {
        let inner = self.inner();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open if self.cooldown_elapsed(&inner) => Ok(()),
            BreakerState::HalfOpen if !inner.probe_in_flight => Ok(()),
            _ => Err(self.unavailable()),
        }
    }

    /// Ask permission for one upstream attempt.
    ///
    /// The returned permit must be settled with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]. Dropping an unsettled probe permit frees
    /// the probe slot without changing state.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner();
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false)),
            BreakerState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return Err(self.unavailable());
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                info!(breaker = %self.name, "Circuit breaker half-open, sending probe");
                Ok(BreakerPermit::new(self, true))
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.unavailable());
                }
                inner.probe_in_flight = true;
                debug!(breaker = %self.name, "Circuit breaker probe slot taken");
                Ok(BreakerPermit::new(self, true))
            }
        }
    }

    fn cooldown_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown)
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            info!(breaker = %self.name, "Circuit breaker closed");
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "Probe failed, circuit breaker re-opened");
            }
            BreakerState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            // A non-probe call that started before the breaker opened
            _ => {}
        }
    }

    fn on_abandon(&self) {
        self.inner().probe_in_flight = false;
    }
}

/// Permission to make one upstream attempt
#[must_use = "settle the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this attempt is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandon();
        }
    }
}
