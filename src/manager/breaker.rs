//! Per-detector circuit breaker.
//!
//! Closed until `threshold` failures land inside the rolling window, then
//! open for `reset_ms`. The first admission afterwards is a half-open
//! probe: success closes the breaker, failure reopens it.

use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window_ms: i64,
    reset_ms: i64,
    failures: VecDeque<i64>,
    state: BreakerState,
    opened_at_ms: i64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window_ms: i64, reset_ms: i64) -> Self {
        Self {
            threshold: threshold.max(1),
            window_ms,
            reset_ms,
            failures: VecDeque::new(),
            state: BreakerState::Closed,
            opened_at_ms: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// May a signal from this detector pass right now?
    pub fn allow(&mut self, now_ms: i64) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now_ms - self.opened_at_ms >= self.reset_ms {
                    debug!("breaker half-open, admitting probe");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_failure(&mut self, now_ms: i64) {
        match self.state {
            BreakerState::HalfOpen => {
                warn!("probe failed, breaker reopened");
                self.trip(now_ms);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                self.failures.push_back(now_ms);
                let cutoff = now_ms - self.window_ms;
                while self.failures.front().is_some_and(|&t| t < cutoff) {
                    self.failures.pop_front();
                }
                if self.failures.len() >= self.threshold as usize {
                    warn!(failures = self.failures.len(), "breaker tripped");
                    self.trip(now_ms);
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            debug!("probe succeeded, breaker closed");
            self.state = BreakerState::Closed;
        }
        self.failures.clear();
    }

    fn trip(&mut self, now_ms: i64) {
        self.state = BreakerState::Open;
        self.opened_at_ms = now_ms;
        self.failures.clear();
    }
}
