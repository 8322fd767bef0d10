//! Reconnect delays: exponential, capped, with a little jitter so a reader
//! that drops off the bus is not hammered in lock-step.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff state for reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            next: initial,
            jitter: true,
        }
    }

    /// Disable jitter, making [`Self::next_delay`] deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next attempt. Each call doubles the following delay
    /// up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = base.saturating_mul(2).min(self.max);
        if !self.jitter || base.is_zero() {
            return base;
        }
        // Up to +10%, never past the cap.
        let spread = base.as_millis().min(u128::from(u64::MAX)) as u64 / 10;
        let extra = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        (base + Duration::from_millis(extra)).min(self.max)
    }

    /// Start over from the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}
