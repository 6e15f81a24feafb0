//! Reconnect backoff
//!
//! Exponential growth from a base delay up to a cap, with ±jitter so a fleet
//! of clients dropped by the same broker restart does not reconnect in
//! lockstep. Consecutive delays never shrink until the counter is reset.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Cap on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor per failed attempt
    pub multiplier: f64,
    /// Randomisation applied as ±jitter (0.0 - 1.0)
    pub jitter: f64,
    /// Active time after which the attempt counter resets
    pub reset_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a given attempt number (0-indexed), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Attempt counter over a [`ReconnectPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Get the next delay and increment the attempt counter
    ///
    /// The result is at least the previous delay and at most `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let jittered = if jitter == 0.0 {
            delay
        } else {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            delay.mul_f64(factor)
        };

        let next = jittered.max(self.last_delay).min(self.policy.max_delay);
        self.last_delay = next;
        next
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Reset if a session stayed active long enough
    pub fn record_active(&mut self, active_for: Duration) {
        if active_for >= self.policy.reset_after {
            self.reset();
        }
    }
}
