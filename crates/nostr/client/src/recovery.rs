//! Backoff schedules for reconnects and outbox retries.
//!
//! Both follow `min(base * 2^(attempt - 1), max)`. Outbox retries use the
//! plain schedule so entries have predictable retry times; reconnects add
//! full jitter so endpoints that dropped together do not reconnect together.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Always the capped exponential delay.
    None,
    /// A random delay in `[0, capped_delay]`.
    Full,
}

/// Capped exponential delay schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let exp_ms = self.base.as_millis().saturating_mul(1u128 << shift);
        let capped_ms = exp_ms.min(self.max.as_millis());
        Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Reconnect delays for one endpoint. Reset after every successful connect.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    jitter: Jitter,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            jitter: Jitter::Full,
            failures: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Record a failed connect and return how long to wait before the next.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let capped = self.policy.delay(self.failures);
        match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                let capped_ms = capped.as_millis().min(u64::MAX as u128) as u64;
                Duration::from_millis(rand::rng().random_range(0..=capped_ms))
            }
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failed connects since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
