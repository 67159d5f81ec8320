//! Reconnection supervisor
//!
//! Tracks consecutive failures of one subscription and decides how long to
//! wait before the next attempt:
//!
//! ```text
//! backoff(attempt) = min(base * 2^attempt, cap) ± jitter
//! ```
//!
//! The jittered delay is clamped to `[0, cap]`. A successful subscribe resets
//! the attempt counter. With `max_attempts` set, the failure after the last
//! allowed attempt exhausts the subscription instead of retrying forever.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any delay
    pub cap: Duration,
    /// Jitter as a fraction of the nominal delay (0.0 - 1.0)
    pub jitter: f64,
    /// Consecutive failed attempts before giving up (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// Create policy from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_ms = std::env::var("RECONNECT_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.base.as_millis() as u64);

        let cap_ms = std::env::var("RECONNECT_CAP_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cap.as_millis() as u64);

        let jitter = std::env::var("RECONNECT_JITTER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.jitter);

        // 0 = infinite
        let max_attempts = std::env::var("RECONNECT_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(|n| (n > 0).then_some(n))
            .unwrap_or(defaults.max_attempts);

        Self {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            jitter,
            max_attempts,
        }
    }

    /// Delay for `attempt` (0-based) before jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay for `attempt` with jitter drawn from `rng`
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }

        let spread = nominal.as_secs_f64() * jitter;
        let offset = rng.gen_range(-spread..=spread);
        let jittered = (nominal.as_secs_f64() + offset).clamp(0.0, self.cap.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }
}

/// Failure bookkeeping for one subscription
#[derive(Debug, Clone)]
pub struct ReconnectionSupervisor {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ReconnectionSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Consecutive failures since the last successful subscribe
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Subscribe succeeded; start over
    pub fn on_success(&mut self) {
        self.attempt = 0;
    }

    /// Record a failure and return the wait before the next attempt, or
    /// `None` if the subscription is exhausted
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.on_failure_with(&mut rand::thread_rng())
    }

    pub fn on_failure_with<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        let delay = self.policy.delay_with(self.attempt, rng);
        self.attempt = self.attempt.saturating_add(1);

        match self.policy.max_attempts {
            Some(max) if self.attempt > max => None,
            _ => Some(delay),
        }
    }
}
