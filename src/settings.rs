//! Tuning knobs for subscriptions, apply retries and health probes.

use std::time::Duration;

use crate::replica::DEFAULT_TOMBSTONE_RETENTION;

/// Runtime settings for a sync session.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Upper bound for one shape request, long-poll included.
    pub request_timeout: Duration,
    /// Backoff between failed shape requests and failed batch applies.
    pub backoff: Backoff,
    /// How many times a batch is applied before the table is resynced.
    pub apply_attempts: u32,
    /// Consecutive request failures before a table counts as offline.
    pub degrade_after_failures: u32,
    /// Timeout for the embedded database liveness probe.
    pub probe_timeout: Duration,
    /// How long a delete keeps suppressing late updates of its row.
    pub tombstone_retention: Duration,
}

impl SyncSettings {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_apply_attempts(mut self, attempts: u32) -> Self {
        self.apply_attempts = attempts;
        self
    }

    pub fn with_degrade_after_failures(mut self, failures: u32) -> Self {
        self.degrade_after_failures = failures;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            backoff: Backoff::default(),
            apply_attempts: 3,
            degrade_after_failures: 3,
            probe_timeout: Duration::from_secs(5),
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Adds up to 25% random jitter when set.
    pub jitter: bool,
}

impl Backoff {
    /// A backoff without jitter, mostly useful in tests.
    pub fn fixed(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let ceiling = self.max_delay.as_secs_f64();
        let mut delay = base.min(ceiling);

        if self.jitter {
            delay += delay * 0.25 * rand::random::<f64>();
        }

        Duration::from_secs_f64(delay.min(ceiling))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}
