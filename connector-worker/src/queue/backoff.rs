use elba_connect::config::FunctionsConfig;
use rand::Rng;
use std::time::Duration;

/// Retry and concurrency limits applied by the job queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per job, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound of the exponential delay. A larger server delay still wins.
    pub cap: Duration,
    /// Concurrent deletes per organisation.
    pub delete_concurrency: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&FunctionsConfig::default())
    }
}

impl From<&FunctionsConfig> for RetryPolicy {
    fn from(config: &FunctionsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_secs(config.backoff_cap_secs),
            delete_concurrency: config.delete_concurrency.max(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential ceiling after `failures` failed attempts: base, 2x, 4x, ...
    pub fn ceiling(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before the next attempt.
    ///
    /// Jittered between half and all of the ceiling. A server-specified delay
    /// replaces it when larger.
    pub fn delay(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        let jittered = jitter(self.ceiling(failures));
        match retry_after {
            Some(server) if server > jittered => server,
            _ => jittered,
        }
    }
}

fn jitter(ceiling: Duration) -> Duration {
    let half = ceiling / 2;
    let spread = (ceiling - half).as_millis() as u64;
    if spread == 0 {
        return ceiling;
    }
    half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
