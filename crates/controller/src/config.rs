use std::time::Duration;

use carctl_queue::{BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, MAX_DELAY};

use crate::ControllerError;

/// Slowest accepted overall rate: one sync per 1000 seconds.
const MIN_QPS: f64 = 0.001;

/// Runtime knobs for the controller and the informer feeding it.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of parallel workers.
    pub workers: usize,
    /// Informer resync period; `None` disables resync.
    pub resync_period: Option<Duration>,
    /// Give up waiting for the initial cache sync after this long.
    pub cache_sync_timeout: Option<Duration>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
    /// Drop an item once it has been requeued this many times.
    pub max_retries: Option<u32>,
    pub queue_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_period: Some(Duration::from_secs(30)),
            cache_sync_timeout: None,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            max_retries: None,
            queue_name: "cars".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overlaid with `CARCTL_*` environment variables.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse::<T>().ok())
        }
        let d = Self::default();
        Self {
            workers: parse(&lookup, "CARCTL_WORKERS").unwrap_or(d.workers),
            resync_period: match parse::<u64>(&lookup, "CARCTL_RESYNC_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => d.resync_period,
            },
            cache_sync_timeout: parse::<u64>(&lookup, "CARCTL_CACHE_SYNC_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .or(d.cache_sync_timeout),
            base_delay: parse::<u64>(&lookup, "CARCTL_BASE_DELAY_MS").map(Duration::from_millis).unwrap_or(d.base_delay),
            max_delay: parse::<u64>(&lookup, "CARCTL_MAX_DELAY_SECS").map(Duration::from_secs).unwrap_or(d.max_delay),
            qps: parse(&lookup, "CARCTL_QPS").unwrap_or(d.qps),
            burst: parse(&lookup, "CARCTL_BURST").unwrap_or(d.burst),
            max_retries: parse(&lookup, "CARCTL_MAX_RETRIES").or(d.max_retries),
            queue_name: d.queue_name,
        }
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.max_delay > MAX_DELAY {
            return Err(ControllerError::InvalidConfig(format!(
                "max delay {:?} exceeds the queue limit {:?}",
                self.max_delay, MAX_DELAY
            )));
        }
        if !self.qps.is_finite() || self.qps < MIN_QPS {
            return Err(ControllerError::InvalidConfig(format!("qps must be finite and at least {}", MIN_QPS)));
        }
        if self.base_delay > self.max_delay {
            return Err(ControllerError::InvalidConfig(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Per-item exponential backoff combined with the overall token bucket.
    pub fn rate_limiter(&self) -> MaxOfRateLimiter<String> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(self.base_delay, self.max_delay)),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}
