//! Exponential backoff shared by the work queue's rate limiter and the async operation poll
//! cadence.
use ::backoff::backoff::Backoff;
use ::backoff::ExponentialBackoff;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration that determines the behavior of an exponential backoff. The `Default` impl
/// starts at 1 second, caps at 20 minutes, multiplies by 2 and never gives up.
///
/// ```rust
/// use osb_controller::handler::backoff::BackoffConfig;
/// use std::time::Duration;
///
/// let config = BackoffConfig {
///     max_interval: Duration::from_secs(120),
///     ..Default::default()
/// };
/// assert_eq!(Duration::from_secs(1), config.initial_interval);
/// assert!(config.give_up_after.is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// The backoff after the first failure
    pub initial_interval: Duration,

    /// No backoff will ever be longer than this
    pub max_interval: Duration,

    /// Stop returning backoffs once this much time has passed since the first failure. `None`
    /// retries forever.
    pub give_up_after: Option<Duration>,

    /// Applied to the interval after each failure, until `max_interval` is reached
    pub multiplier: f64,

    /// Varies each backoff by at most this fraction in either direction
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(20 * 60),
            give_up_after: None,
            multiplier: 2.0,
            randomization_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Polls of async broker operations: 1s doubling to 2m, without jitter
    pub fn poll_default() -> BackoffConfig {
        BackoffConfig {
            max_interval: Duration::from_secs(120),
            randomization_factor: 0.0,
            ..Default::default()
        }
    }

    /// Always the same interval, with no randomization
    pub fn fixed_interval(interval: Duration) -> BackoffConfig {
        BackoffConfig {
            initial_interval: interval,
            max_interval: interval,
            give_up_after: None,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    pub fn disable_randomization(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    /// The un-randomized interval after `attempt` consecutive failures, starting from zero
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_interval.as_millis() as f64 * factor;
        let max = self.max_interval.as_millis() as f64;
        Duration::from_millis(millis.min(max) as u64)
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: self.give_up_after,
            randomization_factor: self.randomization_factor,
            start_time: Instant::now(),
            ..Default::default()
        }
    }
}

/// Tracks an independent backoff per key. The work queue keeps one of these per controller, and
/// controllers keep one for their poll cadence.
#[derive(Debug)]
pub struct KeyedBackoff<K: Hash + Eq> {
    state: Mutex<HashMap<K, (u32, ExponentialBackoff)>>,
    config: BackoffConfig,
}

impl<K: Hash + Eq + Clone> KeyedBackoff<K> {
    pub fn new(config: BackoffConfig) -> KeyedBackoff<K> {
        KeyedBackoff {
            state: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Returns the next backoff for the key, growing with each call until `reset` is called.
    /// Returns `None` once `give_up_after` has elapsed.
    pub fn next_backoff(&self, key: &K) -> Option<Duration> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let config = &self.config;
        let entry = state
            .entry(key.clone())
            .or_insert_with(|| (0, config.new_backoff()));
        entry.0 += 1;
        entry.1.next_backoff()
    }

    /// Number of backoffs handed out for the key since the last reset
    pub fn attempts(&self, key: &K) -> u32 {
        match self.state.lock() {
            Ok(state) => state.get(key).map(|e| e.0).unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(key).map(|e| e.0).unwrap_or(0),
        }
    }

    pub fn reset(&self, key: &K) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.remove(key);
    }
}
