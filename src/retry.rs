//! Declarative retry policy for language function calls.
//!
//! [`RetryPolicy`] is the serializable, user-facing description: one stop
//! strategy, one wait strategy, and a `reraise` flag. [`RetryPolicy::compile`]
//! turns it into [`RetryParameters`], which the call loop consults after
//! every failed attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which stop strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Never,
    AfterAttempt,
    AfterDelay,
}

/// Which wait strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    None,
    Fixed,
    Random,
    Exponential,
}

/// Retry configuration. Only the fields of the selected strategies are used.
///
/// Times are in seconds.
///
/// # Example
///
/// ```
/// use lm_functions::retry::{RetryPolicy, StopStrategy, WaitType};
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_wait(WaitType::Exponential);
/// let params = policy.compile();
/// assert_eq!(params.stop, StopStrategy::AfterAttempt(5));
/// assert!(params.reraise);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub stop: StopType,
    pub wait: WaitType,
    pub stop_max_attempt: u32,
    pub stop_max_delay: f64,
    pub wait_fixed: f64,
    pub wait_random_min: f64,
    pub wait_random_max: f64,
    pub wait_exponential_min: f64,
    pub wait_exponential_max: f64,
    pub wait_exponential_multiplier: f64,
    pub reraise: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            stop: StopType::AfterAttempt,
            wait: WaitType::None,
            stop_max_attempt: 3,
            stop_max_delay: 1.0,
            wait_fixed: 1.0,
            wait_random_min: 1.0,
            wait_random_max: 2.0,
            wait_exponential_min: 1.0,
            wait_exponential_max: 2.0,
            wait_exponential_multiplier: 2.0,
            reraise: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Stop after `n` attempts (including the first).
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.stop = StopType::AfterAttempt;
        self.stop_max_attempt = n.max(1);
        self
    }

    /// Stop once `seconds` have elapsed since the first attempt started.
    pub fn with_max_delay(mut self, seconds: f64) -> Self {
        self.stop = StopType::AfterDelay;
        self.stop_max_delay = seconds;
        self
    }

    pub fn with_stop(mut self, stop: StopType) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_wait(mut self, wait: WaitType) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_fixed_wait(mut self, seconds: f64) -> Self {
        self.wait = WaitType::Fixed;
        self.wait_fixed = seconds;
        self
    }

    pub fn with_random_wait(mut self, min: f64, max: f64) -> Self {
        self.wait = WaitType::Random;
        self.wait_random_min = min;
        self.wait_random_max = max;
        self
    }

    pub fn with_exponential_wait(mut self, min: f64, max: f64, multiplier: f64) -> Self {
        self.wait = WaitType::Exponential;
        self.wait_exponential_min = min;
        self.wait_exponential_max = max;
        self.wait_exponential_multiplier = multiplier;
        self
    }

    pub fn with_reraise(mut self, reraise: bool) -> Self {
        self.reraise = reraise;
        self
    }

    /// Build the executable parameters from the current fields.
    pub fn compile(&self) -> RetryParameters {
        let stop = match self.stop {
            StopType::Never => StopStrategy::Never,
            StopType::AfterAttempt => StopStrategy::AfterAttempt(self.stop_max_attempt),
            StopType::AfterDelay => StopStrategy::AfterDelay(secs(self.stop_max_delay)),
        };
        let wait = match self.wait {
            WaitType::None => WaitStrategy::None,
            WaitType::Fixed => WaitStrategy::Fixed(secs(self.wait_fixed)),
            WaitType::Random => WaitStrategy::Random {
                min: secs(self.wait_random_min),
                max: secs(self.wait_random_max),
            },
            WaitType::Exponential => WaitStrategy::Exponential {
                min: secs(self.wait_exponential_min),
                max: secs(self.wait_exponential_max),
                multiplier: self.wait_exponential_multiplier,
            },
        };
        RetryParameters {
            stop,
            wait,
            reraise: self.reraise,
        }
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopStrategy {
    Never,
    AfterAttempt(u32),
    AfterDelay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitStrategy {
    None,
    Fixed(Duration),
    /// Uniform in `[min, max]`.
    Random { min: Duration, max: Duration },
    /// `multiplier * 2^(attempt - 1)` seconds, clamped to `[min, max]`.
    Exponential {
        min: Duration,
        max: Duration,
        multiplier: f64,
    },
}

/// Compiled retry parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryParameters {
    pub stop: StopStrategy,
    pub wait: WaitStrategy,
    pub reraise: bool,
}

/// Snapshot passed to the `retry` event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    /// The attempt that just failed (1-indexed).
    pub attempt: u32,
    pub elapsed: Duration,
    /// Wait before the next attempt.
    pub wait: Duration,
}

impl RetryParameters {
    /// Whether to give up after `attempt` (1-indexed) has failed.
    pub fn should_stop(&self, attempt: u32, elapsed: Duration) -> bool {
        match self.stop {
            StopStrategy::Never => false,
            StopStrategy::AfterAttempt(max) => attempt >= max,
            StopStrategy::AfterDelay(budget) => elapsed >= budget,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.wait {
            WaitStrategy::None => Duration::ZERO,
            WaitStrategy::Fixed(d) => d,
            WaitStrategy::Random { min, max } => {
                let (lo, hi) = (min.as_secs_f64(), max.as_secs_f64());
                if hi <= lo {
                    return min;
                }
                Duration::from_secs_f64(lo + fastrand::f64() * (hi - lo))
            }
            WaitStrategy::Exponential {
                min,
                max,
                multiplier,
            } => {
                let exp = 2f64.powi(attempt.saturating_sub(1).min(1024) as i32);
                let raw = multiplier * exp;
                let clamped = if raw.is_finite() {
                    raw.clamp(min.as_secs_f64(), max.as_secs_f64().max(min.as_secs_f64()))
                } else {
                    max.as_secs_f64()
                };
                Duration::from_secs_f64(clamped.max(0.0))
            }
        }
    }
}
