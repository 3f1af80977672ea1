//! Backoff policies for failed webhook deliveries.
//!
//! Each endpoint names the policy it wants (`retry_policy = "quadratic"`); the
//! delivery worker asks the policy how long to wait after the `n`-th failed attempt
//! and stores `now + delay` as the delivery's `next_retry_at`. The retry scheduler
//! then pulls the delivery once that instant has passed.
//!
//! # Policies
//!
//! - [`Quadratic`](RetryPolicy::Quadratic) - `n²` minutes (1m, 4m, 9m, 16m, ...). Default.
//! - [`Exponential`](RetryPolicy::Exponential) - `2^(n-1)` minutes (1m, 2m, 4m, 8m, ...)
//! - [`Linear`](RetryPolicy::Linear) - `5·n` minutes (5m, 10m, 15m, ...)
//! - [`Fixed`](RetryPolicy::Fixed) - a constant 5 minutes
//!
//! Every policy is capped at [`MAX_RETRY_DELAY`] and never decreases as `n` grows.
//!
//! # Examples
//!
//! ```rust
//! use hookwork::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy: RetryPolicy = "quadratic".parse().unwrap();
//! assert_eq!(policy.calculate_delay(1), Duration::from_secs(60));
//! assert_eq!(policy.calculate_delay(2), Duration::from_secs(4 * 60));
//! assert_eq!(policy.calculate_delay(1000), Duration::from_secs(24 * 60 * 60));
//! ```

use crate::HookworkError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// Upper bound for any retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

const MINUTE: u64 = 60;
const STEP_MINUTES: u64 = 5;

/// Named backoff policy applied between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// `min(24h, n² minutes)`.
    #[default]
    Quadratic,
    /// `min(24h, 2^(n-1) minutes)`.
    Exponential,
    /// `min(24h, 5·n minutes)`.
    Linear,
    /// A constant five minutes.
    Fixed,
}

impl RetryPolicy {
    /// Delay to wait after `attempt` failed attempts (1-based).
    ///
    /// An `attempt` of zero is treated as the first attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let n = u64::from(attempt.max(1));
        let minutes = match self {
            RetryPolicy::Quadratic => n.saturating_mul(n),
            RetryPolicy::Exponential => {
                // 2^(n-1); anything past 2^11 minutes is already beyond the cap
                if n > 12 { u64::MAX } else { 1u64 << (n - 1) }
            }
            RetryPolicy::Linear => n.saturating_mul(STEP_MINUTES),
            RetryPolicy::Fixed => STEP_MINUTES,
        };

        Duration::from_secs(minutes.saturating_mul(MINUTE)).min(MAX_RETRY_DELAY)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::Quadratic => "quadratic",
            RetryPolicy::Exponential => "exponential",
            RetryPolicy::Linear => "linear",
            RetryPolicy::Fixed => "fixed",
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryPolicy {
    type Err = HookworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quadratic" | "default" => Ok(RetryPolicy::Quadratic),
            "exponential" => Ok(RetryPolicy::Exponential),
            "linear" => Ok(RetryPolicy::Linear),
            "fixed" => Ok(RetryPolicy::Fixed),
            other => Err(HookworkError::InvalidEndpoint {
                message: format!("unknown retry policy '{}'", other),
            }),
        }
    }
}
