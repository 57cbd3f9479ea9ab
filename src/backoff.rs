//! Exponential backoff for retry delays.
//!
//! `delay(n)` is the wait after the `n`th failed attempt (1-based):
//! `min(max, base * multiplier^(n-1))`. Attempt `0` means the initial call and has no delay.
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::backoff::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_multiplier(2.0)
//!     .with_max(Duration::from_secs(1));
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(10), Duration::from_secs(1));
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    /// Doubling backoff from `base`, capped only by [`MAX_BACKOFF`].
    pub fn exponential(base: Duration) -> Self {
        Self { base, multiplier: 2.0, max: MAX_BACKOFF }
    }

    /// Same delay after every failure.
    pub fn constant(delay: Duration) -> Self {
        Self { base: delay, multiplier: 1.0, max: delay.max(Duration::from_nanos(1)) }
    }

    /// Values below 1.0 (and NaN) are treated as 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier >= 1.0 { multiplier } else { 1.0 };
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max.min(MAX_BACKOFF);
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.multiplier.powi(exponent);
        let nanos = self.base.as_nanos() as f64 * factor;
        let cap = self.max.min(MAX_BACKOFF);
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos as u64).min(cap)
    }
}
