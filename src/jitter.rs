//! Randomized perturbation of retry delays.
//!
//! `Proportional(p)` moves a delay uniformly within `[delay * (1 - p), delay * (1 + p)]`, so a
//! fleet of callers that failed together does not retry together. `None` keeps delays exact.
//!
//! The thread-local RNG is used by default; tests inject a seeded RNG via `apply_with_rng`.

use std::time::Duration;

use rand::{rng, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    #[default]
    None,
    /// Fraction in `0.0..=1.0`.
    Proportional(f64),
}

impl Jitter {
    /// Out-of-range fractions are clamped into `0.0..=1.0`; zero disables jitter.
    pub fn proportional(fraction: f64) -> Self {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        if fraction == 0.0 {
            Jitter::None
        } else {
            Jitter::Proportional(fraction)
        }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(fraction) => {
                if delay.is_zero() {
                    return delay;
                }
                let offset = rng.random_range(-fraction..=fraction);
                delay.mul_f64((1.0 + offset).max(0.0))
            }
        }
    }
}
