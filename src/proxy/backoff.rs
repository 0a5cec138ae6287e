//! Exponential backoff between same-backend retries

use std::time::Duration;

use rand::Rng;

/// Randomize over the full exponential delay.
pub const MAX_JITTER: f64 = 1.0;

/// Plain exponential delay.
pub const NO_JITTER: f64 = 0.0;

/// Exponents beyond this are clamped; the cap is reached long before.
const MAX_EXPONENT: u32 = 32;

/// Maps a retry count to a wait: `base * factor^retry`, capped at `max`,
/// plus a random share in `[0, jitter]` of that delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::full_jitter(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl BackoffPolicy {
    pub fn full_jitter(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
            jitter: MAX_JITTER,
        }
    }

    pub fn no_jitter(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
            jitter: NO_JITTER,
        }
    }

    /// Delay for `retry` using the thread-local RNG.
    pub fn duration(&self, retry: u32) -> Duration {
        self.duration_with(retry, &mut rand::thread_rng())
    }

    /// Delay for `retry` drawing jitter from `rng`.
    pub fn duration_with<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let fraction = if self.jitter > 0.0 {
            rng.gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.duration_with_fraction(retry, fraction)
    }

    /// Delay for `retry` with a fixed jitter fraction.
    pub fn duration_with_fraction(&self, retry: u32, fraction: f64) -> Duration {
        let exponent = retry.min(MAX_EXPONENT) as i32;
        let max = self.max.as_secs_f64();
        let delay = (self.base.as_secs_f64() * self.factor.powi(exponent)).min(max);
        let fraction = fraction.clamp(0.0, self.jitter.max(0.0));

        Duration::from_secs_f64(delay * (1.0 + fraction))
    }
}
