//! Exponential backoff schedule for the initial collector handshake.

use std::time::Duration;

use common::TelemetryError;

/// Bound on the whole connect operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Give up after this many dial attempts (including the first).
    MaxAttempts(u32),
    /// Give up once the next backoff sleep would cross this much wall-clock time.
    MaxElapsed(Duration),
}

/// Retry schedule for [`Connector`](super::Connector).
///
/// Delay before retry `k` (zero-based) is `base_delay * multiplier^k`, capped
/// at `max_delay`, then scaled by a random factor in
/// `[1 - jitter_fraction, 1 + jitter_fraction]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    /// Upper bound on a single dial attempt.
    pub min_connect_timeout: Duration,
    pub limit: RetryLimit,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.4,
            max_delay: Duration::from_secs(15),
            jitter_fraction: 0.2,
            min_connect_timeout: Duration::from_secs(20),
            limit: RetryLimit::MaxAttempts(10),
        }
    }
}

impl BackoffPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.min_connect_timeout = timeout;
        self
    }

    pub fn with_limit(mut self, limit: RetryLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Validate the policy, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(TelemetryError::config("backoff multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(TelemetryError::config(
                "backoff jitter fraction must be within [0, 1]",
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(TelemetryError::config(
                "backoff max delay must not be shorter than the base delay",
            ));
        }
        if self.min_connect_timeout.is_zero() {
            return Err(TelemetryError::config("connect timeout must be > 0"));
        }
        match self.limit {
            RetryLimit::MaxAttempts(0) => {
                Err(TelemetryError::config("max attempts must be at least 1"))
            }
            RetryLimit::MaxElapsed(d) if d.is_zero() => {
                Err(TelemetryError::config("max elapsed time must be > 0"))
            }
            _ => Ok(()),
        }
    }

    /// Un-jittered delay before retry `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        // 0 * inf is NaN for a zero base delay.
        let capped = if raw.is_nan() {
            0.0
        } else {
            raw.min(self.max_delay.as_secs_f64())
        };
        Duration::from_secs_f64(capped)
    }

    /// Apply jitter to `delay`. `unit` is a sample from `[-1, 1]`.
    pub fn jittered(&self, delay: Duration, unit: f64) -> Duration {
        let unit = unit.clamp(-1.0, 1.0);
        let scaled = delay.as_secs_f64() * (1.0 + self.jitter_fraction * unit);
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Shortest possible sleep before retry `retry` once jitter is applied.
    pub fn min_delay(&self, retry: u32) -> Duration {
        self.jittered(self.delay(retry), -1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Duration, secs: f64) -> bool {
        (a.as_secs_f64() - secs).abs() < 1e-6
    }

    #[test]
    fn defaults_are_correct() {
        let p = BackoffPolicy::default();
        assert_eq!(p.base_delay, Duration::from_secs(1));
        assert_eq!(p.multiplier, 1.4);
        assert_eq!(p.max_delay, Duration::from_secs(15));
        assert_eq!(p.jitter_fraction, 0.2);
        assert_eq!(p.min_connect_timeout, Duration::from_secs(20));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn delay_grows_geometrically() {
        let p = BackoffPolicy::default();
        assert!(approx(p.delay(0), 1.0));
        assert!(approx(p.delay(1), 1.4));
        assert!(approx(p.delay(2), 1.96));
        assert!(approx(p.delay(3), 2.744));
    }

    #[test]
    fn delay_is_capped() {
        let p = BackoffPolicy::default();
        assert_eq!(p.delay(20), Duration::from_secs(15));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(15));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let p = BackoffPolicy::default();
        let d = Duration::from_secs(10);
        assert!(approx(p.jittered(d, -1.0), 8.0));
        assert!(approx(p.jittered(d, 1.0), 12.0));
        assert!(approx(p.jittered(d, 0.0), 10.0));
        // Out-of-range samples are clamped.
        assert!(approx(p.jittered(d, 7.0), 12.0));
    }

    #[test]
    fn validate_rejects_bad_policies() {
        let base = BackoffPolicy::default();
        assert!(base.clone().with_multiplier(0.5).validate().is_err());
        assert!(base.clone().with_multiplier(f64::NAN).validate().is_err());
        assert!(base.clone().with_jitter(1.5).validate().is_err());
        assert!(base
            .clone()
            .with_max_delay(Duration::from_millis(10))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_connect_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_limit(RetryLimit::MaxAttempts(0))
            .validate()
            .is_err());
        assert!(base
            .with_limit(RetryLimit::MaxElapsed(Duration::ZERO))
            .validate()
            .is_err());
    }
}
