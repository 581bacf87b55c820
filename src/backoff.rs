//! Exponential reconnect backoff with jitter.

use crate::config::SyncSettings;
use rand::Rng;
use std::time::Duration;

const DEFAULT_JITTER: f64 = 0.15;

/// `base × factor^attempt`, capped at `max`, spread by ±`jitter`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            factor: factor.max(1.0),
            max: max.max(base),
            jitter: DEFAULT_JITTER,
            max_attempts,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_base_ms),
            settings.reconnect_factor,
            Duration::from_millis(settings.reconnect_max_ms),
            settings.reconnect_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempt).as_secs_f64();
        let spread = if self.jitter > 0.0 {
            rng.gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((nominal * (1.0 + spread)).max(0.0))
    }

    /// No retries left after `attempt` failed reconnects.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff() -> Backoff {
        Backoff::from_settings(&SyncSettings::default())
    }

    #[test]
    fn grows_by_factor_until_capped() {
        let backoff = backoff();
        assert_eq!(backoff.nominal(0), Duration::from_millis(1000));
        assert_eq!(backoff.nominal(1), Duration::from_millis(1500));
        assert_eq!(backoff.nominal(2), Duration::from_millis(2250));
        assert_eq!(backoff.nominal(40), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_fifteen_percent() {
        let backoff = backoff();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..12 {
            let nominal = backoff.nominal(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = backoff.delay_with(attempt, &mut rng).as_secs_f64();
                assert!(delay >= nominal * 0.85 - 1e-9, "{} < {}", delay, nominal);
                assert!(delay <= nominal * 1.15 + 1e-9, "{} > {}", delay, nominal);
            }
        }
    }

    #[test]
    fn exhaustion_after_configured_attempts() {
        let backoff = backoff();
        assert!(!backoff.exhausted(9));
        assert!(backoff.exhausted(10));
    }
}
