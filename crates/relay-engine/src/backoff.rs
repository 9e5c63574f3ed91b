use std::time::Duration;

use rand::Rng;

use crate::config::RelayConfig;

/// Exponential backoff with bounded jitter.
///
/// The un-jittered delay after `attempts` attempts is
/// `base * 2^attempts`, capped at `max`. Below the cap, jitter of `±jitter`
/// is applied and the result is clamped from below by the largest delay the
/// previous attempt could have produced, so delays for one record never
/// decrease on the way up. Once capped, delays spread over
/// `[max * (1 - jitter), max]` so records that failed together drift apart.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.base_backoff(), config.max_backoff(), config.jitter)
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// `base * 2^attempts`, capped.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let delay_ms = if attempts > 63 {
            max_ms
        } else {
            let multiplier = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
            base_ms.saturating_mul(multiplier)
        };
        Duration::from_millis(delay_ms.min(max_ms))
    }

    fn is_capped(&self, attempts: u32) -> bool {
        self.base_delay(attempts) >= self.max
    }

    /// Lowest delay of the band capped delays are spread over.
    fn capped_low(&self) -> Duration {
        self.max.mul_f64(1.0 - self.jitter)
    }

    /// Lowest delay allowed after `attempts` attempts.
    fn floor(&self, attempts: u32) -> Duration {
        match attempts.checked_sub(1) {
            Some(prev) if self.is_capped(prev) => self.capped_low(),
            Some(prev) => self.base_delay(prev).mul_f64(1.0 + self.jitter).min(self.max),
            None => Duration::ZERO,
        }
    }

    /// Jittered delay before the next attempt, given `attempts` made so far.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let jittered = if self.jitter == 0.0 {
            self.base_delay(attempts)
        } else if self.is_capped(attempts) {
            self.max.mul_f64(1.0 - rng.gen_range(0.0..=self.jitter))
        } else {
            let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
            self.base_delay(attempts).mul_f64(factor)
        };
        jittered.max(self.floor(attempts)).min(self.max)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        self.delay_with(attempts, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 0.2)
    }

    #[test]
    fn base_delay_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.base_delay(0), Duration::from_millis(100));
        assert_eq!(p.base_delay(1), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(800));
        assert_eq!(p.base_delay(7), Duration::from_secs(10));
        assert_eq!(p.base_delay(200), Duration::from_secs(10));
    }

    #[test]
    fn no_jitter_is_exact() {
        let p = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 0.0);
        assert_eq!(p.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let d = p.delay_with(3, &mut rng);
            assert!(d >= Duration::from_millis(639), "{d:?}");
            assert!(d <= Duration::from_millis(961), "{d:?}");
        }
    }

    #[test]
    fn capped_delays_keep_jitter() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(11);
        let low = Duration::from_secs(8);
        let delays: Vec<Duration> = (0..50).map(|_| p.delay_with(20, &mut rng)).collect();
        assert!(delays.iter().all(|d| *d >= low && *d <= p.max()), "{delays:?}");
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first));
    }

    proptest! {
        #[test]
        fn delays_never_decrease_below_the_cap(
            seed in any::<u64>(),
            base_ms in 1u64..5_000,
            cap_factor in 1u64..1_000,
            jitter in 0.0f64..0.5,
        ) {
            let p = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(base_ms * cap_factor),
                jitter,
            );
            let mut rng = StdRng::seed_from_u64(seed);
            let capped_low = p.max().mul_f64(1.0 - jitter.clamp(0.0, 0.99));
            let mut previous = Duration::ZERO;
            for attempts in 0..40 {
                let d = p.delay_with(attempts, &mut rng);
                let previous_capped = attempts > 0 && p.base_delay(attempts - 1) >= p.max();
                if previous_capped {
                    prop_assert!(d >= capped_low, "attempt {}: {:?} < {:?}", attempts, d, capped_low);
                } else {
                    prop_assert!(d >= previous, "attempt {}: {:?} < {:?}", attempts, d, previous);
                }
                prop_assert!(d <= p.max());
                previous = d;
            }
        }
    }
}
