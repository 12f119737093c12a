use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped, with bounded jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(63);
        let ms = (self.base.as_millis() as u128).saturating_mul(1u128 << shift);
        Duration::from_millis(ms.min(self.max.as_millis() as u128) as u64)
    }

    /// `delay(attempt)` plus up to 25% jitter, so synchronized loops
    /// don't retry in lockstep.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let d = self.delay(attempt);
        let span = (d.as_millis() as u64 / 4).max(1);
        d + Duration::from_millis(rand::random::<u64>() % span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(20), Duration::from_secs(10));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(10), "no overflow");
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let p = policy();
        for attempt in 0..6 {
            let base = p.delay(attempt);
            for _ in 0..50 {
                let jittered = p.delay_with_jitter(attempt);
                assert!(jittered >= base);
                assert!(jittered <= base + base / 4 + Duration::from_millis(1));
            }
        }
    }
}
