//! Capped exponential backoff with jitter.
//!
//! Used by the ingestion loop between failed transport calls and by
//! processing workers before their single handler retry.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped at `cap`, with ±25% jitter applied after the cap so concurrent
/// retries spread out instead of thundering together.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    if base_ms == 0 || cap_ms == 0 {
        return Duration::ZERO;
    }

    let exp = attempt.min(32);
    let raw_ms = base_ms
        .saturating_mul(2u64.saturating_pow(exp))
        .min(cap_ms);

    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((raw_ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_within_jitter_bounds() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(60);

        for attempt in 0..6u32 {
            let expected = 100u64 * 2u64.pow(attempt);
            let delay = backoff_delay(attempt, base, cap).as_millis() as u64;
            assert!(
                delay >= expected * 3 / 4 && delay <= expected * 5 / 4,
                "attempt {attempt}: {delay}ms outside [{}, {}]",
                expected * 3 / 4,
                expected * 5 / 4
            );
        }
    }

    #[test]
    fn respects_the_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);

        for attempt in 4..64u32 {
            let delay = backoff_delay(attempt, base, cap);
            assert!(delay <= cap.mul_f64(1.25));
            assert!(delay >= cap.mul_f64(0.75));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let delay = backoff_delay(u32::MAX, Duration::from_millis(500), Duration::from_secs(5));
        assert!(delay <= Duration::from_secs(5).mul_f64(1.25));
    }

    #[test]
    fn zero_base_yields_zero() {
        assert_eq!(
            backoff_delay(3, Duration::ZERO, Duration::from_secs(1)),
            Duration::ZERO
        );
    }
}
