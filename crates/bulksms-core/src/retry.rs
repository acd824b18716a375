//! Retry backoff computation
//!
//! Capped exponential backoff with symmetric jitter, applied to transient
//! transport failures. The durable queue itself lives in the store crate;
//! this module only decides *when* the next attempt happens and whether the
//! budget allows one.

use core::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;
use crate::types::Timestamp;

/// Whether a message that has already been retried `retry_count` times may
/// be attempted again.
///
/// `max_attempts` counts the initial send, so a policy of 5 allows 4 retries.
pub fn has_budget(policy: &RetryPolicy, retry_count: u32) -> bool {
    retry_count + 1 < policy.max_attempts
}

/// Delay before retry number `retry_count + 1`.
///
/// `backoff(n) = min(base * 2^n, cap)` with `±jitter_frac` applied on top;
/// the result never exceeds `cap * (1 + jitter_frac)` and never goes
/// negative.
pub fn backoff_delay<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    retry_count: u32,
    rng: &mut R,
) -> Duration {
    let exp = policy
        .base_ms
        .saturating_mul(1u64.checked_shl(retry_count).unwrap_or(u64::MAX));
    let capped = exp.min(policy.cap_ms);

    let jittered = if policy.jitter_frac > 0.0 {
        let spread = capped as f64 * policy.jitter_frac;
        let offset = rng.gen_range(-spread..=spread);
        ((capped as f64) + offset).max(0.0) as u64
    } else {
        capped
    };

    Duration::from_millis(jittered)
}

/// Absolute wake-up time for the next retry, or `None` when the budget is
/// spent and the message must be marked exhausted.
pub fn next_retry_at<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    retry_count: u32,
    now: Timestamp,
    rng: &mut R,
) -> Option<Timestamp> {
    if !has_budget(policy, retry_count) {
        return None;
    }
    let delay = backoff_delay(policy, retry_count, rng);
    Some(now.add_millis(delay.as_millis() as u64))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_ms: 5_000,
            cap_ms: 300_000,
            jitter_frac: 0.0,
        }
    }

    #[test]
    fn doubles_until_cap() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<u64> = (0..8)
            .map(|n| backoff_delay(&policy, n, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![5_000, 10_000, 20_000, 40_000, 80_000, 160_000, 300_000, 300_000]
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_frac: 0.2,
            ..policy()
        };
        let mut rng = StdRng::seed_from_u64(42);
        for n in 0..6 {
            let nominal = (policy.base_ms * (1 << n)).min(policy.cap_ms) as f64;
            for _ in 0..100 {
                let delay = backoff_delay(&policy, n, &mut rng).as_millis() as f64;
                assert!(delay >= nominal * 0.8 - 1.0, "n={n} delay={delay}");
                assert!(delay <= nominal * 1.2 + 1.0, "n={n} delay={delay}");
            }
        }
    }

    #[test]
    fn budget_counts_initial_attempt() {
        let policy = policy();
        // retry_count is the number of retries already performed
        assert!(has_budget(&policy, 0));
        assert!(has_budget(&policy, 3));
        assert!(!has_budget(&policy, 4)); // fifth attempt already happened
        assert!(!has_budget(&policy, 10));
    }

    #[test]
    fn next_retry_at_exhausts() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Timestamp::new(1_000);

        let at = next_retry_at(&policy, 0, now, &mut rng).unwrap();
        assert_eq!(at, Timestamp::new(6_000));

        assert!(next_retry_at(&policy, 4, now, &mut rng).is_none());
    }

    #[test]
    fn huge_retry_count_does_not_overflow() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(1);
        let delay = backoff_delay(&policy, 63, &mut rng);
        assert_eq!(delay, Duration::from_millis(policy.cap_ms));
    }
}
