use crate::prelude::*;

use std::future::Future;

#[cfg(not(feature = "mocks"))]
const BACKOFF_CAP_SECS: u64 = 30;
#[cfg(feature = "mocks")]
const BACKOFF_CAP_SECS: u64 = 0;

/// Delay before retry `attempt` (1-based), doubling from `base` up to the cap.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let cap = Duration::from_secs(BACKOFF_CAP_SECS);
    std::cmp::min(base.saturating_mul(1 << attempt.saturating_sub(1).min(16)), cap)
}

/// Runs `op` up to `max_attempts` times, sleeping with exponential backoff
/// between attempts. Returns true as soon as one attempt succeeds.
pub async fn retry_with_backoff<F, Fut>(
    what: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = backoff_delay(base_delay, attempt - 1);
            debug!(
                "{}: attempt {}/{} in {:?}",
                what, attempt, max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }

        if op().await {
            return true;
        }
    }

    warn!("{}: giving up after {} attempts", what, max_attempts);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "mocks"))]
    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 60), Duration::from_secs(30));
    }

    #[cfg(feature = "mocks")]
    #[test]
    fn backoff_is_zero_under_mocks() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::ZERO);
        assert_eq!(backoff_delay(base, 5), Duration::ZERO);
    }
}
