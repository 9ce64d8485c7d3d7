use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Backoff schedule for [`retry_send`] (spec §4.2).
///
/// Delay for attempt *i* (0-indexed) is `min(max_delay, base_delay *
/// backoff_factor^i)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, backoff_factor: f64) -> Self {
        Self { max_retries, base_delay, max_delay, backoff_factor }
    }

    /// Default policy used by the hub's critical senders: 5 attempts,
    /// 200ms base, 10s cap, factor 2.
    pub fn default_critical() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(10), 2.0)
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Invoke `f` repeatedly under `policy` until it returns `true` or the
/// retry budget is exhausted (spec §4.2).
///
/// `f` is re-invoked on a `false` return; the first `true` short-circuits
/// the loop. After `max_retries` additional attempts are exhausted, returns
/// `false`. Used for critical sends: automation actions and OTA chunks.
pub async fn retry_send<F, Fut>(mut f: F, policy: RetryPolicy) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if f().await {
        return true;
    }
    for attempt in 0..policy.max_retries {
        let delay = policy.delay_for_attempt(attempt);
        tokio::time::sleep(delay).await;
        if f().await {
            return true;
        }
        debug!(attempt, "retry_send: attempt failed");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_caps_at_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1), 10.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_then_stops() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50), 2.0);
        let ok = retry_send(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { n == 2 }
            },
            policy,
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_false_after_exhausting_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50), 2.0);
        let ok = retry_send(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { false }
            },
            policy,
        )
        .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
