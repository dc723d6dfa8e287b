use std::future::Future;
use std::time::Duration;

use tileindex_core::config::WorkerSettings;

/// Exponential backoff: `base`, `2*base`, `4*base`, ... between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(200) }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self { max_retries: settings.upsert_retries, base_delay: settings.retry_base_delay() }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or `max_retries` retries are spent. Returns the last error.
    pub async fn run<T, E, F, Fut, P>(&self, what: &str, retryable: P, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if retry < self.max_retries && retryable(&e) => {
                    retry += 1;
                    let delay = self.delay(retry);
                    tracing::warn!(
                        op = what,
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles() {
        let p = RetryPolicy { max_retries: 5, base_delay: Duration::from_millis(100) };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let p = RetryPolicy { max_retries: 2, base_delay: Duration::ZERO };
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = p
            .run("op", |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let p = RetryPolicy { max_retries: 3, base_delay: Duration::ZERO };
        let calls = AtomicU32::new(0);
        let res: Result<u32, String> = p
            .run("op", |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("down".to_string()) } else { Ok(n) }
            })
            .await;
        assert_eq!(res, Ok(2));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let p = RetryPolicy { max_retries: 5, base_delay: Duration::ZERO };
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = p
            .run("op", |e: &String| e != "bad input", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad input".to_string())
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
