//! Bounded exponential backoff for capability calls and store writes.
//!
//! `delay = min(initial_delay_ms * 2^attempt, max_delay_ms)`

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries()      -> u32 { 4 }
fn default_initial_delay_ms() -> u64 { 500 }
fn default_max_delay_ms()     -> u64 { 30_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// The last error of an operation that never succeeded.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy with no delays, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self { max_retries, initial_delay_ms: 0, max_delay_ms: 0 }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_retryable(&e) && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(what, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(Exhausted { error: e, attempts: attempt + 1 }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let p = RetryPolicy { max_retries: 10, initial_delay_ms: 100, max_delay_ms: 1_000 };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_max_delay_exceeds_initial_by_default() {
        let p = RetryPolicy::default();
        assert!(p.max_delay_ms > p.initial_delay_ms);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, Exhausted<String>> = RetryPolicy::immediate(3)
            .run("op", |_e: &String| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("busy".to_string()) } else { Ok(n) }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let out: Result<(), Exhausted<String>> = RetryPolicy::immediate(2)
            .run("op", |_e: &String| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("busy".to_string())
            })
            .await;
        let err = out.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let out: Result<(), Exhausted<String>> = RetryPolicy::immediate(5)
            .run("op", |_e: &String| false, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad".to_string())
            })
            .await;
        assert_eq!(out.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
