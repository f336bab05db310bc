//! Polling until a cluster reaches an expected state.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{OperationError, Result};

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    /// Create a new wait policy.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Check once, never sleep.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(10))
    }
}

/// Poll `check` until it returns `Ok(true)`.
///
/// Errors from `check` are logged and retried; on timeout the last error (or
/// a plain timeout) is reported as `UnexpectedFailure` naming `what`.
pub async fn wait_until<F, Fut>(policy: WaitPolicy, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut last_error = None;

    loop {
        match check().await {
            Ok(true) => {
                debug!(what = %what, elapsed_ms = start.elapsed().as_millis() as u64, "Condition reached");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                debug!(what = %what, error = %e, "Condition check failed, will retry");
                last_error = Some(e);
            }
        }

        if start.elapsed() >= policy.timeout {
            break;
        }
        tokio::time::sleep(policy.interval).await;
    }

    warn!(what = %what, timeout_secs = policy.timeout.as_secs(), "Timed out waiting");
    Err(OperationError::UnexpectedFailure(match last_error {
        Some(e) => format!("timed out waiting for {}: {}", what, e),
        None => format!("timed out waiting for {}", what),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_succeeds_after_retries() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = WaitPolicy::new(Duration::from_secs(60), Duration::from_secs(5));
        wait_until(policy, "third attempt", move || async move {
            Ok(attempts.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out_with_last_error() {
        let policy = WaitPolicy::new(Duration::from_secs(20), Duration::from_secs(5));
        let err = wait_until(policy, "pool health", || async {
            Err::<bool, _>(OperationError::CommandFailed("no such pool".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OperationError::UnexpectedFailure(ref m) if m.contains("no such pool")));
    }

    #[tokio::test]
    async fn test_immediate_checks_once() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = wait_until(WaitPolicy::immediate(), "never", move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
