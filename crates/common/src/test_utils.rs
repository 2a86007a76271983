//! Test utilities for fx3-stream
//!
//! Helpers shared by the integration tests of every crate: timeouts for async
//! tests and polling for state that another thread is expected to reach.
//!
//! # Example
//!
//! ```
//! use common::test_utils::wait_until;
//! use std::time::Duration;
//!
//! assert!(wait_until(Duration::from_millis(10), || true));
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between polls in [`wait_until`]
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Run an async operation with a timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was observed.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(5), || false));
    }

    #[test]
    fn test_wait_until_sees_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        let handle = std::thread::spawn(move || setter.store(true, Ordering::SeqCst));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || flag.load(Ordering::SeqCst)));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(5), std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
