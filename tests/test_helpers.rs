//! Test helpers
//!
//! Log setup and polling for conditions that settle asynchronously.

use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to warnings only so passing runs stay quiet.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every `step` until it holds or `timeout` elapses.
/// Returns whether it held.
///
/// Uses Tokio time, so it also works under a paused clock.
pub async fn wait_until<F, Fut>(timeout: Duration, step: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_succeeds_eventually() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let held = wait_until(Duration::from_secs(1), Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;

        assert!(held);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let held = wait_until(Duration::from_millis(50), Duration::from_millis(10), || async {
            false
        })
        .await;
        assert!(!held);
    }
}
