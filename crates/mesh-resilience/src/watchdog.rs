use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

/// Runs `callback` every `interval` until [`Watchdog::stop`] is called
/// (spec §4.2). Callback errors are logged and swallowed; the loop
/// continues on the same interval regardless.
pub struct Watchdog {
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts the periodic loop immediately. `callback` returns `Result`
    /// so failures can be logged without aborting the watchdog.
    pub fn start<F, Fut>(interval: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let loop_stopped = stopped.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if loop_stopped.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = callback().await {
                    warn!(error = %err, "watchdog callback failed");
                }
            }
        });
        Self { stopped, handle: Some(handle) }
    }

    /// Idempotent; valid to call more than once, and safe even if the
    /// watchdog never started ticking yet.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
