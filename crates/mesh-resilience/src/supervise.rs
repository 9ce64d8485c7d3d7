use std::future::Future;

use tracing::error;

/// Spawns `f` as a background task whose completion is observed: any
/// `Err` is logged, a task cancellation (the handle being dropped/aborted)
/// is silent (spec §4.2).
///
/// Every long-running loop in the hub — discovery receive, beacon
/// broadcaster, prune watchdog, transport listener, per-connection
/// handlers, federation link loops, OTA timeout watchdog, automation
/// persistence flush — is spawned this way so a panic or stray error in
/// one does not take down the process and is never silently lost either.
pub fn supervised_task<F, Fut>(f: F) -> tokio::task::JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        match f().await {
            Ok(()) => {}
            Err(err) => error!(error = %err, "supervised task exited with error"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ok_completion_is_silent() {
        let handle = supervised_task(|| async { Ok(()) });
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn err_completion_is_logged_not_propagated() {
        let handle = supervised_task(|| async { Err("boom".to_string()) });
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn abort_is_silent() {
        let handle = supervised_task(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        });
        handle.abort();
        let result = handle.await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_cancelled());
    }
}
