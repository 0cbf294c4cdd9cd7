//! Long-lived watch consumers feeding in-memory mirrors.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{KvError, KvStore, WatchResponse};

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Subscribes to `prefix`, applies the initial snapshot before returning and
/// then keeps applying batches on a tracked task until `cancel` fires.
///
/// `apply` is the only writer of whatever it maintains. When the underlying
/// stream ends the watch is re-established; the new stream starts with a
/// snapshot flagged `restarted`, so consumers reset instead of drifting.
pub async fn spawn_watch<F>(
    kv: Arc<dyn KvStore>,
    prefix: &str,
    cancel: CancellationToken,
    tracker: &TaskTracker,
    mut apply: F,
) -> Result<(), KvError>
where
    F: FnMut(WatchResponse) + Send + 'static,
{
    let mut stream = kv.watch_prefix(prefix).await?;
    let snapshot = stream.recv().await.ok_or_else(|| KvError::WatchClosed {
        prefix: prefix.to_string(),
    })?;
    apply(snapshot);

    let prefix = prefix.to_string();
    tracker.spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = stream.recv() => received,
            };

            match received {
                Some(response) => apply(response),
                None => {
                    tracing::warn!(prefix = %prefix, "watch stream closed, resubscribing");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                    match kv.watch_prefix(&prefix).await {
                        Ok(new_stream) => stream = new_stream,
                        Err(err) => {
                            tracing::warn!(prefix = %prefix, error = %err, "cannot resubscribe watch");
                        }
                    }
                }
            }
        }
    });

    Ok(())
}
