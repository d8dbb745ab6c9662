//! Existence polling for watch roots that do not exist yet.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawns a task that checks `root` every `interval` and calls `on_appear`
/// once it exists. Aborting the returned handle cancels the poll.
pub fn spawn_existence_poll<F>(root: PathBuf, interval: Duration, on_appear: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the caller just saw the root missing.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if root_exists(&root).await {
                break;
            }
        }
        log::debug!("watch root appeared: {}", root.display());
        on_appear();
    })
}

async fn root_exists(root: &Path) -> bool {
    tokio::fs::try_exists(root).await.unwrap_or(false)
}
