use crate::routing::RouterSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// How often the config file's mtime is sampled.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Quiet period required before a change triggers a rebuild. Bursts of
/// writes within this window coalesce into one rebuild request.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watch the configuration file and ask the supervisor to rebuild on
/// change. The watcher only logs its own errors — it never crashes the
/// process — and stops when shutdown is notified.
pub fn start(
    path: PathBuf,
    supervisor: Arc<RouterSupervisor>,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_time(&path);
        info!("watcher: watching {}", path.display());

        loop {
            if sleep_or_shutdown(POLL_INTERVAL, &shutdown).await {
                return;
            }

            let current = match modified_time(&path) {
                Some(t) => t,
                None => {
                    debug!("watcher: cannot stat {}", path.display());
                    continue;
                }
            };
            if Some(current) == last_seen {
                continue;
            }

            // Change detected — wait for the file to go quiet so a
            // burst of writes lands as a single rebuild.
            let mut settled = current;
            loop {
                if sleep_or_shutdown(DEBOUNCE, &shutdown).await {
                    return;
                }
                match modified_time(&path) {
                    Some(t) if t != settled => settled = t,
                    _ => break,
                }
            }
            last_seen = Some(settled);

            info!("watcher: config change detected, rebuilding");
            if let Err(e) = supervisor.rebuild() {
                warn!("watcher: rebuild failed: {}", e);
            }
        }
    })
}

fn modified_time(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// Sleep for `duration`, returning `true` immediately on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}
