use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::TokenRegistry;
use crate::vault::VaultSync;

/// Spawn the eviction loop: every `interval`, drop tokens older than `ttl`
/// and delete their artifact files.
///
/// The loop is owned by the process lifecycle; cancelling `shutdown` stops it
/// at the next tick boundary, which lets tests start and stop it
/// deterministically.
pub fn spawn_sweeper(
    registry: Arc<TokenRegistry>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(ttl_secs = ttl.as_secs(), tick_secs = interval.as_secs(), "sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("sweeper stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let evicted = sweep_once(&registry, ttl).await;
                    if evicted > 0 {
                        tracing::info!(evicted, "sweeper evicted expired jobs");
                    }
                }
            }
        }
    })
}

/// Run one eviction pass, returning the number of jobs removed.
///
/// A failure deleting one artifact is logged and must not stop the rest of
/// the sweep.
pub async fn sweep_once(registry: &TokenRegistry, ttl: Duration) -> usize {
    let evicted = registry.evict_expired(ttl);
    let count = evicted.len();

    for job in evicted {
        let Some(artifact) = job.artifact else { continue };
        match tokio::fs::remove_file(&artifact).await {
            Ok(()) => tracing::debug!(path = %artifact.display(), "deleted expired artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(path = %artifact.display(), error = %e, "failed to delete expired artifact");
            }
        }
    }

    count
}

/// Spawn the vault refresh loop: one eager sync at startup, then a sync every
/// `interval`. Runs decoupled from the sweeper tick.
pub fn spawn_vault_refresher(
    vault: Arc<VaultSync>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(tick_secs = interval.as_secs(), "vault refresher started");
        vault.fetch_now().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("vault refresher stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    vault.fetch_now().await;
                }
            }
        }
    })
}
