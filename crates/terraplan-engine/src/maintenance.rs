//! Background pruning of the lease store.

use crate::cache::LeaseStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Bounds applied on every prune pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    pub max_entries: usize,
    pub max_age: Duration,
    pub every: Duration,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_age: Duration::from_secs(30 * 24 * 3600),
            every: Duration::from_secs(600),
        }
    }
}

/// Prune `store` every `policy.every` until `shutdown` fires.
///
/// The first pass runs immediately.
pub async fn run_prune_loop(
    store: Arc<dyn LeaseStore>,
    policy: PrunePolicy,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(policy.every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Cache prune loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                match store.prune(policy.max_entries, policy.max_age).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Pruned cache entries"),
                    Err(e) => tracing::error!("Cache prune failed: {}", e),
                }
            }
        }
    }
}
