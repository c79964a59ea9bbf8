// =============================================================================
// Debounced broadcaster — one task, totally ordered snapshot pushes
// =============================================================================
//
// The store's dirty signal coalesces any number of mutations into one
// wake-up. On each wake-up the broadcaster sleeps for the debounce window,
// clears the flag before doing any work (so mutations racing the build
// schedule a follow-up), rebuilds the overview and snapshot, and fans the
// serialised payload out to every client concurrently. Clients whose send
// fails are removed and closed.
// =============================================================================

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::api::registry::ClientRegistry;
use crate::market::store::MarketStore;

/// Run the broadcaster until cancelled.
pub async fn run_broadcaster(
    store: Arc<MarketStore>,
    registry: Arc<ClientRegistry>,
    debounce: Duration,
) {
    info!(debounce_ms = debounce.as_millis() as u64, "broadcaster starting");

    loop {
        store.wait_dirty().await;
        tokio::time::sleep(debounce).await;
        store.clear_dirty();

        store.recompute_overview();
        let snapshot = store.build_snapshot();
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize snapshot");
                continue;
            }
        };

        if registry.is_empty() {
            continue;
        }
        let handles = registry.handles();

        let sends = handles.iter().map(|handle| {
            let json = json.clone();
            async move { (handle.id, handle.send_text(json).await) }
        });
        let results = join_all(sends).await;

        let mut dropped = 0usize;
        for (id, result) in results {
            if let Err(e) = result {
                debug!(client_id = id, error = %e, "snapshot send failed, dropping client");
                if let Some(handle) = registry.remove(id) {
                    handle.close().await;
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            info!(dropped, remaining = registry.len(), "pruned dead clients");
        }
        debug!(
            clients = registry.len(),
            entries = snapshot.entries.len(),
            "snapshot broadcast"
        );
    }
}
