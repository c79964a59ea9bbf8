// =============================================================================
// Shared application state for the downstream server
// =============================================================================

use std::sync::Arc;

use crate::api::registry::ClientRegistry;
use crate::config::Settings;
use crate::market::store::MarketStore;

/// Handles shared by the downstream router and its handlers. The market
/// store and client registry carry their own interior locking; this struct
/// just ties them together for axum's state extractor.
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<MarketStore>,
    pub registry: Arc<ClientRegistry>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<MarketStore>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            settings,
            store,
            registry,
            start_time: std::time::Instant::now(),
        }
    }
}
