// =============================================================================
// Settings — deployment configuration with per-field defaults
// =============================================================================
//
// Every field carries `#[serde(default)]` so that loading an older settings
// file never breaks when new fields are added. Environment variables override
// the file for the values that differ between deployments.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:7000/0".to_string()
}

fn default_quote_coin() -> String {
    "USDT".to_string()
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_index_poll_secs() -> u64 {
    60
}

fn default_kline_seed_concurrency() -> usize {
    10
}

// =============================================================================
// Settings
// =============================================================================

/// Deployment-level settings. Protocol constants (slot size, topic budget,
/// retry counts, history caps) are compile-time constants in their modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address the downstream websocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection URL for index candle persistence.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Quote currency that selects the contract universe.
    #[serde(default = "default_quote_coin")]
    pub quote_coin: String,

    /// Broadcast debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Index aggregator tick period in seconds.
    #[serde(default = "default_index_poll_secs")]
    pub index_poll_secs: u64,

    /// Maximum in-flight kline seed requests during cold start.
    #[serde(default = "default_kline_seed_concurrency")]
    pub kline_seed_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        // Round-trip through an empty JSON object so every field picks up its
        // serde default.
        serde_json::from_str("{}").expect("empty settings object must deserialize")
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut settings = match Self::read_file(path) {
            Ok(s) => {
                info!(path = %path.display(), "settings file loaded");
                s
            }
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                } else {
                    info!(path = %path.display(), "no settings file, using defaults");
                }
                Self::default()
            }
        };
        settings.apply_env();
        settings
    }

    fn read_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Environment overrides for deployment-specific values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                self.redis_url = url;
            }
        }
        if let Ok(addr) = std::env::var("PULSEFEED_BIND_ADDR") {
            if !addr.is_empty() {
                self.bind_addr = addr;
            }
        }
        if let Ok(quote) = std::env::var("PULSEFEED_QUOTE") {
            if !quote.is_empty() {
                self.quote_coin = quote.trim().to_uppercase();
            }
        }
    }
}
