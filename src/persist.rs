// =============================================================================
// Persistence adapter — index candles in a Redis sorted set
// =============================================================================
//
// One sorted set holds the hourly index candles: member = candle JSON,
// score = slot start in milliseconds. `put` is idempotent (delete-by-score
// then add) so re-persisting a slot replaces any earlier write.
//
// The adapter must never take the service down. A failed initial connection
// starts the process in in-memory-only mode; any runtime error afterwards
// logs once and latches in-memory-only mode for the remainder of the
// process. In-memory mode is a silent no-op; the index history already
// lives in the market store.
// =============================================================================

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::index::state::{IndexCandle, HISTORY_CAP};

/// Sorted-set key for the hourly index series.
pub const INDEX_KEY: &str = "market:index:candles:h1";

/// Index candle persistence with a latching in-memory fallback.
pub struct CandleStore {
    conn: Mutex<Option<ConnectionManager>>,
}

impl CandleStore {
    /// Connect to Redis at `url`. Connection failure is not fatal; the store
    /// starts in in-memory-only mode instead.
    pub async fn connect(url: &str) -> Self {
        match Self::try_connect(url).await {
            Ok(conn) => {
                info!(url, "redis connected");
                Self {
                    conn: Mutex::new(Some(conn)),
                }
            }
            Err(e) => {
                warn!(url, error = %e, "redis unreachable, running in-memory only");
                Self::memory()
            }
        }
    }

    /// A store that never talks to a backend.
    pub fn memory() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    async fn try_connect(url: &str) -> anyhow::Result<ConnectionManager> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(conn)
    }

    /// Whether writes currently reach the backend.
    pub fn is_durable(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn take_conn(&self) -> Option<ConnectionManager> {
        self.conn.lock().clone()
    }

    /// Drop the connection after a runtime error. Logged once; later calls
    /// find the connection gone and no-op.
    fn degrade(&self, op: &str, err: &redis::RedisError) {
        let mut guard = self.conn.lock();
        if guard.take().is_some() {
            warn!(op, error = %err, "redis error, switching to in-memory only for the rest of the process");
        }
    }

    /// Load the persisted series, ordered by slot. Unparseable members are
    /// skipped.
    pub async fn load(&self) -> Vec<IndexCandle> {
        let Some(mut conn) = self.take_conn() else {
            return Vec::new();
        };
        let raw: Vec<String> = match conn.zrange(INDEX_KEY, 0, -1).await {
            Ok(v) => v,
            Err(e) => {
                self.degrade("zrange", &e);
                return Vec::new();
            }
        };

        let mut candles = Vec::with_capacity(raw.len());
        for member in raw {
            match serde_json::from_str::<IndexCandle>(&member) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(error = %e, "skipping unparseable persisted index candle"),
            }
        }
        info!(count = candles.len(), "index history loaded");
        candles
    }

    /// Persist one closed candle, replacing any earlier write for the same
    /// slot, then trim the low end past the history bound.
    pub async fn put(&self, candle: &IndexCandle) {
        let member = match serde_json::to_string(candle) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to serialize index candle");
                return;
            }
        };

        self.delete_by_score(candle.start_time).await;

        let Some(mut conn) = self.take_conn() else {
            return;
        };
        let added: redis::RedisResult<()> =
            conn.zadd(INDEX_KEY, member, candle.start_time).await;
        if let Err(e) = added {
            self.degrade("zadd", &e);
            return;
        }

        self.trim(HISTORY_CAP).await;
    }

    /// Delete the lowest-ranked members past `max_entries`.
    pub async fn trim(&self, max_entries: usize) {
        let Some(mut conn) = self.take_conn() else {
            return;
        };
        let card: i64 = match conn.zcard(INDEX_KEY).await {
            Ok(c) => c,
            Err(e) => {
                self.degrade("zcard", &e);
                return;
            }
        };
        let excess = card - max_entries as i64;
        if excess > 0 {
            let removed: redis::RedisResult<()> = conn
                .zremrangebyrank(INDEX_KEY, 0, (excess - 1) as isize)
                .await;
            if let Err(e) = removed {
                self.degrade("zremrangebyrank", &e);
            }
        }
    }

    /// Remove any member stored at `score`.
    pub async fn delete_by_score(&self, score: i64) {
        let Some(mut conn) = self.take_conn() else {
            return;
        };
        let removed: redis::RedisResult<()> =
            conn.zrembyscore(INDEX_KEY, score, score).await;
        if let Err(e) = removed {
            self.degrade("zrembyscore", &e);
        }
    }

    /// Release the backend connection on shutdown.
    pub async fn close(&self) {
        if self.conn.lock().take().is_some() {
            info!("persistence connection released");
        }
    }
}
