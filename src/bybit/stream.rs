// =============================================================================
// Ingestion workers — Bybit v5 public linear websocket
// =============================================================================
//
// The topic universe (one ticker topic per symbol plus one kline topic per
// (symbol, timeframe)) is partitioned into buckets of at most
// MAX_TOPICS_PER_CONN; each bucket gets one long-lived worker that owns its
// connection. A worker connects, sends a single subscribe frame, then
// dispatches data frames until the connection dies, and reconnects after a
// short sleep (1 s on a clean close, 2 s on an error).
//
// Malformed frames, unknown symbols and unknown interval codes are upstream
// garbage, not protocol breaks: they are dropped without disconnecting.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::market::candle::{parse_value_f64, parse_value_i64, KlineCandle};
use crate::market::store::MarketStore;
use crate::types::Timeframe;

/// Public linear stream endpoint.
pub const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
/// Maximum topics carried by one connection.
pub const MAX_TOPICS_PER_CONN: usize = 200;
/// Application-level ping cadence the stream expects.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Reconnect delay after a clean close.
const RECONNECT_CLEAN: Duration = Duration::from_secs(1);
/// Reconnect delay after a transport error.
const RECONNECT_ERROR: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topic universe
// ---------------------------------------------------------------------------

/// Build every subscription topic for the given symbols.
pub fn build_topics(symbols: &[String]) -> Vec<String> {
    let mut topics = Vec::with_capacity(symbols.len() * (1 + Timeframe::ALL.len()));
    for symbol in symbols {
        topics.push(format!("tickers.{symbol}"));
    }
    for symbol in symbols {
        for tf in Timeframe::ALL {
            topics.push(format!("kline.{}.{}", tf.interval_code(), symbol));
        }
    }
    topics
}

/// Split the topic universe into per-connection buckets.
pub fn partition_topics(topics: Vec<String>, max_per_conn: usize) -> Vec<Vec<String>> {
    topics
        .chunks(max_per_conn.max(1))
        .map(<[String]>::to_vec)
        .collect()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Run one worker until cancelled, reconnecting forever.
pub async fn run_ingest_worker(worker_id: usize, topics: Vec<String>, store: Arc<MarketStore>) {
    loop {
        match run_connection(worker_id, &topics, &store).await {
            Ok(()) => {
                warn!(worker_id, "upstream connection closed, reconnecting");
                sleep(RECONNECT_CLEAN).await;
            }
            Err(e) => {
                error!(worker_id, error = %e, "upstream connection error, reconnecting");
                sleep(RECONNECT_ERROR).await;
            }
        }
    }
}

/// One connection lifetime: connect, subscribe, then read until the stream
/// ends. Returns `Ok` on a clean close and `Err` on a transport error.
async fn run_connection(
    worker_id: usize,
    topics: &[String],
    store: &Arc<MarketStore>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(WS_URL)
        .await
        .context("failed to connect to upstream stream")?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({"op": "subscribe", "args": topics}).to_string();
    write
        .send(Message::Text(subscribe))
        .await
        .context("failed to send subscribe frame")?;
    info!(worker_id, topics = topics.len(), "subscribed to upstream stream");

    let mut ping = interval(PING_INTERVAL);
    // Consume the immediate first tick so the first ping waits a full period.
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write
                    .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                    .await
                    .context("failed to send ping")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch_frame(&text, store),
                Some(Ok(Message::Ping(data))) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .context("failed to send pong")?;
                }
                Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(_)) => {} // Binary / Pong / raw frames carry no data here
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

/// Route one inbound text frame to the store. Frames without a topic are
/// control traffic (subscribe acks, pong replies) and are ignored.
pub(crate) fn dispatch_frame(text: &str, store: &MarketStore) {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "dropping unparseable frame");
            return;
        }
    };

    let Some(topic) = root["topic"].as_str() else {
        return;
    };

    if let Some(symbol) = topic.strip_prefix("tickers.") {
        handle_ticker(symbol, &root, store);
    } else if topic.starts_with("kline.") {
        handle_kline(topic, &root, store);
    }
    // Any other topic prefix: drop.
}

fn handle_ticker(symbol: &str, root: &serde_json::Value, store: &MarketStore) {
    let data = &root["data"];
    // Delta frames may omit lastPrice; the store keeps the old value then.
    let last_price = parse_value_f64(&data["lastPrice"], "lastPrice").ok();
    let ts = root["ts"]
        .as_i64()
        .or_else(|| parse_value_i64(&data["ts"], "ts").ok())
        .or_else(|| parse_value_i64(&data["timestamp"], "timestamp").ok());
    store.apply_ticker(symbol, last_price, ts);
}

fn handle_kline(topic: &str, root: &serde_json::Value, store: &MarketStore) {
    // kline.<interval>.<symbol>; symbols never contain dots.
    let mut parts = topic.splitn(3, '.');
    parts.next();
    let (Some(code), Some(symbol)) = (parts.next(), parts.next()) else {
        return;
    };
    let Some(tf) = Timeframe::from_interval_code(code) else {
        return;
    };
    let Some(last) = root["data"].as_array().and_then(|rows| rows.last()) else {
        return;
    };

    match KlineCandle::from_ws_object(last) {
        Ok(candle) => store.apply_kline(symbol, tf, &candle, candle.confirm),
        Err(e) => debug!(topic, error = %e, "dropping malformed kline frame"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
