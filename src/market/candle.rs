use anyhow::{Context, Result};

// ---------------------------------------------------------------------------
// Normalised candle
// ---------------------------------------------------------------------------

/// A single candle normalised at the ingestion edge.
///
/// Upstream candles arrive in two shapes: array rows from the REST kline
/// endpoint (`[start, open, high, low, close, volume, turnover]`) and objects
/// from the websocket kline topic. Both are parsed into this one record so
/// that polymorphic JSON never travels further into the service.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineCandle {
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
    /// True once the candle's slot has closed.
    pub confirm: bool,
}

impl KlineCandle {
    /// Parse an object-shaped candle from a websocket kline frame.
    pub fn from_ws_object(v: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            start: parse_value_i64(&v["start"], "start")?,
            open: parse_value_f64(&v["open"], "open")?,
            high: parse_value_f64(&v["high"], "high")?,
            low: parse_value_f64(&v["low"], "low")?,
            close: parse_value_f64(&v["close"], "close")?,
            volume: parse_value_f64(&v["volume"], "volume")?,
            turnover: parse_value_f64(&v["turnover"], "turnover")?,
            confirm: v["confirm"].as_bool().unwrap_or(false),
        })
    }

    /// Parse an array-shaped candle row from the REST kline endpoint.
    ///
    /// Row indices: [0] start, [1] open, [2] high, [3] low, [4] close,
    /// [5] volume, [6] turnover.
    pub fn from_rest_row(v: &serde_json::Value) -> Result<Self> {
        let row = v.as_array().context("kline row is not an array")?;
        if row.len() < 7 {
            anyhow::bail!("kline row has {} elements, expected 7", row.len());
        }
        Ok(Self {
            start: parse_value_i64(&row[0], "start")?,
            open: parse_value_f64(&row[1], "open")?,
            high: parse_value_f64(&row[2], "high")?,
            low: parse_value_f64(&row[3], "low")?,
            close: parse_value_f64(&row[4], "close")?,
            volume: parse_value_f64(&row[5], "volume")?,
            turnover: parse_value_f64(&row[6], "turnover")?,
            // REST only returns slot-complete rows plus the live head; the
            // loader decides which row seeds the prev-close table.
            confirm: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Tolerant numeric parsing
// ---------------------------------------------------------------------------

/// Bybit sends numeric values as JSON strings in most payloads, but plain
/// numbers appear too. Accept both.
pub fn parse_value_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Millisecond timestamps arrive as strings from REST and integers from the
/// websocket.
pub fn parse_value_i64(val: &serde_json::Value, name: &str) -> Result<i64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse {name} as i64: {s}")),
        serde_json::Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("field {name} is not a valid i64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
