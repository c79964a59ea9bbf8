// =============================================================================
// Bybit REST API client — public v5 market data
// =============================================================================
//
// Only public endpoints are consumed (instruments, tickers, kline), so no
// request signing is needed. Every call retries transient failures up to
// HTTP_RETRIES times with a linear backoff; the cold-start loader treats a
// terminal failure as fatal.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market::candle::{parse_value_f64, parse_value_i64, KlineCandle};
use crate::types::Timeframe;

/// Total per-request timeout.
const HTTP_TIMEOUT_SECS: u64 = 20;
/// Attempts per logical request.
const HTTP_RETRIES: u32 = 3;
/// Linear backoff step between attempts.
const RETRY_BACKOFF_MS: u64 = 600;

/// One row from the instruments-info endpoint.
#[derive(Debug, Clone)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    pub status: String,
}

/// One row from the tickers endpoint.
#[derive(Debug, Clone)]
pub struct TickerInfo {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub ts: Option<i64>,
}

/// Bybit public REST client.
#[derive(Clone)]
pub struct BybitClient {
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        debug!("BybitClient initialised (base_url=https://api.bybit.com)");

        Self {
            base_url: "https://api.bybit.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// GET a v5 endpoint and return its `result` object, retrying transient
    /// failures with linear backoff.
    async fn get_result(&self, path_and_query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut last_err = None;

        for attempt in 1..=HTTP_RETRIES {
            match self.get_once(&url).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(attempt, error = %e, "Bybit request failed");
                    last_err = Some(e);
                    if attempt < HTTP_RETRIES {
                        let backoff = RETRY_BACKOFF_MS * attempt as u64;
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt ran"))
            .with_context(|| format!("GET {path_and_query} failed after {HTTP_RETRIES} attempts"))
    }

    async fn get_once(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("request failed")?;

        let status = resp.status();
        let mut body: serde_json::Value =
            resp.json().await.context("failed to parse response body")?;

        if !status.is_success() {
            anyhow::bail!("Bybit returned {}: {}", status, body);
        }

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            anyhow::bail!("Bybit retCode {}: {}", ret_code, body["retMsg"]);
        }

        Ok(body["result"].take())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v5/market/instruments-info for the linear category.
    #[instrument(skip(self), name = "bybit::instruments")]
    pub async fn instruments(&self) -> Result<Vec<InstrumentInfo>> {
        let result = self
            .get_result("/v5/market/instruments-info?category=linear&limit=1000")
            .await?;
        let instruments = parse_instruments(&result)?;
        debug!(count = instruments.len(), "instruments fetched");
        Ok(instruments)
    }

    /// GET /v5/market/tickers for the linear category.
    #[instrument(skip(self), name = "bybit::tickers")]
    pub async fn tickers(&self) -> Result<Vec<TickerInfo>> {
        let result = self.get_result("/v5/market/tickers?category=linear").await?;
        let tickers = parse_tickers(&result)?;
        debug!(count = tickers.len(), "tickers fetched");
        Ok(tickers)
    }

    /// GET /v5/market/kline: the `limit` most recent candles for one
    /// (symbol, timeframe), sorted ascending by start regardless of the
    /// order the API returned them in.
    #[instrument(skip(self), name = "bybit::kline")]
    pub async fn recent_klines(
        &self,
        symbol: &str,
        tf: Timeframe,
        limit: u32,
    ) -> Result<Vec<KlineCandle>> {
        let path = format!(
            "/v5/market/kline?category=linear&symbol={}&interval={}&limit={}",
            symbol,
            tf.interval_code(),
            limit
        );
        let result = self.get_result(&path).await?;

        let rows = result["list"]
            .as_array()
            .context("kline response missing 'list' array")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match KlineCandle::from_rest_row(row) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(symbol, %tf, error = %e, "skipping malformed kline row"),
            }
        }
        candles.sort_by_key(|c| c.start);
        Ok(candles)
    }
}

impl Default for BybitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Response parsing
// -------------------------------------------------------------------------

fn parse_instruments(result: &serde_json::Value) -> Result<Vec<InstrumentInfo>> {
    let rows = result["list"]
        .as_array()
        .context("instruments response missing 'list' array")?;

    let mut instruments = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(symbol) = row["symbol"].as_str() else {
            warn!("skipping instrument row without a symbol");
            continue;
        };
        instruments.push(InstrumentInfo {
            symbol: symbol.to_string(),
            base_coin: row["baseCoin"].as_str().unwrap_or_default().to_string(),
            quote_coin: row["quoteCoin"].as_str().unwrap_or_default().to_string(),
            status: row["status"].as_str().unwrap_or_default().to_string(),
        });
    }
    Ok(instruments)
}

fn parse_tickers(result: &serde_json::Value) -> Result<Vec<TickerInfo>> {
    let rows = result["list"]
        .as_array()
        .context("tickers response missing 'list' array")?;

    let mut tickers = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(symbol) = row["symbol"].as_str() else {
            continue;
        };
        // The payload carries `ts` or `timestamp` depending on endpoint
        // version; accept either, as string or number.
        let ts = parse_value_i64(&row["ts"], "ts")
            .or_else(|_| parse_value_i64(&row["timestamp"], "timestamp"))
            .ok();
        tickers.push(TickerInfo {
            symbol: symbol.to_string(),
            last_price: parse_value_f64(&row["lastPrice"], "lastPrice").ok(),
            ts,
        });
    }
    Ok(tickers)
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_instruments_skips_rows_without_symbol() {
        let result: serde_json::Value = serde_json::from_str(
            r#"{"list": [
                {"symbol": "BTCUSDT", "baseCoin": "BTC", "quoteCoin": "USDT", "status": "Trading"},
                {"baseCoin": "GHOST", "quoteCoin": "USDT", "status": "Trading"},
                {"symbol": "ETHUSD", "baseCoin": "ETH", "quoteCoin": "USD", "status": "Closed"}
            ]}"#,
        )
        .unwrap();

        let instruments = parse_instruments(&result).unwrap();
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0].symbol, "BTCUSDT");
        assert_eq!(instruments[0].quote_coin, "USDT");
        assert_eq!(instruments[1].status, "Closed");
    }

    #[test]
    fn parse_tickers_accepts_ts_or_timestamp() {
        let result: serde_json::Value = serde_json::from_str(
            r#"{"list": [
                {"symbol": "AUSDT", "lastPrice": "1.5", "ts": "1700000000001"},
                {"symbol": "BUSDT", "lastPrice": "2.5", "timestamp": 1700000000002},
                {"symbol": "CUSDT"}
            ]}"#,
        )
        .unwrap();

        let tickers = parse_tickers(&result).unwrap();
        assert_eq!(tickers.len(), 3);
        assert_eq!(tickers[0].ts, Some(1_700_000_000_001));
        assert_eq!(tickers[1].ts, Some(1_700_000_000_002));
        assert_eq!(tickers[1].last_price, Some(2.5));
        assert_eq!(tickers[2].last_price, None);
        assert_eq!(tickers[2].ts, None);
    }

    #[test]
    fn parse_instruments_rejects_missing_list() {
        let result = serde_json::json!({"category": "linear"});
        assert!(parse_instruments(&result).is_err());
    }
}
