// =============================================================================
// Shared types used across the pulsefeed service
// =============================================================================

use serde::{Deserialize, Serialize};

/// Candle period tracked for every contract, in canonical order.
///
/// The derived `Ord` follows declaration order, so `BTreeMap<Timeframe, _>`
/// iterates M1 → D1 and serialised maps keep that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// All timeframes in canonical order.
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Label used in outbound JSON and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Interval code used by the Bybit v5 API (REST query and kline topics).
    pub fn interval_code(&self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M5 => "5",
            Self::M15 => "15",
            Self::H1 => "60",
            Self::H4 => "240",
            Self::D1 => "D",
        }
    }

    /// Reverse mapping from a Bybit interval code. Unknown codes yield `None`
    /// and the caller drops the message.
    pub fn from_interval_code(code: &str) -> Option<Timeframe> {
        match code {
            "1" => Some(Self::M1),
            "5" => Some(Self::M5),
            "15" => Some(Self::M15),
            "60" => Some(Self::H1),
            "240" => Some(Self::H4),
            "D" => Some(Self::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_codes_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_interval_code(tf.interval_code()), Some(tf));
        }
        assert_eq!(Timeframe::from_interval_code("W"), None);
        assert_eq!(Timeframe::from_interval_code(""), None);
    }

    #[test]
    fn canonical_order_is_declaration_order() {
        let mut sorted = Timeframe::ALL;
        sorted.sort();
        assert_eq!(sorted, Timeframe::ALL);
    }

    #[test]
    fn json_labels() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let back: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(back, Timeframe::D1);
    }
}
