//! Wallet trade model: external trades observed for tracked wallets.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ParseError;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl FromStr for TradeSide {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(ParseError::UnknownSide(other.to_string())),
        }
    }
}

/// Trade made by an external wallet, as delivered by the wallet trade feed.
///
/// Append-only: once stored, a wallet trade is never modified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTrade {
    /// Wallet that made the trade
    pub wallet_address: String,

    /// Per-wallet monotonic trade identifier
    pub trade_id: i64,

    /// Trade direction
    pub side: TradeSide,

    /// Asset traded
    pub asset: String,

    /// Price the wallet traded at, if the feed reports it
    pub price: Option<Decimal>,

    /// When the wallet's trade occurred
    pub timestamp: DateTime<Utc>,
}

impl WalletTrade {
    /// Age of the trade relative to the moment it was detected.
    pub fn detection_lag(&self, detected_at: DateTime<Utc>) -> chrono::Duration {
        detected_at - self.timestamp
    }

    /// Whether the trade was detected later than `window_secs` after it happened.
    pub fn is_stale(&self, detected_at: DateTime<Utc>, window_secs: i64) -> bool {
        self.detection_lag(detected_at).num_seconds() > window_secs
    }
}

/// Consumption progress through one wallet's trade stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletCursor {
    pub wallet_address: String,
    pub last_processed_trade_id: i64,
}
