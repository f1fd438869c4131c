//! Price samples, drawdown-bounded price cycles, and raw market-data rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Reason recorded when a cycle closes on a drawdown.
pub const END_REASON_DRAWDOWN: &str = "drawdown";

/// A single price sample for the tracked asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub asset: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PricePoint {
    pub fn new(asset: impl Into<String>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            asset: asset.into(),
            price,
            timestamp,
        }
    }
}

/// Contiguous span in which price trends to a peak without drawing down by
/// `threshold` from that peak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceCycle {
    pub id: i64,
    pub asset: String,

    /// Drawdown fraction that closes the cycle (e.g. 0.003)
    pub threshold: Decimal,

    pub start_time: DateTime<Utc>,
    pub start_price: Decimal,

    /// Highest price seen while open; never decreases
    pub peak_price: Decimal,
    pub peak_time: DateTime<Utc>,

    /// Timestamp of the last sample applied to this cycle
    pub last_sample_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl PriceCycle {
    /// Check if the cycle is still open.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Price at or below which the cycle closes.
    pub fn drawdown_floor(&self) -> Decimal {
        self.peak_price * (Decimal::ONE - self.threshold)
    }

    /// Current drawdown from peak as a fraction.
    pub fn drawdown_at(&self, price: Decimal) -> Decimal {
        if self.peak_price.is_zero() {
            return Decimal::ZERO;
        }
        ((self.peak_price - price) / self.peak_price).max(Decimal::ZERO)
    }

    /// Peak gain relative to the starting price.
    pub fn run_up(&self) -> Decimal {
        if self.start_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.peak_price - self.start_price) / self.start_price
    }
}

/// Order-book snapshot from the raw market store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub asset: String,
    pub timestamp: DateTime<Utc>,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Total resting bid size within the captured depth
    pub bid_depth: f64,
    /// Total resting ask size within the captured depth
    pub ask_depth: f64,
}

/// Executed market trade from the raw transaction store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTrade {
    pub asset: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// Quote-currency notional of the trade
    pub notional: f64,
    pub is_buy: bool,
}
