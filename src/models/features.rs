//! Feature snapshot model: per-minute market statistics around a position's entry.
//!
//! The feature set is a fixed enumerated schema. Every feature carries a
//! ratio/absolute tag; ratio features are scale-invariant and stay valid as
//! the asset's price level drifts, absolute features do not.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ParseError;

/// Market feature computed for one minute bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    // === Price ===
    /// Last traded price in the bucket
    PriceClose,
    /// Close-to-close change vs the previous bucket, percent
    PriceChangePct,
    /// (high - low) / low within the bucket, percent
    PriceRangePct,
    /// Standard deviation of tick-to-tick returns within the bucket, percent
    VolatilityPct,

    // === Order book ===
    /// Resting bid size at the last book snapshot
    BidDepth,
    /// Resting ask size at the last book snapshot
    AskDepth,
    /// (bid - ask) / (bid + ask) depth imbalance, in [-1, 1]
    BookImbalance,
    /// (ask - bid) / mid, percent
    SpreadPct,

    // === Flow ===
    /// Buy-side notional in the bucket
    BuyVolume,
    /// Sell-side notional in the bucket
    SellVolume,
    /// Buy notional / sell notional
    BuySellRatio,

    // === Transactions ===
    /// Number of market trades in the bucket
    TradeCount,
    /// Number of trades at or above the whale notional
    WhaleCount,
    /// (whale buys - whale sells) / whale notional, percent
    WhaleNetFlowPct,
}

impl Feature {
    pub const COUNT: usize = 14;

    /// Every feature, in storage column order.
    pub const ALL: [Feature; Feature::COUNT] = [
        Feature::PriceClose,
        Feature::PriceChangePct,
        Feature::PriceRangePct,
        Feature::VolatilityPct,
        Feature::BidDepth,
        Feature::AskDepth,
        Feature::BookImbalance,
        Feature::SpreadPct,
        Feature::BuyVolume,
        Feature::SellVolume,
        Feature::BuySellRatio,
        Feature::TradeCount,
        Feature::WhaleCount,
        Feature::WhaleNetFlowPct,
    ];

    /// Storage column / display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::PriceClose => "price_close",
            Feature::PriceChangePct => "price_change_pct",
            Feature::PriceRangePct => "price_range_pct",
            Feature::VolatilityPct => "volatility_pct",
            Feature::BidDepth => "bid_depth",
            Feature::AskDepth => "ask_depth",
            Feature::BookImbalance => "book_imbalance",
            Feature::SpreadPct => "spread_pct",
            Feature::BuyVolume => "buy_volume",
            Feature::SellVolume => "sell_volume",
            Feature::BuySellRatio => "buy_sell_ratio",
            Feature::TradeCount => "trade_count",
            Feature::WhaleCount => "whale_count",
            Feature::WhaleNetFlowPct => "whale_net_flow_pct",
        }
    }

    /// Whether the feature is dimensionless (independent of price level and size scale).
    pub fn is_ratio(&self) -> bool {
        match self {
            Feature::PriceChangePct
            | Feature::PriceRangePct
            | Feature::VolatilityPct
            | Feature::BookImbalance
            | Feature::SpreadPct
            | Feature::BuySellRatio
            | Feature::WhaleNetFlowPct => true,
            Feature::PriceClose
            | Feature::BidDepth
            | Feature::AskDepth
            | Feature::BuyVolume
            | Feature::SellVolume
            | Feature::TradeCount
            | Feature::WhaleCount => false,
        }
    }

    /// Features eligible for rule generation.
    pub fn eligible(ratio_only: bool) -> impl Iterator<Item = Feature> {
        Feature::ALL
            .into_iter()
            .filter(move |f| !ratio_only || f.is_ratio())
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ParseError::UnknownFeature(s.to_string()))
    }
}

/// Feature values for one (position, minute offset).
///
/// `None` means the value could not be computed from the data available;
/// it is never the same thing as `Some(0.0)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureRow {
    values: [Option<f64>; Feature::COUNT],
}

impl FeatureRow {
    pub fn get(&self, feature: Feature) -> Option<f64> {
        self.values[feature.index()]
    }

    /// Set a value; non-finite values are stored as unavailable.
    pub fn set(&mut self, feature: Feature, value: Option<f64>) {
        self.values[feature.index()] = value.filter(|v| v.is_finite());
    }

    /// Fill values that are missing here from `other`, leaving present values untouched.
    ///
    /// Returns the number of values filled.
    pub fn fill_missing(&mut self, other: &FeatureRow) -> usize {
        let mut filled = 0;
        for feature in Feature::ALL {
            if self.get(feature).is_none() {
                if let Some(v) = other.get(feature) {
                    self.set(feature, Some(v));
                    filled += 1;
                }
            }
        }
        filled
    }

    /// Number of features without a value.
    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }
}

/// Snapshot window `[-W, +V]` for one position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub position_id: i64,
    pub rows: BTreeMap<i32, FeatureRow>,
}

impl FeatureSnapshot {
    pub fn new(position_id: i64) -> Self {
        Self {
            position_id,
            rows: BTreeMap::new(),
        }
    }

    /// Value of `feature` at `minute_offset`, or `None` if unavailable.
    pub fn value(&self, feature: Feature, minute_offset: i32) -> Option<f64> {
        self.rows.get(&minute_offset).and_then(|row| row.get(feature))
    }

    /// Total number of unavailable values across the window.
    pub fn missing_count(&self) -> usize {
        self.rows.values().map(FeatureRow::missing_count).sum()
    }
}
