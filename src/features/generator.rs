//! Per-minute feature computation for a position's snapshot window.
//!
//! Offset `k` covers the one-minute bucket `(entry + k - 1m, entry + k]`.
//! A value is `None` whenever its inputs are missing: an absent stream,
//! an empty bucket, or a bucket that has not fully elapsed yet. Trade flow
//! is only counted from the bucket holding the first recorded trade on;
//! earlier buckets predate ingestion and stay `None` rather than zero. Generation
//! is deterministic for a given data set, and storage only ever fills
//! missing values, so re-running it is safe.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::Statistics;
use tracing::warn;

use super::MarketDataSource;
use crate::models::{BookSnapshot, Feature, FeatureRow, MarketTrade, PricePoint};
use crate::trading::StrategyConfig;

/// True once every bucket up to `+V` has elapsed.
pub fn window_closed(entry_time: DateTime<Utc>, window_after_minutes: i32, now: DateTime<Utc>) -> bool {
    now >= entry_time + Duration::minutes(i64::from(window_after_minutes))
}

/// True while late-arriving data may still be backfilled into the snapshot.
pub fn backfill_open(entry_time: DateTime<Utc>, config: &StrategyConfig, now: DateTime<Utc>) -> bool {
    now <= entry_time
        + Duration::minutes(i64::from(config.window_after_minutes))
        + Duration::minutes(config.backfill_grace_minutes)
}

/// Raw streams fetched for one window. `None` means the stream was unavailable.
struct WindowData {
    ticks: Option<Vec<PricePoint>>,
    books: Option<Vec<BookSnapshot>>,
    trades: Option<Vec<MarketTrade>>,
    first_trade: Option<DateTime<Utc>>,
}

/// Computes feature rows from market streams.
#[derive(Debug, Clone)]
pub struct FeatureGenerator {
    whale_notional: f64,
}

impl FeatureGenerator {
    pub fn new(whale_notional: f64) -> Self {
        Self { whale_notional }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.whale_notional)
    }

    /// Compute rows for every offset in `offsets`.
    ///
    /// A failing stream degrades to missing values for the features it feeds.
    pub async fn generate(
        &self,
        source: &dyn MarketDataSource,
        asset: &str,
        entry_time: DateTime<Utc>,
        offsets: RangeInclusive<i32>,
        now: DateTime<Utc>,
    ) -> BTreeMap<i32, FeatureRow> {
        // One extra bucket before the window so the first price change has a reference
        let from = entry_time + Duration::minutes(i64::from(*offsets.start()) - 2);
        let to = (entry_time + Duration::minutes(i64::from(*offsets.end()))).min(now);

        let data = if to <= from {
            WindowData {
                ticks: None,
                books: None,
                trades: None,
                first_trade: None,
            }
        } else {
            WindowData {
                ticks: source
                    .price_ticks(asset, from, to)
                    .await
                    .map_err(|e| warn!(asset = %asset, error = %e, "Price stream unavailable"))
                    .ok(),
                books: source
                    .book_snapshots(asset, from, to)
                    .await
                    .map_err(|e| warn!(asset = %asset, error = %e, "Order book stream unavailable"))
                    .ok(),
                trades: source
                    .market_trades(asset, from, to)
                    .await
                    .map_err(|e| warn!(asset = %asset, error = %e, "Market trade stream unavailable"))
                    .ok(),
                first_trade: source
                    .first_trade_time(asset)
                    .await
                    .map_err(|e| warn!(asset = %asset, error = %e, "Market trade coverage unknown"))
                    .ok()
                    .flatten(),
            }
        };

        offsets
            .map(|offset| (offset, self.compute_row(&data, entry_time, offset, now)))
            .collect()
    }

    fn compute_row(
        &self,
        data: &WindowData,
        entry_time: DateTime<Utc>,
        offset: i32,
        now: DateTime<Utc>,
    ) -> FeatureRow {
        let mut row = FeatureRow::default();
        let end = entry_time + Duration::minutes(i64::from(offset));
        if end > now {
            return row;
        }
        let start = end - Duration::minutes(1);

        if let Some(ticks) = &data.ticks {
            let prices: Vec<f64> = in_bucket(ticks, |t| t.timestamp, start, end)
                .filter_map(|t| t.price.to_f64())
                .collect();
            let previous_close = in_bucket(ticks, |t| t.timestamp, start - Duration::minutes(1), start)
                .filter_map(|t| t.price.to_f64())
                .last();
            price_features(&mut row, &prices, previous_close);
        }

        if let Some(books) = &data.books {
            if let Some(book) = in_bucket(books, |b| b.timestamp, start, end).last() {
                book_features(&mut row, book);
            }
        }

        if let (Some(trades), Some(first_trade)) = (&data.trades, data.first_trade) {
            if first_trade <= end {
                let bucket: Vec<&MarketTrade> = in_bucket(trades, |t| t.timestamp, start, end).collect();
                self.flow_features(&mut row, &bucket);
            }
        }

        row
    }

    fn flow_features(&self, row: &mut FeatureRow, trades: &[&MarketTrade]) {
        let buy_volume = trades.iter().filter(|t| t.is_buy).fold(0.0, |acc, t| acc + t.notional);
        let sell_volume = trades.iter().filter(|t| !t.is_buy).fold(0.0, |acc, t| acc + t.notional);

        row.set(Feature::BuyVolume, Some(buy_volume));
        row.set(Feature::SellVolume, Some(sell_volume));
        row.set(
            Feature::BuySellRatio,
            (sell_volume > 0.0).then(|| buy_volume / sell_volume),
        );
        row.set(Feature::TradeCount, Some(trades.len() as f64));

        let whales: Vec<&&MarketTrade> = trades
            .iter()
            .filter(|t| t.notional >= self.whale_notional)
            .collect();
        row.set(Feature::WhaleCount, Some(whales.len() as f64));

        let whale_total = whales.iter().fold(0.0, |acc, t| acc + t.notional);
        let whale_net = whales
            .iter()
            .fold(0.0, |acc, t| if t.is_buy { acc + t.notional } else { acc - t.notional });
        row.set(
            Feature::WhaleNetFlowPct,
            (whale_total > 0.0).then(|| whale_net / whale_total * 100.0),
        );
    }
}

fn in_bucket<'a, T>(
    items: &'a [T],
    timestamp: impl Fn(&T) -> DateTime<Utc> + 'a,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> impl Iterator<Item = &'a T> + 'a {
    items.iter().filter(move |item| {
        let ts = timestamp(item);
        ts > start && ts <= end
    })
}

fn price_features(row: &mut FeatureRow, prices: &[f64], previous_close: Option<f64>) {
    let Some(&close) = prices.last() else {
        return;
    };
    row.set(Feature::PriceClose, Some(close));

    if let Some(prev) = previous_close.filter(|p| *p > 0.0) {
        row.set(Feature::PriceChangePct, Some((close / prev - 1.0) * 100.0));
    }

    let high = prices.iter().copied().fold(f64::MIN, f64::max);
    let low = prices.iter().copied().fold(f64::MAX, f64::min);
    if low > 0.0 {
        row.set(Feature::PriceRangePct, Some((high - low) / low * 100.0));
    }

    // Sample std dev needs at least two returns
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() >= 2 {
        row.set(Feature::VolatilityPct, Some(returns.std_dev() * 100.0));
    }
}

fn book_features(row: &mut FeatureRow, book: &BookSnapshot) {
    row.set(Feature::BidDepth, Some(book.bid_depth));
    row.set(Feature::AskDepth, Some(book.ask_depth));

    let total_depth = book.bid_depth + book.ask_depth;
    if total_depth > 0.0 {
        row.set(
            Feature::BookImbalance,
            Some((book.bid_depth - book.ask_depth) / total_depth),
        );
    }

    let mid = (book.best_bid + book.best_ask) / 2.0;
    if mid > 0.0 && book.best_ask >= book.best_bid {
        row.set(
            Feature::SpreadPct,
            Some((book.best_ask - book.best_bid) / mid * 100.0),
        );
    }
}
