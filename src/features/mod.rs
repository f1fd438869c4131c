//! Feature extraction around position entries.
//!
//! Market data is read through [`MarketDataSource`]; the store-backed
//! implementation lives on [`crate::db::Database`], tests use in-memory
//! fixtures.

mod generator;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{BookSnapshot, MarketTrade, PricePoint};

pub use generator::{backfill_open, window_closed, FeatureGenerator};

/// Read access to raw market streams over half-open `(from, to]` windows.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn price_ticks(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>>;

    async fn book_snapshots(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BookSnapshot>>;

    async fn market_trades(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MarketTrade>>;

    /// Timestamp of the oldest recorded market trade, if any.
    async fn first_trade_time(&self, asset: &str) -> Result<Option<DateTime<Utc>>>;
}
