use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{from_millis, parse_decimal, to_millis, Database};
use crate::features::MarketDataSource;
use crate::models::{BookSnapshot, MarketTrade, PricePoint};

#[derive(Debug, sqlx::FromRow)]
struct StoredPricePoint {
    asset: String,
    timestamp: i64,
    price: String,
}

impl StoredPricePoint {
    fn decode(self) -> Result<PricePoint> {
        Ok(PricePoint {
            price: parse_decimal(&self.price)?,
            timestamp: from_millis(self.timestamp),
            asset: self.asset,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StoredBookSnapshot {
    asset: String,
    timestamp: i64,
    best_bid: f64,
    best_ask: f64,
    bid_depth: f64,
    ask_depth: f64,
}

impl From<StoredBookSnapshot> for BookSnapshot {
    fn from(row: StoredBookSnapshot) -> Self {
        Self {
            asset: row.asset,
            timestamp: from_millis(row.timestamp),
            best_bid: row.best_bid,
            best_ask: row.best_ask,
            bid_depth: row.bid_depth,
            ask_depth: row.ask_depth,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StoredMarketTrade {
    asset: String,
    timestamp: i64,
    price: f64,
    notional: f64,
    is_buy: bool,
}

impl From<StoredMarketTrade> for MarketTrade {
    fn from(row: StoredMarketTrade) -> Self {
        Self {
            asset: row.asset,
            timestamp: from_millis(row.timestamp),
            price: row.price,
            notional: row.notional,
            is_buy: row.is_buy,
        }
    }
}

impl Database {
    // ==================== Price Feed ====================

    /// Price samples strictly after `after`, oldest first.
    pub async fn get_prices_after(
        &self,
        asset: &str,
        after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PricePoint>> {
        let rows = sqlx::query_as::<_, StoredPricePoint>(
            r#"
            SELECT asset, timestamp, price FROM price_points
            WHERE asset = ? AND timestamp > ?
            ORDER BY timestamp ASC
            LIMIT ?
            "#,
        )
        .bind(asset)
        .bind(to_millis(after))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredPricePoint::decode).collect()
    }

    /// Most recent price sample for an asset.
    pub async fn get_latest_price(&self, asset: &str) -> Result<Option<PricePoint>> {
        let row = sqlx::query_as::<_, StoredPricePoint>(
            "SELECT asset, timestamp, price FROM price_points WHERE asset = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(asset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredPricePoint::decode).transpose()
    }

    /// Price samples in `(from, to]`, oldest first.
    pub async fn get_prices_between(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>> {
        let rows = sqlx::query_as::<_, StoredPricePoint>(
            r#"
            SELECT asset, timestamp, price FROM price_points
            WHERE asset = ? AND timestamp > ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(asset)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredPricePoint::decode).collect()
    }
}

#[async_trait]
impl MarketDataSource for Database {
    async fn price_ticks(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>> {
        self.get_prices_between(asset, from, to).await
    }

    async fn book_snapshots(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BookSnapshot>> {
        let rows = sqlx::query_as::<_, StoredBookSnapshot>(
            r#"
            SELECT asset, timestamp, best_bid, best_ask, bid_depth, ask_depth
            FROM orderbook_snapshots
            WHERE asset = ? AND timestamp > ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(asset)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BookSnapshot::from).collect())
    }

    async fn market_trades(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MarketTrade>> {
        let rows = sqlx::query_as::<_, StoredMarketTrade>(
            r#"
            SELECT asset, timestamp, price, notional, is_buy
            FROM market_trades
            WHERE asset = ? AND timestamp > ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(asset)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MarketTrade::from).collect())
    }

    async fn first_trade_time(&self, asset: &str) -> Result<Option<DateTime<Utc>>> {
        let (first,): (Option<i64>,) = sqlx::query_as("SELECT MIN(timestamp) FROM market_trades WHERE asset = ?")
            .bind(asset)
            .fetch_one(&self.pool)
            .await?;

        Ok(first.map(from_millis))
    }
}

#[cfg(test)]
impl Database {
    /// Stand-in for the price ingester. Duplicate timestamps are ignored.
    pub(crate) async fn insert_price_point(&self, point: &PricePoint) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO price_points (asset, timestamp, price) VALUES (?, ?, ?)")
            .bind(&point.asset)
            .bind(to_millis(point.timestamp))
            .bind(point.price.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub(crate) async fn insert_book_snapshot(&self, book: &BookSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orderbook_snapshots (asset, timestamp, best_bid, best_ask, bid_depth, ask_depth)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&book.asset)
        .bind(to_millis(book.timestamp))
        .bind(book.best_bid)
        .bind(book.best_ask)
        .bind(book.bid_depth)
        .bind(book.ask_depth)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn insert_market_trade(&self, trade: &MarketTrade) -> Result<()> {
        sqlx::query(
            "INSERT INTO market_trades (asset, timestamp, price, notional, is_buy) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&trade.asset)
        .bind(to_millis(trade.timestamp))
        .bind(trade.price)
        .bind(trade.notional)
        .bind(trade.is_buy)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_price_windows_are_half_open() {
        let db = Database::in_memory().await.unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for (i, price) in [dec!(100), dec!(101), dec!(102)].into_iter().enumerate() {
            let point = PricePoint::new("BTC", price, t0 + Duration::seconds(i as i64 * 30));
            db.insert_price_point(&point).await.unwrap();
        }

        let window = db
            .price_ticks("BTC", t0, t0 + Duration::seconds(60))
            .await
            .unwrap();
        let prices: Vec<_> = window.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![dec!(101), dec!(102)]);

        let latest = db.get_latest_price("BTC").await.unwrap().unwrap();
        assert_eq!(latest.price, dec!(102));

        assert!(db.get_latest_price("ETH").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_trade_time_per_asset() {
        let db = Database::in_memory().await.unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(db.first_trade_time("BTC").await.unwrap(), None);

        for secs in [90, 30, 60] {
            db.insert_market_trade(&MarketTrade {
                asset: "BTC".to_string(),
                timestamp: t0 + Duration::seconds(secs),
                price: 100.0,
                notional: 250.0,
                is_buy: true,
            })
            .await
            .unwrap();
        }

        assert_eq!(db.first_trade_time("BTC").await.unwrap(), Some(t0 + Duration::seconds(30)));
        assert_eq!(db.first_trade_time("ETH").await.unwrap(), None);

        let trades = db
            .market_trades("BTC", t0 + Duration::seconds(30), t0 + Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(trades.len(), 2);
    }
}
