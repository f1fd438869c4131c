use anyhow::{Context, Result};
use chrono::Utc;

use super::{from_millis, parse_decimal, to_millis, Database};
use crate::models::{WalletCursor, WalletTrade};

#[derive(Debug, sqlx::FromRow)]
struct StoredWalletTrade {
    wallet_address: String,
    trade_id: i64,
    side: String,
    asset: String,
    price: Option<String>,
    timestamp: i64,
}

impl StoredWalletTrade {
    fn decode(self) -> Result<WalletTrade> {
        Ok(WalletTrade {
            side: self
                .side
                .parse()
                .with_context(|| format!("wallet trade {}", self.trade_id))?,
            price: self.price.as_deref().map(parse_decimal).transpose()?,
            timestamp: from_millis(self.timestamp),
            wallet_address: self.wallet_address,
            trade_id: self.trade_id,
            asset: self.asset,
        })
    }
}

impl Database {
    // ==================== Tracked Wallets ====================

    /// Start mirroring `wallet` for a strategy.
    ///
    /// A wallet seen for the first time gets its cursor set to its latest
    /// known trade, so history is never replayed. An existing cursor is
    /// left where it is.
    pub async fn track_wallet(&self, strategy_id: &str, wallet: &str) -> Result<WalletCursor> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO strategy_wallets (strategy_id, wallet_address, is_tracked, tracking_since)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(strategy_id, wallet_address) DO UPDATE SET is_tracked = 1
            "#,
        )
        .bind(strategy_id)
        .bind(wallet)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO wallet_cursors (wallet_address, last_processed_trade_id, updated_at)
            SELECT ?, COALESCE(MAX(trade_id), 0), ? FROM wallet_trades WHERE wallet_address = ?
            ON CONFLICT(wallet_address) DO NOTHING
            "#,
        )
        .bind(wallet)
        .bind(now)
        .bind(wallet)
        .execute(&mut *tx)
        .await?;

        let (last,): (i64,) = sqlx::query_as(
            "SELECT last_processed_trade_id FROM wallet_cursors WHERE wallet_address = ?",
        )
        .bind(wallet)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(WalletCursor {
            wallet_address: wallet.to_string(),
            last_processed_trade_id: last,
        })
    }

    /// Stop mirroring `wallet` for a strategy. The cursor is kept.
    pub async fn untrack_wallet(&self, strategy_id: &str, wallet: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE strategy_wallets SET is_tracked = 0 WHERE strategy_id = ? AND wallet_address = ?",
        )
        .bind(strategy_id)
        .bind(wallet)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Wallets tracked by at least one enabled strategy.
    pub async fn get_tracked_wallets(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT w.wallet_address
            FROM strategy_wallets w
            JOIN strategies s ON s.id = w.strategy_id
            WHERE w.is_tracked = 1 AND s.enabled = 1
            ORDER BY w.wallet_address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(w,)| w).collect())
    }

    /// Enabled strategies mirroring `wallet`.
    pub async fn get_wallet_strategies(&self, wallet: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT w.strategy_id
            FROM strategy_wallets w
            JOIN strategies s ON s.id = w.strategy_id
            WHERE w.wallet_address = ? AND w.is_tracked = 1 AND s.enabled = 1
            ORDER BY w.strategy_id
            "#,
        )
        .bind(wallet)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    /// Wallets tracked by one strategy.
    pub async fn get_strategy_wallets(&self, strategy_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT wallet_address FROM strategy_wallets WHERE strategy_id = ? AND is_tracked = 1 ORDER BY wallet_address",
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(w,)| w).collect())
    }

    // ==================== Cursors ====================

    pub async fn get_cursor(&self, wallet: &str) -> Result<Option<WalletCursor>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT last_processed_trade_id FROM wallet_cursors WHERE wallet_address = ?",
        )
        .bind(wallet)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last,)| WalletCursor {
            wallet_address: wallet.to_string(),
            last_processed_trade_id: last,
        }))
    }

    /// Move the cursor forward to `trade_id`.
    ///
    /// Returns false when the cursor is already at or beyond `trade_id`,
    /// meaning another consumer claimed the trade first.
    pub async fn advance_cursor(&self, wallet: &str, trade_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE wallet_cursors
            SET last_processed_trade_id = ?, updated_at = ?
            WHERE wallet_address = ? AND last_processed_trade_id < ?
            "#,
        )
        .bind(trade_id)
        .bind(to_millis(Utc::now()))
        .bind(wallet)
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Wallet Trades ====================

    /// Trades by `wallet` newer than `after_trade_id`, oldest first.
    pub async fn get_wallet_trades_after(
        &self,
        wallet: &str,
        after_trade_id: i64,
        limit: i64,
    ) -> Result<Vec<WalletTrade>> {
        let rows = sqlx::query_as::<_, StoredWalletTrade>(
            r#"
            SELECT wallet_address, trade_id, side, asset, price, timestamp
            FROM wallet_trades
            WHERE wallet_address = ? AND trade_id > ?
            ORDER BY trade_id ASC
            LIMIT ?
            "#,
        )
        .bind(wallet)
        .bind(after_trade_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredWalletTrade::decode).collect()
    }
}

#[cfg(test)]
impl Database {
    /// Stand-in for the webhook receiver.
    pub(crate) async fn insert_wallet_trade(&self, trade: &WalletTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_trades (wallet_address, trade_id, side, asset, price, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.wallet_address)
        .bind(trade.trade_id)
        .bind(trade.side.as_str())
        .bind(&trade.asset)
        .bind(trade.price.map(|p| p.to_string()))
        .bind(to_millis(trade.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use crate::trading::StrategyConfig;
    use chrono::TimeZone;

    fn trade(wallet: &str, trade_id: i64) -> WalletTrade {
        WalletTrade {
            wallet_address: wallet.to_string(),
            trade_id,
            side: TradeSide::Buy,
            asset: "BTC".to_string(),
            price: None,
            timestamp: Utc.timestamp_opt(1_700_000_000 + trade_id, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_track_starts_at_latest_trade() {
        let db = Database::in_memory().await.unwrap();
        db.save_strategy("s1", &StrategyConfig::default()).await.unwrap();
        for id in [10, 11, 12] {
            db.insert_wallet_trade(&trade("0xabc", id)).await.unwrap();
        }

        let cursor = db.track_wallet("s1", "0xabc").await.unwrap();
        assert_eq!(cursor.last_processed_trade_id, 12);

        // Re-tracking never rewinds an existing cursor
        assert!(db.advance_cursor("0xabc", 20).await.unwrap());
        let cursor = db.track_wallet("s1", "0xabc").await.unwrap();
        assert_eq!(cursor.last_processed_trade_id, 20);
    }

    #[tokio::test]
    async fn test_cursor_only_moves_forward() {
        let db = Database::in_memory().await.unwrap();
        db.save_strategy("s1", &StrategyConfig::default()).await.unwrap();
        db.track_wallet("s1", "0xabc").await.unwrap();

        assert!(db.advance_cursor("0xabc", 5).await.unwrap());
        assert!(!db.advance_cursor("0xabc", 5).await.unwrap());
        assert!(!db.advance_cursor("0xabc", 3).await.unwrap());
        assert_eq!(
            db.get_cursor("0xabc").await.unwrap().unwrap().last_processed_trade_id,
            5
        );
    }

    #[tokio::test]
    async fn test_disabled_strategy_wallets_not_polled() {
        let db = Database::in_memory().await.unwrap();
        db.save_strategy("s1", &StrategyConfig::default()).await.unwrap();
        db.save_strategy("s2", &StrategyConfig::default()).await.unwrap();
        db.track_wallet("s1", "0xaaa").await.unwrap();
        db.track_wallet("s2", "0xaaa").await.unwrap();
        db.track_wallet("s2", "0xbbb").await.unwrap();

        assert_eq!(db.get_wallet_strategies("0xaaa").await.unwrap(), vec!["s1", "s2"]);

        db.set_strategy_enabled("s2", false).await.unwrap();
        assert_eq!(db.get_tracked_wallets().await.unwrap(), vec!["0xaaa"]);
        assert_eq!(db.get_wallet_strategies("0xaaa").await.unwrap(), vec!["s1"]);

        db.untrack_wallet("s1", "0xaaa").await.unwrap();
        assert!(db.get_tracked_wallets().await.unwrap().is_empty());
    }
}
