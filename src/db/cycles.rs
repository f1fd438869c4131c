use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{decimal_key, from_millis, parse_decimal, to_millis, Database};
use crate::models::{PriceCycle, PricePoint};

const CYCLE_COLUMNS: &str = "id, asset, threshold, start_time, start_price, peak_price, peak_time, last_sample_time, end_time, end_reason";

#[derive(Debug, sqlx::FromRow)]
struct StoredCycle {
    id: i64,
    asset: String,
    threshold: String,
    start_time: i64,
    start_price: String,
    peak_price: String,
    peak_time: i64,
    last_sample_time: i64,
    end_time: Option<i64>,
    end_reason: Option<String>,
}

impl StoredCycle {
    fn decode(self) -> Result<PriceCycle> {
        Ok(PriceCycle {
            id: self.id,
            asset: self.asset,
            threshold: parse_decimal(&self.threshold)?,
            start_time: from_millis(self.start_time),
            start_price: parse_decimal(&self.start_price)?,
            peak_price: parse_decimal(&self.peak_price)?,
            peak_time: from_millis(self.peak_time),
            last_sample_time: from_millis(self.last_sample_time),
            end_time: self.end_time.map(from_millis),
            end_reason: self.end_reason,
        })
    }
}

impl Database {
    // ==================== Price Cycles ====================

    /// Open a cycle at `point` unless one is already open for (asset, threshold).
    ///
    /// Returns the open cycle either way.
    pub async fn open_cycle(&self, threshold: Decimal, point: &PricePoint) -> Result<PriceCycle> {
        let ts = to_millis(point.timestamp);
        let price = point.price.to_string();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO price_cycles
                (asset, threshold, start_time, start_price, peak_price, peak_time, last_sample_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&point.asset)
        .bind(decimal_key(threshold))
        .bind(ts)
        .bind(&price)
        .bind(&price)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        self.get_open_cycle(&point.asset, threshold)
            .await?
            .context("open cycle missing after insert")
    }

    pub async fn get_open_cycle(&self, asset: &str, threshold: Decimal) -> Result<Option<PriceCycle>> {
        let row = sqlx::query_as::<_, StoredCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM price_cycles WHERE asset = ? AND threshold = ? AND end_time IS NULL"
        ))
        .bind(asset)
        .bind(decimal_key(threshold))
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredCycle::decode).transpose()
    }

    pub async fn get_cycle(&self, id: i64) -> Result<Option<PriceCycle>> {
        let row = sqlx::query_as::<_, StoredCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM price_cycles WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredCycle::decode).transpose()
    }

    /// Most recent cycles for an asset, newest first.
    pub async fn list_cycles(&self, asset: &str, limit: i64) -> Result<Vec<PriceCycle>> {
        let rows = sqlx::query_as::<_, StoredCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM price_cycles WHERE asset = ? ORDER BY start_time DESC, id DESC LIMIT ?"
        ))
        .bind(asset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredCycle::decode).collect()
    }

    /// Record a new peak. Only applies to a still-open cycle whose stored
    /// peak is lower, so concurrent writers cannot move the peak down.
    pub async fn raise_cycle_peak(
        &self,
        cycle: &PriceCycle,
        peak: Decimal,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE price_cycles
            SET peak_price = ?, peak_time = ?, last_sample_time = ?
            WHERE id = ? AND end_time IS NULL AND peak_price = ?
            "#,
        )
        .bind(peak.to_string())
        .bind(to_millis(at))
        .bind(to_millis(at))
        .bind(cycle.id)
        .bind(cycle.peak_price.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Advance the cycle's sample clock without changing its peak.
    pub async fn touch_cycle(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE price_cycles SET last_sample_time = ? WHERE id = ? AND end_time IS NULL AND last_sample_time < ?",
        )
        .bind(to_millis(at))
        .bind(id)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close `closing` and open its successor at `point` in one transaction.
    ///
    /// Returns `None` if the cycle was already closed by someone else.
    pub async fn roll_cycle(
        &self,
        closing: &PriceCycle,
        point: &PricePoint,
        reason: &str,
    ) -> Result<Option<PriceCycle>> {
        let ts = to_millis(point.timestamp);
        let price = point.price.to_string();
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            r#"
            UPDATE price_cycles
            SET end_time = ?, end_reason = ?, last_sample_time = ?
            WHERE id = ? AND end_time IS NULL
            "#,
        )
        .bind(ts)
        .bind(reason)
        .bind(ts)
        .bind(closing.id)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO price_cycles
                (asset, threshold, start_time, start_price, peak_price, peak_time, last_sample_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&closing.asset)
        .bind(decimal_key(closing.threshold))
        .bind(ts)
        .bind(&price)
        .bind(&price)
        .bind(ts)
        .bind(ts)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(PriceCycle {
            id,
            asset: closing.asset.clone(),
            threshold: closing.threshold,
            start_time: point.timestamp,
            start_price: point.price,
            peak_price: point.price,
            peak_time: point.timestamp,
            last_sample_time: point.timestamp,
            end_time: None,
            end_reason: None,
        }))
    }

    /// Delete closed cycles that ended before `cutoff` and no longer anchor
    /// any live position.
    pub async fn prune_cycles(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM price_cycles
            WHERE end_time IS NOT NULL AND end_time < ?
              AND id NOT IN (
                SELECT price_cycle_id FROM positions
                WHERE status IN ('pending', 'validating', 'go')
              )
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn point(price: Decimal, secs: i64) -> PricePoint {
        PricePoint::new("BTC", price, Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    #[tokio::test]
    async fn test_only_one_open_cycle_per_threshold() {
        let db = Database::in_memory().await.unwrap();
        let first = db.open_cycle(dec!(0.01), &point(dec!(100), 0)).await.unwrap();
        let second = db.open_cycle(dec!(0.010), &point(dec!(105), 1)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.start_price, dec!(100));

        // A different threshold tracks independently
        let other = db.open_cycle(dec!(0.02), &point(dec!(105), 1)).await.unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn test_roll_cycle_closes_and_opens_atomically() {
        let db = Database::in_memory().await.unwrap();
        let cycle = db.open_cycle(dec!(0.01), &point(dec!(100), 0)).await.unwrap();
        assert!(db.raise_cycle_peak(&cycle, dec!(101), point(dec!(101), 5).timestamp).await.unwrap());
        // Stale peak view loses
        assert!(!db.raise_cycle_peak(&cycle, dec!(102), point(dec!(102), 6).timestamp).await.unwrap());

        let next = db
            .roll_cycle(&cycle, &point(dec!(99.6), 10), "drawdown")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.start_price, dec!(99.6));

        let closed = db.get_cycle(cycle.id).await.unwrap().unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.peak_price, dec!(101));
        assert_eq!(closed.end_reason.as_deref(), Some("drawdown"));

        // Second close attempt is a no-op
        assert!(db.roll_cycle(&cycle, &point(dec!(99), 11), "drawdown").await.unwrap().is_none());
        let open = db.get_open_cycle("BTC", dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(open.id, next.id);
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_and_open_cycles() {
        let db = Database::in_memory().await.unwrap();
        let cycle = db.open_cycle(dec!(0.01), &point(dec!(100), 0)).await.unwrap();
        db.roll_cycle(&cycle, &point(dec!(98), 60), "drawdown").await.unwrap();

        let cutoff = point(dec!(0), 0).timestamp + Duration::days(1);
        assert_eq!(db.prune_cycles(cutoff).await.unwrap(), 1);
        assert!(db.get_cycle(cycle.id).await.unwrap().is_none());
        assert!(db.get_open_cycle("BTC", dec!(0.01)).await.unwrap().is_some());
    }
}
