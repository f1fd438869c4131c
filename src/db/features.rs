use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use super::{to_millis, Database};
use crate::models::{Feature, FeatureRow, FeatureSnapshot};

fn feature_column_list() -> String {
    Feature::ALL
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_row(row: &SqliteRow) -> Result<(i64, i32, FeatureRow)> {
    let position_id: i64 = row.try_get("position_id")?;
    let offset: i32 = row.try_get("minute_offset")?;
    let mut values = FeatureRow::default();
    for feature in Feature::ALL {
        values.set(feature, row.try_get::<Option<f64>, _>(feature.as_str())?);
    }
    Ok((position_id, offset, values))
}

impl Database {
    // ==================== Feature Snapshots ====================

    /// Write feature rows for a position.
    ///
    /// Values already stored are never overwritten; only missing values are
    /// filled, so repeated generation converges instead of drifting.
    pub async fn upsert_feature_rows(
        &self,
        position_id: i64,
        rows: &BTreeMap<i32, FeatureRow>,
    ) -> Result<()> {
        let columns = feature_column_list();
        let placeholders = vec!["?"; Feature::COUNT].join(", ");
        let updates = Feature::ALL
            .iter()
            .map(|f| {
                let c = f.as_str();
                format!("{c} = COALESCE(feature_snapshots.{c}, excluded.{c})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            INSERT INTO feature_snapshots (position_id, minute_offset, {columns}, generated_at, updated_at)
            VALUES (?, ?, {placeholders}, ?, ?)
            ON CONFLICT(position_id, minute_offset) DO UPDATE SET {updates}, updated_at = excluded.updated_at
            "#
        );

        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for (offset, row) in rows {
            let mut query = sqlx::query(&sql).bind(position_id).bind(*offset);
            for feature in Feature::ALL {
                query = query.bind(row.get(feature));
            }
            query.bind(now).bind(now).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Stored snapshot for a position (empty if none was generated).
    pub async fn get_feature_snapshot(&self, position_id: i64) -> Result<FeatureSnapshot> {
        let sql = format!(
            "SELECT position_id, minute_offset, {} FROM feature_snapshots WHERE position_id = ? ORDER BY minute_offset",
            feature_column_list()
        );
        let rows = sqlx::query(&sql)
            .bind(position_id)
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = FeatureSnapshot::new(position_id);
        for row in &rows {
            let (_, offset, values) = decode_row(row)?;
            snapshot.rows.insert(offset, values);
        }
        Ok(snapshot)
    }

    /// Snapshots of every labeled position of a strategy entered since `since`.
    pub async fn get_labeled_snapshots(
        &self,
        strategy_id: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<i64, FeatureSnapshot>> {
        let sql = format!(
            r#"
            SELECT f.position_id, f.minute_offset, {}
            FROM feature_snapshots f
            JOIN positions p ON p.id = f.position_id
            WHERE p.strategy_id = ? AND p.realized_outcome IS NOT NULL AND p.entry_time >= ?
            "#,
            Feature::ALL
                .iter()
                .map(|f| format!("f.{}", f.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(strategy_id)
            .bind(to_millis(since))
            .fetch_all(&self.pool)
            .await?;

        let mut snapshots: HashMap<i64, FeatureSnapshot> = HashMap::new();
        for row in &rows {
            let (position_id, offset, values) = decode_row(row)?;
            snapshots
                .entry(position_id)
                .or_insert_with(|| FeatureSnapshot::new(position_id))
                .rows
                .insert(offset, values);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_only_fills_missing_values() {
        let db = Database::in_memory().await.unwrap();

        let mut first = FeatureRow::default();
        first.set(Feature::PriceClose, Some(100.0));
        db.upsert_feature_rows(1, &BTreeMap::from([(0, first)])).await.unwrap();

        let mut second = FeatureRow::default();
        second.set(Feature::PriceClose, Some(250.0));
        second.set(Feature::TradeCount, Some(0.0));
        db.upsert_feature_rows(1, &BTreeMap::from([(0, second), (1, second)]))
            .await
            .unwrap();

        let snapshot = db.get_feature_snapshot(1).await.unwrap();
        assert_eq!(snapshot.value(Feature::PriceClose, 0), Some(100.0));
        assert_eq!(snapshot.value(Feature::TradeCount, 0), Some(0.0));
        assert_eq!(snapshot.value(Feature::PriceClose, 1), Some(250.0));
        assert_eq!(snapshot.value(Feature::BidDepth, 0), None);
        assert_eq!(snapshot.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let db = Database::in_memory().await.unwrap();
        let snapshot = db.get_feature_snapshot(42).await.unwrap();
        assert!(snapshot.rows.is_empty());
    }
}
