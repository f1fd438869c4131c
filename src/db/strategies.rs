use anyhow::{Context, Result};
use chrono::Utc;

use super::{to_millis, Database};
use crate::trading::StrategyConfig;

/// Registered strategy with its decoded configuration.
#[derive(Debug, Clone)]
pub struct StrategyRecord {
    pub id: String,
    pub config: StrategyConfig,
    pub enabled: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredStrategy {
    id: String,
    config: String,
    enabled: bool,
}

impl StoredStrategy {
    fn decode(self) -> Result<StrategyRecord> {
        let config: StrategyConfig = serde_json::from_str(&self.config)
            .with_context(|| format!("Invalid config for strategy {}", self.id))?;
        Ok(StrategyRecord {
            id: self.id,
            config,
            enabled: self.enabled,
        })
    }
}

impl Database {
    // ==================== Strategies ====================

    /// Insert or replace a strategy's configuration.
    pub async fn save_strategy(&self, id: &str, config: &StrategyConfig) -> Result<()> {
        let now = to_millis(Utc::now());
        let json = serde_json::to_string(config)?;

        sqlx::query(
            r#"
            INSERT INTO strategies (id, config, enabled, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(&json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_strategy(&self, id: &str) -> Result<Option<StrategyRecord>> {
        let row = sqlx::query_as::<_, StoredStrategy>(
            "SELECT id, config, enabled FROM strategies WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredStrategy::decode).transpose()
    }

    pub async fn list_strategies(&self) -> Result<Vec<StrategyRecord>> {
        let rows = sqlx::query_as::<_, StoredStrategy>(
            "SELECT id, config, enabled FROM strategies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredStrategy::decode).collect()
    }

    pub async fn set_strategy_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE strategies SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(to_millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
