//! Database persistence for engine state.
//!
//! Stores everything needed to resume after restart and to coordinate
//! independently scheduled tasks:
//! - Strategies, tracked wallets and per-wallet cursors
//! - Price cycles per (asset, threshold)
//! - Positions and their lifecycle state
//! - Feature snapshots
//! - Filter sets, the active-set pointer, and optimizer audit rows
//!
//! The raw market stores (`price_points`, `orderbook_snapshots`,
//! `market_trades`, `wallet_trades`) are written by external ingesters and
//! only read here.
//!
//! Every mutation that other tasks may race on is a single conditional
//! statement or a transaction; callers never read-modify-write.

mod cycles;
mod features;
mod filters;
mod market;
mod positions;
mod strategies;
mod wallets;

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::Feature;

pub use filters::{FilterSetSummary, OptimizerRunRecord};
pub use positions::AdmitResult;
pub use strategies::StrategyRecord;

/// Database connection pool with full state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Single-connection in-memory database (each connection would otherwise
    /// see its own empty database).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Strategies
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Wallets mirrored by each strategy
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_wallets (
                strategy_id TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                is_tracked INTEGER NOT NULL DEFAULT 1,
                tracking_since INTEGER NOT NULL,
                PRIMARY KEY (strategy_id, wallet_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-wallet consumption cursor
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_cursors (
                wallet_address TEXT PRIMARY KEY,
                last_processed_trade_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Raw wallet trades (written by the webhook receiver)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_trades (
                wallet_address TEXT NOT NULL,
                trade_id INTEGER NOT NULL,
                side TEXT NOT NULL,
                asset TEXT NOT NULL,
                price TEXT,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (wallet_address, trade_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Raw price samples (written by the price ingester)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_points (
                asset TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                price TEXT NOT NULL,
                PRIMARY KEY (asset, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Raw order-book snapshots
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orderbook_snapshots (
                asset TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                best_bid REAL NOT NULL,
                best_ask REAL NOT NULL,
                bid_depth REAL NOT NULL,
                ask_depth REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Raw executed market trades
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_trades (
                asset TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                price REAL NOT NULL,
                notional REAL NOT NULL,
                is_buy INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Price cycles
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset TEXT NOT NULL,
                threshold TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                start_price TEXT NOT NULL,
                peak_price TEXT NOT NULL,
                peak_time INTEGER NOT NULL,
                last_sample_time INTEGER NOT NULL,
                end_time INTEGER,
                end_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                price_cycle_id INTEGER NOT NULL,
                source_wallet TEXT NOT NULL,
                source_trade_id INTEGER NOT NULL,
                entry_time INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                exit_time INTEGER,
                exit_price TEXT,
                high_water_price TEXT NOT NULL,
                realized_outcome REAL,
                outcome_source TEXT,
                validator_log TEXT,
                reason TEXT,
                stale_detection INTEGER NOT NULL DEFAULT 0,
                validating_since INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(strategy_id, source_wallet, source_trade_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Feature snapshots: one fixed column per feature
        let feature_columns: String = Feature::ALL
            .iter()
            .map(|f| format!("{} REAL,\n", f.as_str()))
            .collect();
        let snapshot_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS feature_snapshots (
                position_id INTEGER NOT NULL,
                minute_offset INTEGER NOT NULL,
                {feature_columns}
                generated_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (position_id, minute_offset)
            )
            "#
        );
        sqlx::query(&snapshot_table).execute(&self.pool).await?;

        // Immutable filter sets
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filter_sets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                run_id TEXT,
                created_at INTEGER NOT NULL,
                retired_at INTEGER,
                UNIQUE(strategy_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filter_rules (
                filter_set_id INTEGER NOT NULL,
                rule_index INTEGER NOT NULL,
                feature TEXT NOT NULL,
                minute_offset INTEGER NOT NULL,
                lower_bound REAL NOT NULL,
                upper_bound REAL NOT NULL,
                is_ratio INTEGER NOT NULL,
                PRIMARY KEY (filter_set_id, rule_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Active filter set pointer, one per strategy
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_filter_sets (
                strategy_id TEXT PRIMARY KEY,
                filter_set_id INTEGER NOT NULL,
                activated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Optimizer audit trail
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS optimizer_runs (
                run_id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                labeled_samples INTEGER NOT NULL DEFAULT 0,
                scenarios_evaluated INTEGER NOT NULL DEFAULT 0,
                outcome TEXT,
                selected_filter_set_id INTEGER,
                message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scenario_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                descriptor TEXT NOT NULL,
                bad_removed_pct REAL NOT NULL,
                good_kept_pct REAL NOT NULL,
                score REAL NOT NULL,
                selected INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_price_cycles_open ON price_cycles(asset, threshold) WHERE end_time IS NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_cycle ON positions(strategy_id, price_cycle_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orderbook_time ON orderbook_snapshots(asset, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_market_trades_time ON market_trades(asset, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scenario_results_run ON scenario_results(run_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
impl Database {
    /// Run a raw statement, e.g. a trigger that makes later writes fail.
    pub(crate) async fn execute_sql(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

// ==================== Encoding helpers ====================

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Normalized decimal text, so `0.010` and `0.01` share a storage key.
pub(crate) fn decimal_key(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn parse_decimal(text: &str) -> Result<Decimal> {
    Decimal::from_str(text).with_context(|| format!("Invalid stored decimal: {text}"))
}
