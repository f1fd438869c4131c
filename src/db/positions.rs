use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{from_millis, parse_decimal, to_millis, Database};
use crate::models::{NewPosition, OutcomeSource, Position, PositionStatus};

const POSITION_COLUMNS: &str = "id, strategy_id, price_cycle_id, source_wallet, source_trade_id, entry_time, entry_price, status, exit_time, exit_price, high_water_price, realized_outcome, outcome_source, validator_log, reason, stale_detection, validating_since";

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitResult {
    Admitted(i64),
    /// The cycle already holds `max_entries` non-failed positions
    CycleFull,
    /// This (strategy, wallet, trade) was admitted before
    Duplicate(i64),
}

#[derive(Debug, sqlx::FromRow)]
struct StoredPosition {
    id: i64,
    strategy_id: String,
    price_cycle_id: i64,
    source_wallet: String,
    source_trade_id: i64,
    entry_time: i64,
    entry_price: String,
    status: String,
    exit_time: Option<i64>,
    exit_price: Option<String>,
    high_water_price: String,
    realized_outcome: Option<f64>,
    outcome_source: Option<String>,
    validator_log: Option<String>,
    reason: Option<String>,
    stale_detection: bool,
    validating_since: Option<i64>,
}

impl StoredPosition {
    fn decode(self) -> Result<Position> {
        let status: PositionStatus = self
            .status
            .parse()
            .with_context(|| format!("position {}", self.id))?;
        let outcome_source = self
            .outcome_source
            .as_deref()
            .map(str::parse::<OutcomeSource>)
            .transpose()
            .with_context(|| format!("position {}", self.id))?;

        Ok(Position {
            id: self.id,
            strategy_id: self.strategy_id,
            price_cycle_id: self.price_cycle_id,
            source_wallet: self.source_wallet,
            source_trade_id: self.source_trade_id,
            entry_time: from_millis(self.entry_time),
            entry_price: parse_decimal(&self.entry_price)?,
            status,
            exit_time: self.exit_time.map(from_millis),
            exit_price: self.exit_price.as_deref().map(parse_decimal).transpose()?,
            high_water_price: parse_decimal(&self.high_water_price)?,
            realized_outcome: self.realized_outcome,
            outcome_source,
            validator_log: self.validator_log,
            reason: self.reason,
            stale_detection: self.stale_detection,
            validating_since: self.validating_since.map(from_millis),
        })
    }
}

fn decode_all(rows: Vec<StoredPosition>) -> Result<Vec<Position>> {
    rows.into_iter().map(StoredPosition::decode).collect()
}

impl Database {
    // ==================== Admission ====================

    /// Admit a position if its cycle still has room.
    ///
    /// The count check and the insert are one statement, so concurrent
    /// admissions into the same cycle can never exceed `max_entries`.
    /// Failed positions (`no_go`, `error`) do not occupy a slot.
    pub async fn admit_position(&self, new: &NewPosition, max_entries: u32) -> Result<AdmitResult> {
        if let Some(id) = self
            .find_position_id(&new.strategy_id, &new.source_wallet, new.source_trade_id)
            .await?
        {
            return Ok(AdmitResult::Duplicate(id));
        }

        let now = to_millis(Utc::now());
        let entry_price = new.entry_price.to_string();

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO positions (
                strategy_id, price_cycle_id, source_wallet, source_trade_id,
                entry_time, entry_price, status, high_water_price,
                stale_detection, created_at, updated_at
            )
            SELECT ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?
            WHERE (
                SELECT COUNT(*) FROM positions
                WHERE strategy_id = ? AND price_cycle_id = ?
                  AND status NOT IN ('no_go', 'error')
            ) < ?
            ON CONFLICT(strategy_id, source_wallet, source_trade_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&new.strategy_id)
        .bind(new.price_cycle_id)
        .bind(&new.source_wallet)
        .bind(new.source_trade_id)
        .bind(to_millis(new.entry_time))
        .bind(&entry_price)
        .bind(&entry_price)
        .bind(new.stale_detection)
        .bind(now)
        .bind(now)
        .bind(&new.strategy_id)
        .bind(new.price_cycle_id)
        .bind(i64::from(max_entries))
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(AdmitResult::Admitted(id));
        }

        // Lost a race with an identical admission, or the cycle is full
        match self
            .find_position_id(&new.strategy_id, &new.source_wallet, new.source_trade_id)
            .await?
        {
            Some(id) => Ok(AdmitResult::Duplicate(id)),
            None => Ok(AdmitResult::CycleFull),
        }
    }

    async fn find_position_id(
        &self,
        strategy_id: &str,
        wallet: &str,
        trade_id: i64,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM positions WHERE strategy_id = ? AND source_wallet = ? AND source_trade_id = ?",
        )
        .bind(strategy_id)
        .bind(wallet)
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    // ==================== Queries ====================

    pub async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, StoredPosition>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredPosition::decode).transpose()
    }

    /// Positions in `status`, oldest entry first.
    pub async fn get_positions_by_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE status = ? ORDER BY entry_time ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    /// Most recent positions, optionally narrowed by strategy and status.
    pub async fn list_positions(
        &self,
        strategy_id: Option<&str>,
        status: Option<PositionStatus>,
        limit: i64,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(&format!(
            r#"
            SELECT {POSITION_COLUMNS} FROM positions
            WHERE (?1 IS NULL OR strategy_id = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY entry_time DESC, id DESC
            LIMIT ?3
            "#
        ))
        .bind(strategy_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    /// Positions with a realized or shadow outcome entered at or after `since`,
    /// in chronological order.
    pub async fn get_labeled_positions(
        &self,
        strategy_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(&format!(
            r#"
            SELECT {POSITION_COLUMNS} FROM positions
            WHERE strategy_id = ? AND realized_outcome IS NOT NULL AND entry_time >= ?
            ORDER BY entry_time ASC, id ASC
            "#
        ))
        .bind(strategy_id)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    /// Positions past validation entered at or after `since`.
    pub async fn get_validated_since(&self, since: DateTime<Utc>) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(&format!(
            r#"
            SELECT {POSITION_COLUMNS} FROM positions
            WHERE entry_time >= ? AND status IN ('go', 'no_go', 'sold')
            ORDER BY entry_time ASC
            "#
        ))
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    /// Rejected positions entered before `entered_before` with no shadow label yet.
    pub async fn get_unlabeled_rejections(
        &self,
        strategy_id: &str,
        entered_before: DateTime<Utc>,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(&format!(
            r#"
            SELECT {POSITION_COLUMNS} FROM positions
            WHERE strategy_id = ? AND status = 'no_go'
              AND realized_outcome IS NULL AND entry_time < ?
            ORDER BY entry_time ASC
            "#
        ))
        .bind(strategy_id)
        .bind(to_millis(entered_before))
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    // ==================== Transitions ====================
    //
    // Each transition is a single UPDATE guarded by the expected current
    // status. A `false` return means the position was not in that status,
    // i.e. another task already moved it.

    /// `pending -> validating`
    pub async fn begin_validation(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        PositionStatus::Pending.transition(PositionStatus::Validating)?;

        let result = sqlx::query(
            r#"
            UPDATE positions SET status = 'validating', validating_since = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `validating -> go | no_go`
    pub async fn complete_validation(
        &self,
        id: i64,
        decision: PositionStatus,
        validator_log: &str,
        reason: &str,
    ) -> Result<bool> {
        PositionStatus::Validating.transition(decision)?;

        let result = sqlx::query(
            r#"
            UPDATE positions SET status = ?, validator_log = ?, reason = ?, updated_at = ?
            WHERE id = ? AND status = 'validating'
            "#,
        )
        .bind(decision.as_str())
        .bind(validator_log)
        .bind(reason)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Any non-terminal state `-> error`.
    pub async fn mark_position_error(&self, id: i64, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET status = 'error', reason = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'validating', 'go')
            "#,
        )
        .bind(reason)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move positions stuck in `validating` since before `cutoff` to `error`.
    pub async fn sweep_stuck_validations(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE positions SET status = 'error', reason = ?, updated_at = ?
            WHERE status = 'validating' AND validating_since < ?
            RETURNING id
            "#,
        )
        .bind(reason)
        .bind(to_millis(Utc::now()))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Raise the high-water mark of an open position. Never lowers it.
    pub async fn raise_high_water(&self, id: i64, current: Decimal, price: Decimal) -> Result<bool> {
        if price <= current {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE positions SET high_water_price = ?, updated_at = ?
            WHERE id = ? AND status = 'go' AND high_water_price = ?
            "#,
        )
        .bind(price.to_string())
        .bind(to_millis(Utc::now()))
        .bind(id)
        .bind(current.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `go -> sold`, recording the exit and realized outcome.
    pub async fn close_position(
        &self,
        id: i64,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        realized_outcome: f64,
        reason: &str,
    ) -> Result<bool> {
        PositionStatus::Go.transition(PositionStatus::Sold)?;

        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'sold', exit_price = ?, exit_time = ?, realized_outcome = ?,
                outcome_source = 'realized', reason = ?, updated_at = ?
            WHERE id = ? AND status = 'go'
            "#,
        )
        .bind(exit_price.to_string())
        .bind(to_millis(exit_time))
        .bind(realized_outcome)
        .bind(reason)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Attach a counterfactual outcome to a rejected position, once.
    pub async fn record_shadow_outcome(&self, id: i64, outcome: f64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET realized_outcome = ?, outcome_source = 'shadow', updated_at = ?
            WHERE id = ? AND status = 'no_go' AND realized_outcome IS NULL
            "#,
        )
        .bind(outcome)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
