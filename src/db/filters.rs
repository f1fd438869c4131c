use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{from_millis, to_millis, Database};
use crate::models::{Feature, FilterRule, FilterSet, ScenarioResult};

/// Filter set header for history listings.
#[derive(Debug, Clone, Serialize)]
pub struct FilterSetSummary {
    pub id: i64,
    pub version: i64,
    pub name: String,
    pub rule_count: i64,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// One optimizer run, as recorded in the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerRunRecord {
    pub run_id: String,
    pub strategy_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub labeled_samples: i64,
    pub scenarios_evaluated: i64,
    pub outcome: Option<String>,
    pub selected_filter_set_id: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredFilterSet {
    id: i64,
    strategy_id: String,
    version: i64,
    name: String,
    run_id: Option<String>,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredRule {
    feature: String,
    minute_offset: i32,
    lower_bound: f64,
    upper_bound: f64,
    is_ratio: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredRun {
    run_id: String,
    strategy_id: String,
    started_at: i64,
    finished_at: Option<i64>,
    labeled_samples: i64,
    scenarios_evaluated: i64,
    outcome: Option<String>,
    selected_filter_set_id: Option<i64>,
    message: Option<String>,
}

impl From<StoredRun> for OptimizerRunRecord {
    fn from(row: StoredRun) -> Self {
        Self {
            run_id: row.run_id,
            strategy_id: row.strategy_id,
            started_at: from_millis(row.started_at),
            finished_at: row.finished_at.map(from_millis),
            labeled_samples: row.labeled_samples,
            scenarios_evaluated: row.scenarios_evaluated,
            outcome: row.outcome,
            selected_filter_set_id: row.selected_filter_set_id,
            message: row.message,
        }
    }
}

impl Database {
    // ==================== Filter Sets ====================

    /// Persist a new immutable filter set and make it the strategy's active set.
    ///
    /// Insert, retirement of the previous set, and the pointer swap happen in
    /// one transaction: readers see either the old set or the new one.
    pub async fn activate_filter_set(
        &self,
        strategy_id: &str,
        name: &str,
        rules: &[FilterRule],
        run_id: Option<&str>,
    ) -> Result<FilterSet> {
        let now = Utc::now();
        let ts = to_millis(now);
        let mut tx = self.pool.begin().await?;

        let (version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM filter_sets WHERE strategy_id = ?",
        )
        .bind(strategy_id)
        .fetch_one(&mut *tx)
        .await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO filter_sets (strategy_id, version, name, run_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(strategy_id)
        .bind(version)
        .bind(name)
        .bind(run_id)
        .bind(ts)
        .fetch_one(&mut *tx)
        .await?;

        for (index, rule) in rules.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO filter_rules
                    (filter_set_id, rule_index, feature, minute_offset, lower_bound, upper_bound, is_ratio)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(index as i64)
            .bind(rule.feature.as_str())
            .bind(rule.minute_offset)
            .bind(rule.lower_bound)
            .bind(rule.upper_bound)
            .bind(rule.is_ratio)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE filter_sets SET retired_at = ?
            WHERE id = (SELECT filter_set_id FROM active_filter_sets WHERE strategy_id = ?)
            "#,
        )
        .bind(ts)
        .bind(strategy_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO active_filter_sets (strategy_id, filter_set_id, activated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(strategy_id) DO UPDATE SET
                filter_set_id = excluded.filter_set_id,
                activated_at = excluded.activated_at
            "#,
        )
        .bind(strategy_id)
        .bind(id)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(FilterSet {
            id,
            strategy_id: strategy_id.to_string(),
            version,
            name: name.to_string(),
            rules: rules.to_vec(),
            created_at: from_millis(ts),
            run_id: run_id.map(str::to_string),
        })
    }

    /// The strategy's active filter set, if one was ever activated.
    pub async fn get_active_filter_set(&self, strategy_id: &str) -> Result<Option<FilterSet>> {
        let pointer: Option<(i64,)> =
            sqlx::query_as("SELECT filter_set_id FROM active_filter_sets WHERE strategy_id = ?")
                .bind(strategy_id)
                .fetch_optional(&self.pool)
                .await?;

        match pointer {
            Some((id,)) => self.get_filter_set(id).await,
            None => Ok(None),
        }
    }

    pub async fn get_filter_set(&self, id: i64) -> Result<Option<FilterSet>> {
        let Some(header) = sqlx::query_as::<_, StoredFilterSet>(
            "SELECT id, strategy_id, version, name, run_id, created_at FROM filter_sets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, StoredRule>(
            r#"
            SELECT feature, minute_offset, lower_bound, upper_bound, is_ratio
            FROM filter_rules WHERE filter_set_id = ? ORDER BY rule_index
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let rules = rows
            .into_iter()
            .map(|r| {
                let feature: Feature = r
                    .feature
                    .parse()
                    .with_context(|| format!("filter set {id}"))?;
                Ok(FilterRule {
                    feature,
                    minute_offset: r.minute_offset,
                    lower_bound: r.lower_bound,
                    upper_bound: r.upper_bound,
                    is_ratio: r.is_ratio,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(FilterSet {
            id: header.id,
            strategy_id: header.strategy_id,
            version: header.version,
            name: header.name,
            rules,
            created_at: from_millis(header.created_at),
            run_id: header.run_id,
        }))
    }

    /// Every filter set a strategy has had, newest first.
    pub async fn list_filter_sets(&self, strategy_id: &str) -> Result<Vec<FilterSetSummary>> {
        let rows: Vec<(i64, i64, String, i64, i64, Option<i64>, bool)> = sqlx::query_as(
            r#"
            SELECT s.id, s.version, s.name,
                   (SELECT COUNT(*) FROM filter_rules r WHERE r.filter_set_id = s.id),
                   s.created_at, s.retired_at,
                   EXISTS(SELECT 1 FROM active_filter_sets a WHERE a.filter_set_id = s.id)
            FROM filter_sets s
            WHERE s.strategy_id = ?
            ORDER BY s.version DESC
            "#,
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, version, name, rule_count, created_at, retired_at, active)| FilterSetSummary {
                    id,
                    version,
                    name,
                    rule_count,
                    created_at: from_millis(created_at),
                    retired_at: retired_at.map(from_millis),
                    active,
                },
            )
            .collect())
    }

    // ==================== Optimizer Audit ====================

    pub async fn start_optimizer_run(
        &self,
        run_id: &str,
        strategy_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO optimizer_runs (run_id, strategy_id, started_at) VALUES (?, ?, ?)")
            .bind(run_id)
            .bind(strategy_id)
            .bind(to_millis(started_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn finish_optimizer_run(
        &self,
        run_id: &str,
        labeled_samples: usize,
        scenarios_evaluated: usize,
        outcome: &str,
        selected_filter_set_id: Option<i64>,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE optimizer_runs
            SET finished_at = ?, labeled_samples = ?, scenarios_evaluated = ?,
                outcome = ?, selected_filter_set_id = ?, message = ?
            WHERE run_id = ?
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(labeled_samples as i64)
        .bind(scenarios_evaluated as i64)
        .bind(outcome)
        .bind(selected_filter_set_id)
        .bind(message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append scenario audit rows for a run.
    pub async fn save_scenario_results(&self, results: &[ScenarioResult]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                r#"
                INSERT INTO scenario_results
                    (run_id, descriptor, bad_removed_pct, good_kept_pct, score, selected)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&result.run_id)
            .bind(serde_json::to_string(&result.descriptor)?)
            .bind(result.bad_removed_pct)
            .bind(result.good_kept_pct)
            .bind(result.score)
            .bind(result.selected)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn get_scenario_results(&self, run_id: &str) -> Result<Vec<ScenarioResult>> {
        let rows: Vec<(String, String, f64, f64, f64, bool)> = sqlx::query_as(
            r#"
            SELECT run_id, descriptor, bad_removed_pct, good_kept_pct, score, selected
            FROM scenario_results WHERE run_id = ? ORDER BY score DESC, id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(run_id, descriptor, bad_removed_pct, good_kept_pct, score, selected)| {
                Ok(ScenarioResult {
                    run_id,
                    descriptor: serde_json::from_str(&descriptor)
                        .context("Invalid scenario descriptor")?,
                    bad_removed_pct,
                    good_kept_pct,
                    score,
                    selected,
                })
            })
            .collect()
    }

    /// Optimizer runs for a strategy, newest first.
    pub async fn list_optimizer_runs(&self, strategy_id: &str, limit: i64) -> Result<Vec<OptimizerRunRecord>> {
        let rows = sqlx::query_as::<_, StoredRun>(
            r#"
            SELECT run_id, strategy_id, started_at, finished_at, labeled_samples,
                   scenarios_evaluated, outcome, selected_filter_set_id, message
            FROM optimizer_runs WHERE strategy_id = ?
            ORDER BY started_at DESC LIMIT ?
            "#,
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OptimizerRunRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScenarioDescriptor;

    #[tokio::test]
    async fn test_activation_swaps_pointer_and_retires_previous() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.get_active_filter_set("s1").await.unwrap().is_none());

        let v1 = db
            .activate_filter_set("s1", "manual", &[FilterRule::new(Feature::SpreadPct, 0, 0.0, 0.2)], None)
            .await
            .unwrap();
        let v2 = db
            .activate_filter_set(
                "s1",
                "optimized",
                &[
                    FilterRule::new(Feature::BookImbalance, -3, -0.1, 0.5),
                    FilterRule::new(Feature::BuySellRatio, -1, 0.8, 3.0),
                ],
                Some("run-1"),
            )
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let active = db.get_active_filter_set("s1").await.unwrap().unwrap();
        assert_eq!(active, v2);

        let history = db.list_filter_sets("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].active && history[0].retired_at.is_none());
        assert!(!history[1].active && history[1].retired_at.is_some());
        assert_eq!(history[0].rule_count, 2);

        // Old set stays readable for audit
        let old = db.get_filter_set(v1.id).await.unwrap().unwrap();
        assert_eq!(old.rules, v1.rules);
    }

    #[tokio::test]
    async fn test_optimizer_audit_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        db.start_optimizer_run("run-1", "s1", Utc::now()).await.unwrap();

        let results = vec![ScenarioResult {
            run_id: "run-1".to_string(),
            descriptor: ScenarioDescriptor {
                lookback_days: 7,
                percentile_low: 5.0,
                percentile_high: 95.0,
                ratio_only: true,
                rule_count: 1,
                rules: vec!["spread_pct@+0".to_string()],
            },
            bad_removed_pct: 40.0,
            good_kept_pct: 90.0,
            score: 40.0,
            selected: true,
        }];
        db.save_scenario_results(&results).await.unwrap();
        db.finish_optimizer_run("run-1", 30, 1, "replaced", Some(3), "ok")
            .await
            .unwrap();

        assert_eq!(db.get_scenario_results("run-1").await.unwrap(), results);
        let runs = db.list_optimizer_runs("s1", 10).await.unwrap();
        assert_eq!(runs[0].outcome.as_deref(), Some("replaced"));
        assert_eq!(runs[0].scenarios_evaluated, 1);
    }
}
