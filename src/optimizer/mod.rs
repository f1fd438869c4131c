//! Filter optimizer: learns a strategy's filter set from labeled history.
//!
//! A run:
//! - labels every position with an outcome as good or bad
//! - mines single-feature rules from good-trade percentiles
//! - scores rule combinations on a chronological holdout
//! - swaps in the best scenario if it beats the active set
//!
//! Every scored scenario is written to the audit trail whether or not it
//! was selected.

mod candidates;
mod search;

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Database, StrategyRecord};
use crate::models::{FeatureSnapshot, FilterSet, ScenarioDescriptor, ScenarioResult};
use crate::trading::ActiveFilters;

use search::search;

/// One labeled position as seen by the optimizer.
#[derive(Debug, Clone)]
pub struct LabeledSample {
    pub position_id: i64,
    pub entry_time: DateTime<Utc>,
    pub outcome: f64,
    pub good: bool,
    pub snapshot: FeatureSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OptimizerOutcome {
    Replaced { filter_set: FilterSet, score: f64 },
    Retained { best_score: Option<f64> },
    InsufficientData { samples: usize },
}

impl OptimizerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerOutcome::Replaced { .. } => "replaced",
            OptimizerOutcome::Retained { .. } => "retained",
            OptimizerOutcome::InsufficientData { .. } => "insufficient_data",
        }
    }
}

pub struct FilterOptimizer {
    db: Database,
    filters: ActiveFilters,
}

impl FilterOptimizer {
    pub fn new(db: Database, filters: ActiveFilters) -> Self {
        Self { db, filters }
    }

    /// Load labeled samples entered within the longest lookback, oldest first.
    pub async fn load_samples(&self, strategy: &StrategyRecord, now: DateTime<Utc>) -> Result<Vec<LabeledSample>> {
        let config = &strategy.config;
        let longest = config.optimizer.lookback_days.iter().copied().max().unwrap_or(0);
        let since = now - Duration::days(longest);

        let positions = self.db.get_labeled_positions(&strategy.id, since).await?;
        let mut snapshots = self.db.get_labeled_snapshots(&strategy.id, since).await?;

        Ok(positions
            .into_iter()
            .filter_map(|p| {
                let outcome = p.realized_outcome?;
                Some(LabeledSample {
                    position_id: p.id,
                    entry_time: p.entry_time,
                    outcome,
                    good: outcome >= config.good_trade_return_threshold,
                    snapshot: snapshots.remove(&p.id).unwrap_or_else(|| FeatureSnapshot::new(p.id)),
                })
            })
            .collect())
    }

    /// Run one optimization pass for `strategy`.
    pub async fn run(&self, strategy: &StrategyRecord, now: DateTime<Utc>) -> Result<OptimizerOutcome> {
        let run_id = Uuid::new_v4().to_string();
        self.db.start_optimizer_run(&run_id, &strategy.id, now).await?;

        let result = self.run_inner(&run_id, strategy, now).await;
        if let Err(e) = &result {
            let message = format!("{e:#}");
            warn!(run_id = %run_id, strategy = %strategy.id, error = %message, "Optimizer run failed");
            self.db
                .finish_optimizer_run(&run_id, 0, 0, "error", None, &message)
                .await?;
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: &str,
        strategy: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<OptimizerOutcome> {
        let config = strategy.config.clone();
        let samples = self.load_samples(strategy, now).await?;
        let labeled = samples.len();

        if labeled < config.optimizer.min_labeled_samples {
            let outcome = OptimizerOutcome::InsufficientData { samples: labeled };
            let message = format!(
                "{} labeled samples, {} required",
                labeled, config.optimizer.min_labeled_samples
            );
            info!(run_id = %run_id, strategy = %strategy.id, %message, "Optimizer skipped");
            self.db
                .finish_optimizer_run(run_id, labeled, 0, outcome.as_str(), None, &message)
                .await?;
            return Ok(outcome);
        }

        let incumbent = self.db.get_active_filter_set(&strategy.id).await?;
        let incumbent_rules = incumbent.as_ref().map(|s| s.rules.clone());
        let deadline = Instant::now() + std::time::Duration::from_millis(config.optimizer.time_budget_ms);

        let started = Instant::now();
        let report = tokio::task::spawn_blocking(move || {
            search(
                &samples,
                incumbent_rules.as_deref(),
                config.minute_offsets(),
                config.min_evaluable_rules,
                now,
                &config.optimizer,
                deadline,
            )
        })
        .await
        .context("Scenario search panicked")?;

        let mut audit: Vec<ScenarioResult> = report
            .scenarios
            .iter()
            .enumerate()
            .map(|(i, s)| ScenarioResult {
                run_id: run_id.to_string(),
                descriptor: s.descriptor.clone(),
                bad_removed_pct: s.score.bad_removed_pct,
                good_kept_pct: s.score.good_kept_pct,
                score: s.score.score,
                selected: report.best == Some(i),
            })
            .collect();
        if let (Some(set), Some(score)) = (&incumbent, report.incumbent) {
            audit.push(ScenarioResult {
                run_id: run_id.to_string(),
                descriptor: ScenarioDescriptor::incumbent(&set.rules),
                bad_removed_pct: score.bad_removed_pct,
                good_kept_pct: score.good_kept_pct,
                score: score.score,
                selected: false,
            });
        }
        self.db.save_scenario_results(&audit).await?;

        let scenarios = report.scenarios.len();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let Some(best) = report.best() else {
            let best_score = report
                .scenarios
                .iter()
                .map(|s| s.score.score)
                .max_by(f64::total_cmp);
            let message = format!(
                "no scenario beat the active set ({} scenarios{})",
                scenarios,
                if report.truncated { ", truncated" } else { "" }
            );
            info!(
                run_id = %run_id,
                strategy = %strategy.id,
                samples = labeled,
                scenarios,
                elapsed_ms,
                "Optimizer kept active filter set"
            );
            let outcome = OptimizerOutcome::Retained { best_score };
            self.db
                .finish_optimizer_run(run_id, labeled, scenarios, outcome.as_str(), None, &message)
                .await?;
            return Ok(outcome);
        };

        let name = format!("auto-{}", &run_id[..8]);
        let set = self
            .db
            .activate_filter_set(&strategy.id, &name, &best.rules, Some(run_id))
            .await?;
        self.filters.install(set.clone()).await;

        let message = format!(
            "bad removed {:.1}%, good kept {:.1}% on {} holdout samples",
            best.score.bad_removed_pct, best.score.good_kept_pct, report.holdout_size
        );
        info!(
            run_id = %run_id,
            strategy = %strategy.id,
            filter_set_id = set.id,
            version = set.version,
            rules = ?best.descriptor.rules,
            score = best.score.score,
            samples = labeled,
            scenarios,
            elapsed_ms,
            "Optimizer activated new filter set"
        );
        self.db
            .finish_optimizer_run(run_id, labeled, scenarios, "replaced", Some(set.id), &message)
            .await?;

        Ok(OptimizerOutcome::Replaced {
            filter_set: set,
            score: best.score.score,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::LabeledSample;
    use crate::models::{Feature, FeatureRow, FeatureSnapshot};

    pub fn base_time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// Sample `i`, entered `i` minutes after `base_time`, with the given
    /// (feature, offset, value) triples set.
    pub fn sample(i: i64, good: bool, values: &[(Feature, i32, f64)]) -> LabeledSample {
        let mut snapshot = FeatureSnapshot::new(i);
        for &(feature, offset, value) in values {
            snapshot
                .rows
                .entry(offset)
                .or_insert_with(FeatureRow::default)
                .set(feature, Some(value));
        }
        LabeledSample {
            position_id: i,
            entry_time: base_time() + Duration::minutes(i),
            outcome: if good { 0.02 } else { -0.02 },
            good,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::fixtures::base_time;
    use super::*;
    use crate::db::AdmitResult;
    use crate::models::{Feature, FeatureRow, FilterRule, NewPosition, PositionStatus};
    use crate::trading::StrategyConfig;
    use rust_decimal_macros::dec;

    fn strategy() -> StrategyRecord {
        StrategyRecord {
            id: "s1".to_string(),
            config: StrategyConfig {
                window_before_minutes: 0,
                window_after_minutes: 0,
                ..Default::default()
            },
            enabled: true,
        }
    }

    /// Store `n` sold positions; `spread(i)` gives each one's spread at offset 0.
    async fn seed(db: &Database, n: i64, spread: impl Fn(i64) -> f64) {
        for i in 0..n {
            let entry = base_time() + Duration::minutes(i);
            let AdmitResult::Admitted(id) = db
                .admit_position(
                    &NewPosition {
                        strategy_id: "s1".to_string(),
                        price_cycle_id: i,
                        source_wallet: "0xabc".to_string(),
                        source_trade_id: i,
                        entry_time: entry,
                        entry_price: dec!(100),
                        stale_detection: false,
                    },
                    10,
                )
                .await
                .unwrap()
            else {
                panic!("expected admission");
            };
            db.begin_validation(id, entry).await.unwrap();
            db.complete_validation(id, PositionStatus::Go, "{}", "no active filter set")
                .await
                .unwrap();

            let good = i % 2 == 0;
            let (exit, outcome) = if good { (dec!(102), 0.02) } else { (dec!(98), -0.02) };
            db.close_position(id, exit, entry + Duration::minutes(30), outcome, "trailing stop")
                .await
                .unwrap();

            let mut row = FeatureRow::default();
            row.set(Feature::SpreadPct, Some(spread(i)));
            db.upsert_feature_rows(id, &BTreeMap::from([(0, row)])).await.unwrap();
        }
    }

    fn now() -> DateTime<Utc> {
        base_time() + Duration::days(1)
    }

    #[tokio::test]
    async fn test_insufficient_data_is_recorded() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 5, |_| 0.1).await;
        let optimizer = FilterOptimizer::new(db.clone(), ActiveFilters::new());

        let outcome = optimizer.run(&strategy(), now()).await.unwrap();
        assert_eq!(outcome.as_str(), "insufficient_data");

        let runs = db.list_optimizer_runs("s1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome.as_deref(), Some("insufficient_data"));
        assert_eq!(runs[0].labeled_samples, 5);
    }

    #[tokio::test]
    async fn test_separating_feature_replaces_active_set() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 60, |i| if i % 2 == 0 { 0.1 + 0.01 * (i % 7) as f64 } else { 0.9 }).await;
        let filters = ActiveFilters::new();
        let optimizer = FilterOptimizer::new(db.clone(), filters.clone());

        let OptimizerOutcome::Replaced { filter_set, score } = optimizer.run(&strategy(), now()).await.unwrap() else {
            panic!("expected a new filter set");
        };
        assert!(score > 0.0);
        assert_eq!(filter_set.rules[0].feature, Feature::SpreadPct);
        assert!(filter_set.name.starts_with("auto-"));

        assert_eq!(filters.get("s1").await.map(|s| s.id), Some(filter_set.id));
        assert_eq!(db.get_active_filter_set("s1").await.unwrap().map(|s| s.id), Some(filter_set.id));

        let run_id = filter_set.run_id.clone().unwrap();
        let results = db.get_scenario_results(&run_id).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results.iter().filter(|r| r.selected).count(), 1);
    }

    #[tokio::test]
    async fn test_no_signal_leaves_active_set_unchanged() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 60, |i| 0.1 + 0.01 * ((i / 2) % 10) as f64).await;
        let existing = db
            .activate_filter_set("s1", "manual", &[FilterRule::new(Feature::SpreadPct, 0, 0.0, 1.0)], None)
            .await
            .unwrap();
        let filters = ActiveFilters::new();
        filters.install(existing.clone()).await;
        let optimizer = FilterOptimizer::new(db.clone(), filters.clone());

        let outcome = optimizer.run(&strategy(), now()).await.unwrap();
        assert_eq!(outcome.as_str(), "retained");
        assert_eq!(db.get_active_filter_set("s1").await.unwrap().map(|s| s.id), Some(existing.id));
        assert_eq!(filters.get("s1").await.map(|s| s.id), Some(existing.id));
        assert_eq!(db.list_filter_sets("s1").await.unwrap().len(), 1);
    }
}
