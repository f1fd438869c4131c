//! Validation scheduling: moves pending positions through feature
//! generation and the pattern validator once their snapshot window closes.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::api::{ExecutionAction, ExecutionDelegate, ExecutionRequest};
use crate::db::{Database, StrategyRecord};
use crate::features::{backfill_open, window_closed, FeatureGenerator};
use crate::models::{Position, PositionStatus};

use super::active_filters::ActiveFilters;
use super::validator::{evaluate, ValidationReport};

/// Counts from one validation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidationStats {
    pub go: usize,
    pub no_go: usize,
    pub errored: usize,
}

pub struct ValidationService {
    db: Database,
    filters: ActiveFilters,
    delegate: Arc<dyn ExecutionDelegate>,
}

impl ValidationService {
    pub fn new(db: Database, filters: ActiveFilters, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        Self {
            db,
            filters,
            delegate,
        }
    }

    /// Validate every pending position whose post-entry window has elapsed.
    ///
    /// Positions of strategies missing from `strategies` (disabled) stay pending.
    pub async fn process_pending(
        &self,
        strategies: &HashMap<String, StrategyRecord>,
        now: DateTime<Utc>,
    ) -> Result<ValidationStats> {
        let mut stats = ValidationStats::default();

        for position in self.db.get_positions_by_status(PositionStatus::Pending).await? {
            let Some(strategy) = strategies.get(&position.strategy_id) else {
                continue;
            };
            if !window_closed(position.entry_time, strategy.config.window_after_minutes, now) {
                continue;
            }

            match self.validate_position(&position, strategy, now).await {
                Ok(Some(report)) if report.is_go() => stats.go += 1,
                Ok(Some(_)) => stats.no_go += 1,
                Ok(None) => {}
                Err(e) => {
                    let reason = format!("validation failed: {e:#}");
                    error!(position_id = position.id, error = %reason, "Validation error");
                    match self.db.mark_position_error(position.id, &reason).await {
                        Ok(true) => stats.errored += 1,
                        Ok(false) => {}
                        Err(e) => error!(
                            position_id = position.id,
                            error = %e,
                            "Could not record validation error, leaving position to the timeout sweep"
                        ),
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Returns `None` when another task moved the position first.
    async fn validate_position(
        &self,
        position: &Position,
        strategy: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ValidationReport>> {
        let config = &strategy.config;
        if !self.db.begin_validation(position.id, now).await? {
            return Ok(None);
        }

        let rows = FeatureGenerator::from_config(config)
            .generate(
                &self.db,
                &config.asset,
                position.entry_time,
                config.minute_offsets(),
                now,
            )
            .await;
        self.db.upsert_feature_rows(position.id, &rows).await?;
        let snapshot = self.db.get_feature_snapshot(position.id).await?;

        let filter_set = self.filters.get(&strategy.id).await;
        let report = evaluate(filter_set.as_deref(), &snapshot, config.min_evaluable_rules);
        let summary = report.summary();

        if !self
            .db
            .complete_validation(position.id, report.status(), &report.to_log()?, &summary)
            .await?
        {
            warn!(position_id = position.id, "Position left validating before a decision was stored");
            return Ok(None);
        }

        info!(
            position_id = position.id,
            strategy = %strategy.id,
            decision = report.status().as_str(),
            evaluable = report.evaluable,
            missing_values = snapshot.missing_count(),
            reason = %summary,
            "Candidate validated"
        );

        if report.is_go() {
            let request = ExecutionRequest::new(
                ExecutionAction::Open,
                position.id,
                &strategy.id,
                &config.asset,
                position.entry_price,
                now,
            );
            if let Err(e) = self.delegate.open_position(&request).await {
                warn!(position_id = position.id, error = %e, "Open notification failed, not retrying");
            }
        }

        Ok(Some(report))
    }

    /// Fill snapshot values that were unavailable at validation time, for
    /// positions still inside their backfill grace period.
    ///
    /// Returns the number of positions whose snapshot gained values.
    pub async fn backfill(
        &self,
        strategies: &HashMap<String, StrategyRecord>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let longest = strategies
            .values()
            .map(|s| i64::from(s.config.window_after_minutes) + s.config.backfill_grace_minutes)
            .max()
            .unwrap_or(0);

        let mut updated = 0;
        for position in self.db.get_validated_since(now - Duration::minutes(longest)).await? {
            let Some(strategy) = strategies.get(&position.strategy_id) else {
                continue;
            };
            if !backfill_open(position.entry_time, &strategy.config, now) {
                continue;
            }

            let before = self.db.get_feature_snapshot(position.id).await?;
            let expected = strategy.config.minute_offsets().count();
            if before.rows.len() == expected && before.missing_count() == 0 {
                continue;
            }

            let rows = FeatureGenerator::from_config(&strategy.config)
                .generate(
                    &self.db,
                    &strategy.config.asset,
                    position.entry_time,
                    strategy.config.minute_offsets(),
                    now,
                )
                .await;
            self.db.upsert_feature_rows(position.id, &rows).await?;

            let after = self.db.get_feature_snapshot(position.id).await?;
            if after.missing_count() < before.missing_count() || after.rows.len() > before.rows.len() {
                updated += 1;
            }
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::RecordingDelegate;
    use crate::db::AdmitResult;
    use crate::models::{Feature, FilterRule, NewPosition, PricePoint};
    use crate::trading::StrategyConfig;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn entry() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    async fn setup() -> (Database, HashMap<String, StrategyRecord>, i64) {
        let db = Database::in_memory().await.unwrap();
        let config = StrategyConfig {
            window_before_minutes: 2,
            window_after_minutes: 1,
            ..Default::default()
        };
        db.save_strategy("s1", &config).await.unwrap();

        // One tick per 20s from -3m to +1m
        for i in -9..=3 {
            let price = Decimal::from(100 + i);
            db.insert_price_point(&PricePoint::new("BTC", price, entry() + Duration::seconds(i * 20)))
                .await
                .unwrap();
        }

        let AdmitResult::Admitted(id) = db
            .admit_position(
                &NewPosition {
                    strategy_id: "s1".to_string(),
                    price_cycle_id: 1,
                    source_wallet: "0xabc".to_string(),
                    source_trade_id: 1,
                    entry_time: entry(),
                    entry_price: dec!(100),
                    stale_detection: false,
                },
                3,
            )
            .await
            .unwrap()
        else {
            panic!("expected admission");
        };

        let strategies = HashMap::from([(
            "s1".to_string(),
            StrategyRecord {
                id: "s1".to_string(),
                config,
                enabled: true,
            },
        )]);
        (db, strategies, id)
    }

    #[tokio::test]
    async fn test_waits_for_window_then_goes_without_filter() {
        let (db, strategies, id) = setup().await;
        let delegate = Arc::new(RecordingDelegate::default());
        let service = ValidationService::new(db.clone(), ActiveFilters::new(), delegate.clone());

        let stats = service.process_pending(&strategies, entry() + Duration::seconds(30)).await.unwrap();
        assert_eq!(stats, ValidationStats::default());

        let stats = service.process_pending(&strategies, entry() + Duration::minutes(1)).await.unwrap();
        assert_eq!(stats.go, 1);

        let position = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Go);
        assert_eq!(position.reason.as_deref(), Some("no active filter set"));
        assert_eq!(delegate.opened.lock().unwrap().len(), 1);

        let snapshot = db.get_feature_snapshot(id).await.unwrap();
        assert_eq!(snapshot.rows.len(), 4);
        assert_eq!(snapshot.value(Feature::PriceClose, 0), Some(100.0));
        assert_eq!(snapshot.value(Feature::PriceClose, 1), Some(103.0));
    }

    #[tokio::test]
    async fn test_unrecordable_error_does_not_stop_the_pass() {
        let (db, strategies, broken) = setup().await;
        let AdmitResult::Admitted(healthy) = db
            .admit_position(
                &NewPosition {
                    strategy_id: "s1".to_string(),
                    price_cycle_id: 1,
                    source_wallet: "0xabc".to_string(),
                    source_trade_id: 2,
                    entry_time: entry(),
                    entry_price: dec!(100),
                    stale_detection: false,
                },
                3,
            )
            .await
            .unwrap()
        else {
            panic!("expected admission");
        };

        // Every status write for the first position fails, including the error record
        db.execute_sql(&format!(
            "CREATE TRIGGER fail_status BEFORE UPDATE OF status ON positions WHEN OLD.id = {broken} \
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END"
        ))
        .await
        .unwrap();

        let service = ValidationService::new(db.clone(), ActiveFilters::new(), Arc::new(RecordingDelegate::default()));
        let stats = service.process_pending(&strategies, entry() + Duration::minutes(1)).await.unwrap();
        assert_eq!(stats.go, 1);
        assert_eq!(stats.errored, 0);

        assert_eq!(db.get_position(healthy).await.unwrap().unwrap().status, PositionStatus::Go);
        assert_eq!(db.get_position(broken).await.unwrap().unwrap().status, PositionStatus::Pending);
    }

    #[tokio::test]
    async fn test_failing_rule_rejects_with_log() {
        let (db, strategies, id) = setup().await;
        let filters = ActiveFilters::new();
        let set = db
            .activate_filter_set(
                "s1",
                "tight",
                &[FilterRule::new(Feature::PriceChangePct, 0, 10.0, 20.0)],
                None,
            )
            .await
            .unwrap();
        filters.install(set).await;

        let delegate = Arc::new(RecordingDelegate::default());
        let service = ValidationService::new(db.clone(), filters, delegate.clone());
        let stats = service.process_pending(&strategies, entry() + Duration::minutes(2)).await.unwrap();
        assert_eq!(stats.no_go, 1);

        let position = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::NoGo);
        assert!(position.reason.unwrap().starts_with("rules failed"));
        let log: ValidationReport = serde_json::from_str(&position.validator_log.unwrap()).unwrap();
        assert_eq!(log.failed, 1);
        assert!(delegate.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_fills_late_data_within_grace() {
        let (db, strategies, id) = setup().await;
        let service = ValidationService::new(db.clone(), ActiveFilters::new(), Arc::new(RecordingDelegate::default()));
        service.process_pending(&strategies, entry() + Duration::minutes(1)).await.unwrap();
        assert_eq!(db.get_feature_snapshot(id).await.unwrap().value(Feature::BidDepth, 0), None);

        db.insert_book_snapshot(&crate::models::BookSnapshot {
            asset: "BTC".to_string(),
            timestamp: entry() - Duration::seconds(10),
            best_bid: 99.0,
            best_ask: 101.0,
            bid_depth: 5.0,
            ask_depth: 5.0,
        })
        .await
        .unwrap();

        let updated = service.backfill(&strategies, entry() + Duration::minutes(5)).await.unwrap();
        assert_eq!(updated, 1);
        let snapshot = db.get_feature_snapshot(id).await.unwrap();
        assert_eq!(snapshot.value(Feature::BidDepth, 0), Some(5.0));
        // Previously stored values are untouched
        assert_eq!(snapshot.value(Feature::PriceClose, 0), Some(100.0));

        // Outside the grace period nothing is touched
        let updated = service.backfill(&strategies, entry() + Duration::hours(2)).await.unwrap();
        assert_eq!(updated, 0);
    }
}
