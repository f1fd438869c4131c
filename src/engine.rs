//! Engine runner: independently scheduled tasks over the shared store.
//!
//! Handles:
//! - Applying new price samples to cycle trackers and the trailing-stop monitor
//! - Polling tracked wallets and admitting candidates
//! - Maintenance: validation, backfill, stuck-state sweep, shadow labeling, pruning
//! - Periodic filter optimization
//!
//! Tasks share no in-memory state besides the active filter handle; every
//! coordination point is a conditional write in the database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{DryRunDelegate, ExecutionDelegate, WebhookDelegate};
use crate::cycles::{CycleTracker, TrackerHealth};
use crate::db::{Database, StrategyRecord};
use crate::optimizer::FilterOptimizer;
use crate::trading::{
    ActiveFilters, Admission, EngineConfig, EntryPipeline, ShadowLabeler, StrategyConfig, TradeOutcome,
    TrailingStopMonitor, ValidationService,
};

const PRICE_BATCH: i64 = 500;
const OPTIMIZER_CHECK_SECS: u64 = 60;
const SWEEP_REASON: &str = "validation timed out";

/// Price polling state for one asset.
pub struct AssetFeed {
    tracker: CycleTracker,
    /// Timestamp of the newest sample applied
    cursor: Option<DateTime<Utc>>,
    health: TrackerHealth,
}

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub validated: usize,
    pub backfilled: usize,
    pub swept: usize,
    pub labeled: usize,
    pub pruned: u64,
}

pub struct Engine {
    config: EngineConfig,
    db: Database,
    filters: ActiveFilters,
    pipeline: EntryPipeline,
    validation: ValidationService,
    monitor: TrailingStopMonitor,
    labeler: ShadowLabeler,
    optimizer: FilterOptimizer,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(db: Database, config: EngineConfig) -> Result<Self> {
        let delegate: Arc<dyn ExecutionDelegate> = match (&config.execution_webhook, config.dry_run) {
            (Some(url), false) => {
                info!(url = %url, "Execution webhook configured");
                Arc::new(WebhookDelegate::new(url.clone())?)
            }
            (None, false) => anyhow::bail!("live mode requires an execution webhook"),
            (_, true) => Arc::new(DryRunDelegate),
        };
        Ok(Self::with_delegate(db, config, delegate))
    }

    pub fn with_delegate(db: Database, config: EngineConfig, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        let filters = ActiveFilters::new();
        Self {
            pipeline: EntryPipeline::new(db.clone()),
            validation: ValidationService::new(db.clone(), filters.clone(), delegate.clone()),
            monitor: TrailingStopMonitor::new(db.clone(), delegate),
            labeler: ShadowLabeler::new(db.clone()),
            optimizer: FilterOptimizer::new(db.clone(), filters.clone()),
            filters,
            config,
            db,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run every task until ctrl-c.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let strategies = self.enabled_strategies().await?;
        self.filters
            .refresh(&self.db, &strategies.keys().cloned().collect::<Vec<_>>())
            .await?;
        info!(
            strategies = strategies.len(),
            dry_run = self.config.dry_run,
            "Starting engine"
        );

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let tasks = vec![
            tokio::spawn(Arc::clone(&self).price_loop()),
            tokio::spawn(Arc::clone(&self).wallet_loop()),
            tokio::spawn(Arc::clone(&self).maintenance_loop()),
            tokio::spawn(Arc::clone(&self).optimizer_loop()),
        ];
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Engine task panicked");
            }
        }

        info!("Engine stopped");
        Ok(())
    }

    fn running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    async fn price_loop(self: Arc<Self>) {
        let mut ticker = interval(StdDuration::from_millis(self.config.price_poll_ms));
        let mut feeds = HashMap::new();
        while self.running() {
            ticker.tick().await;
            if let Err(e) = self.price_pass(&mut feeds, Utc::now()).await {
                error!(error = %e, "Error in price pass");
            }
        }
    }

    async fn wallet_loop(self: Arc<Self>) {
        let mut ticker = interval(StdDuration::from_secs(self.config.wallet_poll_secs));
        while self.running() {
            ticker.tick().await;
            if let Err(e) = self.wallet_pass(Utc::now()).await {
                error!(error = %e, "Error in wallet pass");
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = interval(StdDuration::from_secs(self.config.maintenance_secs));
        while self.running() {
            ticker.tick().await;
            if let Err(e) = self.maintenance_pass(Utc::now()).await {
                error!(error = %e, "Error in maintenance pass");
            }
        }
    }

    async fn optimizer_loop(self: Arc<Self>) {
        let mut ticker = interval(StdDuration::from_secs(OPTIMIZER_CHECK_SECS));
        let mut last_runs: HashMap<String, DateTime<Utc>> = HashMap::new();
        while self.running() {
            ticker.tick().await;
            if let Err(e) = self.optimizer_pass(&mut last_runs, Utc::now()).await {
                error!(error = %e, "Error in optimizer pass");
            }
        }
    }

    async fn enabled_strategies(&self) -> Result<HashMap<String, StrategyRecord>> {
        Ok(self
            .db
            .list_strategies()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id.clone(), s))
            .collect())
    }

    // ==================== Prices ====================

    /// Apply every new sample, per asset, to the cycle tracker and then to
    /// the trailing-stop monitor. Returns the number of samples applied.
    pub async fn price_pass(&self, feeds: &mut HashMap<String, AssetFeed>, now: DateTime<Utc>) -> Result<usize> {
        let strategies = self.enabled_strategies().await?;
        let configs: HashMap<String, StrategyConfig> = strategies
            .iter()
            .map(|(id, s)| (id.clone(), s.config.clone()))
            .collect();

        let mut thresholds: HashMap<String, Vec<Decimal>> = HashMap::new();
        for config in configs.values() {
            thresholds.entry(config.asset.clone()).or_default().push(config.threshold);
        }
        feeds.retain(|asset, _| thresholds.contains_key(asset));

        let mut applied = 0;
        for (asset, asset_thresholds) in thresholds {
            if !feeds.contains_key(&asset) {
                let feed = self.open_feed(&asset, &asset_thresholds).await?;
                feeds.insert(asset.clone(), feed);
            }
            let Some(feed) = feeds.get_mut(&asset) else {
                continue;
            };
            feed.tracker.set_thresholds(asset_thresholds);

            let points = match feed.cursor {
                Some(cursor) => self.db.get_prices_after(&asset, cursor, PRICE_BATCH).await?,
                None => self.db.get_latest_price(&asset).await?.into_iter().collect(),
            };

            // The cursor only moves past a sample once it is fully applied;
            // a failed sample is retried from the same point next pass.
            for point in &points {
                let outcome = feed.tracker.on_price(point).await;
                if !outcome.is_complete() {
                    warn!(
                        asset = %asset,
                        timestamp = %point.timestamp,
                        thresholds = ?outcome.failed,
                        "Cycle update incomplete, retrying sample next pass"
                    );
                    break;
                }
                if let Err(e) = self.monitor.on_tick(point, &configs).await {
                    error!(asset = %asset, error = %e, "Trailing-stop monitor failed, retrying sample next pass");
                    break;
                }
                feed.cursor = Some(point.timestamp);
                applied += 1;
            }

            let health = feed.tracker.health(now);
            if health != feed.health {
                match health {
                    TrackerHealth::Healthy => info!(asset = %asset, "Price feed recovered"),
                    TrackerHealth::Degraded { silent_for_secs } => warn!(
                        asset = %asset,
                        silent_for_secs,
                        "Price feed silent, cycles held open"
                    ),
                }
                feed.health = health;
            }
        }

        Ok(applied)
    }

    /// Resume after the newest sample the open cycles have seen, or at the
    /// latest sample on a fresh start.
    async fn open_feed(&self, asset: &str, thresholds: &[Decimal]) -> Result<AssetFeed> {
        let mut tracker = CycleTracker::new(self.db.clone(), asset, self.config.staleness_secs);
        tracker.set_thresholds(thresholds.iter().copied());
        let cursor = tracker.resume_point().await?;
        info!(asset = %asset, thresholds = ?tracker.thresholds(), resume = ?cursor, "Tracking asset");

        Ok(AssetFeed {
            tracker,
            cursor,
            health: TrackerHealth::Healthy,
        })
    }

    // ==================== Wallets ====================

    /// Returns the number of positions admitted.
    pub async fn wallet_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut admitted = 0;
        for wallet in self.db.get_tracked_wallets().await? {
            match self.pipeline.poll_wallet(&wallet, now).await {
                Ok(outcomes) => {
                    admitted += outcomes
                        .iter()
                        .map(|o| match o {
                            TradeOutcome::Processed(decisions) => decisions
                                .iter()
                                .filter(|(_, a)| matches!(a, Admission::Admitted { .. }))
                                .count(),
                            TradeOutcome::AlreadyProcessed => 0,
                        })
                        .sum::<usize>();
                }
                Err(e) => error!(wallet = %wallet, error = %e, "Wallet poll failed"),
            }
        }
        Ok(admitted)
    }

    // ==================== Maintenance ====================

    pub async fn maintenance_pass(&self, now: DateTime<Utc>) -> Result<MaintenanceStats> {
        let strategies = self.enabled_strategies().await?;
        let ids: Vec<String> = strategies.keys().cloned().collect();
        let mut stats = MaintenanceStats::default();

        self.filters.refresh(&self.db, &ids).await?;

        let validation = self.validation.process_pending(&strategies, now).await?;
        stats.validated = validation.go + validation.no_go;

        match self.validation.backfill(&strategies, now).await {
            Ok(n) => stats.backfilled = n,
            Err(e) => warn!(error = %e, "Backfill failed"),
        }

        let cutoff = now - Duration::seconds(self.config.validating_timeout_secs);
        let swept = self.db.sweep_stuck_validations(cutoff, SWEEP_REASON).await?;
        if !swept.is_empty() {
            warn!(positions = ?swept, "Swept positions stuck in validation");
        }
        stats.swept = swept.len();

        for strategy in strategies.values() {
            match self.labeler.label_rejections(strategy, now).await {
                Ok(n) => stats.labeled += n,
                Err(e) => warn!(strategy = %strategy.id, error = %e, "Shadow labeling failed"),
            }
        }

        stats.pruned = self
            .db
            .prune_cycles(now - Duration::days(self.config.cycle_retention_days))
            .await?;

        debug!(
            validated = stats.validated,
            go = validation.go,
            no_go = validation.no_go,
            errored = validation.errored,
            backfilled = stats.backfilled,
            swept = stats.swept,
            labeled = stats.labeled,
            pruned = stats.pruned,
            "Maintenance pass complete"
        );
        Ok(stats)
    }

    // ==================== Optimizer ====================

    /// Run the optimizer for every strategy whose interval has elapsed.
    pub async fn optimizer_pass(
        &self,
        last_runs: &mut HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut ran = 0;
        for strategy in self.enabled_strategies().await?.into_values() {
            if !last_runs.contains_key(&strategy.id) {
                if let Some(run) = self.db.list_optimizer_runs(&strategy.id, 1).await?.into_iter().next() {
                    last_runs.insert(strategy.id.clone(), run.started_at);
                }
            }

            let due = last_runs
                .get(&strategy.id)
                .map_or(true, |last| now - *last >= Duration::hours(strategy.config.optimizer.interval_hours));
            if !due {
                continue;
            }

            last_runs.insert(strategy.id.clone(), now);
            match self.optimizer.run(&strategy, now).await {
                Ok(outcome) => {
                    info!(strategy = %strategy.id, outcome = outcome.as_str(), "Optimizer run finished");
                    ran += 1;
                }
                Err(e) => error!(strategy = %strategy.id, error = %e, "Optimizer run failed"),
            }
        }
        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::RecordingDelegate;
    use crate::models::{PositionStatus, PricePoint, TradeSide, WalletTrade};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    async fn engine() -> (Engine, Database, Arc<RecordingDelegate>) {
        let db = Database::in_memory().await.unwrap();
        let config = StrategyConfig {
            threshold: dec!(0.01),
            trailing_threshold: dec!(0.02),
            window_before_minutes: 1,
            window_after_minutes: 1,
            ..Default::default()
        };
        db.save_strategy("s1", &config).await.unwrap();
        db.track_wallet("s1", "0xabc").await.unwrap();

        let delegate = Arc::new(RecordingDelegate::default());
        let engine = Engine::with_delegate(db.clone(), EngineConfig::default(), delegate.clone());
        (engine, db, delegate)
    }

    async fn price(db: &Database, price: Decimal, secs: i64) {
        db.insert_price_point(&PricePoint::new("BTC", price, t0() + Duration::seconds(secs)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_live_mode_requires_webhook() {
        let config = EngineConfig {
            dry_run: false,
            execution_webhook: None,
            ..Default::default()
        };
        let db = Database::in_memory().await.unwrap();
        assert!(Engine::new(db, config).is_err());
    }

    #[tokio::test]
    async fn test_price_pass_starts_at_latest_then_follows() {
        let (engine, db, _) = engine().await;
        let mut feeds = HashMap::new();

        price(&db, dec!(90), 0).await;
        price(&db, dec!(100), 10).await;
        assert_eq!(engine.price_pass(&mut feeds, t0() + Duration::seconds(10)).await.unwrap(), 1);
        let cycle = db.get_open_cycle("BTC", dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(cycle.start_price, dec!(100));

        price(&db, dec!(101), 20).await;
        price(&db, dec!(99.9), 30).await;
        assert_eq!(engine.price_pass(&mut feeds, t0() + Duration::seconds(30)).await.unwrap(), 2);
        let cycle = db.get_open_cycle("BTC", dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(cycle.start_price, dec!(99.9));

        // Nothing new
        assert_eq!(engine.price_pass(&mut feeds, t0() + Duration::seconds(31)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_close_is_retried_next_pass() {
        let (engine, db, _) = engine().await;
        let mut feeds = HashMap::new();

        price(&db, dec!(100), 0).await;
        engine.price_pass(&mut feeds, t0()).await.unwrap();

        db.execute_sql(
            "CREATE TRIGGER fail_close BEFORE UPDATE OF end_time ON price_cycles \
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .await
        .unwrap();

        // The floor break cannot be stored and the price recovers right after
        price(&db, dec!(98.9), 10).await;
        price(&db, dec!(100.5), 20).await;
        assert_eq!(engine.price_pass(&mut feeds, t0() + Duration::seconds(20)).await.unwrap(), 0);
        let cycle = db.get_open_cycle("BTC", dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(cycle.start_price, dec!(100));

        db.execute_sql("DROP TRIGGER fail_close").await.unwrap();
        assert_eq!(engine.price_pass(&mut feeds, t0() + Duration::seconds(30)).await.unwrap(), 2);

        let cycle = db.get_open_cycle("BTC", dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(cycle.start_price, dec!(98.9));
        assert_eq!(cycle.peak_price, dec!(100.5));
        let closed = db.list_cycles("BTC", 10).await.unwrap();
        assert!(closed
            .iter()
            .any(|c| !c.is_open() && c.end_time == Some(t0() + Duration::seconds(10))));
    }

    #[tokio::test]
    async fn test_candidate_flows_from_trade_to_exit() {
        let (engine, db, delegate) = engine().await;
        let mut feeds = HashMap::new();

        price(&db, dec!(100), 0).await;
        engine.price_pass(&mut feeds, t0()).await.unwrap();

        db.insert_wallet_trade(&WalletTrade {
            wallet_address: "0xabc".to_string(),
            trade_id: 1,
            side: TradeSide::Buy,
            asset: "BTC".to_string(),
            price: None,
            timestamp: t0(),
        })
        .await
        .unwrap();
        assert_eq!(engine.wallet_pass(t0()).await.unwrap(), 1);
        // Replaying the same poll admits nothing
        assert_eq!(engine.wallet_pass(t0()).await.unwrap(), 0);

        // Post-entry window closes one minute later; no filter set yet, so go
        let stats = engine.maintenance_pass(t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(stats.validated, 1);
        let position = db.get_positions_by_status(PositionStatus::Go).await.unwrap();
        assert_eq!(position.len(), 1);
        assert_eq!(delegate.opened.lock().unwrap().len(), 1);

        price(&db, dec!(102), 70).await;
        price(&db, dec!(99.9), 80).await;
        engine.price_pass(&mut feeds, t0() + Duration::seconds(80)).await.unwrap();

        let sold = db.get_positions_by_status(PositionStatus::Sold).await.unwrap();
        assert_eq!(sold.len(), 1);
        assert_eq!(sold[0].exit_price, Some(dec!(99.9)));
        assert_eq!(delegate.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_optimizer_pass_respects_interval() {
        let (engine, _, _) = engine().await;
        let mut last_runs = HashMap::new();

        assert_eq!(engine.optimizer_pass(&mut last_runs, t0()).await.unwrap(), 1);
        assert_eq!(engine.optimizer_pass(&mut last_runs, t0() + Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(engine.optimizer_pass(&mut last_runs, t0() + Duration::hours(7)).await.unwrap(), 1);
    }
}
