//! Strategy and engine configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Per-strategy configuration, persisted as JSON alongside the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Asset whose price drives cycles, entries and exits
    pub asset: String,

    // === Cycles & Admission ===
    /// Drawdown fraction that closes a price cycle (e.g. 0.003 = 0.3%)
    pub threshold: Decimal,

    /// Maximum non-failed positions admitted into one cycle
    pub max_entries_per_cycle: u32,

    /// Wallet trades detected later than this after they happened are flagged stale
    pub recency_window_secs: i64,

    /// Admit stale trades (flagged) instead of skipping them
    pub act_on_stale_trades: bool,

    // === Exit ===
    /// Fractional decline from the high-water mark that closes a position
    pub trailing_threshold: Decimal,

    // === Feature window & validation ===
    /// Minutes before entry covered by the feature snapshot (W)
    pub window_before_minutes: i32,

    /// Minutes after entry covered by the feature snapshot (V)
    pub window_after_minutes: i32,

    /// Minimum number of evaluable rules for a go decision
    pub min_evaluable_rules: usize,

    /// Minutes after the window closes during which missing values may still be backfilled
    pub backfill_grace_minutes: i64,

    /// Market trades at or above this notional count as whale trades
    pub whale_notional: f64,

    // === Learning ===
    /// Realized return at or above which a trade is labeled good
    pub good_trade_return_threshold: f64,

    /// Replay horizon for labeling rejected candidates
    pub shadow_horizon_minutes: i64,

    /// Filter optimizer settings
    pub optimizer: OptimizerConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            asset: "BTC".to_string(),

            // Cycles & admission
            threshold: dec!(0.003),           // 0.3% drawdown closes a cycle
            max_entries_per_cycle: 3,
            recency_window_secs: 300,         // 5 minutes
            act_on_stale_trades: false,

            // Exit
            trailing_threshold: dec!(0.02),   // 2% trailing stop

            // Feature window & validation
            window_before_minutes: 15,
            window_after_minutes: 2,
            min_evaluable_rules: 1,
            backfill_grace_minutes: 30,
            whale_notional: 100_000.0,

            // Learning
            good_trade_return_threshold: 0.005, // +0.5% labels a trade good
            shadow_horizon_minutes: 240,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl StrategyConfig {
    /// Minute offsets covered by the feature snapshot, inclusive.
    pub fn minute_offsets(&self) -> std::ops::RangeInclusive<i32> {
        -self.window_before_minutes..=self.window_after_minutes
    }

    /// Check invariants that would make the strategy meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threshold <= Decimal::ZERO || self.threshold >= Decimal::ONE {
            anyhow::bail!("threshold must be in (0, 1), got {}", self.threshold);
        }
        if self.trailing_threshold <= Decimal::ZERO || self.trailing_threshold >= Decimal::ONE {
            anyhow::bail!(
                "trailing_threshold must be in (0, 1), got {}",
                self.trailing_threshold
            );
        }
        if self.window_before_minutes < 0 || self.window_after_minutes < 0 {
            anyhow::bail!("feature window bounds must be non-negative");
        }
        self.optimizer.validate()
    }
}

/// Filter optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Historical lookback windows to try, in days
    pub lookback_days: Vec<i64>,

    /// (low, high) percentile cut points to try, most aggressive last
    pub percentile_pairs: Vec<(f64, f64)>,

    /// Maximum number of rules combined in one scenario (K)
    pub max_rules: usize,

    /// Try scenarios restricted to ratio features
    pub try_ratio_only: bool,

    /// Try scenarios that also admit absolute features
    pub try_absolute: bool,

    /// Fraction of the most recent samples held out for scoring
    pub holdout_fraction: f64,

    /// Minimum (bad removed - good removed) fraction for a single rule to be kept
    pub min_discrimination: f64,

    /// Minimum non-null good values needed to derive a rule's bounds
    pub min_samples_per_rule: usize,

    /// Minimum labeled samples for a run to proceed
    pub min_labeled_samples: usize,

    /// Weight on bad-trade rejection (w1)
    pub bad_removed_weight: f64,

    /// Weight on good-trade rejection beyond target (w2)
    pub good_shortfall_weight: f64,

    /// Good-kept percentage below which the shortfall penalty applies
    pub target_good_kept_pct: f64,

    /// Scenarios keeping fewer good trades than this are never selected
    pub min_good_kept_pct: f64,

    /// Hard cap on scenarios per run
    pub max_scenarios: usize,

    /// Wall-clock budget per run in milliseconds
    pub time_budget_ms: u64,

    /// Hours between scheduled runs
    pub interval_hours: i64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lookback_days: vec![7, 14, 30],
            percentile_pairs: vec![(2.5, 97.5), (5.0, 95.0), (10.0, 90.0)],
            max_rules: 3,
            try_ratio_only: true,
            try_absolute: false,
            holdout_fraction: 0.3,
            min_discrimination: 0.05,
            min_samples_per_rule: 5,
            min_labeled_samples: 20,
            bad_removed_weight: 1.0,
            good_shortfall_weight: 0.25,
            target_good_kept_pct: 80.0,
            min_good_kept_pct: 50.0,
            max_scenarios: 200,
            time_budget_ms: 10_000,
            interval_hours: 6,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.holdout_fraction) || self.holdout_fraction == 0.0 {
            anyhow::bail!("holdout_fraction must be in (0, 1)");
        }
        for (low, high) in &self.percentile_pairs {
            if !(0.0..=100.0).contains(low) || !(0.0..=100.0).contains(high) || low >= high {
                anyhow::bail!("invalid percentile pair ({}, {})", low, high);
            }
        }
        if !self.try_ratio_only && !self.try_absolute {
            anyhow::bail!("optimizer must try at least one feature eligibility mode");
        }
        Ok(())
    }

    /// Feature eligibility modes to explore, ratio-only first.
    pub fn eligibility_modes(&self) -> Vec<bool> {
        let mut modes = Vec::new();
        if self.try_ratio_only {
            modes.push(true);
        }
        if self.try_absolute {
            modes.push(false);
        }
        modes
    }
}

/// Engine-wide runtime configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Price ingestion / trailing-stop polling interval
    pub price_poll_ms: u64,

    /// Wallet trade polling interval
    pub wallet_poll_secs: u64,

    /// Validation, sweep and labeling interval
    pub maintenance_secs: u64,

    /// Positions in `validating` longer than this are swept to `error`
    pub validating_timeout_secs: i64,

    /// Tracker reports degraded when no sample arrived within this window
    pub staleness_secs: i64,

    /// Closed cycles older than this are pruned
    pub cycle_retention_days: i64,

    /// Log execution notifications instead of sending them
    pub dry_run: bool,

    /// Execution delegate endpoint
    pub execution_webhook: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            price_poll_ms: 1_000,
            wallet_poll_secs: 5,
            maintenance_secs: 15,
            validating_timeout_secs: 300,
            staleness_secs: 120,
            cycle_retention_days: 30,
            dry_run: true,
            execution_webhook: None,
        }
    }
}
