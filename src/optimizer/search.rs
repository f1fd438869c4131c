//! Scenario search: combines candidate rules into filter sets and scores
//! them on a chronological holdout.
//!
//! Pure and CPU-bound; the caller runs it on a blocking thread and hands in
//! the wall-clock deadline.

use std::ops::RangeInclusive;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::models::{FilterRule, ScenarioDescriptor};
use crate::trading::{evaluate_rules, Decision, OptimizerConfig};

use super::candidates::generate_candidates;
use super::LabeledSample;

/// Holdout performance of one rule list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub bad_removed_pct: f64,
    pub good_kept_pct: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ScoredScenario {
    pub descriptor: ScenarioDescriptor,
    pub rules: Vec<FilterRule>,
    pub score: Score,
}

#[derive(Debug, Clone, Default)]
pub struct SearchReport {
    pub scenarios: Vec<ScoredScenario>,
    /// Index into `scenarios` of the scenario that should replace the incumbent
    pub best: Option<usize>,
    pub incumbent: Option<Score>,
    pub holdout_size: usize,
    /// Stopped early on the scenario cap or the deadline
    pub truncated: bool,
}

impl SearchReport {
    pub fn best(&self) -> Option<&ScoredScenario> {
        self.best.map(|i| &self.scenarios[i])
    }
}

/// Split chronologically ordered samples into (train, holdout).
///
/// The holdout is the most recent `fraction` of the samples, at least one,
/// and never the whole set.
pub fn split_holdout(samples: &[LabeledSample], fraction: f64) -> (&[LabeledSample], &[LabeledSample]) {
    if samples.len() < 2 {
        return (samples, &[]);
    }
    let holdout = ((samples.len() as f64) * fraction).ceil() as usize;
    let holdout = holdout.clamp(1, samples.len() - 1);
    samples.split_at(samples.len() - holdout)
}

/// Score `rules` on `holdout`: a sample is kept when the validator would say go.
///
/// `score = w1 * bad_removed_pct - w2 * max(0, target - good_kept_pct)`.
/// With no bad samples nothing can be removed (0%); with no good samples
/// nothing good is lost (100% kept).
pub fn score_rules(
    rules: &[FilterRule],
    holdout: &[LabeledSample],
    min_evaluable: usize,
    config: &OptimizerConfig,
) -> Score {
    let mut good = 0usize;
    let mut good_kept = 0usize;
    let mut bad = 0usize;
    let mut bad_removed = 0usize;

    for sample in holdout {
        let (decision, _, _) = evaluate_rules(rules, &sample.snapshot, min_evaluable);
        let kept = decision == Decision::Go;
        if sample.good {
            good += 1;
            good_kept += usize::from(kept);
        } else {
            bad += 1;
            bad_removed += usize::from(!kept);
        }
    }

    let bad_removed_pct = if bad == 0 { 0.0 } else { 100.0 * bad_removed as f64 / bad as f64 };
    let good_kept_pct = if good == 0 { 100.0 } else { 100.0 * good_kept as f64 / good as f64 };
    let shortfall = (config.target_good_kept_pct - good_kept_pct).max(0.0);

    Score {
        bad_removed_pct,
        good_kept_pct,
        score: config.bad_removed_weight * bad_removed_pct - config.good_shortfall_weight * shortfall,
    }
}

/// Explore scenarios over eligibility mode, lookback, percentile pair and
/// rule count, in that nesting order.
///
/// Ratio-only scenarios come first and ties keep the first scenario found,
/// so a ratio-only set wins over an equally good mixed one.
pub fn search(
    samples: &[LabeledSample],
    incumbent: Option<&[FilterRule]>,
    offsets: RangeInclusive<i32>,
    min_evaluable: usize,
    now: DateTime<Utc>,
    config: &OptimizerConfig,
    deadline: Instant,
) -> SearchReport {
    let (train, holdout) = split_holdout(samples, config.holdout_fraction);
    let mut report = SearchReport {
        holdout_size: holdout.len(),
        incumbent: incumbent.map(|rules| score_rules(rules, holdout, min_evaluable, config)),
        ..Default::default()
    };
    let mut best_score = report.incumbent.map(|s| s.score);

    'modes: for ratio_only in config.eligibility_modes() {
        for &lookback_days in &config.lookback_days {
            let since = now - Duration::days(lookback_days);
            let window: Vec<&LabeledSample> = train.iter().filter(|s| s.entry_time >= since).collect();

            for &(low, high) in &config.percentile_pairs {
                let candidates = generate_candidates(&window, offsets.clone(), ratio_only, (low, high), config);
                if candidates.is_empty() {
                    debug!(lookback_days, low, high, ratio_only, "No candidate rules");
                    continue;
                }

                for k in 1..=config.max_rules.min(candidates.len()) {
                    if report.scenarios.len() >= config.max_scenarios || Instant::now() >= deadline {
                        report.truncated = true;
                        break 'modes;
                    }

                    let rules: Vec<FilterRule> = candidates[..k].iter().map(|c| c.rule.clone()).collect();
                    let score = score_rules(&rules, holdout, min_evaluable, config);
                    let viable = score.score > 0.0
                        && score.good_kept_pct >= config.min_good_kept_pct
                        && best_score.map_or(true, |b| score.score > b);
                    if viable {
                        best_score = Some(score.score);
                        report.best = Some(report.scenarios.len());
                    }

                    report.scenarios.push(ScoredScenario {
                        descriptor: ScenarioDescriptor {
                            lookback_days,
                            percentile_low: low,
                            percentile_high: high,
                            ratio_only,
                            rule_count: k,
                            rules: rules.iter().map(FilterRule::label).collect(),
                        },
                        rules,
                        score,
                    });
                }
            }
        }
    }

    report
}
