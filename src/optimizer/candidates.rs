//! Single-rule candidates mined from labeled training samples.

use std::ops::RangeInclusive;

use statrs::statistics::{Data, OrderStatistics};

use crate::models::{Feature, FilterRule};
use crate::trading::OptimizerConfig;

use super::LabeledSample;

/// A rule together with how well it separated good from bad in training.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rule: FilterRule,
    /// Fraction of bad samples removed minus fraction of good samples removed
    pub discrimination: f64,
}

/// Derive percentile bounds from good-trade values for every eligible
/// (feature, offset) and keep those that separate the classes.
///
/// Result is ordered by discrimination, strongest first; ties are broken by
/// feature then offset so the output is deterministic.
pub fn generate_candidates(
    train: &[&LabeledSample],
    offsets: RangeInclusive<i32>,
    ratio_only: bool,
    (low_pct, high_pct): (f64, f64),
    config: &OptimizerConfig,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for feature in Feature::eligible(ratio_only) {
        for offset in offsets.clone() {
            let (good, bad) = split_values(train, feature, offset);
            if good.len() < config.min_samples_per_rule || bad.len() < config.min_samples_per_rule {
                continue;
            }

            let mut data = Data::new(good.clone());
            let lower = data.quantile(low_pct / 100.0);
            let upper = data.quantile(high_pct / 100.0);
            if !lower.is_finite() || !upper.is_finite() || lower > upper {
                continue;
            }

            let rule = FilterRule::new(feature, offset, lower, upper);
            let discrimination = removed_fraction(&rule, &bad) - removed_fraction(&rule, &good);
            if discrimination >= config.min_discrimination {
                candidates.push(Candidate {
                    rule,
                    discrimination,
                });
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.discrimination
            .total_cmp(&a.discrimination)
            .then(a.rule.feature.cmp(&b.rule.feature))
            .then(a.rule.minute_offset.cmp(&b.rule.minute_offset))
    });
    candidates
}

/// Non-null values of (feature, offset), split by label.
fn split_values(samples: &[&LabeledSample], feature: Feature, offset: i32) -> (Vec<f64>, Vec<f64>) {
    let mut good = Vec::new();
    let mut bad = Vec::new();
    for sample in samples {
        if let Some(value) = sample.snapshot.value(feature, offset) {
            if sample.good {
                good.push(value);
            } else {
                bad.push(value);
            }
        }
    }
    (good, bad)
}

fn removed_fraction(rule: &FilterRule, values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let removed = values.iter().filter(|v| !rule.contains(**v)).count();
    removed as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::fixtures::sample;

    #[test]
    fn test_separating_feature_becomes_candidate() {
        let samples: Vec<LabeledSample> = (0..40)
            .map(|i| {
                let good = i % 2 == 0;
                let spread = if good { 0.1 + 0.01 * (i % 10) as f64 } else { 0.8 + 0.01 * (i % 10) as f64 };
                sample(i, good, &[(Feature::SpreadPct, 0, spread), (Feature::BookImbalance, 0, 0.1)])
            })
            .collect();
        let train: Vec<&LabeledSample> = samples.iter().collect();

        let candidates = generate_candidates(&train, -1..=0, true, (5.0, 95.0), &OptimizerConfig::default());
        assert_eq!(candidates.len(), 1);
        let best = &candidates[0];
        assert_eq!(best.rule.feature, Feature::SpreadPct);
        assert_eq!(best.rule.minute_offset, 0);
        assert!(best.rule.upper_bound < 0.8);
        assert!(best.discrimination > 0.8);
    }

    #[test]
    fn test_ratio_only_skips_absolute_features() {
        let samples: Vec<LabeledSample> = (0..40)
            .map(|i| {
                let good = i % 2 == 0;
                let depth = if good { 10.0 + (i % 5) as f64 } else { 100.0 + (i % 5) as f64 };
                sample(i, good, &[(Feature::BidDepth, 0, depth)])
            })
            .collect();
        let train: Vec<&LabeledSample> = samples.iter().collect();

        assert!(generate_candidates(&train, 0..=0, true, (5.0, 95.0), &OptimizerConfig::default()).is_empty());
        let absolute = generate_candidates(&train, 0..=0, false, (5.0, 95.0), &OptimizerConfig::default());
        assert_eq!(absolute[0].rule.feature, Feature::BidDepth);
        assert!(!absolute[0].rule.is_ratio);
    }

    #[test]
    fn test_too_few_samples_yield_nothing() {
        let samples: Vec<LabeledSample> = (0..6)
            .map(|i| sample(i, i % 2 == 0, &[(Feature::SpreadPct, 0, if i % 2 == 0 { 0.1 } else { 1.0 })]))
            .collect();
        let train: Vec<&LabeledSample> = samples.iter().collect();
        assert!(generate_candidates(&train, 0..=0, true, (5.0, 95.0), &OptimizerConfig::default()).is_empty());
    }
}
