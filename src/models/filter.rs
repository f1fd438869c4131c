//! Filter rules, immutable filter sets, and optimizer scenario audit rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Feature;

/// Bound on one feature at one minute offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub feature: Feature,
    pub minute_offset: i32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub is_ratio: bool,
}

impl FilterRule {
    pub fn new(feature: Feature, minute_offset: i32, lower_bound: f64, upper_bound: f64) -> Self {
        Self {
            feature,
            minute_offset,
            lower_bound,
            upper_bound,
            is_ratio: feature.is_ratio(),
        }
    }

    /// Inclusive on both ends.
    pub fn contains(&self, value: f64) -> bool {
        self.lower_bound <= value && value <= self.upper_bound
    }

    pub fn label(&self) -> String {
        format!("{}@{:+}", self.feature, self.minute_offset)
    }
}

/// Named, versioned, immutable collection of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    pub id: i64,
    pub strategy_id: String,
    pub version: i64,
    pub name: String,
    pub rules: Vec<FilterRule>,
    pub created_at: DateTime<Utc>,
    /// Optimizer run that produced the set, if any
    pub run_id: Option<String>,
}

/// How one optimizer scenario was assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    pub lookback_days: i64,
    pub percentile_low: f64,
    pub percentile_high: f64,
    pub ratio_only: bool,
    pub rule_count: usize,
    /// Rule labels, e.g. `book_imbalance@-3`
    pub rules: Vec<String>,
}

impl ScenarioDescriptor {
    /// Descriptor for scoring the currently active set.
    pub fn incumbent(rules: &[FilterRule]) -> Self {
        Self {
            lookback_days: 0,
            percentile_low: 0.0,
            percentile_high: 0.0,
            ratio_only: rules.iter().all(|r| r.is_ratio),
            rule_count: rules.len(),
            rules: rules.iter().map(FilterRule::label).collect(),
        }
    }
}

/// Scored scenario; append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub run_id: String,
    pub descriptor: ScenarioDescriptor,
    pub bad_removed_pct: f64,
    pub good_kept_pct: f64,
    pub score: f64,
    pub selected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_bounds_are_inclusive() {
        let rule = FilterRule::new(Feature::BookImbalance, -3, -0.2, 0.4);
        assert!(rule.contains(-0.2));
        assert!(rule.contains(0.4));
        assert!(rule.contains(0.1));
        assert!(!rule.contains(0.41));
        assert!(!rule.contains(-0.21));
    }

    #[test]
    fn test_rule_ratio_tag_follows_feature() {
        assert!(FilterRule::new(Feature::SpreadPct, 0, 0.0, 1.0).is_ratio);
        assert!(!FilterRule::new(Feature::PriceClose, 0, 0.0, 1.0).is_ratio);
    }

    #[test]
    fn test_rule_label() {
        let rule = FilterRule::new(Feature::BuySellRatio, -5, 0.5, 2.0);
        assert_eq!(rule.label(), "buy_sell_ratio@-5");
        let rule = FilterRule::new(Feature::BuySellRatio, 2, 0.5, 2.0);
        assert_eq!(rule.label(), "buy_sell_ratio@+2");
    }
}
