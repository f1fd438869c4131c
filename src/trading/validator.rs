//! Pattern validator: checks a position's feature snapshot against a filter set.
//!
//! Pure and deterministic. A rule whose value is missing is *not evaluable*
//! and never rejects on its own; too few evaluable rules is its own
//! rejection reason so that data outages are distinguishable from genuine
//! filter failures.

use serde::{Deserialize, Serialize};

use crate::models::{FeatureSnapshot, FilterRule, FilterSet, PositionStatus};

/// Reason string used when no filter set has been activated yet.
pub const NO_ACTIVE_SET: &str = "no active filter set";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Pass,
    Fail,
    NotEvaluable,
}

/// One rule applied to one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule: String,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub value: Option<f64>,
    pub outcome: RuleOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Go,
    NoGo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoGoReason {
    RulesFailed,
    InsufficientData,
}

/// Full validator output; serialized into the position's validator log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub filter_set_id: Option<i64>,
    pub filter_set_version: Option<i64>,
    pub decision: Decision,
    pub reason: Option<NoGoReason>,
    pub evaluable: usize,
    pub required: usize,
    pub passed: usize,
    pub failed: usize,
    pub evaluations: Vec<RuleEvaluation>,
}

impl ValidationReport {
    pub fn is_go(&self) -> bool {
        self.decision == Decision::Go
    }

    /// Position status this report resolves to.
    pub fn status(&self) -> PositionStatus {
        match self.decision {
            Decision::Go => PositionStatus::Go,
            Decision::NoGo => PositionStatus::NoGo,
        }
    }

    /// Human-readable one-liner for the position's reason field.
    pub fn summary(&self) -> String {
        let Some(version) = self.filter_set_version else {
            return NO_ACTIVE_SET.to_string();
        };

        match self.reason {
            None => format!(
                "{}/{} rules passed (filter set v{})",
                self.passed,
                self.evaluations.len(),
                version
            ),
            Some(NoGoReason::RulesFailed) => {
                let failures: Vec<String> = self
                    .evaluations
                    .iter()
                    .filter(|e| e.outcome == RuleOutcome::Fail)
                    .map(|e| {
                        format!(
                            "{}={:.4} outside [{:.4}, {:.4}]",
                            e.rule,
                            e.value.unwrap_or(f64::NAN),
                            e.lower_bound,
                            e.upper_bound
                        )
                    })
                    .collect();
                format!("rules failed (filter set v{}): {}", version, failures.join("; "))
            }
            Some(NoGoReason::InsufficientData) => format!(
                "insufficient data (filter set v{}): {} of {} rules evaluable, {} required",
                version,
                self.evaluable,
                self.evaluations.len(),
                self.required
            ),
        }
    }

    /// Structured log as JSON.
    pub fn to_log(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Apply `rules` to `snapshot`.
///
/// Go iff every evaluable rule passes and at least
/// `min(min_evaluable, rules.len())` rules were evaluable.
pub fn evaluate_rules(
    rules: &[FilterRule],
    snapshot: &FeatureSnapshot,
    min_evaluable: usize,
) -> (Decision, Option<NoGoReason>, Vec<RuleEvaluation>) {
    let evaluations: Vec<RuleEvaluation> = rules
        .iter()
        .map(|rule| {
            let value = snapshot.value(rule.feature, rule.minute_offset);
            let outcome = match value {
                None => RuleOutcome::NotEvaluable,
                Some(v) if rule.contains(v) => RuleOutcome::Pass,
                Some(_) => RuleOutcome::Fail,
            };
            RuleEvaluation {
                rule: rule.label(),
                lower_bound: rule.lower_bound,
                upper_bound: rule.upper_bound,
                value,
                outcome,
            }
        })
        .collect();

    let failed = count(&evaluations, RuleOutcome::Fail);
    let evaluable = evaluations.len() - count(&evaluations, RuleOutcome::NotEvaluable);
    let required = min_evaluable.min(rules.len());

    let (decision, reason) = if failed > 0 {
        (Decision::NoGo, Some(NoGoReason::RulesFailed))
    } else if evaluable < required {
        (Decision::NoGo, Some(NoGoReason::InsufficientData))
    } else {
        (Decision::Go, None)
    };

    (decision, reason, evaluations)
}

fn count(evaluations: &[RuleEvaluation], outcome: RuleOutcome) -> usize {
    evaluations.iter().filter(|e| e.outcome == outcome).count()
}

/// Evaluate a snapshot against the active filter set.
///
/// Without an active set every candidate is let through so labeled
/// history can accumulate for the first optimizer run.
pub fn evaluate(
    filter_set: Option<&FilterSet>,
    snapshot: &FeatureSnapshot,
    min_evaluable: usize,
) -> ValidationReport {
    let Some(set) = filter_set else {
        return ValidationReport {
            filter_set_id: None,
            filter_set_version: None,
            decision: Decision::Go,
            reason: None,
            evaluable: 0,
            required: 0,
            passed: 0,
            failed: 0,
            evaluations: Vec::new(),
        };
    };

    let (decision, reason, evaluations) = evaluate_rules(&set.rules, snapshot, min_evaluable);
    ValidationReport {
        filter_set_id: Some(set.id),
        filter_set_version: Some(set.version),
        decision,
        reason,
        evaluable: evaluations.len() - count(&evaluations, RuleOutcome::NotEvaluable),
        required: min_evaluable.min(set.rules.len()),
        passed: count(&evaluations, RuleOutcome::Pass),
        failed: count(&evaluations, RuleOutcome::Fail),
        evaluations,
    }
}
