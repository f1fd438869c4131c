//! Calculator for strategy performance: good rate, returns, drawdown, Sharpe ratio.

use chrono::{DateTime, Utc};
use serde::Serialize;
use statrs::statistics::{Data, Median, Statistics};

use crate::models::{OutcomeSource, Position};

/// Summary of a strategy's labeled outcomes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceReport {
    pub strategy_id: String,
    pub calculated_at: DateTime<Utc>,

    // === Counts ===
    /// Positions closed by the trailing stop
    pub realized_trades: usize,
    /// Rejected candidates with a counterfactual outcome
    pub shadow_trades: usize,

    // === Realized returns ===
    /// Share of realized trades at or above the good-trade threshold (0.0 to 1.0)
    pub good_rate: f64,
    pub avg_return: f64,
    pub median_return: f64,
    pub total_return: f64,

    // === Risk ===
    /// Largest peak-to-trough fall of the cumulative return curve
    pub max_drawdown: f64,
    /// Per-trade Sharpe ratio (mean / std dev, zero risk-free rate)
    pub sharpe_ratio: f64,

    // === Filter effectiveness ===
    /// Share of shadow-labeled rejections that would have been good trades
    pub shadow_good_rate: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Summarize `positions`, which must be in entry order.
    ///
    /// Positions without an outcome are ignored.
    pub fn calculate(strategy_id: &str, positions: &[Position], good_threshold: f64) -> PerformanceReport {
        let mut report = PerformanceReport {
            strategy_id: strategy_id.to_string(),
            calculated_at: Utc::now(),
            ..Default::default()
        };

        let realized = outcomes(positions, OutcomeSource::Realized);
        let shadow = outcomes(positions, OutcomeSource::Shadow);
        report.realized_trades = realized.len();
        report.shadow_trades = shadow.len();
        report.shadow_good_rate = good_rate(&shadow, good_threshold);

        if realized.is_empty() {
            return report;
        }

        report.good_rate = good_rate(&realized, good_threshold);
        report.total_return = realized.iter().sum();
        report.avg_return = realized.iter().mean();
        report.median_return = Data::new(realized.clone()).median();
        report.max_drawdown = Self::max_drawdown(&realized);
        report.sharpe_ratio = Self::sharpe(&realized);

        report
    }

    /// Maximum drawdown of the cumulative (additive) return curve.
    pub fn max_drawdown(returns: &[f64]) -> f64 {
        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;

        for r in returns {
            equity += r;
            if equity > peak {
                peak = equity;
            }
            max_dd = max_dd.max(peak - equity);
        }
        max_dd
    }

    /// Zero when fewer than two returns or no dispersion.
    pub fn sharpe(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let std_dev = returns.std_dev();
        if std_dev > 0.0 {
            returns.mean() / std_dev
        } else {
            0.0
        }
    }
}

fn outcomes(positions: &[Position], source: OutcomeSource) -> Vec<f64> {
    positions
        .iter()
        .filter(|p| p.outcome_source == Some(source))
        .filter_map(|p| p.realized_outcome)
        .collect()
}

fn good_rate(returns: &[f64], threshold: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().filter(|&&r| r >= threshold).count() as f64 / returns.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionStatus;
    use rust_decimal_macros::dec;

    fn position(id: i64, outcome: f64, source: OutcomeSource) -> Position {
        Position {
            id,
            strategy_id: "s1".to_string(),
            price_cycle_id: 1,
            source_wallet: "0xabc".to_string(),
            source_trade_id: id,
            entry_time: Utc::now(),
            entry_price: dec!(100),
            status: match source {
                OutcomeSource::Realized => PositionStatus::Sold,
                OutcomeSource::Shadow => PositionStatus::NoGo,
            },
            exit_time: None,
            exit_price: None,
            high_water_price: dec!(100),
            realized_outcome: Some(outcome),
            outcome_source: Some(source),
            validator_log: None,
            reason: None,
            stale_detection: false,
            validating_since: None,
        }
    }

    #[test]
    fn test_calculate_returns() {
        let positions: Vec<Position> = [0.02, -0.01, 0.03, -0.02, 0.01]
            .iter()
            .enumerate()
            .map(|(i, r)| position(i as i64, *r, OutcomeSource::Realized))
            .chain([position(10, 0.05, OutcomeSource::Shadow), position(11, -0.05, OutcomeSource::Shadow)])
            .collect();

        let report = PerformanceCalculator::calculate("s1", &positions, 0.005);
        assert_eq!(report.realized_trades, 5);
        assert_eq!(report.shadow_trades, 2);
        assert!((report.good_rate - 0.6).abs() < 1e-9);
        assert!((report.avg_return - 0.006).abs() < 1e-9);
        assert!((report.median_return - 0.01).abs() < 1e-9);
        assert!((report.shadow_good_rate - 0.5).abs() < 1e-9);
        assert!(report.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_calculate_drawdown() {
        // Curve: 0.10, 0.15, 0.07, 0.05, 0.15, 0.20
        let returns = [0.10, 0.05, -0.08, -0.02, 0.10, 0.05];
        let dd = PerformanceCalculator::max_drawdown(&returns);
        assert!((dd - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_empty_history() {
        let report = PerformanceCalculator::calculate("s1", &[], 0.005);
        assert_eq!(report.realized_trades, 0);
        assert_eq!(report.sharpe_ratio, 0.0);
        assert_eq!(PerformanceCalculator::sharpe(&[0.01]), 0.0);
    }
}
