//! Trailing-stop exit monitor for open (`go`) positions.
//!
//! Each position is judged independently, and only on observed ticks:
//! - price above the high-water mark raises the mark
//! - price at or below `high_water * (1 - trailing_threshold)` sells

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::api::{ExecutionAction, ExecutionDelegate, ExecutionRequest};
use crate::db::Database;
use crate::models::{Position, PositionStatus, PricePoint};

use super::StrategyConfig;

pub const EXIT_REASON_TRAILING_STOP: &str = "trailing stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStep {
    Raise(Decimal),
    Exit,
    Hold,
}

/// Classify a tick against a position's high-water mark.
pub fn evaluate(high_water: Decimal, price: Decimal, trailing_threshold: Decimal) -> StopStep {
    if price > high_water {
        StopStep::Raise(price)
    } else if price <= high_water * (Decimal::ONE - trailing_threshold) {
        StopStep::Exit
    } else {
        StopStep::Hold
    }
}

/// Replay the stop over a tick path starting at `entry_price`.
///
/// Returns the exit price and whether the stop fired; when it never fires
/// the last tick is used as the mark.
pub fn replay(entry_price: Decimal, ticks: &[Decimal], trailing_threshold: Decimal) -> Option<(Decimal, bool)> {
    let mut high_water = entry_price;
    for price in ticks {
        match evaluate(high_water, *price, trailing_threshold) {
            StopStep::Raise(p) => high_water = p,
            StopStep::Exit => return Some((*price, true)),
            StopStep::Hold => {}
        }
    }
    ticks.last().map(|last| (*last, false))
}

/// Fractional return as f64 for labeling and reporting.
pub fn fractional_return(entry_price: Decimal, exit_price: Decimal) -> f64 {
    if entry_price.is_zero() {
        return 0.0;
    }
    ((exit_price - entry_price) / entry_price)
        .to_f64()
        .unwrap_or(0.0)
}

/// A position closed by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitEvent {
    pub position_id: i64,
    pub strategy_id: String,
    pub exit_price: Decimal,
    pub realized_outcome: f64,
}

pub struct TrailingStopMonitor {
    db: Database,
    delegate: Arc<dyn ExecutionDelegate>,
}

impl TrailingStopMonitor {
    pub fn new(db: Database, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        Self { db, delegate }
    }

    /// Apply one tick to every open position on its asset.
    ///
    /// A failure on one position is logged and does not affect the others.
    pub async fn on_tick(
        &self,
        point: &PricePoint,
        strategies: &HashMap<String, StrategyConfig>,
    ) -> Result<Vec<ExitEvent>> {
        let open = self.db.get_positions_by_status(PositionStatus::Go).await?;
        let mut exits = Vec::new();

        for position in open {
            let Some(config) = strategies.get(&position.strategy_id) else {
                continue;
            };
            if config.asset != point.asset || point.timestamp < position.entry_time {
                continue;
            }

            match self.apply(&position, point, config).await {
                Ok(Some(exit)) => exits.push(exit),
                Ok(None) => {}
                Err(e) => error!(
                    position_id = position.id,
                    error = %e,
                    "Trailing stop update failed"
                ),
            }
        }

        Ok(exits)
    }

    async fn apply(
        &self,
        position: &Position,
        point: &PricePoint,
        config: &StrategyConfig,
    ) -> Result<Option<ExitEvent>> {
        match evaluate(position.high_water_price, point.price, config.trailing_threshold) {
            StopStep::Raise(price) => {
                if self
                    .db
                    .raise_high_water(position.id, position.high_water_price, price)
                    .await?
                {
                    debug!(position_id = position.id, high_water = %price, "High-water mark raised");
                }
                Ok(None)
            }
            StopStep::Hold => Ok(None),
            StopStep::Exit => {
                let outcome = fractional_return(position.entry_price, point.price);
                let closed = self
                    .db
                    .close_position(
                        position.id,
                        point.price,
                        point.timestamp,
                        outcome,
                        EXIT_REASON_TRAILING_STOP,
                    )
                    .await?;
                if !closed {
                    // Another task already moved it
                    return Ok(None);
                }

                info!(
                    position_id = position.id,
                    strategy = %position.strategy_id,
                    entry = %position.entry_price,
                    high_water = %position.high_water_price,
                    exit = %point.price,
                    outcome = outcome,
                    "Position sold on trailing stop"
                );

                let request = ExecutionRequest::new(
                    ExecutionAction::Close,
                    position.id,
                    &position.strategy_id,
                    &point.asset,
                    point.price,
                    point.timestamp,
                )
                .with_reason(EXIT_REASON_TRAILING_STOP);
                if let Err(e) = self.delegate.close_position(&request).await {
                    warn!(position_id = position.id, error = %e, "Close notification failed, not retrying");
                }

                Ok(Some(ExitEvent {
                    position_id: position.id,
                    strategy_id: position.strategy_id.clone(),
                    exit_price: point.price,
                    realized_outcome: outcome,
                }))
            }
        }
    }
}
