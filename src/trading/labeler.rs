//! Counterfactual outcomes for rejected candidates.
//!
//! `no_go` positions never trade, so without a label the optimizer would
//! only learn from trades the current filter already let through. Once the
//! shadow horizon has passed, the trailing stop is replayed over stored
//! ticks and the result is recorded as a shadow outcome.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::db::{Database, StrategyRecord};

use super::trailing_stop::{fractional_return, replay};

pub struct ShadowLabeler {
    db: Database,
}

impl ShadowLabeler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Label every rejection of `strategy` whose horizon has elapsed.
    ///
    /// Returns the number of positions labeled.
    pub async fn label_rejections(&self, strategy: &StrategyRecord, now: DateTime<Utc>) -> Result<usize> {
        let config = &strategy.config;
        let horizon = Duration::minutes(config.shadow_horizon_minutes);
        let due = self
            .db
            .get_unlabeled_rejections(&strategy.id, now - horizon)
            .await?;

        let mut labeled = 0;
        for position in due {
            let ticks = self
                .db
                .get_prices_between(&config.asset, position.entry_time, position.entry_time + horizon)
                .await?;
            let prices: Vec<_> = ticks.iter().map(|t| t.price).collect();

            let Some((exit_price, stopped)) =
                replay(position.entry_price, &prices, config.trailing_threshold)
            else {
                debug!(position_id = position.id, "No ticks in shadow horizon, leaving unlabeled");
                continue;
            };

            let outcome = fractional_return(position.entry_price, exit_price);
            if self.db.record_shadow_outcome(position.id, outcome).await? {
                debug!(
                    position_id = position.id,
                    exit = %exit_price,
                    stopped = stopped,
                    outcome = outcome,
                    "Shadow outcome recorded"
                );
                labeled += 1;
            }
        }

        if labeled > 0 {
            info!(strategy = %strategy.id, labeled = labeled, "Labeled rejected candidates");
        }
        Ok(labeled)
    }
}
