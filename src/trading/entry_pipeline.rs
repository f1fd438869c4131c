//! Entry candidate pipeline: wallet trades in, pending positions out.
//!
//! For each new trade of a tracked wallet:
//! 1. Claim the trade by advancing the wallet cursor (exactly one consumer wins)
//! 2. Fan it out to every enabled strategy that mirrors the wallet
//! 3. Per strategy, resolve the open cycle and admit under the per-cycle limit
//!
//! Cursor progress never depends on admission policy: stale or rejected
//! trades still move the cursor.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::db::{AdmitResult, Database, StrategyRecord};
use crate::models::{NewPosition, TradeSide, WalletTrade};

/// Trades fetched per wallet per poll.
const TRADE_BATCH: i64 = 100;

/// Per-strategy admission decision for one wallet trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { position_id: i64, stale: bool },
    /// No open cycle for the strategy's threshold yet
    NoCycle,
    /// The open cycle already holds `max_entries_per_cycle` live positions
    CycleFull { cycle_id: i64 },
    /// Detected outside the recency window and stale trades are not acted on
    StaleSkipped,
    /// Only buys open positions
    IgnoredSide,
    /// No price sample to enter at
    NoPrice,
    /// Already admitted for this strategy
    Duplicate { position_id: i64 },
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Admitted { .. } => "admitted",
            Admission::NoCycle => "no_cycle",
            Admission::CycleFull { .. } => "cycle_full",
            Admission::StaleSkipped => "stale_detection",
            Admission::IgnoredSide => "ignored_side",
            Admission::NoPrice => "no_price",
            Admission::Duplicate { .. } => "duplicate",
        }
    }
}

/// Result of feeding one wallet trade through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeOutcome {
    /// Cursor was already at or past this trade
    AlreadyProcessed,
    Processed(Vec<(String, Admission)>),
}

pub struct EntryPipeline {
    db: Database,
}

impl EntryPipeline {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Process every unconsumed trade of `wallet` in trade_id order.
    pub async fn poll_wallet(&self, wallet: &str, now: DateTime<Utc>) -> Result<Vec<TradeOutcome>> {
        let Some(cursor) = self.db.get_cursor(wallet).await? else {
            warn!(wallet = %wallet, "Wallet has no cursor, skipping");
            return Ok(Vec::new());
        };

        let trades = self
            .db
            .get_wallet_trades_after(wallet, cursor.last_processed_trade_id, TRADE_BATCH)
            .await?;

        let mut outcomes = Vec::with_capacity(trades.len());
        for trade in &trades {
            outcomes.push(self.process_trade(trade, now).await?);
        }
        Ok(outcomes)
    }

    /// Claim one trade and fan it out to the strategies mirroring its wallet.
    pub async fn process_trade(&self, trade: &WalletTrade, now: DateTime<Utc>) -> Result<TradeOutcome> {
        if !self
            .db
            .advance_cursor(&trade.wallet_address, trade.trade_id)
            .await?
        {
            debug!(
                wallet = %trade.wallet_address,
                trade_id = trade.trade_id,
                "Trade already processed"
            );
            return Ok(TradeOutcome::AlreadyProcessed);
        }

        let mut decisions = Vec::new();
        for strategy_id in self.db.get_wallet_strategies(&trade.wallet_address).await? {
            let strategy = match self.db.get_strategy(&strategy_id).await {
                Ok(Some(strategy)) => strategy,
                Ok(None) => continue,
                Err(e) => {
                    error!(strategy = %strategy_id, error = %e, "Failed to load strategy");
                    continue;
                }
            };

            match self.admit(&strategy, trade, now).await {
                Ok(admission) => {
                    log_admission(&strategy.id, trade, &admission);
                    decisions.push((strategy.id, admission));
                }
                Err(e) => error!(
                    strategy = %strategy.id,
                    wallet = %trade.wallet_address,
                    trade_id = trade.trade_id,
                    error = %e,
                    "Admission failed"
                ),
            }
        }

        Ok(TradeOutcome::Processed(decisions))
    }

    async fn admit(
        &self,
        strategy: &StrategyRecord,
        trade: &WalletTrade,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let config = &strategy.config;

        if trade.side != TradeSide::Buy {
            return Ok(Admission::IgnoredSide);
        }

        let stale = trade.is_stale(now, config.recency_window_secs);
        if stale && !config.act_on_stale_trades {
            return Ok(Admission::StaleSkipped);
        }

        let Some(cycle) = self.db.get_open_cycle(&config.asset, config.threshold).await? else {
            return Ok(Admission::NoCycle);
        };

        let Some(price) = self.db.get_latest_price(&config.asset).await? else {
            return Ok(Admission::NoPrice);
        };

        let new = NewPosition {
            strategy_id: strategy.id.clone(),
            price_cycle_id: cycle.id,
            source_wallet: trade.wallet_address.clone(),
            source_trade_id: trade.trade_id,
            entry_time: now,
            entry_price: price.price,
            stale_detection: stale,
        };

        Ok(
            match self.db.admit_position(&new, config.max_entries_per_cycle).await? {
                AdmitResult::Admitted(position_id) => Admission::Admitted { position_id, stale },
                AdmitResult::CycleFull => Admission::CycleFull { cycle_id: cycle.id },
                AdmitResult::Duplicate(position_id) => Admission::Duplicate { position_id },
            },
        )
    }
}

fn log_admission(strategy_id: &str, trade: &WalletTrade, admission: &Admission) {
    match admission {
        Admission::Admitted { position_id, stale } => info!(
            strategy = %strategy_id,
            wallet = %trade.wallet_address,
            trade_id = trade.trade_id,
            position_id = position_id,
            stale_detection = stale,
            "Candidate admitted"
        ),
        other => info!(
            strategy = %strategy_id,
            wallet = %trade.wallet_address,
            trade_id = trade.trade_id,
            decision = other.as_str(),
            "Candidate rejected"
        ),
    }
}
