//! Cycle Copy Engine
//!
//! Mirrors buy trades of tracked wallets into drawdown cycles, admits a
//! bounded number of candidates per cycle, validates them against a learned
//! entry filter and exits through a trailing stop.

mod api;
mod cycles;
mod db;
mod engine;
mod features;
mod metrics;
mod models;
mod optimizer;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::db::Database;
use crate::engine::Engine;
use crate::metrics::PerformanceCalculator;
use crate::models::PositionStatus;
use crate::optimizer::{FilterOptimizer, OptimizerOutcome};
use crate::trading::{ActiveFilters, EngineConfig, StrategyConfig};

/// Cycle copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "cyclecopier")]
#[command(about = "Copy wallet entries into drawdown cycles with learned entry filters", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "CYCLE_DATABASE_URL", default_value = "sqlite:./cyclecopier.db?mode=rwc")]
    database: String,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage strategies
    Strategy {
        #[command(subcommand)]
        action: StrategyAction,
    },

    /// Mirror a wallet's trades into a strategy
    Track {
        strategy: String,
        /// Wallet address
        wallet: String,
    },

    /// Stop mirroring a wallet
    Untrack {
        strategy: String,
        wallet: String,
    },

    /// List tracked wallets and their cursors
    Wallets {
        /// Only wallets of this strategy
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Run the engine until Ctrl+C
    Run {
        /// Send execution instructions instead of logging them
        #[arg(long)]
        live: bool,

        /// Execution delegate endpoint
        #[arg(long, env = "CYCLE_EXECUTION_WEBHOOK")]
        webhook: Option<String>,

        /// Price polling interval (milliseconds)
        #[arg(long, default_value = "1000")]
        price_poll_ms: u64,

        /// Wallet polling interval (seconds)
        #[arg(long, default_value = "5")]
        wallet_poll_secs: u64,
    },

    /// Run the filter optimizer once for a strategy
    Optimize { strategy: String },

    /// Show recent price cycles
    Cycles {
        #[arg(short, long, default_value = "BTC")]
        asset: String,

        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show positions
    Positions {
        #[arg(short, long)]
        strategy: Option<String>,

        /// pending, validating, go, no_go, sold, error
        #[arg(long)]
        status: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show filter set history and the active rules
    Filters {
        strategy: String,

        /// Also list optimizer runs
        #[arg(long)]
        runs: bool,
    },

    /// Performance summary of a strategy
    Report { strategy: String },

    /// Show default configuration
    Config,
}

#[derive(Subcommand)]
enum StrategyAction {
    /// Create or update a strategy
    Add {
        id: String,

        /// JSON file with a full or partial strategy config
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        asset: Option<String>,

        /// Cycle drawdown threshold (e.g. 0.003)
        #[arg(long)]
        threshold: Option<Decimal>,

        #[arg(long)]
        max_entries: Option<u32>,

        /// Trailing stop fraction (e.g. 0.02)
        #[arg(long)]
        trailing: Option<Decimal>,
    },

    /// List strategies
    List,

    Enable { id: String },

    Disable { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Strategy { action } => strategy_command(&db, action).await?,

        Commands::Track { strategy, wallet } => {
            if db.get_strategy(&strategy).await?.is_none() {
                anyhow::bail!("unknown strategy '{}'", strategy);
            }
            let cursor = db.track_wallet(&strategy, &wallet).await?;
            info!(strategy = %strategy, wallet = %wallet, "Wallet tracked");
            println!(
                "Now tracking {} for {} (cursor at trade {})",
                wallet, strategy, cursor.last_processed_trade_id
            );
        }

        Commands::Untrack { strategy, wallet } => {
            if db.untrack_wallet(&strategy, &wallet).await? {
                println!("Stopped tracking {} for {}", wallet, strategy);
            } else {
                println!("{} was not tracked by {}", wallet, strategy);
            }
        }

        Commands::Wallets { strategy } => {
            let wallets = match &strategy {
                Some(id) => db.get_strategy_wallets(id).await?,
                None => db.get_tracked_wallets().await?,
            };
            if wallets.is_empty() {
                println!("No wallets tracked. Use 'cyclecopier track <strategy> <wallet>' to add one.");
                return Ok(());
            }

            println!("\n{:<44} {:>12} {:<30}", "WALLET", "CURSOR", "STRATEGIES");
            println!("{}", "-".repeat(88));
            for wallet in wallets {
                let cursor = db
                    .get_cursor(&wallet)
                    .await?
                    .map(|c| c.last_processed_trade_id)
                    .unwrap_or(0);
                let strategies = db.get_wallet_strategies(&wallet).await?.join(",");
                println!("{:<44} {:>12} {:<30}", wallet, cursor, truncate(&strategies, 30));
            }
        }

        Commands::Run {
            live,
            webhook,
            price_poll_ms,
            wallet_poll_secs,
        } => {
            let strategies = db.list_strategies().await?;
            let enabled = strategies.iter().filter(|s| s.enabled).count();
            if enabled == 0 {
                println!("No enabled strategies. Use 'cyclecopier strategy add <id>' first.");
                return Ok(());
            }

            let config = EngineConfig {
                price_poll_ms,
                wallet_poll_secs,
                dry_run: !live,
                execution_webhook: webhook,
                ..Default::default()
            };

            println!("\n=== Cycle Copy Engine ===");
            println!("Mode: {}", if live { "LIVE (webhook)" } else { "DRY RUN (log only)" });
            println!("Strategies: {}", enabled);
            println!("Tracked wallets: {}", db.get_tracked_wallets().await?.len());
            println!("\nPress Ctrl+C to stop.\n");

            let engine = Arc::new(Engine::new(db, config)?);
            engine.run().await?;
        }

        Commands::Optimize { strategy } => {
            let record = db
                .get_strategy(&strategy)
                .await?
                .with_context(|| format!("unknown strategy '{}'", strategy))?;
            let optimizer = FilterOptimizer::new(db.clone(), ActiveFilters::new());

            match optimizer.run(&record, Utc::now()).await? {
                OptimizerOutcome::Replaced { filter_set, score } => {
                    println!(
                        "Activated filter set v{} '{}' (score {:.1})",
                        filter_set.version, filter_set.name, score
                    );
                    for rule in &filter_set.rules {
                        println!("  {:<28} [{:.6}, {:.6}]", rule.label(), rule.lower_bound, rule.upper_bound);
                    }
                }
                OptimizerOutcome::Retained { best_score } => match best_score {
                    Some(score) => println!("Active filter set retained (best scenario scored {:.1})", score),
                    None => println!("Active filter set retained (no candidate rules)"),
                },
                OptimizerOutcome::InsufficientData { samples } => println!(
                    "Not enough labeled samples ({} of {} required)",
                    samples, record.config.optimizer.min_labeled_samples
                ),
            }
        }

        Commands::Cycles { asset, limit } => {
            let cycles = db.list_cycles(&asset, limit).await?;
            println!(
                "\n{:>6} {:>8} {:<20} {:>12} {:>12} {:<20} {:<10}",
                "ID", "THRESH", "START", "START PX", "PEAK", "END", "STATE"
            );
            println!("{}", "-".repeat(96));
            for c in cycles {
                println!(
                    "{:>6} {:>8} {:<20} {:>12} {:>12} {:<20} {:<10}",
                    c.id,
                    c.threshold,
                    fmt_time(c.start_time),
                    c.start_price,
                    c.peak_price,
                    c.end_time.map(fmt_time).unwrap_or_default(),
                    if c.is_open() { "open" } else { "closed" }
                );
            }
        }

        Commands::Positions {
            strategy,
            status,
            limit,
        } => {
            let status = status
                .map(|s| s.parse::<PositionStatus>())
                .transpose()?;
            let positions = db.list_positions(strategy.as_deref(), status, limit).await?;

            println!(
                "\n{:>6} {:<12} {:<20} {:>10} {:<11} {:>10} {:>9} {:<30}",
                "ID", "STRATEGY", "ENTRY", "PRICE", "STATUS", "EXIT", "RETURN", "REASON"
            );
            println!("{}", "-".repeat(114));
            for p in positions {
                println!(
                    "{:>6} {:<12} {:<20} {:>10} {:<11} {:>10} {:>9} {:<30}",
                    p.id,
                    truncate(&p.strategy_id, 12),
                    fmt_time(p.entry_time),
                    p.entry_price,
                    p.status.as_str(),
                    p.exit_price.map(|x| x.to_string()).unwrap_or_default(),
                    p.realized_outcome
                        .map(|r| format!("{:+.2}%", r * 100.0))
                        .unwrap_or_default(),
                    truncate(p.reason.as_deref().unwrap_or(""), 30)
                );
            }
        }

        Commands::Filters { strategy, runs } => {
            let sets = db.list_filter_sets(&strategy).await?;
            if sets.is_empty() {
                println!("No filter sets for {}; candidates pass unfiltered.", strategy);
            } else {
                println!("\n{:>4} {:<24} {:>6} {:<20} {:<8}", "VER", "NAME", "RULES", "CREATED", "ACTIVE");
                println!("{}", "-".repeat(66));
                for s in &sets {
                    println!(
                        "{:>4} {:<24} {:>6} {:<20} {:<8}",
                        s.version,
                        truncate(&s.name, 24),
                        s.rule_count,
                        fmt_time(s.created_at),
                        if s.active { "*" } else { "" }
                    );
                }
            }

            if let Some(active) = db.get_active_filter_set(&strategy).await? {
                println!("\n--- Active rules (v{}) ---", active.version);
                for rule in &active.rules {
                    println!(
                        "  {:<28} [{:.6}, {:.6}] {}",
                        rule.label(),
                        rule.lower_bound,
                        rule.upper_bound,
                        if rule.is_ratio { "ratio" } else { "absolute" }
                    );
                }
            }

            if runs {
                println!("\n--- Optimizer runs ---");
                for run in db.list_optimizer_runs(&strategy, 20).await? {
                    println!(
                        "  {} {:<20} {:<18} samples={:<5} scenarios={:<5} {}",
                        run.run_id.get(..8).unwrap_or(&run.run_id),
                        fmt_time(run.started_at),
                        run.outcome.as_deref().unwrap_or("running"),
                        run.labeled_samples,
                        run.scenarios_evaluated,
                        run.message.as_deref().unwrap_or("")
                    );
                }
            }
        }

        Commands::Report { strategy } => {
            let record = db
                .get_strategy(&strategy)
                .await?
                .with_context(|| format!("unknown strategy '{}'", strategy))?;
            let positions = db.get_labeled_positions(&strategy, DateTime::<Utc>::UNIX_EPOCH).await?;
            let report =
                PerformanceCalculator::calculate(&strategy, &positions, record.config.good_trade_return_threshold);

            println!("\n=== Strategy: {} ===", strategy);
            println!("\n--- Realized ---");
            println!("Trades:         {}", report.realized_trades);
            println!("Good Rate:      {:.1}%", report.good_rate * 100.0);
            println!("Avg Return:     {:+.3}%", report.avg_return * 100.0);
            println!("Median Return:  {:+.3}%", report.median_return * 100.0);
            println!("Total Return:   {:+.3}%", report.total_return * 100.0);

            println!("\n--- Risk ---");
            println!("Max Drawdown:   {:.3}%", report.max_drawdown * 100.0);
            println!("Sharpe Ratio:   {:.2}", report.sharpe_ratio);

            println!("\n--- Rejected (shadow) ---");
            println!("Labeled:        {}", report.shadow_trades);
            println!("Would be good:  {:.1}%", report.shadow_good_rate * 100.0);
        }

        Commands::Config => {
            let engine = EngineConfig::default();

            println!("\n=== Engine Configuration ===\n");
            println!("  Price Poll:           {}ms", engine.price_poll_ms);
            println!("  Wallet Poll:          {}s", engine.wallet_poll_secs);
            println!("  Maintenance:          {}s", engine.maintenance_secs);
            println!("  Validating Timeout:   {}s", engine.validating_timeout_secs);
            println!("  Feed Staleness:       {}s", engine.staleness_secs);
            println!("  Cycle Retention:      {}d", engine.cycle_retention_days);

            println!("\n=== Default Strategy Configuration ===\n");
            println!("{}", serde_json::to_string_pretty(&StrategyConfig::default())?);
        }
    }

    Ok(())
}

async fn strategy_command(db: &Database, action: StrategyAction) -> Result<()> {
    match action {
        StrategyAction::Add {
            id,
            config,
            asset,
            threshold,
            max_entries,
            trailing,
        } => {
            let mut strategy = match config {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    serde_json::from_str::<StrategyConfig>(&raw)
                        .with_context(|| format!("Invalid strategy config in {}", path.display()))?
                }
                None => match db.get_strategy(&id).await? {
                    Some(existing) => existing.config,
                    None => StrategyConfig::default(),
                },
            };
            if let Some(asset) = asset {
                strategy.asset = asset;
            }
            if let Some(threshold) = threshold {
                strategy.threshold = threshold;
            }
            if let Some(max_entries) = max_entries {
                strategy.max_entries_per_cycle = max_entries;
            }
            if let Some(trailing) = trailing {
                strategy.trailing_threshold = trailing;
            }
            strategy.validate()?;

            db.save_strategy(&id, &strategy).await?;
            println!(
                "Saved strategy {} ({} threshold {}, max {} per cycle, trailing {})",
                id,
                strategy.asset,
                strategy.threshold,
                strategy.max_entries_per_cycle,
                strategy.trailing_threshold
            );
        }

        StrategyAction::List => {
            let strategies = db.list_strategies().await?;
            if strategies.is_empty() {
                println!("No strategies. Use 'cyclecopier strategy add <id>' to create one.");
                return Ok(());
            }

            println!(
                "\n{:<16} {:<8} {:>10} {:>8} {:>10} {:>8} {:<8}",
                "ID", "ASSET", "THRESHOLD", "MAX/CYC", "TRAILING", "WALLETS", "ENABLED"
            );
            println!("{}", "-".repeat(74));
            for s in strategies {
                let wallets = db.get_strategy_wallets(&s.id).await?.len();
                println!(
                    "{:<16} {:<8} {:>10} {:>8} {:>10} {:>8} {:<8}",
                    truncate(&s.id, 16),
                    s.config.asset,
                    s.config.threshold,
                    s.config.max_entries_per_cycle,
                    s.config.trailing_threshold,
                    wallets,
                    if s.enabled { "yes" } else { "no" }
                );
            }
        }

        StrategyAction::Enable { id } => {
            if !db.set_strategy_enabled(&id, true).await? {
                anyhow::bail!("unknown strategy '{}'", id);
            }
            println!("Enabled {}", id);
        }

        StrategyAction::Disable { id } => {
            if !db.set_strategy_enabled(&id, false).await? {
                anyhow::bail!("unknown strategy '{}'", id);
            }
            println!("Disabled {}", id);
        }
    }
    Ok(())
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Truncate a string to at most `max_len` characters, with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
