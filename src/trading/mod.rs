//! Trading logic: entry admission, validation, trailing-stop exits and labeling.

mod active_filters;
mod config;
mod entry_pipeline;
mod labeler;
mod trailing_stop;
mod validation;
mod validator;

pub use active_filters::ActiveFilters;
pub use config::{EngineConfig, OptimizerConfig, StrategyConfig};
pub use entry_pipeline::{Admission, EntryPipeline, TradeOutcome};
pub use labeler::ShadowLabeler;
pub use trailing_stop::TrailingStopMonitor;
pub use validation::ValidationService;
pub use validator::{evaluate_rules, Decision};
