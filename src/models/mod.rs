//! Data models for prices, cycles, wallet trades, positions, features and filters.

mod error;
mod features;
mod filter;
mod position;
mod price;
mod trade;

pub use error::{ParseError, TransitionError};
pub use features::{Feature, FeatureRow, FeatureSnapshot};
pub use filter::{FilterRule, FilterSet, ScenarioDescriptor, ScenarioResult};
pub use position::{NewPosition, OutcomeSource, Position, PositionStatus};
pub use price::{BookSnapshot, MarketTrade, PriceCycle, PricePoint, END_REASON_DRAWDOWN};
pub use trade::{TradeSide, WalletCursor, WalletTrade};
