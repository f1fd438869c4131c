//! Position model: a notional trade mirroring an external wallet's action,
//! from admission through validation to exit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ParseError, TransitionError};

/// Lifecycle state of a position.
///
/// ```text
/// pending -> validating -> go -> sold
///                       \-> no_go
/// (any non-terminal) -> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Validating,
    Go,
    NoGo,
    Sold,
    Error,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Validating => "validating",
            PositionStatus::Go => "go",
            PositionStatus::NoGo => "no_go",
            PositionStatus::Sold => "sold",
            PositionStatus::Error => "error",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::NoGo | PositionStatus::Sold | PositionStatus::Error
        )
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (Pending, Validating) => true,
            (Validating, Go) | (Validating, NoGo) => true,
            (Go, Sold) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Validate a transition, returning the target state on success.
    pub fn transition(self, next: PositionStatus) -> Result<PositionStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PositionStatus::Pending),
            "validating" => Ok(PositionStatus::Validating),
            "go" => Ok(PositionStatus::Go),
            "no_go" => Ok(PositionStatus::NoGo),
            "sold" => Ok(PositionStatus::Sold),
            "error" => Ok(PositionStatus::Error),
            other => Err(ParseError::UnknownStatus(other.to_string())),
        }
    }
}

/// Where a position's realized outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    /// Trailing stop actually closed the position
    Realized,
    /// Counterfactual replay for a rejected candidate
    Shadow,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSource::Realized => "realized",
            OutcomeSource::Shadow => "shadow",
        }
    }
}

impl FromStr for OutcomeSource {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realized" => Ok(OutcomeSource::Realized),
            "shadow" => Ok(OutcomeSource::Shadow),
            other => Err(ParseError::UnknownOutcomeSource(other.to_string())),
        }
    }
}

/// Tracked notional position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub strategy_id: String,

    /// Back-reference to the cycle the position was admitted into
    pub price_cycle_id: i64,

    pub source_wallet: String,
    pub source_trade_id: i64,

    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,

    pub status: PositionStatus,

    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,

    /// Highest price observed since entry; never decreases while open
    pub high_water_price: Decimal,

    /// Fractional return (exit / entry - 1)
    pub realized_outcome: Option<f64>,
    pub outcome_source: Option<OutcomeSource>,

    /// Structured validator log (JSON)
    pub validator_log: Option<String>,

    /// Human-readable reason for the current terminal state
    pub reason: Option<String>,

    /// Trade was detected outside the recency window
    pub stale_detection: bool,

    pub validating_since: Option<DateTime<Utc>>,
}

impl Position {
    /// Whether the position is open for trailing-stop monitoring.
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Go
    }
}

/// Data needed to admit a new position.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub strategy_id: String,
    pub price_cycle_id: i64,
    pub source_wallet: String,
    pub source_trade_id: i64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub stale_detection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let status = PositionStatus::Pending;
        let status = status.transition(PositionStatus::Validating).unwrap();
        let status = status.transition(PositionStatus::Go).unwrap();
        let status = status.transition(PositionStatus::Sold).unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn test_transitions_are_one_directional() {
        assert!(!PositionStatus::Validating.can_transition_to(PositionStatus::Pending));
        assert!(!PositionStatus::Go.can_transition_to(PositionStatus::Validating));
        assert!(!PositionStatus::Pending.can_transition_to(PositionStatus::Go));
        assert!(!PositionStatus::NoGo.can_transition_to(PositionStatus::Go));

        let err = PositionStatus::Sold.transition(PositionStatus::Error).unwrap_err();
        assert_eq!(err.from, PositionStatus::Sold);
        assert_eq!(err.to, PositionStatus::Error);
    }

    #[test]
    fn test_error_reachable_from_any_open_state() {
        for status in [
            PositionStatus::Pending,
            PositionStatus::Validating,
            PositionStatus::Go,
        ] {
            assert!(status.can_transition_to(PositionStatus::Error));
        }
    }

    #[test]
    fn test_status_storage_strings() {
        for status in [
            PositionStatus::Pending,
            PositionStatus::Validating,
            PositionStatus::Go,
            PositionStatus::NoGo,
            PositionStatus::Sold,
            PositionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<PositionStatus>().unwrap(), status);
        }
    }
}
