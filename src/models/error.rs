//! Errors raised when decoding stored values or applying illegal transitions.

use thiserror::Error;

use super::PositionStatus;

/// A stored string did not map onto a known enum variant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown trade side: {0}")]
    UnknownSide(String),

    #[error("unknown position status: {0}")]
    UnknownStatus(String),

    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    #[error("unknown outcome source: {0}")]
    UnknownOutcomeSource(String),
}

/// A position state change that the lifecycle does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal position transition {from} -> {to}")]
pub struct TransitionError {
    pub from: PositionStatus,
    pub to: PositionStatus,
}
