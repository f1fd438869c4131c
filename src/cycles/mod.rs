//! Drawdown cycle tracking.
//!
//! A cycle for (asset, threshold) opens at a price sample, follows the
//! running peak, and closes as soon as the price falls to
//! `peak * (1 - threshold)`; the closing sample immediately opens the next
//! cycle. Exactly one cycle is open per (asset, threshold) at any time once
//! the first sample has been seen.

mod tracker;

pub use tracker::{step, CycleEvent, CycleStep, CycleTracker, TrackerHealth};
