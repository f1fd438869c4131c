//! Strategy performance metrics.

mod calculator;

pub use calculator::{PerformanceCalculator, PerformanceReport};
