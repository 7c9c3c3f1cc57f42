//! Performance metrics for settled trade sequences.

mod calculator;

pub use calculator::{PerformanceCalculator, PerformanceMetrics};
