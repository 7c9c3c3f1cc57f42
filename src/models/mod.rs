//! Data models for ticks, trade outcomes, positions and predictions.

mod position;
mod prediction;
mod tick;
mod trade;

pub use position::Position;
pub use prediction::Prediction;
pub use tick::Tick;
pub use trade::{TradeOutcome, TradeResult};
