//! Risk management: stake sizing, circuit breakers, exit state machines.

mod config;
mod engine;
mod exits;
mod position_sizer;

pub use config::RiskConfig;
pub use engine::{RiskEngine, StakeContext};
pub use exits::TrailKind;
pub use position_sizer::{as_f64, digit_volatility, market_regime, KellyVariant, MarketRegime};
