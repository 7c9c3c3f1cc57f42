//! Tick-replay backtesting: single runs, walk-forward analysis and
//! strategy comparison.

mod compare;
mod costs;
mod options;
mod report;
mod simulator;
mod walk_forward;

pub use compare::StrategyComparison;
pub use costs::CostModel;
pub use options::{BacktestOptions, ContractType};
pub use report::BacktestReport;
pub use simulator::BacktestSimulator;
pub use walk_forward::{WalkForwardConfig, WalkForwardResult};
