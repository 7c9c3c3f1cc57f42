//! Portfolio bookkeeping: positions, allocation, correlation, risk scoring.

mod assessment;
mod config;
mod correlation;
mod ledger;

pub use assessment::StressScenario;
pub use config::PortfolioConfig;
pub use ledger::{Admission, PortfolioLedger};
