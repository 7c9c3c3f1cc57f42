//! Backtest run options.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::BacktestError;
use crate::portfolio::PortfolioConfig;
use crate::risk::{KellyVariant, RiskConfig};

use super::costs::CostModel;

/// Digit contract traded at each decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    /// Wins when the next last digit equals the prediction
    Matches,
    /// Wins when the next last digit differs from the prediction
    Differs,
}

impl ContractType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "matches" | "match" => Some(Self::Matches),
            "differs" | "differ" => Some(Self::Differs),
            _ => None,
        }
    }

    /// Profit per unit stake on a win.
    pub fn default_payout(&self) -> Decimal {
        match self {
            Self::Matches => dec!(8.0),
            Self::Differs => dec!(0.095),
        }
    }

    /// Win probability of this contract given the oracle's match probability.
    pub fn win_probability(&self, match_probability: f64) -> f64 {
        match self {
            Self::Matches => match_probability,
            Self::Differs => 1.0 - match_probability,
        }
    }

    pub fn settles_win(&self, predicted: u8, actual: u8) -> bool {
        match self {
            Self::Matches => predicted == actual,
            Self::Differs => predicted != actual,
        }
    }
}

/// Options for one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestOptions {
    pub contract: ContractType,

    /// Profit per unit stake on a win; `None` uses the contract default
    pub payout: Option<Decimal>,

    /// Skip decision points whose win probability is below this
    pub min_confidence: f64,

    /// Digits fed to the oracle at each decision point
    pub lookback: usize,

    pub kelly_variant: KellyVariant,

    /// Fraction for the fractional Kelly variant
    pub kelly_fraction: f64,

    /// Win rate used for Kelly sizing instead of the oracle's estimate
    pub win_rate_prior: Option<f64>,

    /// Base risk per trade before volatility adjustment
    pub base_risk: Decimal,

    pub initial_balance: Decimal,

    /// Trades to simulate; `None` uses every decision point in the history
    pub trade_count: Option<usize>,

    pub cost_model: CostModel,

    /// Charge latency-based adverse selection on every trade
    pub realistic_latency: bool,

    /// Percentage trailing stop on the equity curve; the run ends when it is hit
    pub equity_trailing_stop: Option<Decimal>,

    /// VaR/ES confidence level
    pub confidence: f64,

    pub periods_per_year: f64,

    pub risk: RiskConfig,

    pub portfolio: PortfolioConfig,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        Self {
            contract: ContractType::Differs,
            payout: None,
            min_confidence: 0.0,
            lookback: 100,
            kelly_variant: KellyVariant::Fractional,
            kelly_fraction: 0.25,
            win_rate_prior: None,
            base_risk: dec!(0.02),
            initial_balance: dec!(1000),
            trade_count: None,
            cost_model: CostModel::default(),
            realistic_latency: true,
            equity_trailing_stop: None,
            confidence: 0.95,
            periods_per_year: 252.0,
            risk: RiskConfig::default(),
            portfolio: PortfolioConfig::default(),
        }
    }
}

impl BacktestOptions {
    pub fn payout(&self) -> Decimal {
        self.payout.unwrap_or_else(|| self.contract.default_payout())
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.lookback == 0 {
            return Err(BacktestError::InvalidOptions("lookback must be at least 1".to_string()));
        }
        if self.initial_balance <= Decimal::ZERO {
            return Err(BacktestError::InvalidOptions(format!(
                "initial_balance must be positive, got {}",
                self.initial_balance
            )));
        }
        if self.payout() <= Decimal::ZERO {
            return Err(BacktestError::InvalidOptions(format!(
                "payout must be positive, got {}",
                self.payout()
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(BacktestError::InvalidOptions(format!(
                "min_confidence must be in [0, 1], got {}",
                self.min_confidence
            )));
        }
        if self.base_risk <= Decimal::ZERO || self.base_risk > Decimal::ONE {
            return Err(BacktestError::InvalidOptions(format!(
                "base_risk must be in (0, 1], got {}",
                self.base_risk
            )));
        }
        if let Some(stop) = self.equity_trailing_stop {
            if stop <= Decimal::ZERO || stop >= Decimal::ONE {
                return Err(BacktestError::InvalidOptions(format!(
                    "equity_trailing_stop must be in (0, 1), got {stop}"
                )));
            }
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(BacktestError::InvalidOptions(format!(
                "confidence must be in (0, 1), got {}",
                self.confidence
            )));
        }
        self.cost_model.validate()?;
        self.risk.validate()?;
        self.portfolio.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(BacktestOptions::default().validate().is_ok());
    }

    #[test]
    fn test_contract_settlement() {
        assert!(ContractType::Matches.settles_win(3, 3));
        assert!(!ContractType::Matches.settles_win(3, 4));
        assert!(ContractType::Differs.settles_win(3, 4));
        assert!((ContractType::Differs.win_probability(0.1) - 0.9).abs() < 1e-12);
        assert_eq!(ContractType::from_str("MATCHES"), Some(ContractType::Matches));
    }

    #[test]
    fn test_rejects_zero_lookback() {
        let options = BacktestOptions {
            lookback: 0,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(BacktestError::InvalidOptions(_))));
    }
}
