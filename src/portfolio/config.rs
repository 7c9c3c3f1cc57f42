//! Portfolio ledger configuration.

use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;

/// Diversification limits and risk-scoring thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Largest share of capital a single symbol may hold (0.0 to 1.0)
    pub max_symbol_allocation: f64,

    /// Largest return correlation allowed against any open holding
    pub max_correlation: f64,

    /// Trailing returns used for correlation
    pub correlation_window: usize,

    /// Prices retained per symbol
    pub price_history_capacity: usize,

    /// Portfolio VaR (99%) above which the assessment is penalised
    pub var_limit: f64,

    /// Allocation share above which concentration is penalised
    pub concentration_threshold: f64,

    /// Effective number of bets below which diversification is penalised
    pub min_effective_bets: f64,

    /// Average pairwise correlation above which the assessment is penalised
    pub high_correlation_threshold: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            max_symbol_allocation: 0.30,       // 30% of capital per symbol
            max_correlation: 0.70,
            correlation_window: 50,
            price_history_capacity: 500,
            var_limit: 0.05,                   // 5% one-period VaR
            concentration_threshold: 0.40,
            min_effective_bets: 3.0,
            high_correlation_threshold: 0.60,
        }
    }
}

impl PortfolioConfig {
    pub fn validate(&self) -> Result<(), PortfolioError> {
        if !(self.max_symbol_allocation > 0.0 && self.max_symbol_allocation <= 1.0) {
            return Err(PortfolioError::InvalidConfig(format!(
                "max_symbol_allocation must be in (0, 1], got {}",
                self.max_symbol_allocation
            )));
        }
        if !(self.max_correlation > -1.0 && self.max_correlation <= 1.0) {
            return Err(PortfolioError::InvalidConfig(format!(
                "max_correlation must be in (-1, 1], got {}",
                self.max_correlation
            )));
        }
        if self.correlation_window < 2 || self.price_history_capacity <= self.correlation_window {
            return Err(PortfolioError::InvalidConfig(format!(
                "price_history_capacity ({}) must exceed correlation_window ({}) and the window must be at least 2",
                self.price_history_capacity, self.correlation_window
            )));
        }
        if self.var_limit <= 0.0 {
            return Err(PortfolioError::InvalidConfig(format!(
                "var_limit must be positive, got {}",
                self.var_limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PortfolioConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_window_larger_than_history() {
        let config = PortfolioConfig {
            correlation_window: 600,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
