//! Transaction cost and latency model.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::BacktestError;

/// Frictions applied to every simulated trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModel {
    /// Spread/commission cost as a fraction of stake
    pub fee_rate: Decimal,

    /// Order round-trip latency in milliseconds
    pub latency_ms: u64,

    /// Adverse-selection cost per 100 ms of latency, as a fraction of stake
    pub adverse_selection_per_100ms: Decimal,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.001),                     // 0.1% of stake
            latency_ms: 200,
            adverse_selection_per_100ms: dec!(0.0005), // 0.05% per 100 ms
        }
    }
}

/// Costs charged on one trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeCosts {
    pub fees: Decimal,
    pub slippage: Decimal,
}

impl TradeCosts {
    pub fn total(&self) -> Decimal {
        self.fees + self.slippage
    }
}

impl CostModel {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(BacktestError::InvalidOptions(format!(
                "fee_rate must be in [0, 1), got {}",
                self.fee_rate
            )));
        }
        if self.adverse_selection_per_100ms < Decimal::ZERO {
            return Err(BacktestError::InvalidOptions(format!(
                "adverse_selection_per_100ms must not be negative, got {}",
                self.adverse_selection_per_100ms
            )));
        }
        Ok(())
    }

    /// Slippage rate implied by the configured latency.
    pub fn latency_slippage_rate(&self) -> Decimal {
        self.adverse_selection_per_100ms * Decimal::from(self.latency_ms) / dec!(100)
    }

    /// Fees and slippage for a stake. Slippage is charged only with realistic latency.
    pub fn apply(&self, stake: Decimal, realistic_latency: bool) -> TradeCosts {
        let stake = stake.max(Decimal::ZERO);
        let fees = stake * self.fee_rate;
        let slippage = if realistic_latency {
            stake * self.latency_slippage_rate()
        } else {
            Decimal::ZERO
        };
        TradeCosts { fees, slippage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_costs() {
        let costs = CostModel::default().apply(dec!(100), true);
        assert_eq!(costs.fees, dec!(0.1));
        // 0.0005 * 2 (200 ms) * 100
        assert_eq!(costs.slippage, dec!(0.1));
        assert_eq!(costs.total(), dec!(0.2));
    }

    #[test]
    fn test_no_slippage_without_latency() {
        let costs = CostModel::default().apply(dec!(100), false);
        assert_eq!(costs.slippage, Decimal::ZERO);
        assert!(costs.fees >= Decimal::ZERO);
    }

    #[test]
    fn test_rejects_negative_fee() {
        let model = CostModel {
            fee_rate: dec!(-0.01),
            ..Default::default()
        };
        assert!(matches!(model.validate(), Err(BacktestError::InvalidOptions(_))));
    }
}
