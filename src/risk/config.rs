//! Risk engine configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::RiskError;

/// Configuration for stake sizing and circuit breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Drawdown from peak that halts trading (0.0 to 1.0)
    pub max_drawdown: f64,

    /// Cumulative daily loss, as a fraction of the day's opening balance, that halts trading
    pub max_daily_loss: Decimal,

    /// Losing streak length that halts trading
    pub max_consecutive_losses: u32,

    /// Smallest stake as a fraction of balance
    pub min_stake_fraction: Decimal,

    /// Largest stake as a fraction of balance
    pub max_stake_fraction: Decimal,

    /// Stake fraction used when sizing inputs are unusable
    pub fallback_stake_fraction: Decimal,

    /// Conservatism multiplier applied to every Kelly variant (0.5 = half Kelly)
    pub kelly_multiplier: f64,

    /// User fraction for fractional Kelly when the caller does not supply one
    pub kelly_fraction: f64,

    /// Number of digit deltas used to estimate volatility
    pub volatility_lookback: usize,

    /// Volatility assumed when there is not enough digit history
    pub default_volatility: f64,

    /// True-range window for the ATR estimate
    pub atr_period: usize,

    /// ATR (as a fraction of price) considered normal; higher ATR shrinks the stake
    pub reference_atr_pct: f64,

    /// Efficiency ratio above which the market counts as trending
    pub trend_threshold: f64,

    /// Recent outcomes considered by the dynamic Kelly consistency multiplier
    pub consistency_window: usize,

    /// Ticks retained per symbol
    pub history_capacity: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown: 0.20,                   // Halt at 20% drawdown
            max_daily_loss: dec!(0.10),           // Halt after losing 10% in a day
            max_consecutive_losses: 5,
            min_stake_fraction: dec!(0.001),      // 0.1% floor
            max_stake_fraction: dec!(0.05),       // 5% ceiling
            fallback_stake_fraction: dec!(0.01),  // 1% when inputs are unusable
            kelly_multiplier: 0.5,                // Half Kelly
            kelly_fraction: 0.25,
            volatility_lookback: 20,
            default_volatility: 2.5,
            atr_period: 14,
            reference_atr_pct: 0.001,
            trend_threshold: 0.3,
            consistency_window: 20,
            history_capacity: 500,
        }
    }
}

impl RiskConfig {
    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<(), RiskError> {
        if !(self.max_drawdown > 0.0 && self.max_drawdown <= 1.0) {
            return Err(RiskError::InvalidConfig(format!(
                "max_drawdown must be in (0, 1], got {}",
                self.max_drawdown
            )));
        }
        if self.max_daily_loss <= Decimal::ZERO || self.max_daily_loss > Decimal::ONE {
            return Err(RiskError::InvalidConfig(format!(
                "max_daily_loss must be in (0, 1], got {}",
                self.max_daily_loss
            )));
        }
        if self.max_consecutive_losses == 0 {
            return Err(RiskError::InvalidConfig(
                "max_consecutive_losses must be at least 1".to_string(),
            ));
        }
        if self.min_stake_fraction <= Decimal::ZERO
            || self.min_stake_fraction > self.max_stake_fraction
            || self.max_stake_fraction > Decimal::ONE
        {
            return Err(RiskError::InvalidConfig(format!(
                "stake bounds must satisfy 0 < min <= max <= 1, got [{}, {}]",
                self.min_stake_fraction, self.max_stake_fraction
            )));
        }
        if self.fallback_stake_fraction <= Decimal::ZERO
            || self.fallback_stake_fraction > self.max_stake_fraction
        {
            return Err(RiskError::InvalidConfig(format!(
                "fallback_stake_fraction must be in (0, max_stake_fraction], got {}",
                self.fallback_stake_fraction
            )));
        }
        if !(self.kelly_multiplier > 0.0 && self.kelly_multiplier <= 1.0) {
            return Err(RiskError::InvalidConfig(format!(
                "kelly_multiplier must be in (0, 1], got {}",
                self.kelly_multiplier
            )));
        }
        if !(self.kelly_fraction > 0.0 && self.kelly_fraction <= 1.0) {
            return Err(RiskError::InvalidConfig(format!(
                "kelly_fraction must be in (0, 1], got {}",
                self.kelly_fraction
            )));
        }
        if self.volatility_lookback < 2 || self.atr_period < 1 || self.consistency_window == 0 {
            return Err(RiskError::InvalidConfig(
                "lookback windows must be positive".to_string(),
            ));
        }
        if self.history_capacity <= self.volatility_lookback.max(self.atr_period) {
            return Err(RiskError::InvalidConfig(format!(
                "history_capacity {} must exceed the longest lookback window",
                self.history_capacity
            )));
        }
        if self.default_volatility <= 0.0 || self.reference_atr_pct <= 0.0 {
            return Err(RiskError::InvalidConfig(
                "default_volatility and reference_atr_pct must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_stake_bounds() {
        let config = RiskConfig {
            min_stake_fraction: dec!(0.1),
            max_stake_fraction: dec!(0.05),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RiskError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_drawdown_ceiling() {
        let config = RiskConfig {
            max_drawdown: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
