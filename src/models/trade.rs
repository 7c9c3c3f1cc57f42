//! Trade outcome events emitted by the execution layer.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settled result of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeResult {
    Won,
    Lost,
}

impl TradeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeResult::Won => "won",
            TradeResult::Lost => "lost",
        }
    }

    pub fn is_win(&self) -> bool {
        matches!(self, TradeResult::Won)
    }
}

/// Outcome of one settled trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    /// Instrument the trade was placed on
    pub symbol: String,

    /// Amount staked
    pub stake: Decimal,

    /// Won or lost
    pub result: TradeResult,

    /// Net profit (negative on a loss)
    pub profit: Decimal,
}

impl TradeOutcome {
    pub fn won(symbol: impl Into<String>, stake: Decimal, profit: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            stake,
            result: TradeResult::Won,
            profit,
        }
    }

    pub fn lost(symbol: impl Into<String>, stake: Decimal, profit: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            stake,
            result: TradeResult::Lost,
            profit,
        }
    }

    /// Return on stake for this outcome.
    pub fn return_on_stake(&self) -> Decimal {
        if self.stake.is_zero() {
            return Decimal::ZERO;
        }
        self.profit / self.stake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_return_on_stake() {
        let outcome = TradeOutcome::won("R_100", dec!(10), dec!(9.5));
        assert_eq!(outcome.return_on_stake(), dec!(0.95));
        assert!(outcome.result.is_win());

        let outcome = TradeOutcome::lost("R_100", dec!(10), dec!(-10));
        assert_eq!(outcome.return_on_stake(), dec!(-1));
        assert_eq!(outcome.result.as_str(), "lost");
    }
}
