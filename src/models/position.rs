//! Position model: one stake on one instrument, tracked from entry to settlement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::{TradeOutcome, TradeResult};

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A stake placed on one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique position id
    pub id: String,

    /// Instrument symbol
    pub symbol: String,

    /// Amount staked (always > 0)
    pub stake: Decimal,

    /// Predicted digit the stake was placed on
    pub prediction: u8,

    /// Open or closed
    pub status: PositionStatus,

    /// Settled result, set on close
    #[serde(default)]
    pub result: Option<TradeResult>,

    /// Net profit, set on close
    #[serde(default)]
    pub profit: Option<Decimal>,

    /// When the position was opened
    pub timestamp: DateTime<Utc>,

    /// When the position was closed
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Open a new position with a fresh id.
    pub fn open(symbol: impl Into<String>, stake: Decimal, prediction: u8, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            stake,
            prediction,
            status: PositionStatus::Open,
            result: None,
            profit: None,
            timestamp: at,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Settle the position. Returns false if it was already closed.
    pub fn settle(&mut self, outcome: &TradeOutcome, at: DateTime<Utc>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.status = PositionStatus::Closed;
        self.result = Some(outcome.result);
        self.profit = Some(outcome.profit);
        self.closed_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_settle_once() {
        let mut pos = Position::open("R_50", dec!(25), 7, Utc::now());
        assert!(pos.is_open());

        let outcome = TradeOutcome::won("R_50", dec!(25), dec!(20));
        assert!(pos.settle(&outcome, Utc::now()));
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.profit, Some(dec!(20)));

        // Second settlement is refused and leaves the first result intact
        let loss = TradeOutcome::lost("R_50", dec!(25), dec!(-25));
        assert!(!pos.settle(&loss, Utc::now()));
        assert_eq!(pos.result, Some(TradeResult::Won));
    }
}
