//! Position ledger across instruments with the diversification gate.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::error::PortfolioError;
use crate::models::{Position, Tick, TradeOutcome};
use crate::risk::as_f64;

use super::correlation::{pair_key, pearson, simple_returns, CorrelationEntry};
use super::PortfolioConfig;

/// Why a new position was refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidStake { stake: Decimal },
    NoCapital,
    AllocationCeiling {
        symbol: String,
        projected: f64,
        ceiling: f64,
    },
    Correlated {
        symbol: String,
        correlated_with: String,
        coefficient: f64,
        ceiling: f64,
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStake { stake } => write!(f, "stake {stake} must be positive"),
            Self::NoCapital => write!(f, "portfolio has no capital to allocate"),
            Self::AllocationCeiling {
                symbol,
                projected,
                ceiling,
            } => write!(
                f,
                "{symbol} allocation would reach {:.1}%, above the {:.1}% ceiling",
                projected * 100.0,
                ceiling * 100.0
            ),
            Self::Correlated {
                symbol,
                correlated_with,
                coefficient,
                ceiling,
            } => write!(
                f,
                "{symbol} is correlated {coefficient:.2} with open holding {correlated_with}, above the {ceiling:.2} ceiling"
            ),
        }
    }
}

/// Result of the diversification gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    Approved {
        /// Symbol share of capital after the addition
        projected_allocation: f64,
    },
    Rejected(RejectionReason),
}

impl Admission {
    pub fn is_approved(&self) -> bool {
        matches!(self, Admission::Approved { .. })
    }
}

/// Open and closed positions, per symbol, plus the price history behind correlation.
pub struct PortfolioLedger {
    config: PortfolioConfig,

    // Capital the allocation ceiling is measured against
    capital: Decimal,

    positions: HashMap<String, Vec<Position>>,

    // Position id -> symbol
    index: HashMap<String, String>,

    prices: HashMap<String, VecDeque<f64>>,
}

impl PortfolioLedger {
    pub fn new(config: PortfolioConfig, capital: Decimal) -> Result<Self, PortfolioError> {
        config.validate()?;
        Ok(Self {
            config,
            capital: capital.max(Decimal::ZERO),
            positions: HashMap::new(),
            index: HashMap::new(),
            prices: HashMap::new(),
        })
    }

    pub fn config(&self) -> &PortfolioConfig {
        &self.config
    }

    pub fn capital(&self) -> Decimal {
        self.capital
    }

    /// Update the capital base (e.g. after a settled trade).
    pub fn set_capital(&mut self, capital: Decimal) {
        self.capital = capital.max(Decimal::ZERO);
    }

    // ==================== Positions ====================

    /// Register a position. Admission is the caller's job via [`Self::can_add_position`].
    pub fn add_position(&mut self, position: Position) -> Result<String, PortfolioError> {
        if position.stake <= Decimal::ZERO {
            return Err(PortfolioError::InvalidStake {
                symbol: position.symbol.clone(),
                stake: position.stake.to_string(),
            });
        }

        let id = position.id.clone();
        debug!(
            id = %id,
            symbol = %position.symbol,
            stake = %position.stake,
            prediction = position.prediction,
            "Position opened"
        );

        self.index.insert(id.clone(), position.symbol.clone());
        self.positions
            .entry(position.symbol.clone())
            .or_default()
            .push(position);
        Ok(id)
    }

    /// Open a new position and register it.
    pub fn open_position(
        &mut self,
        symbol: &str,
        stake: Decimal,
        prediction: u8,
        at: DateTime<Utc>,
    ) -> Result<String, PortfolioError> {
        self.add_position(Position::open(symbol, stake, prediction, at))
    }

    /// Change the stake of an open position (e.g. after a partial close).
    pub fn update_position(&mut self, id: &str, stake: Decimal) -> Result<&Position, PortfolioError> {
        let position = self.position_mut(id)?;
        if !position.is_open() {
            return Err(PortfolioError::PositionAlreadyClosed(id.to_string()));
        }
        if stake <= Decimal::ZERO {
            return Err(PortfolioError::InvalidStake {
                symbol: position.symbol.clone(),
                stake: stake.to_string(),
            });
        }
        position.stake = stake;
        Ok(position)
    }

    /// Settle a position. Each position closes exactly once.
    pub fn close_position(
        &mut self,
        id: &str,
        outcome: &TradeOutcome,
        at: DateTime<Utc>,
    ) -> Result<&Position, PortfolioError> {
        let position = self.position_mut(id)?;
        if !position.settle(outcome, at) {
            return Err(PortfolioError::PositionAlreadyClosed(id.to_string()));
        }
        debug!(
            id = %id,
            symbol = %position.symbol,
            result = outcome.result.as_str(),
            profit = %outcome.profit,
            "Position closed"
        );
        Ok(position)
    }

    fn position_mut(&mut self, id: &str) -> Result<&mut Position, PortfolioError> {
        let symbol = self
            .index
            .get(id)
            .ok_or_else(|| PortfolioError::PositionNotFound(id.to_string()))?;
        self.positions
            .get_mut(symbol)
            .and_then(|list| list.iter_mut().find(|p| p.id == id))
            .ok_or_else(|| PortfolioError::PositionNotFound(id.to_string()))
    }

    pub fn get_position(&self, id: &str) -> Option<&Position> {
        let symbol = self.index.get(id)?;
        self.positions.get(symbol)?.iter().find(|p| p.id == id)
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions
            .values()
            .flatten()
            .filter(|p| p.is_open())
            .collect()
    }

    pub fn closed_positions(&self) -> Vec<&Position> {
        self.positions
            .values()
            .flatten()
            .filter(|p| !p.is_open())
            .collect()
    }

    /// Sum of profits over closed positions.
    pub fn realized_profit(&self) -> Decimal {
        self.closed_positions()
            .iter()
            .filter_map(|p| p.profit)
            .sum()
    }

    /// Open stake per symbol.
    pub fn open_stake_by_symbol(&self) -> BTreeMap<String, Decimal> {
        let mut stakes = BTreeMap::new();
        for position in self.open_positions() {
            *stakes.entry(position.symbol.clone()).or_insert(Decimal::ZERO) += position.stake;
        }
        stakes
    }

    pub fn total_open_stake(&self) -> Decimal {
        self.open_positions().iter().map(|p| p.stake).sum()
    }

    /// Each symbol's share of total open stake. Sums to 1 when positions exist.
    pub fn allocation(&self) -> BTreeMap<String, f64> {
        let stakes = self.open_stake_by_symbol();
        let total = as_f64(stakes.values().copied().sum());
        if total <= 0.0 {
            return BTreeMap::new();
        }
        stakes
            .into_iter()
            .map(|(symbol, stake)| (symbol, as_f64(stake) / total))
            .collect()
    }

    // ==================== Prices & Correlation ====================

    /// Append a tick price to the bounded per-symbol history.
    pub fn record_tick(&mut self, tick: &Tick) {
        let capacity = self.config.price_history_capacity;
        let prices = self.prices.entry(tick.symbol.clone()).or_default();
        prices.push_back(tick.price_f64());
        while prices.len() > capacity {
            prices.pop_front();
        }
    }

    fn returns(&self, symbol: &str) -> Vec<f64> {
        self.prices
            .get(symbol)
            .map(|p| simple_returns(&p.iter().copied().collect::<Vec<_>>()))
            .unwrap_or_default()
    }

    /// Sample correlation of two symbols' returns over the trailing window.
    pub fn calculate_correlation(&self, symbol_a: &str, symbol_b: &str, window: usize) -> f64 {
        if symbol_a == symbol_b {
            return 1.0;
        }
        pearson(&self.returns(symbol_a), &self.returns(symbol_b), window).0
    }

    /// Standard deviation of a symbol's trailing returns; 0 without history.
    pub fn symbol_volatility(&self, symbol: &str) -> f64 {
        let returns = self.returns(symbol);
        let window = self.config.correlation_window;
        let tail = &returns[returns.len().saturating_sub(window)..];
        if tail.len() < 2 {
            return 0.0;
        }
        let std_dev = tail.iter().std_dev();
        if std_dev.is_finite() {
            std_dev
        } else {
            0.0
        }
    }

    /// Pairwise correlations over every symbol with price history.
    pub fn correlation_matrix(&self) -> Vec<CorrelationEntry> {
        let mut symbols: Vec<&String> = self.prices.keys().collect();
        symbols.sort();

        let mut entries = Vec::new();
        for (i, a) in symbols.iter().enumerate() {
            for b in &symbols[i + 1..] {
                let (coefficient, samples) =
                    pearson(&self.returns(a), &self.returns(b), self.config.correlation_window);
                entries.push(CorrelationEntry {
                    pair_key: pair_key(a, b),
                    coefficient,
                    samples,
                });
            }
        }
        entries
    }

    // ==================== Diversification Gate ====================

    /// Decide whether `stake` more in `symbol` keeps the portfolio diversified.
    ///
    /// Rejects when the symbol's share of capital would exceed the allocation
    /// ceiling, or when the symbol's returns correlate above the ceiling with
    /// any other open holding. `None` limits use the configured defaults.
    pub fn can_add_position(
        &self,
        symbol: &str,
        stake: Decimal,
        max_symbol_allocation: Option<f64>,
        max_correlation: Option<f64>,
    ) -> Admission {
        let allocation_ceiling = max_symbol_allocation.unwrap_or(self.config.max_symbol_allocation);
        let correlation_ceiling = max_correlation.unwrap_or(self.config.max_correlation);

        let decision = self.admission(symbol, stake, allocation_ceiling, correlation_ceiling);
        if let Admission::Rejected(reason) = &decision {
            info!(symbol = %symbol, stake = %stake, reason = %reason, "Position rejected");
        }
        decision
    }

    fn admission(&self, symbol: &str, stake: Decimal, allocation_ceiling: f64, correlation_ceiling: f64) -> Admission {
        if stake <= Decimal::ZERO {
            return Admission::Rejected(RejectionReason::InvalidStake { stake });
        }
        if self.capital <= Decimal::ZERO {
            return Admission::Rejected(RejectionReason::NoCapital);
        }

        let stakes = self.open_stake_by_symbol();
        let current = stakes.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let projected = as_f64((current + stake) / self.capital);
        if projected > allocation_ceiling {
            return Admission::Rejected(RejectionReason::AllocationCeiling {
                symbol: symbol.to_string(),
                projected,
                ceiling: allocation_ceiling,
            });
        }

        for held in stakes.keys().filter(|s| s.as_str() != symbol) {
            let coefficient =
                self.calculate_correlation(symbol, held, self.config.correlation_window);
            if coefficient > correlation_ceiling {
                return Admission::Rejected(RejectionReason::Correlated {
                    symbol: symbol.to_string(),
                    correlated_with: held.clone(),
                    coefficient,
                    ceiling: correlation_ceiling,
                });
            }
        }

        Admission::Approved {
            projected_allocation: projected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn ledger(capital: Decimal) -> PortfolioLedger {
        PortfolioLedger::new(PortfolioConfig::default(), capital).unwrap()
    }

    fn feed(ledger: &mut PortfolioLedger, symbol: &str, prices: &[f64]) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for (i, price) in prices.iter().enumerate() {
            let price = Decimal::try_from(*price).unwrap();
            ledger.record_tick(&Tick::new(symbol, start + Duration::seconds(i as i64), price));
        }
    }

    #[test]
    fn test_allocation_sums_to_one() {
        let mut ledger = ledger(dec!(1000));
        ledger.open_position("R_10", dec!(30), 1, Utc::now()).unwrap();
        ledger.open_position("R_10", dec!(10), 2, Utc::now()).unwrap();
        ledger.open_position("R_50", dec!(60), 3, Utc::now()).unwrap();

        let allocation = ledger.allocation();
        assert!((allocation["R_10"] - 0.4).abs() < 1e-12);
        assert!((allocation["R_50"] - 0.6).abs() < 1e-12);
        assert!((allocation.values().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_allocation() {
        assert!(ledger(dec!(1000)).allocation().is_empty());
    }

    #[test]
    fn test_rejects_allocation_above_ceiling() {
        let mut ledger = ledger(dec!(1000));
        ledger.open_position("R_100", dec!(250), 4, Utc::now()).unwrap();

        let admission = ledger.can_add_position("R_100", dec!(100), None, None);
        match admission {
            Admission::Rejected(reason) => {
                assert!(matches!(reason, RejectionReason::AllocationCeiling { ceiling, .. } if ceiling == 0.30));
                assert!(reason.to_string().contains("30.0% ceiling"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        assert!(ledger.can_add_position("R_100", dec!(40), None, None).is_approved());
    }

    #[test]
    fn test_rejects_correlated_holding() {
        let mut ledger = ledger(dec!(1000));
        let base = [100.0, 101.0, 100.5, 102.0, 101.0, 103.0, 102.5, 104.0, 103.0, 105.0];
        let twin: Vec<f64> = base.iter().map(|p| p * 2.0).collect();
        let inverse = [100.0, 99.0, 99.5, 98.0, 99.0, 97.0, 97.5, 96.0, 97.0, 95.0];
        feed(&mut ledger, "R_25", &base);
        feed(&mut ledger, "R_75", &twin);
        feed(&mut ledger, "R_10", &inverse);

        ledger.open_position("R_25", dec!(100), 5, Utc::now()).unwrap();

        match ledger.can_add_position("R_75", dec!(100), None, None) {
            Admission::Rejected(RejectionReason::Correlated {
                correlated_with,
                coefficient,
                ..
            }) => {
                assert_eq!(correlated_with, "R_25");
                assert!(coefficient > 0.99);
            }
            other => panic!("expected correlation rejection, got {other:?}"),
        }

        // Negatively correlated symbol diversifies
        assert!(ledger.can_add_position("R_10", dec!(100), None, None).is_approved());
    }

    #[test]
    fn test_close_exactly_once() {
        let mut ledger = ledger(dec!(1000));
        let id = ledger.open_position("R_50", dec!(10), 7, Utc::now()).unwrap();

        let outcome = TradeOutcome::won("R_50", dec!(10), dec!(9));
        ledger.close_position(&id, &outcome, Utc::now()).unwrap();
        assert_eq!(
            ledger.close_position(&id, &outcome, Utc::now()).unwrap_err(),
            PortfolioError::PositionAlreadyClosed(id.clone())
        );

        assert_eq!(ledger.realized_profit(), dec!(9));
        assert!(ledger.open_positions().is_empty());
        assert_eq!(ledger.closed_positions().len(), 1);
    }

    #[test]
    fn test_invalid_stake_and_unknown_id() {
        let mut ledger = ledger(dec!(1000));
        assert!(matches!(
            ledger.open_position("R_50", dec!(0), 1, Utc::now()),
            Err(PortfolioError::InvalidStake { .. })
        ));
        assert_eq!(
            ledger.update_position("nope", dec!(5)).unwrap_err(),
            PortfolioError::PositionNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_update_position_stake() {
        let mut ledger = ledger(dec!(1000));
        let id = ledger.open_position("R_50", dec!(10), 1, Utc::now()).unwrap();
        assert_eq!(ledger.update_position(&id, dec!(4)).unwrap().stake, dec!(4));
        assert_eq!(ledger.total_open_stake(), dec!(4));
    }

    #[test]
    fn test_correlation_matrix_pairs() {
        let mut ledger = ledger(dec!(1000));
        feed(&mut ledger, "A", &[1.0, 2.0, 3.0, 5.0]);
        feed(&mut ledger, "B", &[1.0, 2.0, 3.0, 5.0]);
        feed(&mut ledger, "C", &[5.0, 4.0, 4.5, 3.0]);

        let matrix = ledger.correlation_matrix();
        assert_eq!(matrix.len(), 3);
        assert_eq!(matrix[0].pair_key, "A|B");
        assert!(matrix.iter().all(|e| (-1.0..=1.0).contains(&e.coefficient)));
    }
}
