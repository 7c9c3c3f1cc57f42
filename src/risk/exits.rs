//! Exit management state machines: trailing stops, partial-close ladders and
//! scale-in/scale-out plans.
//!
//! State is keyed by position id. Every transition is one-directional:
//! stops only ratchet favourably, ladder levels and tranches fire at most once.

use std::collections::HashMap;

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RiskError;

/// How the trailing distance is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailKind {
    /// Fixed price distance
    Fixed,
    /// Fraction of price (0.02 = 2%)
    Percentage,
}

impl TrailKind {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "percentage" | "percent" | "pct" => Self::Percentage,
            _ => Self::Fixed,
        }
    }
}

/// Trailing stop lifecycle. An uninitialized stop is simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopState {
    Armed,
    Triggered,
}

/// Exit-protection state for one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStop {
    pub entry_price: Decimal,
    pub current_stop: Decimal,
    pub trailing_amount: Decimal,
    pub kind: TrailKind,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    /// Price the market must reach before the stop starts trailing
    pub activation_price: Option<Decimal>,
    pub activated: bool,
    pub state: StopState,
}

impl TrailingStop {
    fn candidate(&self, price: Decimal, is_long: bool) -> Decimal {
        match (self.kind, is_long) {
            (TrailKind::Fixed, true) => price - self.trailing_amount,
            (TrailKind::Fixed, false) => price + self.trailing_amount,
            (TrailKind::Percentage, true) => price * (Decimal::ONE - self.trailing_amount),
            (TrailKind::Percentage, false) => price * (Decimal::ONE + self.trailing_amount),
        }
    }
}

/// Result of feeding a price to a trailing stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopUpdate {
    pub moved: bool,
    pub current_stop: Decimal,
}

/// One rung of a partial-close ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitLevel {
    /// Profit (as a fraction of stake) that triggers this rung
    pub profit_target: f64,
    /// Fraction of the current stake to close
    pub close_percent: f64,
}

/// Profit-target ladder for scaling out of a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialCloseRule {
    pub levels: Vec<ProfitLevel>,
    /// Minimum time in the trade before any rung may fire
    #[serde(with = "duration_secs")]
    pub min_holding_time: Duration,
}

#[derive(Debug, Clone)]
struct PartialCloseState {
    rule: PartialCloseRule,
    executed: Vec<bool>,
}

/// A partial close that should be executed now.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialClose {
    pub level: usize,
    pub profit_target: f64,
    pub close_percent: f64,
    pub close_amount: Decimal,
    pub remaining_amount: Decimal,
}

/// Direction a scale plan works in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleLadder {
    /// Exit tranches at ascending profit levels
    Out { profit_levels: Vec<f64> },
    /// Entry tranches at price levels, nearest first
    In {
        price_levels: Vec<Decimal>,
        total_stake: Decimal,
        is_long: bool,
    },
}

/// Multi-tranche entry or exit plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleStrategy {
    pub ladder: ScaleLadder,
    pub total_parts: usize,
    /// Fraction of stake per tranche, sums to 1
    pub stake_distribution: Vec<f64>,
    pub completed_parts: usize,
}

impl ScaleStrategy {
    pub fn is_complete(&self) -> bool {
        self.completed_parts >= self.total_parts
    }
}

/// A scale-out tranche that should be closed now.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOutExit {
    pub part: usize,
    pub profit_level: f64,
    pub close_amount: Decimal,
}

/// A scale-in tranche that should be entered now.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleInEntry {
    pub part: usize,
    pub price_level: Decimal,
    pub stake: Decimal,
}

/// Owner of all exit state, keyed by position id.
#[derive(Debug, Default)]
pub struct ExitManager {
    trailing: HashMap<String, TrailingStop>,
    partial: HashMap<String, PartialCloseState>,
    scale: HashMap<String, ScaleStrategy>,
}

impl ExitManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Trailing Stops ====================

    /// Arm a trailing stop for a long position.
    ///
    /// The stop starts `distance` below entry (or `distance` as a fraction for
    /// percentage stops).
    pub fn initialize(&mut self, id: &str, entry_price: Decimal, distance: Decimal, kind: TrailKind) -> Decimal {
        self.arm(id, entry_price, distance, kind, true, None)
    }

    /// Arm a trailing stop for a short position: the stop starts above entry.
    pub fn initialize_short(&mut self, id: &str, entry_price: Decimal, distance: Decimal, kind: TrailKind) -> Decimal {
        self.arm(id, entry_price, distance, kind, false, None)
    }

    /// Arm a stop that only starts trailing once price reaches `activation_price`.
    pub fn initialize_with_activation(
        &mut self,
        id: &str,
        entry_price: Decimal,
        distance: Decimal,
        kind: TrailKind,
        is_long: bool,
        activation_price: Decimal,
    ) -> Decimal {
        self.arm(id, entry_price, distance, kind, is_long, Some(activation_price))
    }

    fn arm(
        &mut self,
        id: &str,
        entry_price: Decimal,
        distance: Decimal,
        kind: TrailKind,
        is_long: bool,
        activation_price: Option<Decimal>,
    ) -> Decimal {
        let distance = distance.abs();
        let mut stop = TrailingStop {
            entry_price,
            current_stop: entry_price,
            trailing_amount: distance,
            kind,
            highest_price: entry_price,
            lowest_price: entry_price,
            activation_price,
            activated: activation_price.is_none(),
            state: StopState::Armed,
        };
        stop.current_stop = stop.candidate(entry_price, is_long);

        debug!(
            id = %id,
            entry = %entry_price,
            stop = %stop.current_stop,
            is_long,
            "Trailing stop armed"
        );

        let current = stop.current_stop;
        self.trailing.insert(id.to_string(), stop);
        current
    }

    /// Feed a price to the stop. The stop only moves in the favourable direction.
    pub fn update(&mut self, id: &str, current_price: Decimal, is_long: bool) -> Result<StopUpdate, RiskError> {
        let stop = self
            .trailing
            .get_mut(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))?;

        if stop.state == StopState::Triggered {
            return Ok(StopUpdate {
                moved: false,
                current_stop: stop.current_stop,
            });
        }

        if !stop.activated {
            if let Some(activation) = stop.activation_price {
                let reached = if is_long {
                    current_price >= activation
                } else {
                    current_price <= activation
                };
                if reached {
                    stop.activated = true;
                    debug!(id = %id, price = %current_price, "Trailing stop activated");
                }
            }
        }

        let mut moved = false;
        if is_long {
            if current_price > stop.highest_price {
                stop.highest_price = current_price;
                let candidate = stop.candidate(current_price, true);
                if stop.activated && candidate > stop.current_stop {
                    stop.current_stop = candidate;
                    moved = true;
                }
            }
        } else if current_price < stop.lowest_price {
            stop.lowest_price = current_price;
            let candidate = stop.candidate(current_price, false);
            if stop.activated && candidate < stop.current_stop {
                stop.current_stop = candidate;
                moved = true;
            }
        }

        if moved {
            debug!(id = %id, price = %current_price, stop = %stop.current_stop, "Trailing stop ratcheted");
        }

        Ok(StopUpdate {
            moved,
            current_stop: stop.current_stop,
        })
    }

    /// True when price has crossed the stop adversely. Crossing moves the stop
    /// to the triggered state.
    pub fn should_exit(&mut self, id: &str, current_price: Decimal, is_long: bool) -> Result<bool, RiskError> {
        let stop = self
            .trailing
            .get_mut(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))?;

        if stop.state == StopState::Triggered {
            return Ok(true);
        }

        let crossed = if is_long {
            current_price <= stop.current_stop
        } else {
            current_price >= stop.current_stop
        };

        if crossed {
            stop.state = StopState::Triggered;
            info!(id = %id, price = %current_price, stop = %stop.current_stop, "Trailing stop triggered");
        }
        Ok(crossed)
    }

    pub fn trailing_stop(&self, id: &str) -> Option<&TrailingStop> {
        self.trailing.get(id)
    }

    // ==================== Partial Close ====================

    /// Install a partial-close ladder.
    ///
    /// Levels are sorted by target. Ladders closing more than 100% are scaled
    /// down proportionally.
    pub fn set_partial_close_rules(&mut self, id: &str, rule: PartialCloseRule) {
        let mut levels: Vec<ProfitLevel> = rule
            .levels
            .into_iter()
            .filter(|l| l.profit_target.is_finite() && l.close_percent.is_finite() && l.close_percent > 0.0)
            .collect();
        levels.sort_by(|a, b| a.profit_target.total_cmp(&b.profit_target));

        let total: f64 = levels.iter().map(|l| l.close_percent).sum();
        if total > 1.0 + 1e-9 {
            warn!(id = %id, total, "Partial close ladder exceeds 100%, normalising");
            for level in &mut levels {
                level.close_percent /= total;
            }
        }

        let executed = vec![false; levels.len()];
        self.partial.insert(
            id.to_string(),
            PartialCloseState {
                rule: PartialCloseRule {
                    levels,
                    min_holding_time: rule.min_holding_time,
                },
                executed,
            },
        );
    }

    /// First unexecuted rung whose profit target is met, if the minimum
    /// holding time has elapsed. The rung is marked executed.
    pub fn should_partial_close(
        &mut self,
        id: &str,
        current_profit: f64,
        holding_time: Duration,
        current_stake: Decimal,
    ) -> Result<Option<PartialClose>, RiskError> {
        let state = self
            .partial
            .get_mut(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))?;

        if holding_time < state.rule.min_holding_time {
            return Ok(None);
        }

        let hit = state
            .rule
            .levels
            .iter()
            .enumerate()
            .find(|(i, level)| !state.executed[*i] && current_profit >= level.profit_target)
            .map(|(i, level)| (i, *level));

        let Some((index, level)) = hit else {
            return Ok(None);
        };
        state.executed[index] = true;

        let close_amount = (current_stake * fraction(level.close_percent)).round_dp(2);
        let remaining_amount = (current_stake - close_amount).max(Decimal::ZERO);

        info!(
            id = %id,
            level = index,
            profit = current_profit,
            close = %close_amount,
            "Partial close triggered"
        );

        Ok(Some(PartialClose {
            level: index,
            profit_target: level.profit_target,
            close_percent: level.close_percent,
            close_amount,
            remaining_amount,
        }))
    }

    // ==================== Scale Out / Scale In ====================

    /// Install a scale-out plan over ascending profit levels.
    ///
    /// A distribution that does not sum to 1 (or does not match the levels)
    /// falls back to equal tranches.
    pub fn create_scale_out_strategy(
        &mut self,
        id: &str,
        profit_levels: Vec<f64>,
        stake_distribution: Vec<f64>,
    ) -> Result<&ScaleStrategy, RiskError> {
        if profit_levels.is_empty() || profit_levels.iter().any(|l| !l.is_finite()) {
            return Err(RiskError::InvalidParameter(
                "scale-out plan needs at least one finite profit level".to_string(),
            ));
        }

        let distribution = checked_distribution(id, &stake_distribution, profit_levels.len());
        let mut pairs: Vec<(f64, f64)> = profit_levels.into_iter().zip(distribution).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (levels, distribution): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();

        let strategy = ScaleStrategy {
            total_parts: levels.len(),
            ladder: ScaleLadder::Out { profit_levels: levels },
            stake_distribution: distribution,
            completed_parts: 0,
        };
        self.scale.insert(id.to_string(), strategy);
        self.scale
            .get(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))
    }

    /// Next unexecuted scale-out tranche, if its profit level is reached.
    pub fn get_next_scale_out_exit(
        &mut self,
        id: &str,
        current_profit: f64,
        total_stake: Decimal,
    ) -> Result<Option<ScaleOutExit>, RiskError> {
        let strategy = self
            .scale
            .get_mut(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))?;

        let ScaleLadder::Out { profit_levels } = &strategy.ladder else {
            return Err(RiskError::InvalidParameter(format!("{id} is not a scale-out plan")));
        };
        if strategy.is_complete() {
            return Ok(None);
        }

        let part = strategy.completed_parts;
        let profit_level = profit_levels[part];
        if current_profit < profit_level {
            return Ok(None);
        }

        let close_amount = (total_stake * fraction(strategy.stake_distribution[part])).round_dp(2);
        strategy.completed_parts += 1;

        info!(id = %id, part, level = profit_level, close = %close_amount, "Scale-out tranche");

        Ok(Some(ScaleOutExit {
            part,
            profit_level,
            close_amount,
        }))
    }

    /// Install a scale-in plan. Longs add on dips (levels sorted descending),
    /// shorts add on rallies (levels sorted ascending).
    pub fn create_scale_in_strategy(
        &mut self,
        id: &str,
        mut price_levels: Vec<Decimal>,
        stake_distribution: Vec<f64>,
        total_stake: Decimal,
        is_long: bool,
    ) -> Result<&ScaleStrategy, RiskError> {
        if price_levels.is_empty() {
            return Err(RiskError::InvalidParameter(
                "scale-in plan needs at least one price level".to_string(),
            ));
        }
        if total_stake <= Decimal::ZERO {
            return Err(RiskError::InvalidParameter(format!(
                "scale-in total stake must be positive, got {total_stake}"
            )));
        }

        let distribution = checked_distribution(id, &stake_distribution, price_levels.len());
        if is_long {
            price_levels.sort_by(|a, b| b.cmp(a));
        } else {
            price_levels.sort();
        }

        let strategy = ScaleStrategy {
            total_parts: price_levels.len(),
            ladder: ScaleLadder::In {
                price_levels,
                total_stake,
                is_long,
            },
            stake_distribution: distribution,
            completed_parts: 0,
        };
        self.scale.insert(id.to_string(), strategy);
        self.scale
            .get(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))
    }

    /// Next scale-in tranche, if price has reached its level.
    pub fn get_next_scale_in_entry(&mut self, id: &str, current_price: Decimal) -> Result<Option<ScaleInEntry>, RiskError> {
        let strategy = self
            .scale
            .get_mut(id)
            .ok_or_else(|| RiskError::UnknownExitState(id.to_string()))?;

        let ScaleLadder::In { price_levels, total_stake, is_long } = &strategy.ladder else {
            return Err(RiskError::InvalidParameter(format!("{id} is not a scale-in plan")));
        };
        if strategy.is_complete() {
            return Ok(None);
        }

        let part = strategy.completed_parts;
        let price_level = price_levels[part];
        let reached = if *is_long {
            current_price <= price_level
        } else {
            current_price >= price_level
        };
        if !reached {
            return Ok(None);
        }

        let stake = (*total_stake * fraction(strategy.stake_distribution[part])).round_dp(2);
        strategy.completed_parts += 1;

        debug!(id = %id, part, level = %price_level, stake = %stake, "Scale-in tranche");

        Ok(Some(ScaleInEntry {
            part,
            price_level,
            stake,
        }))
    }

    pub fn scale_strategy(&self, id: &str) -> Option<&ScaleStrategy> {
        self.scale.get(id)
    }

    /// Drop every piece of exit state for a position.
    pub fn clear(&mut self, id: &str) {
        self.trailing.remove(id);
        self.partial.remove(id);
        self.scale.remove(id);
    }
}

fn fraction(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

/// Validate a tranche distribution, falling back to equal parts.
fn checked_distribution(id: &str, distribution: &[f64], parts: usize) -> Vec<f64> {
    let sum: f64 = distribution.iter().sum();
    let valid = distribution.len() == parts
        && distribution.iter().all(|d| d.is_finite() && *d >= 0.0)
        && (sum - 1.0).abs() < 1e-6;
    if valid {
        return distribution.to_vec();
    }
    warn!(
        id = %id,
        parts,
        sum,
        "Malformed stake distribution, using equal tranches"
    );
    vec![1.0 / parts as f64; parts]
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trailing_stop_ratchet() {
        let mut exits = ExitManager::new();
        assert_eq!(exits.initialize("p1", dec!(100), dec!(5), TrailKind::Fixed), dec!(95));

        let update = exits.update("p1", dec!(110), true).unwrap();
        assert!(update.moved);
        assert_eq!(update.current_stop, dec!(105));

        // Pullback does not move the stop
        let update = exits.update("p1", dec!(102), true).unwrap();
        assert!(!update.moved);
        assert_eq!(update.current_stop, dec!(105));

        assert!(exits.should_exit("p1", dec!(104), true).unwrap());
        assert_eq!(exits.trailing_stop("p1").unwrap().state, StopState::Triggered);
    }

    #[test]
    fn test_trailing_stop_short_and_percentage() {
        let mut exits = ExitManager::new();
        assert_eq!(exits.initialize_short("s1", dec!(100), dec!(0.1), TrailKind::Percentage), dec!(110));

        let update = exits.update("s1", dec!(90), false).unwrap();
        assert_eq!(update.current_stop, dec!(99));

        // Rally does not loosen the stop
        let update = exits.update("s1", dec!(95), false).unwrap();
        assert_eq!(update.current_stop, dec!(99));
        assert!(!exits.should_exit("s1", dec!(98), false).unwrap());
        assert!(exits.should_exit("s1", dec!(99.5), false).unwrap());
    }

    #[test]
    fn test_trailing_stop_activation() {
        let mut exits = ExitManager::new();
        exits.initialize_with_activation("a1", dec!(100), dec!(2), TrailKind::Fixed, true, dec!(105));

        // New high below activation leaves the stop alone
        let update = exits.update("a1", dec!(103), true).unwrap();
        assert!(!update.moved);
        assert_eq!(update.current_stop, dec!(98));

        let update = exits.update("a1", dec!(106), true).unwrap();
        assert!(update.moved);
        assert_eq!(update.current_stop, dec!(104));
    }

    #[test]
    fn test_unknown_stop() {
        let mut exits = ExitManager::new();
        assert_eq!(
            exits.update("missing", dec!(1), true),
            Err(RiskError::UnknownExitState("missing".to_string()))
        );
    }

    #[test]
    fn test_partial_close() {
        let mut exits = ExitManager::new();
        exits.set_partial_close_rules(
            "p1",
            PartialCloseRule {
                levels: vec![ProfitLevel {
                    profit_target: 0.5,
                    close_percent: 0.5,
                }],
                min_holding_time: Duration::seconds(30),
            },
        );

        // Too early
        let early = exits
            .should_partial_close("p1", 0.6, Duration::seconds(10), dec!(100))
            .unwrap();
        assert!(early.is_none());

        let close = exits
            .should_partial_close("p1", 0.6, Duration::seconds(60), dec!(100))
            .unwrap()
            .unwrap();
        assert_eq!(close.close_amount, dec!(50));
        assert_eq!(close.remaining_amount, dec!(50));

        // Rung fires once
        let again = exits
            .should_partial_close("p1", 0.9, Duration::seconds(90), dec!(50))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_partial_close_normalises_oversized_ladder() {
        let mut exits = ExitManager::new();
        exits.set_partial_close_rules(
            "p1",
            PartialCloseRule {
                levels: vec![
                    ProfitLevel { profit_target: 1.0, close_percent: 0.8 },
                    ProfitLevel { profit_target: 0.5, close_percent: 0.8 },
                ],
                min_holding_time: Duration::zero(),
            },
        );

        let close = exits
            .should_partial_close("p1", 2.0, Duration::zero(), dec!(100))
            .unwrap()
            .unwrap();
        // Lowest target first, halved to 0.5
        assert_eq!(close.level, 0);
        assert!((close.profit_target - 0.5).abs() < 1e-12);
        assert_eq!(close.close_amount, dec!(50));
    }

    #[test]
    fn test_scale_out() {
        let mut exits = ExitManager::new();
        exits
            .create_scale_out_strategy("p1", vec![0.25, 0.5, 1.0], vec![0.3, 0.3, 0.4])
            .unwrap();

        let exit = exits.get_next_scale_out_exit("p1", 0.3, dec!(100)).unwrap().unwrap();
        assert_eq!(exit.part, 0);
        assert_eq!(exit.close_amount, dec!(30));

        // Second level not reached yet; first tranche never repeats
        assert!(exits.get_next_scale_out_exit("p1", 0.3, dec!(100)).unwrap().is_none());

        let exit = exits.get_next_scale_out_exit("p1", 1.2, dec!(100)).unwrap().unwrap();
        assert_eq!(exit.part, 1);
        let exit = exits.get_next_scale_out_exit("p1", 1.2, dec!(100)).unwrap().unwrap();
        assert_eq!(exit.close_amount, dec!(40));
        assert!(exits.get_next_scale_out_exit("p1", 5.0, dec!(100)).unwrap().is_none());
        assert!(exits.scale_strategy("p1").unwrap().is_complete());
    }

    #[test]
    fn test_scale_out_malformed_distribution_falls_back() {
        let mut exits = ExitManager::new();
        let plan = exits
            .create_scale_out_strategy("p1", vec![0.5, 0.25], vec![0.9, 0.9])
            .unwrap();
        assert_eq!(plan.stake_distribution, vec![0.5, 0.5]);
        assert_eq!(plan.ladder, ScaleLadder::Out { profit_levels: vec![0.25, 0.5] });
    }

    #[test]
    fn test_scale_in_long() {
        let mut exits = ExitManager::new();
        exits
            .create_scale_in_strategy("p1", vec![dec!(95), dec!(98)], vec![0.5, 0.5], dec!(200), true)
            .unwrap();

        assert!(exits.get_next_scale_in_entry("p1", dec!(99)).unwrap().is_none());
        let entry = exits.get_next_scale_in_entry("p1", dec!(97)).unwrap().unwrap();
        assert_eq!(entry.price_level, dec!(98));
        assert_eq!(entry.stake, dec!(100));
        assert!(exits.get_next_scale_in_entry("p1", dec!(97)).unwrap().is_none());
    }

    #[test]
    fn test_clear_drops_state() {
        let mut exits = ExitManager::new();
        exits.initialize("p1", dec!(100), dec!(5), TrailKind::Fixed);
        exits.clear("p1");
        assert!(exits.trailing_stop("p1").is_none());
    }
}
