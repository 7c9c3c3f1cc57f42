//! Risk engine: account health, circuit breakers and stake recommendations.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RiskError;
use crate::models::{Tick, TradeOutcome};

use super::exits::ExitManager;
use super::position_sizer::{as_f64, KellyRequest, KellyVariant, PositionSizeRecommendation, PositionSizer};
use super::RiskConfig;

/// Aggregate account health. Written only by [`RiskEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub total_balance: Decimal,
    /// Highest balance seen; never decreases
    pub peak_balance: Decimal,
    /// (peak - total) / peak, always >= 0
    pub current_drawdown: f64,
    pub consecutive_losses: u32,
    /// Cumulative loss (positive magnitude) since `last_reset_date` began
    pub daily_loss: Decimal,
    pub day_start_balance: Decimal,
    pub last_reset_date: NaiveDate,
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
}

/// Why trading was halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxDrawdown,
    MaxDailyLoss,
    ConsecutiveLosses,
}

impl StopReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MaxDrawdown => "max_drawdown",
            Self::MaxDailyLoss => "max_daily_loss",
            Self::ConsecutiveLosses => "consecutive_losses",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Circuit breaker verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopDecision {
    pub stop: bool,
    pub reason: Option<StopReason>,
}

impl StopDecision {
    fn proceed() -> Self {
        Self { stop: false, reason: None }
    }

    fn halt(reason: StopReason) -> Self {
        Self {
            stop: true,
            reason: Some(reason),
        }
    }
}

/// Caller-supplied edge estimate for a stake recommendation.
#[derive(Debug, Clone, Copy)]
pub struct StakeContext {
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub variant: KellyVariant,
    /// Fraction for the fractional variant; `None` uses the configured default
    pub fraction: Option<f64>,
    /// Base risk per trade as a fraction of balance, before volatility adjustment
    pub base_risk: Decimal,
    /// Externally estimated digit volatility
    pub volatility: Option<f64>,
}

impl Default for StakeContext {
    fn default() -> Self {
        Self {
            win_rate: 0.5,
            avg_win: 1.0,
            avg_loss: 1.0,
            variant: KellyVariant::Fractional,
            fraction: None,
            base_risk: Decimal::new(2, 2),
            volatility: None,
        }
    }
}

/// Stake recommendation with its components.
#[derive(Debug, Clone, Serialize)]
pub struct StakeRecommendation {
    pub symbol: String,
    pub stake: Decimal,
    pub kelly_stake: Decimal,
    pub sizing: PositionSizeRecommendation,
    /// Set when a circuit breaker forced the stake to zero
    pub halted: Option<StopReason>,
}

/// Per-engine risk state. Callers serialize all writes through one loop.
pub struct RiskEngine {
    config: RiskConfig,
    sizer: PositionSizer,
    stats: PortfolioStats,
    exits: ExitManager,

    // Recent ticks per symbol, oldest first
    history: HashMap<String, VecDeque<Tick>>,

    // Recent outcomes (true = win) for the dynamic Kelly consistency factor
    recent_results: VecDeque<bool>,
}

impl RiskEngine {
    /// Create an engine starting from `balance`, using today's date for daily bookkeeping.
    pub fn new(config: RiskConfig, balance: Decimal) -> Result<Self, RiskError> {
        Self::new_at(config, balance, Utc::now())
    }

    /// Create an engine whose trading day starts at `now`.
    pub fn new_at(config: RiskConfig, balance: Decimal, now: DateTime<Utc>) -> Result<Self, RiskError> {
        config.validate()?;
        if balance < Decimal::ZERO {
            return Err(RiskError::InvalidParameter(format!(
                "starting balance must not be negative, got {balance}"
            )));
        }

        let stats = PortfolioStats {
            total_balance: balance,
            peak_balance: balance,
            current_drawdown: 0.0,
            consecutive_losses: 0,
            daily_loss: Decimal::ZERO,
            day_start_balance: balance,
            last_reset_date: now.date_naive(),
            total_trades: 0,
            wins: 0,
            losses: 0,
        };

        Ok(Self {
            sizer: PositionSizer::new(config.clone()),
            config,
            stats,
            exits: ExitManager::new(),
            history: HashMap::new(),
            recent_results: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn stats(&self) -> &PortfolioStats {
        &self.stats
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub fn exits(&self) -> &ExitManager {
        &self.exits
    }

    pub fn exits_mut(&mut self) -> &mut ExitManager {
        &mut self.exits
    }

    /// Drop trailing stop, partial close and scale state for a closed position.
    pub fn clear_exit_state(&mut self, id: &str) {
        self.exits.clear(id);
    }

    // ==================== Outcome Bookkeeping ====================

    /// Apply a settled trade to the account stats.
    pub fn record_trade_outcome(&mut self, outcome: &TradeOutcome) -> Option<StopReason> {
        self.record_trade_outcome_at(outcome, Utc::now())
    }

    /// Apply a settled trade as of `at`. Date rollover is checked first so a
    /// loss on a new day never counts against the previous day.
    ///
    /// Returns the breaker this trade tripped, if it changed the verdict.
    pub fn record_trade_outcome_at(&mut self, outcome: &TradeOutcome, at: DateTime<Utc>) -> Option<StopReason> {
        self.roll_day(at.date_naive());
        let halted_before = self.should_stop_trading_at(at).reason;

        let stats = &mut self.stats;
        stats.total_balance = (stats.total_balance + outcome.profit).max(Decimal::ZERO);
        if stats.total_balance > stats.peak_balance {
            stats.peak_balance = stats.total_balance;
        }
        stats.current_drawdown = drawdown(stats.peak_balance, stats.total_balance);

        stats.total_trades += 1;
        let won = outcome.result.is_win();
        if won {
            stats.wins += 1;
            stats.consecutive_losses = 0;
        } else {
            stats.losses += 1;
            stats.consecutive_losses += 1;
        }
        if outcome.profit < Decimal::ZERO {
            stats.daily_loss += -outcome.profit;
        }

        self.recent_results.push_back(won);
        while self.recent_results.len() > self.config.consistency_window {
            self.recent_results.pop_front();
        }

        debug!(
            symbol = %outcome.symbol,
            result = outcome.result.as_str(),
            profit = %outcome.profit,
            balance = %self.stats.total_balance,
            drawdown = self.stats.current_drawdown,
            streak = self.stats.consecutive_losses,
            "Recorded trade outcome"
        );

        let halted_after = self.should_stop_trading_at(at).reason;
        match halted_after {
            Some(reason) if halted_before != halted_after => {
                warn!(
                    reason = reason.code(),
                    balance = %self.stats.total_balance,
                    drawdown = self.stats.current_drawdown,
                    daily_loss = %self.stats.daily_loss,
                    streak = self.stats.consecutive_losses,
                    "Circuit breaker tripped"
                );
                Some(reason)
            }
            _ => None,
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.stats.last_reset_date {
            debug!(
                from = %self.stats.last_reset_date,
                to = %today,
                daily_loss = %self.stats.daily_loss,
                "Daily risk counters reset"
            );
            self.stats.last_reset_date = today;
            self.stats.daily_loss = Decimal::ZERO;
            self.stats.day_start_balance = self.stats.total_balance;
        }
    }

    /// Append a tick to the bounded per-symbol history.
    pub fn record_tick(&mut self, tick: &Tick) {
        let capacity = self.config.history_capacity;
        let ticks = self.history.entry(tick.symbol.clone()).or_default();
        ticks.push_back(tick.clone());
        while ticks.len() > capacity {
            ticks.pop_front();
        }
    }

    pub fn tick_count(&self, symbol: &str) -> usize {
        self.history.get(symbol).map_or(0, VecDeque::len)
    }

    // ==================== Circuit Breakers ====================

    pub fn should_stop_trading(&self) -> StopDecision {
        self.should_stop_trading_at(Utc::now())
    }

    /// First tripped breaker in order: drawdown, daily loss, losing streak.
    ///
    /// A pure query; the transition is logged when an outcome trips a breaker.
    pub fn should_stop_trading_at(&self, now: DateTime<Utc>) -> StopDecision {
        let stats = &self.stats;

        if stats.current_drawdown >= self.config.max_drawdown {
            debug!(
                drawdown = stats.current_drawdown,
                limit = self.config.max_drawdown,
                "Circuit breaker: max drawdown"
            );
            return StopDecision::halt(StopReason::MaxDrawdown);
        }

        // Losses booked on an earlier day no longer count
        let daily_loss = if now.date_naive() == stats.last_reset_date {
            stats.daily_loss
        } else {
            Decimal::ZERO
        };
        let daily_limit = stats.day_start_balance * self.config.max_daily_loss;
        if daily_loss > Decimal::ZERO && daily_loss > daily_limit {
            debug!(
                daily_loss = %daily_loss,
                limit = %daily_limit,
                "Circuit breaker: max daily loss"
            );
            return StopDecision::halt(StopReason::MaxDailyLoss);
        }

        if stats.consecutive_losses >= self.config.max_consecutive_losses {
            debug!(
                streak = stats.consecutive_losses,
                limit = self.config.max_consecutive_losses,
                "Circuit breaker: consecutive losses"
            );
            return StopDecision::halt(StopReason::ConsecutiveLosses);
        }

        StopDecision::proceed()
    }

    // ==================== Stake Sizing ====================

    /// Kelly stake for the given edge estimate.
    pub fn kelly_stake(
        &self,
        win_rate: f64,
        avg_win: f64,
        avg_loss: f64,
        balance: Decimal,
        fraction: Option<f64>,
        variant: KellyVariant,
    ) -> Decimal {
        self.sizer.kelly_stake(KellyRequest {
            win_rate,
            avg_win,
            avg_loss,
            balance,
            fraction: fraction.unwrap_or(self.config.kelly_fraction),
            variant,
            consistency: self.consistency(win_rate),
        })
    }

    /// Realised win rate relative to the expected one, clamped to [0.5, 1.5].
    /// Neutral until five outcomes have been seen.
    fn consistency(&self, expected_win_rate: f64) -> f64 {
        if self.recent_results.len() < 5 || !(expected_win_rate > 0.0) {
            return 1.0;
        }
        let wins = self.recent_results.iter().filter(|w| **w).count() as f64;
        let realised = wins / self.recent_results.len() as f64;
        (realised / expected_win_rate).clamp(0.5, 1.5)
    }

    /// Volatility/ATR/regime-adjusted stake from the symbol's recorded ticks.
    pub fn position_size(
        &self,
        symbol: &str,
        balance: Decimal,
        base_risk: Decimal,
        volatility: Option<f64>,
    ) -> PositionSizeRecommendation {
        let (digits, prices): (Vec<u8>, Vec<f64>) = self
            .history
            .get(symbol)
            .map(|ticks| ticks.iter().map(|t| (t.last_digit, t.price_f64())).unzip())
            .unwrap_or_default();

        self.sizer
            .position_size(balance, base_risk, &digits, &prices, volatility)
    }

    /// Stake to place now: the smaller of the Kelly and volatility-adjusted
    /// sizes, or zero while a circuit breaker is tripped.
    pub fn recommended_stake(&self, symbol: &str, balance: Decimal, context: &StakeContext) -> StakeRecommendation {
        self.recommended_stake_at(symbol, balance, context, Utc::now())
    }

    pub fn recommended_stake_at(
        &self,
        symbol: &str,
        balance: Decimal,
        context: &StakeContext,
        now: DateTime<Utc>,
    ) -> StakeRecommendation {
        let kelly_stake = self.kelly_stake(
            context.win_rate,
            context.avg_win,
            context.avg_loss,
            balance,
            context.fraction,
            context.variant,
        );
        let sizing = self.position_size(symbol, balance, context.base_risk, context.volatility);

        let decision = self.should_stop_trading_at(now);
        if decision.stop {
            info!(symbol = %symbol, reason = ?decision.reason, "Trading halted, stake forced to zero");
            return StakeRecommendation {
                symbol: symbol.to_string(),
                stake: Decimal::ZERO,
                kelly_stake,
                sizing,
                halted: decision.reason,
            };
        }

        let stake = kelly_stake.min(sizing.recommended).round_dp(2);
        debug!(
            symbol = %symbol,
            kelly = %kelly_stake,
            sized = %sizing.recommended,
            stake = %stake,
            "Stake recommendation"
        );

        StakeRecommendation {
            symbol: symbol.to_string(),
            stake,
            kelly_stake,
            sizing,
            halted: None,
        }
    }

    /// Win rate over the recent outcome window, if any outcomes were recorded.
    pub fn recent_win_rate(&self) -> Option<f64> {
        if self.recent_results.is_empty() {
            return None;
        }
        let wins = self.recent_results.iter().filter(|w| **w).count();
        Some(wins as f64 / self.recent_results.len() as f64)
    }
}

fn drawdown(peak: Decimal, total: Decimal) -> f64 {
    if peak <= Decimal::ZERO {
        return 0.0;
    }
    (as_f64((peak - total) / peak)).max(0.0)
}
