//! Tick-replay backtest simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::BacktestError;
use crate::metrics::PerformanceCalculator;
use crate::models::{Tick, TradeOutcome, TradeResult};
use crate::oracle::PredictionOracle;
use crate::portfolio::{Admission, PortfolioLedger};
use crate::risk::{as_f64, RiskEngine, StakeContext, TrailKind};

use super::options::BacktestOptions;
use super::report::{BacktestMetadata, BacktestRealism, BacktestReport, BacktestTrade, MarketConditions};

const EQUITY_STOP_ID: &str = "equity";

/// Holds the simulator's run flag; clears it on drop.
pub struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Replays tick history through registered strategies.
///
/// At most one run is in flight per simulator; a second attempt fails
/// immediately with [`BacktestError::BacktestAlreadyRunning`].
pub struct BacktestSimulator {
    strategies: HashMap<String, Box<dyn PredictionOracle>>,
    history: HashMap<String, Vec<Tick>>,
    running: AtomicBool,
}

impl Default for BacktestSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktestSimulator {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            history: HashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Register a prediction oracle under `id`, replacing any previous one.
    pub fn register_strategy(&mut self, id: &str, oracle: Box<dyn PredictionOracle>) {
        info!(strategy = %id, oracle = oracle.name(), "Registered strategy");
        self.strategies.insert(id.to_string(), oracle);
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.strategies.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_strategy(&self, id: &str) -> bool {
        self.strategies.contains_key(id)
    }

    /// Load tick history for a symbol. Ticks are sorted by timestamp.
    pub fn load_history(&mut self, symbol: &str, mut ticks: Vec<Tick>) {
        ticks.sort_by_key(|t| t.timestamp);
        info!(symbol = %symbol, ticks = ticks.len(), "Loaded tick history");
        self.history.insert(symbol.to_string(), ticks);
    }

    pub fn history(&self, symbol: &str) -> Option<&[Tick]> {
        self.history.get(symbol).map(Vec::as_slice)
    }

    /// Claim the run flag, or fail if a run is already in flight.
    pub fn try_begin_run(&self) -> Result<RunGuard<'_>, BacktestError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BacktestError::BacktestAlreadyRunning)?;
        Ok(RunGuard { flag: &self.running })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a backtest of `strategy_id` over the full history of `symbol`.
    pub fn run_backtest(
        &self,
        strategy_id: &str,
        symbol: &str,
        options: &BacktestOptions,
    ) -> Result<BacktestReport, BacktestError> {
        let _guard = self.try_begin_run()?;
        let ticks = self
            .history
            .get(symbol)
            .ok_or_else(|| BacktestError::NoHistory(symbol.to_string()))?;
        self.simulate(strategy_id, symbol, ticks, options)
    }

    /// Run over an explicit tick slice (walk-forward folds).
    pub(crate) fn run_on_slice(
        &self,
        strategy_id: &str,
        symbol: &str,
        ticks: &[Tick],
        options: &BacktestOptions,
    ) -> Result<BacktestReport, BacktestError> {
        self.simulate(strategy_id, symbol, ticks, options)
    }

    /// Decision points a slice supports: each needs `lookback` digits of
    /// history and one following tick to settle on.
    pub fn decision_points(tick_count: usize, lookback: usize) -> usize {
        tick_count.saturating_sub(lookback + 1)
    }

    fn simulate(
        &self,
        strategy_id: &str,
        symbol: &str,
        ticks: &[Tick],
        options: &BacktestOptions,
    ) -> Result<BacktestReport, BacktestError> {
        let oracle = self
            .strategies
            .get(strategy_id)
            .ok_or_else(|| BacktestError::UnknownStrategy(strategy_id.to_string()))?;
        options.validate()?;

        let available = Self::decision_points(ticks.len(), options.lookback);
        let requested = options.trade_count.unwrap_or(available).max(1);
        if requested > available {
            return Err(BacktestError::InsufficientHistoricalData { requested, available });
        }

        let started_at = Utc::now();
        let first = &ticks[0];
        info!(
            strategy = %strategy_id,
            symbol = %symbol,
            ticks = ticks.len(),
            trades = requested,
            contract = ?options.contract,
            "Starting backtest"
        );

        // Fresh engine and ledger per run
        let mut risk = RiskEngine::new_at(options.risk.clone(), options.initial_balance, first.timestamp)?;
        let mut ledger = PortfolioLedger::new(options.portfolio.clone(), options.initial_balance)?;

        if let Some(distance) = options.equity_trailing_stop {
            risk.exits_mut()
                .initialize(EQUITY_STOP_ID, options.initial_balance, distance, TrailKind::Percentage);
        }

        for tick in &ticks[..options.lookback] {
            risk.record_tick(tick);
            ledger.record_tick(tick);
        }

        let payout = options.payout();
        let context = StakeContext {
            win_rate: 0.5,
            avg_win: as_f64(payout),
            avg_loss: 1.0,
            variant: options.kelly_variant,
            fraction: Some(options.kelly_fraction),
            base_risk: options.base_risk,
            volatility: None,
        };

        let mut trades: Vec<BacktestTrade> = Vec::with_capacity(requested);
        let mut profits: Vec<Decimal> = Vec::with_capacity(requested);
        let mut total_fees = Decimal::ZERO;
        let mut total_slippage = Decimal::ZERO;
        let mut skipped = 0usize;
        let mut stop_reason: Option<String> = None;

        for step in 0..requested {
            let index = options.lookback + step;
            let tick = &ticks[index];
            let exit = &ticks[index + 1];
            risk.record_tick(tick);
            ledger.record_tick(tick);

            let decision = risk.should_stop_trading_at(tick.timestamp);
            if let Some(reason) = decision.reason {
                info!(symbol = %symbol, step, reason = reason.code(), "Circuit breaker tripped, ending run");
                stop_reason = Some(reason.code().to_string());
                break;
            }

            let digits: Vec<u8> = ticks[index + 1 - options.lookback..=index]
                .iter()
                .map(|t| t.last_digit)
                .collect();
            let prediction = oracle.predict(&digits);
            let win_probability = options.contract.win_probability(prediction.probability);
            if win_probability < options.min_confidence {
                skipped += 1;
                continue;
            }

            let balance = risk.stats().total_balance;
            let context = StakeContext {
                win_rate: options.win_rate_prior.unwrap_or(win_probability),
                ..context
            };
            let recommendation = risk.recommended_stake_at(symbol, balance, &context, tick.timestamp);
            let stake = recommendation.stake;
            if stake <= Decimal::ZERO {
                skipped += 1;
                continue;
            }

            ledger.set_capital(balance);
            if let Admission::Rejected(reason) = ledger.can_add_position(symbol, stake, None, None) {
                debug!(symbol = %symbol, reason = %reason, "Trade skipped by diversification gate");
                skipped += 1;
                continue;
            }
            let id = ledger.open_position(symbol, stake, prediction.digit, tick.timestamp)?;

            let won = options.contract.settles_win(prediction.digit, exit.last_digit);
            let gross_profit = if won { stake * payout } else { -stake };
            let costs = options.cost_model.apply(stake, options.realistic_latency);
            let net_profit = gross_profit - costs.total();

            let outcome = TradeOutcome {
                symbol: symbol.to_string(),
                stake,
                result: if won { TradeResult::Won } else { TradeResult::Lost },
                profit: net_profit,
            };
            ledger.close_position(&id, &outcome, exit.timestamp)?;
            risk.record_trade_outcome_at(&outcome, exit.timestamp);

            total_fees += costs.fees;
            total_slippage += costs.slippage;
            profits.push(net_profit);
            let balance_after = risk.stats().total_balance;

            trades.push(BacktestTrade {
                symbol: symbol.to_string(),
                stake,
                entry_time: tick.timestamp,
                exit_time: exit.timestamp,
                predicted_digit: prediction.digit,
                exit_digit: exit.last_digit,
                confidence: win_probability,
                result: outcome.result,
                gross_profit,
                fees: costs.fees,
                slippage: costs.slippage,
                net_profit,
                holding_time_ms: (exit.timestamp - tick.timestamp).num_milliseconds(),
                balance_after,
            });

            if options.equity_trailing_stop.is_some() {
                risk.exits_mut().update(EQUITY_STOP_ID, balance_after, true)?;
                if risk.exits_mut().should_exit(EQUITY_STOP_ID, balance_after, true)? {
                    info!(symbol = %symbol, balance = %balance_after, "Equity trailing stop hit, ending run");
                    stop_reason = Some("equity_trailing_stop".to_string());
                    break;
                }
            }

            if balance_after <= Decimal::ZERO {
                warn!(symbol = %symbol, "Balance exhausted, ending run");
                stop_reason = Some("balance_exhausted".to_string());
                break;
            }
        }
        risk.clear_exit_state(EQUITY_STOP_ID);

        let calculator = PerformanceCalculator::new(options.confidence, options.periods_per_year);
        let performance = calculator.calculate(&profits, total_fees, options.initial_balance);

        let replayed = (options.lookback + requested + 1).min(ticks.len());
        let metadata = BacktestMetadata {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            contract: options.contract,
            kelly_variant: options.kelly_variant.name().to_string(),
            initial_balance: options.initial_balance,
            requested_trades: requested,
            skipped_trades: skipped,
            stop_reason,
            market_conditions: MarketConditions::from_ticks(&ticks[..replayed], options.risk.trend_threshold),
            backtest_realism: BacktestRealism {
                fee_rate: options.cost_model.fee_rate,
                latency_ms: options.cost_model.latency_ms,
                adverse_selection_per_100ms: options.cost_model.adverse_selection_per_100ms,
                realistic_latency: options.realistic_latency,
                total_fees,
                total_slippage,
            },
            data_points: replayed,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            strategy = %strategy_id,
            symbol = %symbol,
            trades = performance.total_trades,
            win_rate = performance.win_rate,
            profit = %performance.total_profit,
            max_drawdown = performance.max_drawdown,
            "Backtest complete"
        );

        Ok(BacktestReport {
            performance,
            trades,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::ContractType;
    use crate::models::Prediction;
    use crate::oracle::{FrequencyOracle, LastDigitOracle};
    use crate::risk::RiskConfig;
    use chrono::{DateTime, Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// Deterministic ticks with digits cycling through a fixed pattern.
    fn ticks(symbol: &str, count: usize) -> Vec<Tick> {
        let pattern = [3u8, 7, 1, 7, 9, 0, 7, 4, 2, 7, 5, 8, 7, 6, 1];
        (0..count)
            .map(|i| {
                let digit = pattern[i % pattern.len()] as i64;
                let price = Decimal::new(100_000 + (i as i64 % 40) * 10 + digit, 2);
                Tick::new(symbol, start() + Duration::seconds(i as i64 * 2), price)
            })
            .collect()
    }

    struct Always(u8, f64);

    impl PredictionOracle for Always {
        fn name(&self) -> &str {
            "always"
        }

        fn predict(&self, _history: &[u8]) -> Prediction {
            Prediction::new(self.0, self.1)
        }
    }

    fn simulator() -> BacktestSimulator {
        let mut sim = BacktestSimulator::new();
        sim.register_strategy("freq", Box::new(FrequencyOracle { window: 20 }));
        sim.register_strategy("repeat", Box::new(LastDigitOracle));
        sim.load_history("R_100", ticks("R_100", 200));
        sim
    }

    fn options() -> BacktestOptions {
        BacktestOptions {
            lookback: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_insufficient_history() {
        let sim = simulator();
        let options = BacktestOptions {
            trade_count: Some(500),
            ..options()
        };
        assert_eq!(
            sim.run_backtest("freq", "R_100", &options).unwrap_err(),
            BacktestError::InsufficientHistoricalData {
                requested: 500,
                available: 179
            }
        );
    }

    #[test]
    fn test_rejects_concurrent_run() {
        let sim = simulator();
        let guard = sim.try_begin_run().unwrap();
        assert!(sim.is_running());
        assert_eq!(
            sim.run_backtest("freq", "R_100", &options()).unwrap_err(),
            BacktestError::BacktestAlreadyRunning
        );
        drop(guard);

        assert!(!sim.is_running());
        assert!(sim.run_backtest("freq", "R_100", &options()).is_ok());
        assert!(!sim.is_running());
    }

    #[test]
    fn test_rejects_concurrent_run_across_threads() {
        let sim = simulator();
        let _guard = sim.try_begin_run().unwrap();
        std::thread::scope(|s| {
            let handle = s.spawn(|| sim.run_backtest("freq", "R_100", &options()));
            assert_eq!(handle.join().unwrap().unwrap_err(), BacktestError::BacktestAlreadyRunning);
        });
    }

    #[test]
    fn test_unknown_strategy_and_symbol() {
        let sim = simulator();
        assert_eq!(
            sim.run_backtest("ensemble", "R_100", &options()).unwrap_err(),
            BacktestError::UnknownStrategy("ensemble".to_string())
        );
        assert_eq!(
            sim.run_backtest("freq", "R_10", &options()).unwrap_err(),
            BacktestError::NoHistory("R_10".to_string())
        );
        // Guard released after failures
        assert!(!sim.is_running());
    }

    #[test]
    fn test_report_bounds_and_accounting() {
        let sim = simulator();
        for (strategy, contract) in [
            ("freq", ContractType::Matches),
            ("freq", ContractType::Differs),
            ("repeat", ContractType::Differs),
        ] {
            let options = BacktestOptions {
                contract,
                ..options()
            };
            let report = sim.run_backtest(strategy, "R_100", &options).unwrap();
            let p = &report.performance;

            assert!((0.0..=1.0).contains(&p.win_rate));
            assert!((0.0..=1.0).contains(&p.max_drawdown));
            assert!(p.total_fees >= Decimal::ZERO);
            assert_eq!(p.total_trades as usize, report.trades.len());
            assert!(report.trades.iter().all(|t| t.fees >= Decimal::ZERO && t.slippage >= Decimal::ZERO));
            assert!(report.trades.iter().all(|t| t.stake > Decimal::ZERO));

            let net: Decimal = report.trades.iter().map(|t| t.net_profit).sum();
            assert_eq!(net, p.total_profit);
            assert_eq!(p.final_balance, options.initial_balance + net);
        }
    }

    #[test]
    fn test_exact_trade_count_and_costs() {
        let mut sim = simulator();
        // Digit 7 shows up 5 times in every 15 ticks
        sim.register_strategy("seven", Box::new(Always(7, 0.3)));
        let options = BacktestOptions {
            contract: ContractType::Differs,
            trade_count: Some(30),
            realistic_latency: false,
            ..options()
        };
        let report = sim.run_backtest("seven", "R_100", &options).unwrap();

        assert_eq!(report.trades.len(), 30);
        assert_eq!(report.metadata.requested_trades, 30);
        assert_eq!(report.metadata.backtest_realism.total_slippage, Decimal::ZERO);
        assert_eq!(report.metadata.data_points, 51);
        for trade in &report.trades {
            assert_eq!(trade.result.is_win(), trade.exit_digit != 7);
            assert_eq!(trade.holding_time_ms, 2000);
        }
    }

    #[test]
    fn test_min_confidence_skips_everything() {
        let mut sim = simulator();
        sim.register_strategy("weak", Box::new(Always(1, 0.05)));
        let options = BacktestOptions {
            contract: ContractType::Matches,
            min_confidence: 0.5,
            ..options()
        };
        let report = sim.run_backtest("weak", "R_100", &options).unwrap();
        assert!(report.trades.is_empty());
        assert_eq!(report.metadata.skipped_trades, 179);
        assert_eq!(report.performance.win_rate, 0.0);
    }

    #[test]
    fn test_breaker_ends_run_early() {
        let mut sim = simulator();
        // Digit 9 shows up once every 15 ticks
        sim.register_strategy("loser", Box::new(Always(9, 0.5)));
        let options = BacktestOptions {
            contract: ContractType::Matches,
            risk: RiskConfig {
                max_daily_loss: dec!(0.5),
                ..Default::default()
            },
            ..options()
        };
        let report = sim.run_backtest("loser", "R_100", &options).unwrap();

        assert_eq!(report.metadata.stop_reason.as_deref(), Some("consecutive_losses"));
        assert!(report.trades.len() < report.metadata.requested_trades);
        assert!(report.trades.iter().take(5).all(|t| !t.result.is_win()));
    }

    #[test]
    fn test_equity_trailing_stop_ends_run() {
        let mut sim = simulator();
        sim.register_strategy("seven", Box::new(Always(7, 0.3)));
        let options = BacktestOptions {
            contract: ContractType::Differs,
            equity_trailing_stop: Some(dec!(0.001)),
            ..options()
        };
        let report = sim.run_backtest("seven", "R_100", &options).unwrap();
        assert_eq!(report.metadata.stop_reason.as_deref(), Some("equity_trailing_stop"));
    }
}
