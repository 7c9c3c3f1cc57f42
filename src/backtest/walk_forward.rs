//! Walk-forward analysis over rolling train/test tick windows.
//!
//! Each fold backtests the in-sample window, uses its realised win rate as the
//! sizing prior for the out-of-sample window, then backtests that window.
//! Robustness is scored from how much out-of-sample results vary across folds.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::error::BacktestError;
use crate::risk::as_f64;

use super::options::BacktestOptions;
use super::report::BacktestReport;
use super::simulator::BacktestSimulator;

/// Reported in place of an undefined coefficient of variation.
const CV_CAP: f64 = 999.0;

/// Window sizes, in ticks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub train_window: usize,
    pub test_window: usize,
    /// How far to slide between folds (defaults to test_window)
    pub step_size: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_window: 500,
            test_window: 200,
            step_size: 200,
        }
    }
}

impl WalkForwardConfig {
    pub fn new(train_window: usize, test_window: usize) -> Self {
        Self {
            train_window,
            test_window,
            step_size: test_window,
        }
    }

    #[must_use]
    pub fn with_step_size(mut self, step_size: usize) -> Self {
        self.step_size = step_size;
        self
    }

    /// Fold boundaries `(train_start, test_start, test_end)` for `len` ticks.
    pub fn folds(&self, len: usize) -> Vec<(usize, usize, usize)> {
        let mut folds = Vec::new();
        if self.step_size == 0 {
            return folds;
        }
        let mut start = 0;
        while start + self.train_window + self.test_window <= len {
            let test_start = start + self.train_window;
            folds.push((start, test_start, test_start + self.test_window));
            start += self.step_size;
        }
        folds
    }

    fn validate(&self, lookback: usize) -> Result<(), BacktestError> {
        if self.step_size == 0 {
            return Err(BacktestError::InvalidOptions("step_size must be positive".to_string()));
        }
        if self.train_window <= lookback + 1 || self.test_window < 2 {
            return Err(BacktestError::InvalidOptions(format!(
                "train_window must exceed lookback + 1 ({}) and test_window must be at least 2",
                lookback + 1
            )));
        }
        Ok(())
    }
}

/// Headline numbers of one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub trades: u32,
    pub win_rate: f64,
    pub total_profit: Decimal,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub stop_reason: Option<String>,
}

impl From<&BacktestReport> for WindowMetrics {
    fn from(report: &BacktestReport) -> Self {
        Self {
            trades: report.performance.total_trades,
            win_rate: report.performance.win_rate,
            total_profit: report.performance.total_profit,
            sharpe_ratio: report.performance.sharpe_ratio,
            max_drawdown: report.performance.max_drawdown,
            stop_reason: report.metadata.stop_reason.clone(),
        }
    }
}

/// A single train/test fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardFold {
    pub index: usize,
    pub train_start: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub in_sample: WindowMetrics,
    pub out_of_sample: WindowMetrics,
    /// In-sample win rate used as the out-of-sample sizing prior
    pub calibrated_win_rate: Option<f64>,
}

impl WalkForwardFold {
    /// Positive when the out-of-sample window did worse than in-sample.
    pub fn win_rate_degradation(&self) -> f64 {
        self.in_sample.win_rate - self.out_of_sample.win_rate
    }
}

/// Robustness classification from out-of-sample variability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Robustness {
    HighlyRobust,
    Robust,
    ModeratelyRobust,
    NotRobust,
}

impl Robustness {
    /// Classify a mean coefficient of variation.
    pub fn from_cv(cv: f64) -> Self {
        match cv {
            c if c < 0.25 => Self::HighlyRobust,
            c if c < 0.5 => Self::Robust,
            c if c < 1.0 => Self::ModeratelyRobust,
            _ => Self::NotRobust,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighlyRobust => "highly robust",
            Self::Robust => "robust",
            Self::ModeratelyRobust => "moderately robust",
            Self::NotRobust => "not robust",
        }
    }
}

/// Aggregate walk-forward results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub strategy_id: String,
    pub symbol: String,
    pub config: WalkForwardConfig,
    pub folds: Vec<WalkForwardFold>,
    pub profit_cv: f64,
    pub win_rate_cv: f64,
    /// Mean of the two coefficients of variation; lower is steadier
    pub robustness_score: f64,
    pub robustness: Robustness,
    pub out_of_sample_profit: Decimal,
    pub out_of_sample_win_rate: f64,
    pub win_rate_degradation: f64,
}

impl std::fmt::Display for WalkForwardResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " WALK-FORWARD ANALYSIS ")?;
        writeln!(f, "Strategy: {} on {}", self.strategy_id, self.symbol)?;
        writeln!(
            f,
            "Windows:  train {} / test {} / step {} ticks",
            self.config.train_window, self.config.test_window, self.config.step_size
        )?;
        writeln!(f)?;
        writeln!(f, "{:>4} {:>8} {:>8} {:>10} {:>8} {:>12}", "fold", "IS win", "OOS win", "OOS P&L", "trades", "degradation")?;
        for fold in &self.folds {
            writeln!(
                f,
                "{:>4} {:>7.1}% {:>7.1}% {:>10.2} {:>8} {:>11.1}%",
                fold.index,
                fold.in_sample.win_rate * 100.0,
                fold.out_of_sample.win_rate * 100.0,
                fold.out_of_sample.total_profit,
                fold.out_of_sample.trades,
                fold.win_rate_degradation() * 100.0
            )?;
        }
        writeln!(f)?;
        writeln!(f, "OOS Profit:   ${:.2}", self.out_of_sample_profit)?;
        writeln!(f, "OOS Win Rate: {:.1}%", self.out_of_sample_win_rate * 100.0)?;
        writeln!(f, "Profit CV:    {:.3}", self.profit_cv)?;
        writeln!(f, "Win Rate CV:  {:.3}", self.win_rate_cv)?;
        writeln!(f, "Robustness:   {} ({:.3})", self.robustness.as_str(), self.robustness_score)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Coefficient of variation (sample std / |mean|), capped when the mean is ~0.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.mean();
    let std_dev = values.std_dev();
    if !std_dev.is_finite() || std_dev < f64::EPSILON {
        return 0.0;
    }
    if !mean.is_finite() || mean.abs() < f64::EPSILON {
        return CV_CAP;
    }
    (std_dev / mean.abs()).min(CV_CAP)
}

impl BacktestSimulator {
    /// Slide train/test windows across the symbol's history, backtesting each.
    pub fn walk_forward_analysis(
        &self,
        strategy_id: &str,
        symbol: &str,
        config: &WalkForwardConfig,
        options: &BacktestOptions,
    ) -> Result<WalkForwardResult, BacktestError> {
        let _guard = self.try_begin_run()?;
        if !self.has_strategy(strategy_id) {
            return Err(BacktestError::UnknownStrategy(strategy_id.to_string()));
        }
        let ticks = self
            .history(symbol)
            .ok_or_else(|| BacktestError::NoHistory(symbol.to_string()))?;
        config.validate(options.lookback)?;

        let boundaries = config.folds(ticks.len());
        if boundaries.len() < 2 {
            return Err(BacktestError::InsufficientHistoricalData {
                requested: config.train_window + config.test_window + config.step_size,
                available: ticks.len(),
            });
        }

        info!(
            strategy = %strategy_id,
            symbol = %symbol,
            folds = boundaries.len(),
            "Starting walk-forward analysis"
        );

        let in_sample_options = BacktestOptions {
            trade_count: None,
            win_rate_prior: None,
            ..options.clone()
        };

        let mut folds = Vec::with_capacity(boundaries.len());
        for (index, (train_start, test_start, test_end)) in boundaries.into_iter().enumerate() {
            let in_sample = self.run_on_slice(strategy_id, symbol, &ticks[train_start..test_start], &in_sample_options)?;

            let calibrated_win_rate = Some(in_sample.performance.win_rate)
                .filter(|p| in_sample.performance.total_trades > 0 && *p > 0.0 && *p < 1.0);

            // Warm-up digits come from the end of the training window
            let oos_options = BacktestOptions {
                win_rate_prior: calibrated_win_rate,
                ..in_sample_options.clone()
            };
            let oos_ticks = &ticks[test_start - options.lookback..test_end];
            let out_of_sample = self.run_on_slice(strategy_id, symbol, oos_ticks, &oos_options)?;

            let fold = WalkForwardFold {
                index,
                train_start: ticks[train_start].timestamp,
                test_start: ticks[test_start].timestamp,
                test_end: ticks[test_end - 1].timestamp,
                in_sample: WindowMetrics::from(&in_sample),
                out_of_sample: WindowMetrics::from(&out_of_sample),
                calibrated_win_rate,
            };
            debug!(
                fold = index,
                is_win_rate = fold.in_sample.win_rate,
                oos_win_rate = fold.out_of_sample.win_rate,
                oos_profit = %fold.out_of_sample.total_profit,
                "Walk-forward fold"
            );
            folds.push(fold);
        }

        let profits: Vec<f64> = folds.iter().map(|f| as_f64(f.out_of_sample.total_profit)).collect();
        let win_rates: Vec<f64> = folds.iter().map(|f| f.out_of_sample.win_rate).collect();
        let profit_cv = coefficient_of_variation(&profits);
        let win_rate_cv = coefficient_of_variation(&win_rates);
        let robustness_score = (profit_cv + win_rate_cv) / 2.0;
        let robustness = Robustness::from_cv(robustness_score);

        let n = folds.len() as f64;
        let out_of_sample_profit: Decimal = folds.iter().map(|f| f.out_of_sample.total_profit).sum();
        let out_of_sample_win_rate = win_rates.iter().sum::<f64>() / n;
        let win_rate_degradation = folds.iter().map(WalkForwardFold::win_rate_degradation).sum::<f64>() / n;

        info!(
            strategy = %strategy_id,
            robustness = robustness.as_str(),
            score = robustness_score,
            "Walk-forward analysis complete"
        );

        Ok(WalkForwardResult {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            config: *config,
            folds,
            profit_cv,
            win_rate_cv,
            robustness_score,
            robustness,
            out_of_sample_profit,
            out_of_sample_win_rate,
            win_rate_degradation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::ContractType;
    use crate::models::Tick;
    use crate::oracle::FrequencyOracle;
    use chrono::{Duration, TimeZone};

    fn ticks(count: usize) -> Vec<Tick> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let pattern = [3u8, 7, 1, 7, 9, 0, 7, 4, 2, 7, 5, 8, 7, 6, 1];
        (0..count)
            .map(|i| {
                let price = Decimal::new(50_000 + (i as i64 % 25) * 10 + pattern[i % 15] as i64, 2);
                Tick::new("R_50", start + Duration::seconds(i as i64), price)
            })
            .collect()
    }

    fn simulator(count: usize) -> BacktestSimulator {
        let mut sim = BacktestSimulator::new();
        sim.register_strategy("freq", Box::new(FrequencyOracle { window: 15 }));
        sim.load_history("R_50", ticks(count));
        sim
    }

    fn options() -> BacktestOptions {
        BacktestOptions {
            contract: ContractType::Differs,
            lookback: 15,
            ..Default::default()
        }
    }

    #[test]
    fn test_fold_boundaries() {
        let config = WalkForwardConfig::new(100, 50);
        assert_eq!(config.folds(300), vec![(0, 100, 150), (50, 150, 200), (100, 200, 250), (150, 250, 300)]);
        assert!(config.with_step_size(0).folds(300).is_empty());
    }

    #[test]
    fn test_cv_guards() {
        assert_eq!(coefficient_of_variation(&[1.0]), 0.0);
        assert_eq!(coefficient_of_variation(&[2.0, 2.0, 2.0]), 0.0);
        assert_eq!(coefficient_of_variation(&[-1.0, 1.0]), CV_CAP);
        assert!((coefficient_of_variation(&[1.0, 3.0]) - 2f64.sqrt() / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_robustness_bands() {
        assert_eq!(Robustness::from_cv(0.1), Robustness::HighlyRobust);
        assert_eq!(Robustness::from_cv(0.3), Robustness::Robust);
        assert_eq!(Robustness::from_cv(0.7), Robustness::ModeratelyRobust);
        assert_eq!(Robustness::from_cv(CV_CAP), Robustness::NotRobust);
    }

    #[test]
    fn test_walk_forward_runs_each_fold() {
        let sim = simulator(600);
        let config = WalkForwardConfig::new(150, 90);
        let result = sim.walk_forward_analysis("freq", "R_50", &config, &options()).unwrap();

        assert_eq!(result.folds.len(), 5);
        for fold in &result.folds {
            assert!(fold.train_start < fold.test_start && fold.test_start <= fold.test_end);
            assert!((0.0..=1.0).contains(&fold.out_of_sample.win_rate));
            assert!(fold.out_of_sample.trades <= 89);
        }
        assert!(result.robustness_score >= 0.0);
        assert!(!sim.is_running());
    }

    #[test]
    fn test_walk_forward_needs_two_folds() {
        let sim = simulator(300);
        let config = WalkForwardConfig::new(200, 90);
        assert!(matches!(
            sim.walk_forward_analysis("freq", "R_50", &config, &options()),
            Err(BacktestError::InsufficientHistoricalData { available: 300, .. })
        ));
    }

    #[test]
    fn test_walk_forward_unknown_strategy() {
        let sim = simulator(600);
        assert_eq!(
            sim.walk_forward_analysis("nope", "R_50", &WalkForwardConfig::new(150, 90), &options()).unwrap_err(),
            BacktestError::UnknownStrategy("nope".to_string())
        );
    }
}
