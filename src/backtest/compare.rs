//! Side-by-side comparison of strategies over the same history.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BacktestError;
use crate::metrics::PerformanceMetrics;
use crate::risk::as_f64;

use super::options::BacktestOptions;
use super::simulator::BacktestSimulator;

/// A compared metric and which direction is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparedMetric {
    TotalProfit,
    WinRate,
    ProfitFactor,
    SharpeRatio,
    SortinoRatio,
    MaxDrawdown,
    ValueAtRisk,
    RiskOfRuin,
}

impl ComparedMetric {
    pub const ALL: [ComparedMetric; 8] = [
        Self::TotalProfit,
        Self::WinRate,
        Self::ProfitFactor,
        Self::SharpeRatio,
        Self::SortinoRatio,
        Self::MaxDrawdown,
        Self::ValueAtRisk,
        Self::RiskOfRuin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalProfit => "total_profit",
            Self::WinRate => "win_rate",
            Self::ProfitFactor => "profit_factor",
            Self::SharpeRatio => "sharpe_ratio",
            Self::SortinoRatio => "sortino_ratio",
            Self::MaxDrawdown => "max_drawdown",
            Self::ValueAtRisk => "value_at_risk",
            Self::RiskOfRuin => "risk_of_ruin",
        }
    }

    pub fn lower_is_better(&self) -> bool {
        matches!(self, Self::MaxDrawdown | Self::ValueAtRisk | Self::RiskOfRuin)
    }

    pub fn value(&self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            Self::TotalProfit => as_f64(metrics.total_profit),
            Self::WinRate => metrics.win_rate,
            Self::ProfitFactor => metrics.profit_factor,
            Self::SharpeRatio => metrics.sharpe_ratio,
            Self::SortinoRatio => metrics.sortino_ratio,
            Self::MaxDrawdown => metrics.max_drawdown,
            Self::ValueAtRisk => metrics.risk_adjusted_metrics.value_at_risk,
            Self::RiskOfRuin => metrics.risk_adjusted_metrics.risk_of_ruin,
        }
    }
}

/// Best and worst strategy for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRanking {
    pub metric: ComparedMetric,
    pub best: String,
    pub best_value: f64,
    pub worst: String,
    pub worst_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySummary {
    pub strategy_id: String,
    pub performance: PerformanceMetrics,
    pub stop_reason: Option<String>,
}

/// Result of comparing strategies on one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyComparison {
    pub symbol: String,
    pub strategies: Vec<StrategySummary>,
    pub rankings: Vec<MetricRanking>,
}

impl StrategyComparison {
    pub fn ranking(&self, metric: ComparedMetric) -> Option<&MetricRanking> {
        self.rankings.iter().find(|r| r.metric == metric)
    }
}

impl std::fmt::Display for StrategyComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " STRATEGY COMPARISON ")?;
        writeln!(f, "Symbol: {}", self.symbol)?;
        writeln!(f)?;
        writeln!(f, "{:<14} {:>8} {:>10} {:>8} {:>8} {:>8}", "strategy", "trades", "profit", "win %", "sharpe", "max dd")?;
        for s in &self.strategies {
            let p = &s.performance;
            writeln!(
                f,
                "{:<14} {:>8} {:>10.2} {:>7.1}% {:>8.2} {:>7.1}%",
                s.strategy_id,
                p.total_trades,
                p.total_profit,
                p.win_rate * 100.0,
                p.sharpe_ratio,
                p.max_drawdown * 100.0
            )?;
        }
        writeln!(f)?;
        for r in &self.rankings {
            writeln!(
                f,
                "{:<14} best {} ({:.4}), worst {} ({:.4})",
                r.metric.as_str(),
                r.best,
                r.best_value,
                r.worst,
                r.worst_value
            )?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Rank summaries on every compared metric. Ties keep the earlier strategy.
pub fn rank_strategies(strategies: &[StrategySummary]) -> Vec<MetricRanking> {
    if strategies.is_empty() {
        return Vec::new();
    }
    ComparedMetric::ALL
        .iter()
        .map(|&metric| {
            let score = |s: &StrategySummary| {
                let v = metric.value(&s.performance);
                if metric.lower_is_better() {
                    -v
                } else {
                    v
                }
            };
            let mut best = &strategies[0];
            let mut worst = &strategies[0];
            for s in &strategies[1..] {
                if score(s) > score(best) {
                    best = s;
                }
                if score(s) < score(worst) {
                    worst = s;
                }
            }
            MetricRanking {
                metric,
                best: best.strategy_id.clone(),
                best_value: metric.value(&best.performance),
                worst: worst.strategy_id.clone(),
                worst_value: metric.value(&worst.performance),
            }
        })
        .collect()
}

impl BacktestSimulator {
    /// Backtest each strategy over the same history and rank them per metric.
    ///
    /// Every id is checked before any simulation runs.
    pub fn compare_strategies(
        &self,
        symbol: &str,
        strategy_ids: &[&str],
        options: &BacktestOptions,
    ) -> Result<StrategyComparison, BacktestError> {
        let _guard = self.try_begin_run()?;
        if strategy_ids.is_empty() {
            return Err(BacktestError::InvalidOptions("no strategies to compare".to_string()));
        }
        if let Some(unknown) = strategy_ids.iter().find(|id| !self.has_strategy(id)) {
            return Err(BacktestError::UnknownStrategy(unknown.to_string()));
        }
        let ticks = self
            .history(symbol)
            .ok_or_else(|| BacktestError::NoHistory(symbol.to_string()))?;

        let mut strategies = Vec::with_capacity(strategy_ids.len());
        for id in strategy_ids {
            let report = self.run_on_slice(id, symbol, ticks, options)?;
            strategies.push(StrategySummary {
                strategy_id: id.to_string(),
                performance: report.performance,
                stop_reason: report.metadata.stop_reason,
            });
        }

        let rankings = rank_strategies(&strategies);
        if let Some(profit) = rankings.first() {
            info!(symbol = %symbol, best = %profit.best, worst = %profit.worst, "Strategy comparison complete");
        }

        Ok(StrategyComparison {
            symbol: symbol.to_string(),
            strategies,
            rankings,
        })
    }
}
