//! Backtest report types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::metrics::PerformanceMetrics;
use crate::models::{Tick, TradeResult};
use crate::risk::{digit_volatility, market_regime, MarketRegime};

use super::options::ContractType;

/// One simulated trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub symbol: String,
    pub stake: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    /// Digit the contract was written on
    pub predicted_digit: u8,
    pub exit_digit: u8,
    /// Model win probability for the contract
    pub confidence: f64,
    pub result: TradeResult,
    /// Profit before costs
    pub gross_profit: Decimal,
    pub fees: Decimal,
    pub slippage: Decimal,
    /// Profit after costs
    pub net_profit: Decimal,
    pub holding_time_ms: i64,
    pub balance_after: Decimal,
}

/// Character of the replayed market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditions {
    /// Digit volatility over the replayed ticks
    pub digit_volatility: f64,
    pub regime: MarketRegime,
    /// Count of each last digit 0-9
    pub digit_distribution: Vec<u32>,
    /// Largest deviation of any digit's share from uniform (0.1)
    pub distribution_skew: f64,
}

impl MarketConditions {
    pub fn from_ticks(ticks: &[Tick], trend_threshold: f64) -> Self {
        let digits: Vec<u8> = ticks.iter().map(|t| t.last_digit).collect();
        let prices: Vec<f64> = ticks.iter().map(Tick::price_f64).collect();

        let mut distribution = vec![0u32; 10];
        for &d in &digits {
            distribution[(d % 10) as usize] += 1;
        }
        let n = digits.len().max(1) as f64;
        let distribution_skew = distribution
            .iter()
            .map(|&c| (c as f64 / n - 0.1).abs())
            .fold(0.0, f64::max);

        Self {
            digit_volatility: digit_volatility(&digits, digits.len()).unwrap_or(0.0),
            regime: market_regime(&prices, prices.len(), trend_threshold),
            digit_distribution: distribution,
            distribution_skew,
        }
    }
}

/// Frictions applied during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRealism {
    pub fee_rate: Decimal,
    pub latency_ms: u64,
    pub adverse_selection_per_100ms: Decimal,
    pub realistic_latency: bool,
    pub total_fees: Decimal,
    pub total_slippage: Decimal,
}

/// Context for a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetadata {
    pub strategy_id: String,
    pub symbol: String,
    pub contract: ContractType,
    pub kelly_variant: String,
    pub initial_balance: Decimal,
    pub requested_trades: usize,
    pub skipped_trades: usize,
    /// Why the run ended before the requested trade count, if it did
    pub stop_reason: Option<String>,
    pub market_conditions: MarketConditions,
    pub backtest_realism: BacktestRealism,
    /// Ticks replayed, including the lookback warm-up
    pub data_points: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub performance: PerformanceMetrics,
    pub trades: Vec<BacktestTrade>,
    pub metadata: BacktestMetadata,
}

impl std::fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = &self.performance;
        let m = &self.metadata;
        let r = &p.risk_adjusted_metrics;

        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Strategy:    {} on {} ({:?})", m.strategy_id, m.symbol, m.contract)?;
        writeln!(f, "Data Points: {} ticks, regime {}", m.data_points, m.market_conditions.regime.as_str())?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", m.initial_balance)?;
        writeln!(f, "Final:       ${:.2}", p.final_balance)?;
        if m.initial_balance > Decimal::ZERO {
            writeln!(f, "Return:      {:.2}%", p.total_profit / m.initial_balance * dec!(100))?;
        }
        writeln!(f, "Fees Paid:   ${:.2}", p.total_fees)?;
        writeln!(f, "Slippage:    ${:.2}", m.backtest_realism.total_slippage)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {} ({} skipped)", p.total_trades, m.skipped_trades)?;
        writeln!(f, "Winners:     {} ({:.1}%)", p.winning_trades, p.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", p.losing_trades)?;
        writeln!(f, "Avg Win:     ${:.2}", p.avg_win)?;
        writeln!(f, "Avg Loss:    ${:.2}", p.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", p.profit_factor)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}%", p.max_drawdown * 100.0)?;
        writeln!(f, "Sharpe Ratio: {:.2}", p.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", p.sortino_ratio)?;
        writeln!(f, "VaR:          {:.2}%", r.value_at_risk * 100.0)?;
        writeln!(f, "Exp. Shortfall: {:.2}%", r.expected_shortfall * 100.0)?;
        writeln!(f, "Risk of Ruin: {:.2}%", r.risk_of_ruin * 100.0)?;
        if let Some(reason) = &m.stop_reason {
            writeln!(f)?;
            writeln!(f, "Stopped early: {reason}")?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_market_conditions_distribution() {
        let start = Utc::now();
        let ticks: Vec<Tick> = (0..20)
            .map(|i| Tick::new("R_100", start + Duration::seconds(i), Decimal::new(1000 + i, 1)))
            .collect();

        let conditions = MarketConditions::from_ticks(&ticks, 0.3);
        assert_eq!(conditions.digit_distribution.iter().sum::<u32>(), 20);
        // Each digit appears twice
        assert!(conditions.distribution_skew.abs() < 1e-12);
        // Monotonic prices
        assert_eq!(conditions.regime, MarketRegime::Trending);
    }
}
