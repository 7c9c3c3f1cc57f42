//! Calculator for backtest performance metrics: win rate, profit factor, Sharpe,
//! drawdown, VaR, expected shortfall and risk of ruin.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::risk::as_f64;

/// Reported in place of an infinite profit factor (wins, no losses).
pub const PROFIT_FACTOR_CAP: f64 = 999.0;

/// Tail-risk block of a performance summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskAdjustedMetrics {
    /// Historical VaR at the configured confidence, as a positive loss fraction
    pub value_at_risk: f64,
    /// Mean loss beyond the VaR threshold, as a positive fraction
    pub expected_shortfall: f64,
    /// Approximate probability of losing the whole balance (0.0 to 1.0)
    pub risk_of_ruin: f64,
}

/// Summary of a sequence of settled trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Peak-to-trough decline of equity (0.0 to 1.0)
    pub max_drawdown: f64,
    pub total_profit: Decimal,
    pub total_fees: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub expectancy: Decimal,
    pub final_balance: Decimal,
    pub risk_adjusted_metrics: RiskAdjustedMetrics,
}

/// Calculator for performance metrics.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceCalculator {
    /// VaR/ES confidence level (default 0.95)
    pub confidence: f64,
    /// Annualisation factor for Sharpe/Sortino (default 252)
    pub periods_per_year: f64,
}

impl Default for PerformanceCalculator {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            periods_per_year: 252.0,
        }
    }
}

impl PerformanceCalculator {
    pub fn new(confidence: f64, periods_per_year: f64) -> Self {
        let defaults = Self::default();
        Self {
            confidence: if confidence > 0.0 && confidence < 1.0 {
                confidence
            } else {
                defaults.confidence
            },
            periods_per_year: if periods_per_year > 0.0 {
                periods_per_year
            } else {
                defaults.periods_per_year
            },
        }
    }

    /// Calculate metrics from net per-trade profits, in trade order.
    ///
    /// Returns are measured against the running balance before each trade.
    pub fn calculate(&self, profits: &[Decimal], total_fees: Decimal, initial_balance: Decimal) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics {
            total_fees,
            final_balance: initial_balance,
            ..Default::default()
        };

        if profits.is_empty() {
            return metrics;
        }

        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            profits.iter().partition(|&&p| p > Decimal::ZERO);

        metrics.total_trades = profits.len() as u32;
        metrics.winning_trades = wins.len() as u32;
        metrics.losing_trades = losses.len() as u32;
        metrics.total_profit = profits.iter().copied().sum();
        metrics.final_balance = initial_balance + metrics.total_profit;
        metrics.win_rate = wins.len() as f64 / profits.len() as f64;

        if !wins.is_empty() {
            metrics.avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            metrics.avg_loss =
                losses.iter().map(|l| l.abs()).sum::<Decimal>() / Decimal::from(losses.len() as u32);
        }
        metrics.expectancy = metrics.total_profit / Decimal::from(profits.len() as u32);

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        metrics.profit_factor = profit_factor(gross_profit, gross_loss);

        let returns = returns_on_balance(profits, initial_balance);
        metrics.max_drawdown = max_drawdown(profits, initial_balance);
        let (sharpe, sortino) = self.sharpe_sortino(&returns);
        metrics.sharpe_ratio = sharpe;
        metrics.sortino_ratio = sortino;

        let (value_at_risk, expected_shortfall) = historical_var(&returns, self.confidence);
        metrics.risk_adjusted_metrics = RiskAdjustedMetrics {
            value_at_risk,
            expected_shortfall,
            risk_of_ruin: risk_of_ruin(&returns),
        };

        metrics
    }

    /// Annualised Sharpe and Sortino ratios (0% risk-free rate).
    fn sharpe_sortino(&self, returns: &[f64]) -> (f64, f64) {
        if returns.len() < 2 {
            return (0.0, 0.0);
        }

        let annualiser = self.periods_per_year.sqrt();
        let mean = returns.mean();
        let std_dev = returns.std_dev();

        // Constant returns carry no risk signal
        let sharpe = if std_dev.is_finite() && std_dev > f64::EPSILON {
            mean / std_dev * annualiser
        } else {
            0.0
        };

        // Downside deviation
        let negative_returns: Vec<f64> = returns.iter().filter(|&&r| r < 0.0).copied().collect();
        let sortino = if negative_returns.len() >= 2 {
            let downside_dev = negative_returns.std_dev();
            if downside_dev.is_finite() && downside_dev > f64::EPSILON {
                mean / downside_dev * annualiser
            } else {
                0.0
            }
        } else {
            0.0
        };

        (sharpe, sortino)
    }
}

/// Gross win over gross loss; 0 with no trades, capped when nothing was lost.
pub fn profit_factor(gross_profit: Decimal, gross_loss: Decimal) -> f64 {
    if gross_loss > Decimal::ZERO {
        (as_f64(gross_profit) / as_f64(gross_loss)).min(PROFIT_FACTOR_CAP)
    } else if gross_profit > Decimal::ZERO {
        PROFIT_FACTOR_CAP
    } else {
        0.0
    }
}

/// Per-trade return relative to the balance before the trade.
pub fn returns_on_balance(profits: &[Decimal], initial_balance: Decimal) -> Vec<f64> {
    let mut balance = initial_balance;
    profits
        .iter()
        .map(|profit| {
            let r = if balance > Decimal::ZERO {
                as_f64(*profit / balance)
            } else {
                0.0
            };
            balance += *profit;
            r
        })
        .collect()
}

/// Maximum peak-to-trough decline of `initial_balance + cumulative profit`, in [0, 1].
pub fn max_drawdown(profits: &[Decimal], initial_balance: Decimal) -> f64 {
    let mut equity = initial_balance;
    let mut peak = initial_balance;
    let mut max_dd = 0.0f64;

    for profit in profits {
        equity += *profit;
        if equity > peak {
            peak = equity;
        }
        if peak > Decimal::ZERO {
            let dd = as_f64((peak - equity) / peak);
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd.clamp(0.0, 1.0)
}

/// Historical VaR and expected shortfall at `confidence`, as positive loss magnitudes.
pub fn historical_var(returns: &[f64], confidence: f64) -> (f64, f64) {
    let mut sorted: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
    if sorted.is_empty() {
        return (0.0, 0.0);
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let index = (((1.0 - confidence) * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    let threshold = sorted[index];

    let tail = &sorted[..=index];
    let shortfall = tail.iter().sum::<f64>() / tail.len() as f64;

    ((-threshold).max(0.0), (-shortfall).max(0.0))
}

/// Ruin probability approximation `exp(-2 * mean / variance)` on unit capital.
///
/// A non-positive mean return is certain ruin; zero variance with a positive
/// mean is none.
pub fn risk_of_ruin(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.mean();
    if !mean.is_finite() || mean <= 0.0 {
        return 1.0;
    }
    if returns.len() < 2 {
        return 0.0;
    }
    let variance = returns.variance();
    if !variance.is_finite() || variance <= 0.0 {
        return 0.0;
    }
    (-2.0 * mean / variance).exp().clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_calculate_pnl_metrics() {
        let profits = vec![
            dec!(100), // Win
            dec!(-50), // Loss
            dec!(200), // Win
            dec!(-30), // Loss
            dec!(150), // Win
        ];

        let metrics = PerformanceCalculator::default().calculate(&profits, dec!(5), dec!(1000));

        assert_eq!(metrics.winning_trades, 3);
        assert_eq!(metrics.losing_trades, 2);
        assert_eq!(metrics.total_profit, dec!(370));
        assert_eq!(metrics.final_balance, dec!(1370));
        assert_eq!(metrics.avg_loss, dec!(40));
        assert!((metrics.win_rate - 0.6).abs() < 0.001);
        assert!((metrics.profit_factor - 450.0 / 80.0).abs() < 1e-9);
        assert!(metrics.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_constant_returns_have_zero_ratios() {
        // Every trade returns exactly 10% of the running balance
        let metrics =
            PerformanceCalculator::default().calculate(&[dec!(100), dec!(110), dec!(121)], Decimal::ZERO, dec!(1000));
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.sortino_ratio, 0.0);
        assert_eq!(metrics.final_balance, dec!(1331));

        // Steady 10% losses: no downside dispersion either
        let metrics =
            PerformanceCalculator::default().calculate(&[dec!(-100), dec!(-90), dec!(-81)], Decimal::ZERO, dec!(1000));
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.sortino_ratio, 0.0);
        assert!(returns_on_balance(&[dec!(-100), dec!(-90), dec!(-81)], dec!(1000))
            .iter()
            .all(|r| (r + 0.1).abs() < 1e-12));
    }

    #[test]
    fn test_calculate_drawdown() {
        let profits = vec![
            dec!(100), // Equity: 1100, Peak: 1100
            dec!(50),  // Equity: 1150, Peak: 1150
            dec!(-80), // Equity: 1070
            dec!(-20), // Equity: 1050, DD: 100/1150
            dec!(100), // Equity: 1150
            dec!(50),  // Equity: 1200, Peak: 1200
        ];

        let dd = max_drawdown(&profits, dec!(1000));
        assert!((dd - 100.0 / 1150.0).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_bounded_when_wiped_out() {
        let dd = max_drawdown(&[dec!(50), dec!(-500)], dec!(100));
        assert_eq!(dd, 1.0);
    }

    #[test]
    fn test_profit_factor_guards() {
        assert_eq!(profit_factor(Decimal::ZERO, Decimal::ZERO), 0.0);
        assert_eq!(profit_factor(dec!(10), Decimal::ZERO), PROFIT_FACTOR_CAP);
        assert!((profit_factor(dec!(30), dec!(10)) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_historical_var_and_shortfall() {
        // 20 returns: -0.10, -0.05, then 18 gains
        let mut returns = vec![-0.10, -0.05];
        returns.extend(std::iter::repeat(0.01).take(18));

        // index = floor(0.05 * 20) = 1 -> threshold -0.05
        let (var, es) = historical_var(&returns, 0.95);
        assert!((var - 0.05).abs() < 1e-12);
        assert!((es - 0.075).abs() < 1e-12);
    }

    #[test]
    fn test_var_never_negative() {
        let (var, es) = historical_var(&[0.01, 0.02, 0.03], 0.95);
        assert_eq!(var, 0.0);
        assert_eq!(es, 0.0);
    }

    #[test]
    fn test_risk_of_ruin() {
        assert_eq!(risk_of_ruin(&[-0.01, -0.02, 0.01]), 1.0);
        assert_eq!(risk_of_ruin(&[0.01, 0.01, 0.01]), 0.0);

        let ror = risk_of_ruin(&[0.02, -0.01, 0.03, -0.02]);
        assert!(ror > 0.0 && ror < 1.0);
    }

    #[test]
    fn test_empty_history() {
        let metrics = PerformanceCalculator::default().calculate(&[], Decimal::ZERO, dec!(100));
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.profit_factor, 0.0);
        assert_eq!(metrics.final_balance, dec!(100));
    }
}
