//! Portfolio-level risk scoring and stress testing.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::risk::as_f64;

use super::PortfolioLedger;

/// z-score of the one-sided 99% normal quantile.
const Z_99: f64 = 2.33;

/// Overall portfolio risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=24 => Self::Low,
            25..=49 => Self::Medium,
            50..=74 => Self::High,
            _ => Self::Extreme,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Extreme => "extreme",
        }
    }
}

/// Snapshot of portfolio diversification and tail risk.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioRiskAssessment {
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub position_count: usize,
    pub total_exposure: Decimal,
    /// 1 / sum(weight^2)
    pub effective_bets: f64,
    pub max_allocation: f64,
    pub max_allocation_symbol: Option<String>,
    pub average_correlation: f64,
    pub portfolio_volatility: f64,
    /// One-period 99% VaR as a fraction of exposure
    pub value_at_risk_99: f64,
    /// Remediation advice, most important first
    pub recommendations: Vec<String>,
}

/// A hypothetical shock applied to open positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// Price shock per symbol (-0.2 = 20% adverse move)
    #[serde(default)]
    pub shocks: HashMap<String, f64>,
    /// Shock for symbols without an explicit entry
    pub default_shock: f64,
    /// Stressed VaR above this ceiling counts as a breach
    pub var_limit: f64,
}

impl StressScenario {
    pub fn uniform(name: &str, shock: f64, var_limit: f64) -> Self {
        Self {
            name: name.to_string(),
            shocks: HashMap::new(),
            default_shock: shock,
            var_limit,
        }
    }

    /// Shock a single symbol, leaving the rest untouched.
    pub fn single_symbol(symbol: &str, shock: f64, var_limit: f64) -> Self {
        Self {
            name: format!("{symbol}_shock"),
            shocks: HashMap::from([(symbol.to_string(), shock)]),
            default_shock: 0.0,
            var_limit,
        }
    }

    /// Market crash and flash crash, plus a single-symbol shock on `focus` if given.
    pub fn standard_set(focus: Option<&str>) -> Vec<Self> {
        let mut scenarios = vec![
            Self::uniform("market_crash", -0.30, 0.25),
            Self::uniform("flash_crash", -0.10, 0.10),
        ];
        if let Some(symbol) = focus {
            scenarios.push(Self::single_symbol(symbol, -0.50, 0.20));
        }
        scenarios
    }

    fn shock_for(&self, symbol: &str) -> f64 {
        self.shocks.get(symbol).copied().unwrap_or(self.default_shock)
    }
}

/// Outcome of one stress scenario.
#[derive(Debug, Clone, Serialize)]
pub struct StressResult {
    pub scenario: String,
    /// Loss in currency (negative = gain)
    pub loss: Decimal,
    /// Loss as a fraction of capital
    pub loss_pct: f64,
    pub stressed_var: f64,
    pub var_limit: f64,
    pub breached: bool,
}

impl PortfolioLedger {
    /// Score diversification and tail risk of the open book.
    ///
    /// Penalties: single allocation above the concentration threshold (30),
    /// fewer effective bets than the minimum (20), high average pairwise
    /// correlation (25), 99% VaR above the limit (25).
    pub fn assess_portfolio_risk(&self) -> PortfolioRiskAssessment {
        let config = self.config();
        let allocation = self.allocation();
        let position_count = self.open_positions().len();
        let total_exposure = self.total_open_stake();

        let effective_bets = {
            let sum_sq: f64 = allocation.values().map(|w| w * w).sum();
            if sum_sq > 0.0 {
                1.0 / sum_sq
            } else {
                0.0
            }
        };

        let (max_allocation_symbol, max_allocation) = allocation
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(s, w)| (Some(s.clone()), *w))
            .unwrap_or((None, 0.0));

        let symbols: Vec<&String> = allocation.keys().collect();
        let window = config.correlation_window;
        let mut pair_sum = 0.0;
        let mut pair_count = 0usize;
        for (i, a) in symbols.iter().enumerate() {
            for b in &symbols[i + 1..] {
                pair_sum += self.calculate_correlation(a, b, window);
                pair_count += 1;
            }
        }
        let average_correlation = if pair_count > 0 {
            pair_sum / pair_count as f64
        } else {
            0.0
        };

        // sigma_p^2 = sum_i sum_j w_i w_j sigma_i sigma_j rho_ij
        let vols: Vec<f64> = symbols.iter().map(|s| self.symbol_volatility(s)).collect();
        let weights: Vec<f64> = allocation.values().copied().collect();
        let mut variance = 0.0;
        for i in 0..symbols.len() {
            for j in 0..symbols.len() {
                let rho = if i == j {
                    1.0
                } else {
                    self.calculate_correlation(symbols[i], symbols[j], window)
                };
                variance += weights[i] * weights[j] * vols[i] * vols[j] * rho;
            }
        }
        let portfolio_volatility = variance.max(0.0).sqrt();
        let value_at_risk_99 = portfolio_volatility * Z_99;

        let mut penalties: Vec<(u32, String)> = Vec::new();
        if position_count > 0 {
            if max_allocation > config.concentration_threshold {
                penalties.push((
                    30,
                    format!(
                        "Reduce concentration in {}: {:.1}% of open stake",
                        max_allocation_symbol.as_deref().unwrap_or("?"),
                        max_allocation * 100.0
                    ),
                ));
            }
            if effective_bets < config.min_effective_bets {
                penalties.push((
                    20,
                    format!(
                        "Diversify across more symbols: {effective_bets:.2} effective bets (target {:.0})",
                        config.min_effective_bets
                    ),
                ));
            }
            if average_correlation > config.high_correlation_threshold {
                penalties.push((
                    25,
                    format!("Holdings move together: average correlation {average_correlation:.2}"),
                ));
            }
            if value_at_risk_99 > config.var_limit {
                penalties.push((
                    25,
                    format!(
                        "Cut exposure: 99% VaR {:.2}% exceeds {:.2}% limit",
                        value_at_risk_99 * 100.0,
                        config.var_limit * 100.0
                    ),
                ));
            }
        }
        // Stable sort keeps insertion order for equal weights
        penalties.sort_by(|a, b| b.0.cmp(&a.0));

        let risk_score = penalties.iter().map(|(w, _)| *w).sum::<u32>().min(100);
        let risk_level = RiskLevel::from_score(risk_score);

        if risk_level >= RiskLevel::High {
            warn!(score = risk_score, level = risk_level.as_str(), "Portfolio risk elevated");
        }

        PortfolioRiskAssessment {
            risk_score,
            risk_level,
            position_count,
            total_exposure,
            effective_bets,
            max_allocation,
            max_allocation_symbol,
            average_correlation,
            portfolio_volatility,
            value_at_risk_99,
            recommendations: penalties.into_iter().map(|(_, r)| r).collect(),
        }
    }

    /// Apply each scenario's shocks to open stake and compare stressed VaR
    /// against the scenario's ceiling.
    pub fn stress_test_portfolio(&self, scenarios: &[StressScenario]) -> Vec<StressResult> {
        let stakes = self.open_stake_by_symbol();
        let base_var = self.assess_portfolio_risk().value_at_risk_99;
        let capital = as_f64(self.capital());

        scenarios
            .iter()
            .map(|scenario| {
                let loss: Decimal = stakes
                    .iter()
                    .map(|(symbol, stake)| {
                        let shock = Decimal::try_from(scenario.shock_for(symbol)).unwrap_or(Decimal::ZERO);
                        -(*stake * shock)
                    })
                    .sum();
                let loss = loss.round_dp(2);
                let loss_pct = if capital > 0.0 { as_f64(loss) / capital } else { 0.0 };
                let stressed_var = base_var + loss_pct.max(0.0);
                let breached = stressed_var > scenario.var_limit;

                info!(
                    scenario = %scenario.name,
                    loss = %loss,
                    stressed_var,
                    breached,
                    "Stress scenario"
                );

                StressResult {
                    scenario: scenario.name.clone(),
                    loss,
                    loss_pct,
                    stressed_var,
                    var_limit: scenario.var_limit,
                    breached,
                }
            })
            .collect()
    }
}
