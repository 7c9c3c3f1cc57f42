//! Stake sizing: Kelly criterion variants and volatility/ATR-adjusted sizing.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, warn};

use super::RiskConfig;

/// Kelly criterion flavour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KellyVariant {
    /// Raw edge-optimal fraction
    Classic,
    /// Raw fraction times the caller's fraction
    Fractional,
    /// Win rate shrunk by its binomial standard error before sizing
    Robust { sample_size: u32 },
    /// Raw fraction scaled by recent consistency (0.5x to 1.5x)
    Dynamic,
}

impl KellyVariant {
    pub fn from_str(s: &str, sample_size: u32) -> Self {
        match s.to_lowercase().as_str() {
            "classic" | "full" => Self::Classic,
            "robust" => Self::Robust { sample_size },
            "dynamic" => Self::Dynamic,
            _ => Self::Fractional,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Fractional => "fractional",
            Self::Robust { .. } => "robust",
            Self::Dynamic => "dynamic",
        }
    }
}

/// Inputs to a Kelly stake calculation.
#[derive(Debug, Clone, Copy)]
pub struct KellyRequest {
    /// Probability of winning (must be strictly between 0 and 1)
    pub win_rate: f64,
    /// Average profit of a winning trade
    pub avg_win: f64,
    /// Average loss of a losing trade (positive magnitude)
    pub avg_loss: f64,
    /// Balance to size against
    pub balance: Decimal,
    /// Caller fraction for the fractional variant
    pub fraction: f64,
    pub variant: KellyVariant,
    /// Consistency multiplier for the dynamic variant, already clamped
    pub consistency: f64,
}

/// Broad market character used to nudge stakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Trending,
    Ranging,
    Undetermined,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Undetermined => "undetermined",
        }
    }
}

/// Breakdown of a volatility/ATR-based size recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeRecommendation {
    /// Digit volatility used (supplied or estimated)
    pub volatility: f64,
    pub volatility_multiplier: f64,
    pub volatility_size: Decimal,
    /// Average true range, when enough prices were available
    pub atr: Option<f64>,
    pub atr_size: Decimal,
    pub regime: MarketRegime,
    /// Final stake after regime adjustment and bounds
    pub recommended: Decimal,
}

/// Calculator for stake sizes.
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Fail-safe stake used when the sizing inputs are unusable.
    pub fn fallback_stake(&self, balance: Decimal) -> Decimal {
        balance * self.config.fallback_stake_fraction
    }

    /// Kelly criterion stake.
    ///
    /// f* = (b * p - q) / b
    /// where:
    ///   p = probability of winning
    ///   q = 1 - p
    ///   b = avg_win / avg_loss
    ///
    /// Every variant is multiplied by the half-Kelly conservatism factor and
    /// clamped to the configured stake bounds. Unusable inputs return the
    /// fallback stake.
    pub fn kelly_stake(&self, req: KellyRequest) -> Decimal {
        let p = req.win_rate;
        if !p.is_finite() || p <= 0.0 || p >= 1.0 {
            warn!(win_rate = p, "Win rate outside (0, 1), using fallback stake");
            return self.fallback_stake(req.balance);
        }
        if !req.avg_loss.is_finite() || req.avg_loss <= 0.0 {
            warn!(avg_loss = req.avg_loss, "Non-positive average loss, using fallback stake");
            return self.fallback_stake(req.balance);
        }
        if !req.avg_win.is_finite() || req.avg_win <= 0.0 {
            warn!(avg_win = req.avg_win, "Non-positive average win, using fallback stake");
            return self.fallback_stake(req.balance);
        }

        let b = req.avg_win / req.avg_loss;

        let raw = match req.variant {
            KellyVariant::Classic => Self::kelly_fraction(p, b),
            KellyVariant::Fractional => {
                let fraction = if req.fraction > 0.0 && req.fraction <= 1.0 {
                    req.fraction
                } else {
                    self.config.kelly_fraction
                };
                Self::kelly_fraction(p, b) * fraction
            }
            KellyVariant::Robust { sample_size } => {
                let n = sample_size.max(1) as f64;
                let std_err = (p * (1.0 - p) / n).sqrt();
                Self::kelly_fraction((p - std_err).max(0.0), b)
            }
            KellyVariant::Dynamic => Self::kelly_fraction(p, b) * req.consistency.clamp(0.5, 1.5),
        };

        let adjusted = raw * self.config.kelly_multiplier;
        debug!(
            variant = req.variant.name(),
            raw_fraction = raw,
            adjusted_fraction = adjusted,
            "Kelly fraction"
        );

        req.balance * self.clamp_fraction(adjusted)
    }

    /// Edge-optimal fraction for win probability `p` and payoff ratio `b`.
    pub fn kelly_fraction(p: f64, b: f64) -> f64 {
        if b <= 0.0 {
            return 0.0;
        }
        (b * p - (1.0 - p)) / b
    }

    /// Clamp a stake fraction to the configured bounds.
    fn clamp_fraction(&self, fraction: f64) -> Decimal {
        let fraction = if fraction.is_finite() {
            Decimal::try_from(fraction).unwrap_or(self.config.min_stake_fraction)
        } else {
            self.config.min_stake_fraction
        };
        fraction
            .max(self.config.min_stake_fraction)
            .min(self.config.max_stake_fraction)
    }

    /// Volatility- and ATR-adjusted stake.
    ///
    /// `digits` and `prices` are the recent history for the instrument, oldest first.
    /// The recommendation is the smaller of the volatility-based and ATR-based
    /// sizes, then nudged up 10% in trending markets and down 10% in ranging ones.
    pub fn position_size(
        &self,
        balance: Decimal,
        base_risk: Decimal,
        digits: &[u8],
        prices: &[f64],
        volatility: Option<f64>,
    ) -> PositionSizeRecommendation {
        let volatility = volatility
            .filter(|v| v.is_finite() && *v >= 0.0)
            .or_else(|| digit_volatility(digits, self.config.volatility_lookback))
            .unwrap_or(self.config.default_volatility);

        let vol_multiplier = volatility_multiplier(volatility);
        let base_size = balance * base_risk;
        let volatility_size = base_size * to_decimal(vol_multiplier);

        let atr = average_true_range(prices, self.config.atr_period);
        let atr_size = match (atr, prices.last()) {
            (Some(atr), Some(&last)) if atr > 0.0 && last > 0.0 => {
                let atr_pct = atr / last;
                let atr_multiplier = (self.config.reference_atr_pct / atr_pct).clamp(0.3, 1.2);
                base_size * to_decimal(atr_multiplier)
            }
            // Flat or missing prices give no ATR constraint
            _ => volatility_size,
        };

        let regime = market_regime(
            prices,
            self.config.volatility_lookback,
            self.config.trend_threshold,
        );
        let regime_multiplier = match regime {
            MarketRegime::Trending => 1.1,
            MarketRegime::Ranging => 0.9,
            MarketRegime::Undetermined => 1.0,
        };

        let sized = volatility_size.min(atr_size) * to_decimal(regime_multiplier);
        let recommended = sized
            .max(balance * self.config.min_stake_fraction)
            .min(balance * self.config.max_stake_fraction)
            .round_dp(2);

        PositionSizeRecommendation {
            volatility,
            volatility_multiplier: vol_multiplier,
            volatility_size,
            atr,
            atr_size,
            regime,
            recommended,
        }
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ONE)
}

/// Standard deviation of absolute consecutive digit changes over the last `lookback` deltas.
///
/// Returns `None` when fewer than five deltas are available.
pub fn digit_volatility(digits: &[u8], lookback: usize) -> Option<f64> {
    let deltas: Vec<f64> = digits
        .windows(2)
        .map(|w| (w[1] as f64 - w[0] as f64).abs())
        .collect();
    if deltas.len() < 5 {
        return None;
    }
    let start = deltas.len().saturating_sub(lookback);
    let std_dev = deltas[start..].iter().std_dev();
    std_dev.is_finite().then_some(std_dev)
}

/// Stake multiplier for a digit volatility band.
pub fn volatility_multiplier(volatility: f64) -> f64 {
    match volatility {
        v if v < 1.5 => 1.2, // low
        v if v < 2.5 => 1.0, // normal
        v if v < 3.5 => 0.8, // elevated
        v if v < 4.5 => 0.5, // high
        _ => 0.3,            // extreme
    }
}

/// Mean true range over the last `period` price changes.
///
/// Ticks carry a single price, so the true range is the absolute change from
/// the previous close.
pub fn average_true_range(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }
    let tail = &prices[prices.len() - period - 1..];
    let ranges: Vec<f64> = tail.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    Some(ranges.iter().mean())
}

/// Classify the market by its efficiency ratio (net move / path length).
pub fn market_regime(prices: &[f64], window: usize, trend_threshold: f64) -> MarketRegime {
    if window < 2 || prices.len() < window {
        return MarketRegime::Undetermined;
    }
    let tail = &prices[prices.len() - window..];
    let path: f64 = tail.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    if path <= 0.0 {
        return MarketRegime::Ranging;
    }
    let net = (tail[tail.len() - 1] - tail[0]).abs();
    if net / path >= trend_threshold {
        MarketRegime::Trending
    } else {
        MarketRegime::Ranging
    }
}

/// Convert a Decimal to f64 for statistics, defaulting to zero.
pub fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sizer() -> PositionSizer {
        PositionSizer::new(RiskConfig::default())
    }

    fn request(win_rate: f64, variant: KellyVariant) -> KellyRequest {
        KellyRequest {
            win_rate,
            avg_win: 100.0,
            avg_loss: 100.0,
            balance: dec!(1000),
            fraction: 0.5,
            variant,
            consistency: 1.0,
        }
    }

    #[test]
    fn test_invalid_win_rate_uses_fallback() {
        let sizer = sizer();
        for p in [0.0, -0.2, 1.0, 1.5, f64::NAN] {
            let stake = sizer.kelly_stake(request(p, KellyVariant::Classic));
            assert_eq!(stake, dec!(1000) * dec!(0.01));
        }
    }

    #[test]
    fn test_non_positive_avg_loss_uses_fallback() {
        let mut req = request(0.6, KellyVariant::Classic);
        req.avg_loss = 0.0;
        assert_eq!(sizer().kelly_stake(req), dec!(10));
    }

    #[test]
    fn test_classic_clamped_to_max() {
        // p = 0.6, b = 1 -> f = 0.2, half Kelly 0.1 -> clamped to 5%
        let stake = sizer().kelly_stake(request(0.6, KellyVariant::Classic));
        assert_eq!(stake, dec!(50));
    }

    #[test]
    fn test_fractional_within_bounds() {
        // p = 0.52, b = 1 -> f = 0.04, x0.5 fraction x0.5 half Kelly = 0.01
        let stake = sizer().kelly_stake(request(0.52, KellyVariant::Fractional));
        assert!((as_f64(stake) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_edge_clamped_to_floor() {
        let stake = sizer().kelly_stake(request(0.4, KellyVariant::Classic));
        assert_eq!(stake, dec!(1));
    }

    #[test]
    fn test_robust_shrinks_stake() {
        let sizer = sizer();
        let classic = sizer.kelly_stake(KellyRequest {
            avg_win: 95.0,
            ..request(0.53, KellyVariant::Classic)
        });
        let robust = sizer.kelly_stake(KellyRequest {
            avg_win: 95.0,
            ..request(0.53, KellyVariant::Robust { sample_size: 50 })
        });
        assert!(robust < classic);
    }

    #[test]
    fn test_dynamic_consistency_scales() {
        let sizer = sizer();
        let base = KellyRequest {
            avg_win: 95.0,
            ..request(0.53, KellyVariant::Dynamic)
        };
        let cold = sizer.kelly_stake(KellyRequest { consistency: 0.5, ..base });
        let hot = sizer.kelly_stake(KellyRequest { consistency: 1.5, ..base });
        assert!(cold < hot);
    }

    #[test]
    fn test_volatility_bands() {
        assert_eq!(volatility_multiplier(1.0), 1.2);
        assert_eq!(volatility_multiplier(2.0), 1.0);
        assert_eq!(volatility_multiplier(3.0), 0.8);
        assert_eq!(volatility_multiplier(4.0), 0.5);
        assert_eq!(volatility_multiplier(6.0), 0.3);
    }

    #[test]
    fn test_digit_volatility_needs_history() {
        assert_eq!(digit_volatility(&[1, 2, 3], 20), None);

        // Constant deltas have zero spread
        let digits = [0, 1, 2, 3, 4, 5, 6, 7];
        assert_eq!(digit_volatility(&digits, 20), Some(0.0));
    }

    #[test]
    fn test_atr_and_regime() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.1).collect();
        let atr = average_true_range(&prices, 14).unwrap();
        assert!((atr - 0.1).abs() < 1e-9);
        assert_eq!(market_regime(&prices, 20, 0.3), MarketRegime::Trending);

        let choppy: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 100.5 }).collect();
        assert_eq!(market_regime(&choppy, 20, 0.3), MarketRegime::Ranging);
        assert_eq!(market_regime(&choppy[..5], 20, 0.3), MarketRegime::Undetermined);
    }

    #[test]
    fn test_position_size_takes_minimum() {
        let sizer = sizer();
        // Default volatility 2.5 -> 0.8x; no prices -> ATR does not constrain
        let rec = sizer.position_size(dec!(1000), dec!(0.02), &[], &[], None);
        assert_eq!(rec.volatility, 2.5);
        assert!((as_f64(rec.volatility_size) - 16.0).abs() < 1e-9);
        assert_eq!(rec.recommended, dec!(16.00));

        // Violent prices: ATR size is much smaller than volatility size
        let prices: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 102.0 }).collect();
        let rec = sizer.position_size(dec!(1000), dec!(0.02), &[], &prices, Some(1.0));
        assert!(rec.atr_size < rec.volatility_size);
        assert_eq!(rec.regime, MarketRegime::Ranging);
        // 20 * 0.3 * 0.9 = 5.4
        assert_eq!(rec.recommended, dec!(5.40));
    }
}
