//! Return series and pairwise correlation.

use serde::{Deserialize, Serialize};

/// Pairwise relationship between two instruments.
///
/// Recomputed on demand from price history; never stored as the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    /// Order-independent key, `"A|B"` with A < B
    pub pair_key: String,
    pub coefficient: f64,
    /// Number of paired returns used
    pub samples: usize,
}

/// Order-independent key for a symbol pair.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// Simple returns of a price series. Non-positive prices yield a zero return.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Sample Pearson correlation over the trailing `window` paired values.
///
/// Returns 0.0 for fewer than two pairs or zero variance, and is clamped to [-1, 1].
pub fn pearson(x: &[f64], y: &[f64], window: usize) -> (f64, usize) {
    let n = x.len().min(y.len()).min(window);
    if n < 2 {
        return (0.0, n);
    }
    let x = &x[x.len() - n..];
    let y = &y[y.len() - n..];

    let len = n as f64;
    let mean_x = x.iter().sum::<f64>() / len;
    let mean_y = y.iter().sum::<f64>() / len;

    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        covariance += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denominator = (var_x * var_y).sqrt();
    if !denominator.is_finite() || denominator < f64::EPSILON {
        return (0.0, n);
    }
    ((covariance / denominator).clamp(-1.0, 1.0), n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_correlation() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.0, 4.0, 6.0, 8.0, 10.0];
        let (r, n) = pearson(&a, &b, 10);
        assert!((r - 1.0).abs() < 1e-12);
        assert_eq!(n, 5);

        let c = [5.0, 4.0, 3.0, 2.0, 1.0];
        assert!((pearson(&a, &c, 10).0 + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance_is_neutral() {
        let flat = [1.0, 1.0, 1.0, 1.0];
        let moving = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(pearson(&flat, &moving, 10).0, 0.0);
        assert_eq!(pearson(&[1.0], &[2.0], 10).0, 0.0);
    }

    #[test]
    fn test_uses_trailing_window() {
        // Only the last three values are related
        let a = [9.0, -3.0, 1.0, 2.0, 3.0];
        let b = [-9.0, 7.0, 1.0, 2.0, 3.0];
        let (r, n) = pearson(&a, &b, 3);
        assert_eq!(n, 3);
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(pair_key("R_100", "R_50"), pair_key("R_50", "R_100"));
    }

    #[test]
    fn test_simple_returns() {
        let r = simple_returns(&[100.0, 110.0, 99.0]);
        assert!((r[0] - 0.1).abs() < 1e-12);
        assert!((r[1] + 0.1).abs() < 1e-12);
    }
}
