//! Digit prediction oracles consumed by the simulator.
//!
//! The risk layer treats every model as an opaque `history -> {digit, probability}`
//! function; the baselines here exist for the CLI and tests.

use crate::models::Prediction;

/// A digit prediction model.
pub trait PredictionOracle: Send + Sync {
    fn name(&self) -> &str;

    /// Predict the next last-digit from recent digits, oldest first.
    ///
    /// `probability` is the model's estimate that the next digit equals `digit`.
    fn predict(&self, history: &[u8]) -> Prediction;
}

/// Laplace-smoothed digit counts over the trailing window.
fn digit_counts(history: &[u8], window: usize) -> ([u32; 10], usize) {
    let tail = &history[history.len().saturating_sub(window)..];
    let mut counts = [0u32; 10];
    for &d in tail {
        counts[(d % 10) as usize] += 1;
    }
    (counts, tail.len())
}

fn smoothed(count: u32, n: usize) -> f64 {
    (count as f64 + 1.0) / (n as f64 + 10.0)
}

/// Predicts the most frequent recent digit ("hot" digit).
pub struct FrequencyOracle {
    pub window: usize,
}

impl PredictionOracle for FrequencyOracle {
    fn name(&self) -> &str {
        "frequency"
    }

    fn predict(&self, history: &[u8]) -> Prediction {
        let (counts, n) = digit_counts(history, self.window);
        // Ties go to the lowest digit
        let (digit, count) = counts
            .iter()
            .enumerate()
            .fold((0usize, 0u32), |best, (d, &c)| if c > best.1 { (d, c) } else { best });
        Prediction::new(digit as u8, smoothed(count, n))
    }
}

/// Predicts the least frequent recent digit ("cold" digit). Pairs with
/// differs contracts.
pub struct ColdDigitOracle {
    pub window: usize,
}

impl PredictionOracle for ColdDigitOracle {
    fn name(&self) -> &str {
        "cold"
    }

    fn predict(&self, history: &[u8]) -> Prediction {
        let (counts, n) = digit_counts(history, self.window);
        let (digit, count) = counts
            .iter()
            .enumerate()
            .fold((0usize, u32::MAX), |best, (d, &c)| if c < best.1 { (d, c) } else { best });
        Prediction::new(digit as u8, smoothed(count, n))
    }
}

/// Predicts that the last digit repeats, with the observed repeat rate as probability.
pub struct LastDigitOracle;

impl PredictionOracle for LastDigitOracle {
    fn name(&self) -> &str {
        "last_digit"
    }

    fn predict(&self, history: &[u8]) -> Prediction {
        let Some(&last) = history.last() else {
            return Prediction::new(0, 0.1);
        };
        let pairs = history.len().saturating_sub(1);
        let repeats = history.windows(2).filter(|w| w[0] == w[1]).count() as u32;
        Prediction::new(last, smoothed(repeats, pairs))
    }
}

/// Oracle ids understood by [`builtin`].
pub const BUILTIN_ORACLES: [&str; 3] = ["frequency", "cold", "last_digit"];

/// Construct a baseline oracle by id.
pub fn builtin(id: &str, window: usize) -> Option<Box<dyn PredictionOracle>> {
    match id {
        "frequency" => Some(Box::new(FrequencyOracle { window })),
        "cold" => Some(Box::new(ColdDigitOracle { window })),
        "last_digit" => Some(Box::new(LastDigitOracle)),
        _ => None,
    }
}
