//! Oracle prediction output.

use serde::{Deserialize, Serialize};

/// What a prediction oracle believes the next digit will be.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted digit (0-9)
    pub digit: u8,

    /// Oracle's confidence in the digit (0.0 to 1.0)
    pub probability: f64,
}

impl Prediction {
    pub fn new(digit: u8, probability: f64) -> Self {
        Self {
            digit: digit.min(9),
            probability: probability.clamp(0.0, 1.0),
        }
    }
}
