//! Tick model: one price quote on one instrument.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// A single market tick as delivered by the data layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument symbol (e.g., "R_100")
    pub symbol: String,

    /// When the quote was published
    pub timestamp: DateTime<Utc>,

    /// Quoted price
    pub price: Decimal,

    /// Last digit of the quoted price (0-9)
    pub last_digit: u8,
}

impl Tick {
    /// Build a tick, deriving the last digit from the quoted price.
    ///
    /// The digit is taken from the price as quoted, so `dec!(1234.57)` yields 7
    /// and `dec!(1234.50)` yields 0.
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, price: Decimal) -> Self {
        let last_digit = Self::digit_of(price);
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            last_digit,
        }
    }

    /// Build a tick whose last digit was supplied by the feed.
    pub fn with_last_digit(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        price: Decimal,
        last_digit: u8,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            last_digit,
        }
    }

    /// Last quoted digit of a price.
    pub fn digit_of(price: Decimal) -> u8 {
        (price.mantissa().unsigned_abs() % 10) as u8
    }

    /// Price as f64 for statistics.
    pub fn price_f64(&self) -> f64 {
        self.price.to_f64().unwrap_or(0.0)
    }
}
