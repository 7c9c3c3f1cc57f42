//! Tick history sources: JSON and CSV files, and a seeded synthetic generator.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::models::Tick;

/// On-disk tick. A feed-supplied `lastDigit` wins over the derived one.
#[derive(Debug, Deserialize)]
struct TickRecord {
    symbol: String,
    timestamp: DateTime<Utc>,
    price: Decimal,
    #[serde(default, alias = "lastDigit")]
    last_digit: Option<u8>,
}

impl TickRecord {
    fn into_tick(self, decimals: Option<u32>) -> Result<Tick> {
        build_tick(self.symbol, self.timestamp, self.price, self.last_digit, decimals)
    }
}

/// Resolve the last digit: the supplied one if any, else derived from the
/// price quoted at `decimals` places. JSON numbers drop trailing zeros
/// (`1234.50` parses as `1234.5`), so numeric feeds need one or the other.
fn build_tick(
    symbol: String,
    timestamp: DateTime<Utc>,
    mut price: Decimal,
    last_digit: Option<u8>,
    decimals: Option<u32>,
) -> Result<Tick> {
    if let Some(places) = decimals {
        price.rescale(places);
    }
    match last_digit {
        Some(digit) if digit > 9 => bail!("{} at {}: last digit {} is not 0-9", symbol, timestamp, digit),
        Some(digit) => Ok(Tick::with_last_digit(symbol, timestamp, price, digit)),
        None => Ok(Tick::new(symbol, timestamp, price)),
    }
}

/// Load ticks from a `.json` array or a `symbol,timestamp,price[,last_digit]`
/// CSV file. `decimals` is the quote precision used when a row carries no
/// last digit.
pub fn load_ticks(path: &Path, decimals: Option<u32>) -> Result<Vec<Tick>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tick file {}", path.display()))?;

    let ticks = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => parse_csv(&content, decimals)?,
        _ => parse_json(&content, decimals)?,
    };
    info!(path = %path.display(), ticks = ticks.len(), "Loaded ticks");
    Ok(ticks)
}

pub fn parse_json(content: &str, decimals: Option<u32>) -> Result<Vec<Tick>> {
    let records: Vec<TickRecord> = serde_json::from_str(content).context("Invalid tick JSON")?;
    records.into_iter().map(|r| r.into_tick(decimals)).collect()
}

/// Parse CSV rows. A header row starting with `symbol` is skipped.
pub fn parse_csv(content: &str, decimals: Option<u32>) -> Result<Vec<Tick>> {
    let mut ticks = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (line_no == 0 && line.to_lowercase().starts_with("symbol")) {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 && fields.len() != 4 {
            bail!(
                "line {}: expected symbol,timestamp,price[,last_digit], got {} fields",
                line_no + 1,
                fields.len()
            );
        }
        let timestamp = DateTime::parse_from_rfc3339(fields[1])
            .with_context(|| format!("line {}: bad timestamp {:?}", line_no + 1, fields[1]))?
            .with_timezone(&Utc);
        let price: Decimal = fields[2]
            .parse()
            .with_context(|| format!("line {}: bad price {:?}", line_no + 1, fields[2]))?;
        let last_digit = match fields.get(3).filter(|f| !f.is_empty()) {
            Some(field) => Some(
                field
                    .parse::<u8>()
                    .with_context(|| format!("line {}: bad last digit {:?}", line_no + 1, field))?,
            ),
            None => None,
        };

        let tick = build_tick(fields[0].to_string(), timestamp, price, last_digit, decimals)
            .with_context(|| format!("line {}", line_no + 1))?;
        ticks.push(tick);
    }
    Ok(ticks)
}

/// Random-walk ticks with two-decimal prices, reproducible for a given seed.
pub fn synthetic_ticks(symbol: &str, count: usize, seed: u64, start: DateTime<Utc>) -> Vec<Tick> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = 1000.0f64;

    let ticks: Vec<Tick> = (0..count)
        .map(|i| {
            price = (price * (1.0 + rng.gen_range(-0.001..0.001))).max(1.0);
            let cents = (price * 100.0).round() as i64;
            Tick::new(symbol, start + Duration::seconds(i as i64), Decimal::new(cents, 2))
        })
        .collect();

    debug!(symbol = %symbol, count, seed, "Generated synthetic ticks");
    ticks
}

/// Group ticks by symbol, preserving order within each symbol.
pub fn split_by_symbol(ticks: Vec<Tick>) -> Vec<(String, Vec<Tick>)> {
    let mut groups: Vec<(String, Vec<Tick>)> = Vec::new();
    for tick in ticks {
        match groups.iter_mut().find(|(s, _)| *s == tick.symbol) {
            Some((_, group)) => group.push(tick),
            None => groups.push((tick.symbol.clone(), vec![tick])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_csv_with_header() {
        let csv = "symbol,timestamp,price\n\
                   R_100,2024-03-01T12:00:00Z,1234.57\n\
                   R_100,2024-03-01T12:00:02Z,1234.50\n";
        let ticks = parse_csv(csv, None).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].price, dec!(1234.57));
        assert_eq!(ticks[0].last_digit, 7);
        assert_eq!(ticks[1].last_digit, 0);
    }

    #[test]
    fn test_parse_csv_rejects_bad_rows() {
        assert!(parse_csv("R_100,2024-03-01T12:00:00Z", None).is_err());
        assert!(parse_csv("R_100,yesterday,12.3", None).is_err());
        assert!(parse_csv("R_100,2024-03-01T12:00:00Z,abc", None).is_err());
        assert!(parse_csv("R_100,2024-03-01T12:00:00Z,12.3,x", None).is_err());
        assert!(parse_csv("R_100,2024-03-01T12:00:00Z,12.3,10", None).is_err());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"[{"symbol":"R_50","timestamp":"2024-03-01T12:00:00Z","price":"512.34"}]"#;
        let ticks = parse_json(json, None).unwrap();
        assert_eq!(ticks[0].symbol, "R_50");
        assert_eq!(ticks[0].last_digit, 4);
    }

    #[test]
    fn test_numeric_price_keeps_feed_last_digit() {
        // 1234.50 as a JSON number arrives as 1234.5
        let json = r#"[{"symbol":"R_100","timestamp":"2024-03-01T12:00:00Z","price":1234.50,"lastDigit":0}]"#;
        let ticks = parse_json(json, None).unwrap();
        assert_eq!(ticks[0].price, dec!(1234.5));
        assert_eq!(ticks[0].last_digit, 0);

        let snake = r#"[{"symbol":"R_100","timestamp":"2024-03-01T12:00:00Z","price":1234.50,"last_digit":0}]"#;
        assert_eq!(parse_json(snake, None).unwrap()[0].last_digit, 0);
    }

    #[test]
    fn test_numeric_price_uses_quote_decimals() {
        let json = r#"[{"symbol":"R_100","timestamp":"2024-03-01T12:00:00Z","price":1234.50},
                       {"symbol":"R_100","timestamp":"2024-03-01T12:00:02Z","price":1234.57}]"#;
        let ticks = parse_json(json, Some(2)).unwrap();
        assert_eq!(ticks[0].last_digit, 0);
        assert_eq!(ticks[0].price, dec!(1234.50));
        assert_eq!(ticks[1].last_digit, 7);

        // Without either hint the dropped zero shifts the digit
        assert_eq!(parse_json(json, None).unwrap()[0].last_digit, 5);
    }

    #[test]
    fn test_feed_last_digit_must_be_a_digit() {
        let json = r#"[{"symbol":"R_100","timestamp":"2024-03-01T12:00:00Z","price":1234.5,"lastDigit":12}]"#;
        assert!(parse_json(json, None).is_err());
    }

    #[test]
    fn test_csv_last_digit_column() {
        let csv = "R_100,2024-03-01T12:00:00Z,1234.5,0\n\
                   R_100,2024-03-01T12:00:02Z,1234.6,\n";
        let ticks = parse_csv(csv, None).unwrap();
        assert_eq!(ticks[0].last_digit, 0);
        assert_eq!(ticks[1].last_digit, 6);
    }

    #[test]
    fn test_synthetic_is_seeded() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = synthetic_ticks("R_100", 100, 42, start);
        let b = synthetic_ticks("R_100", 100, 42, start);
        let c = synthetic_ticks("R_100", 100, 7, start);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|t| t.price > Decimal::ZERO && t.last_digit <= 9));
        assert!(a.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_split_by_symbol() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut ticks = synthetic_ticks("A", 3, 1, start);
        ticks.extend(synthetic_ticks("B", 2, 2, start));
        let groups = split_by_symbol(ticks);
        assert_eq!(groups.len(), 2);
        assert_eq!((groups[0].0.as_str(), groups[0].1.len()), ("A", 3));
        assert_eq!((groups[1].0.as_str(), groups[1].1.len()), ("B", 2));
    }
}
