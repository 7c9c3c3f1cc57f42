//! Database persistence for completed backtest runs.
//!
//! Each run is stored with its headline metrics in columns for listing and
//! the full report as a JSON blob.

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::backtest::{BacktestReport, StrategyComparison, WalkForwardResult};

/// Kind of run stored in a row.
pub const KIND_BACKTEST: &str = "backtest";
pub const KIND_WALK_FORWARD: &str = "walk_forward";
pub const KIND_COMPARISON: &str = "comparison";

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored run summary.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRun {
    pub id: String,
    pub kind: String,
    pub strategy_id: String,
    pub symbol: String,
    pub total_trades: i64,
    pub win_rate: f64,
    pub total_profit: f64,
    pub max_drawdown: f64,
    pub stop_reason: Option<String>,
    pub created_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_runs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                total_trades INTEGER NOT NULL DEFAULT 0,
                win_rate REAL NOT NULL DEFAULT 0,
                total_profit REAL NOT NULL DEFAULT 0,
                max_drawdown REAL NOT NULL DEFAULT 0,
                stop_reason TEXT,
                report_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_backtest_runs_created ON backtest_runs(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Store a single backtest report. Returns the run id.
    pub async fn save_backtest(&self, report: &BacktestReport) -> Result<String> {
        let json = serde_json::to_string(report).context("Failed to serialize report")?;
        let p = &report.performance;
        self.insert_run(
            KIND_BACKTEST,
            &report.metadata.strategy_id,
            &report.metadata.symbol,
            i64::from(p.total_trades),
            p.win_rate,
            p.total_profit.to_f64().unwrap_or(0.0),
            p.max_drawdown,
            report.metadata.stop_reason.as_deref(),
            &json,
        )
        .await
    }

    /// Store a walk-forward result with its out-of-sample aggregates.
    pub async fn save_walk_forward(&self, result: &WalkForwardResult) -> Result<String> {
        let json = serde_json::to_string(result).context("Failed to serialize walk-forward result")?;
        let trades: i64 = result.folds.iter().map(|f| i64::from(f.out_of_sample.trades)).sum();
        let max_drawdown = result
            .folds
            .iter()
            .map(|f| f.out_of_sample.max_drawdown)
            .fold(0.0, f64::max);
        self.insert_run(
            KIND_WALK_FORWARD,
            &result.strategy_id,
            &result.symbol,
            trades,
            result.out_of_sample_win_rate,
            result.out_of_sample_profit.to_f64().unwrap_or(0.0),
            max_drawdown,
            Some(result.robustness.as_str()),
            &json,
        )
        .await
    }

    /// Store a comparison; the strategy column lists every compared id.
    pub async fn save_comparison(&self, comparison: &StrategyComparison) -> Result<String> {
        let json = serde_json::to_string(comparison).context("Failed to serialize comparison")?;
        let ids: Vec<&str> = comparison.strategies.iter().map(|s| s.strategy_id.as_str()).collect();
        let trades: i64 = comparison
            .strategies
            .iter()
            .map(|s| i64::from(s.performance.total_trades))
            .sum();
        self.insert_run(
            KIND_COMPARISON,
            &ids.join(","),
            &comparison.symbol,
            trades,
            0.0,
            0.0,
            0.0,
            None,
            &json,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_run(
        &self,
        kind: &str,
        strategy_id: &str,
        symbol: &str,
        total_trades: i64,
        win_rate: f64,
        total_profit: f64,
        max_drawdown: f64,
        stop_reason: Option<&str>,
        report_json: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO backtest_runs
                (id, kind, strategy_id, symbol, total_trades, win_rate, total_profit, max_drawdown, stop_reason, report_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(kind)
        .bind(strategy_id)
        .bind(symbol)
        .bind(total_trades)
        .bind(win_rate)
        .bind(total_profit)
        .bind(max_drawdown)
        .bind(stop_reason)
        .bind(report_json)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        debug!(id = %id, kind = %kind, strategy = %strategy_id, "Saved run");
        Ok(id)
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<StoredRun>> {
        sqlx::query_as::<_, StoredRun>(
            r#"
            SELECT id, kind, strategy_id, symbol, total_trades, win_rate, total_profit,
                   max_drawdown, stop_reason, created_at
            FROM backtest_runs ORDER BY created_at DESC, rowid DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch run history")
    }

    /// Full stored JSON for a run.
    pub async fn get_run_json(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT report_json FROM backtest_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(json,)| json))
    }

    /// Load a stored single-backtest report.
    pub async fn get_backtest(&self, id: &str) -> Result<Option<BacktestReport>> {
        match self.get_run_json(id).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json).context("Stored report is not a backtest report")?)),
            None => Ok(None),
        }
    }

    pub async fn run_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{BacktestOptions, BacktestSimulator};
    use crate::data::synthetic_ticks;
    use crate::oracle::FrequencyOracle;
    use chrono::{TimeZone, Utc};

    fn report() -> BacktestReport {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut sim = BacktestSimulator::new();
        sim.register_strategy("freq", Box::new(FrequencyOracle { window: 20 }));
        sim.load_history("R_100", synthetic_ticks("R_100", 120, 11, start));
        let options = BacktestOptions {
            lookback: 20,
            ..Default::default()
        };
        sim.run_backtest("freq", "R_100", &options).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_list_runs() {
        let db = Database::in_memory().await.unwrap();
        let report = report();

        let first = db.save_backtest(&report).await.unwrap();
        let second = db.save_backtest(&report).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(db.run_count().await.unwrap(), 2);

        let runs = db.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second);
        assert_eq!(runs[0].kind, KIND_BACKTEST);
        assert_eq!(runs[0].strategy_id, "freq");
        assert_eq!(runs[0].total_trades, i64::from(report.performance.total_trades));

        assert_eq!(db.list_runs(1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_report_round_trips_through_json_blob() {
        let report = report();
        let (stored, missing) = tokio_test::block_on(async {
            let db = Database::in_memory().await.unwrap();
            let id = db.save_backtest(&report).await.unwrap();
            (
                db.get_backtest(&id).await.unwrap().unwrap(),
                db.get_backtest("missing").await.unwrap(),
            )
        });

        assert_eq!(stored.performance.total_trades, report.performance.total_trades);
        assert_eq!(stored.performance.total_profit, report.performance.total_profit);
        assert_eq!(stored.trades.len(), report.trades.len());
        assert!(missing.is_none());
    }
}
