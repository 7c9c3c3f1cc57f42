//! EdgeGuard
//!
//! Risk management and backtesting for last-digit tick contracts: Kelly and
//! volatility-aware stake sizing, circuit breakers, portfolio diversification
//! checks and a tick-replay backtester.

mod backtest;
mod data;
mod db;
mod error;
mod metrics;
mod models;
mod oracle;
mod portfolio;
mod risk;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::backtest::{BacktestOptions, BacktestSimulator, ContractType, CostModel, WalkForwardConfig};
use crate::db::Database;
use crate::models::Tick;
use crate::portfolio::{Admission, PortfolioConfig, PortfolioLedger, StressScenario};
use crate::risk::{KellyVariant, RiskConfig, RiskEngine, StakeContext};

/// Risk management and backtesting CLI.
#[derive(Parser)]
#[command(name = "edgeguard")]
#[command(about = "Risk-managed sizing and backtesting for digit contracts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "EDGEGUARD_DATABASE", default_value = "sqlite:./edgeguard.db?mode=rwc")]
    database: String,

    /// Log level or filter directives (trace, debug, info, warn, error)
    #[arg(short, long, env = "EDGEGUARD_LOG", default_value = "info")]
    log_level: String,

    /// Tick file (.json array or symbol,timestamp,price[,last_digit] CSV)
    #[arg(long, global = true)]
    ticks: Option<PathBuf>,

    /// Quote precision of file prices, used when a tick carries no last digit
    #[arg(long, global = true)]
    decimals: Option<u32>,

    /// Generate this many synthetic ticks when no file is given
    #[arg(long, global = true, default_value = "2000")]
    synthetic: usize,

    /// Seed for synthetic ticks
    #[arg(long, global = true, default_value = "42")]
    seed: u64,

    /// Symbol to trade
    #[arg(short, long, global = true, default_value = "R_100")]
    symbol: String,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every simulation command.
#[derive(Args, Clone)]
struct RunArgs {
    /// Contract type (matches, differs)
    #[arg(long, default_value = "differs")]
    contract: String,

    /// Digits fed to the oracle at each decision point
    #[arg(long, default_value = "100")]
    lookback: usize,

    /// Digits the oracle's frequency window covers
    #[arg(long, default_value = "50")]
    window: usize,

    /// Initial balance
    #[arg(short, long, default_value = "1000")]
    balance: f64,

    /// Kelly variant (classic, fractional, robust, dynamic)
    #[arg(long, default_value = "fractional")]
    kelly: String,

    /// Kelly fraction for the fractional variant
    #[arg(long, default_value = "0.25")]
    fraction: f64,

    /// Skip trades whose win probability is below this
    #[arg(long, default_value = "0")]
    min_confidence: f64,

    /// Fee as a fraction of stake
    #[arg(long, default_value = "0.001")]
    fee: f64,

    /// Order latency in milliseconds
    #[arg(long, default_value = "200")]
    latency_ms: u64,

    /// Skip latency-based slippage
    #[arg(long)]
    no_latency: bool,

    /// Store the result in the run history
    #[arg(long)]
    save: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay ticks through one strategy
    Backtest {
        /// Strategy id (frequency, cold, last_digit)
        #[arg(long, default_value = "frequency")]
        strategy: String,

        /// Trades to simulate (default: every decision point)
        #[arg(short, long)]
        trades: Option<usize>,

        /// Percentage trailing stop on equity (e.g. 0.1)
        #[arg(long)]
        equity_stop: Option<f64>,

        /// Print every trade
        #[arg(long)]
        verbose: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Rolling train/test analysis of one strategy
    WalkForward {
        #[arg(long, default_value = "frequency")]
        strategy: String,

        /// Training window in ticks
        #[arg(long, default_value = "500")]
        train: usize,

        /// Test window in ticks
        #[arg(long, default_value = "200")]
        test: usize,

        /// Step between folds in ticks (default: test window)
        #[arg(long)]
        step: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Backtest several strategies on the same ticks
    Compare {
        /// Comma-separated strategy ids (default: all built-in)
        #[arg(long, value_delimiter = ',')]
        strategies: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Recommend a stake for the current balance and edge estimate
    Stake {
        #[arg(short, long, default_value = "1000")]
        balance: f64,

        /// Estimated win probability
        #[arg(long)]
        win_rate: f64,

        /// Average win per unit stake
        #[arg(long, default_value = "0.095")]
        avg_win: f64,

        /// Average loss per unit stake
        #[arg(long, default_value = "1.0")]
        avg_loss: f64,

        #[arg(long, default_value = "fractional")]
        kelly: String,

        #[arg(long)]
        fraction: Option<f64>,

        /// Sample size behind the win rate (robust variant)
        #[arg(long, default_value = "100")]
        sample_size: u32,

        /// Base risk per trade
        #[arg(long, default_value = "0.02")]
        base_risk: f64,
    },

    /// Assess and stress-test a set of open positions
    Stress {
        /// Positions as SYMBOL=STAKE, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        positions: Vec<String>,

        /// Portfolio capital
        #[arg(short, long, default_value = "1000")]
        capital: f64,
    },

    /// Show default configuration
    Config,

    /// List stored runs
    History {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(&cli.log_level)?)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Backtest {
            strategy,
            trades,
            equity_stop,
            verbose,
            run,
        } => {
            let sim = load_simulator(&cli, run.window)?;
            let mut options = backtest_options(run)?;
            options.trade_count = *trades;
            options.equity_trailing_stop = equity_stop.map(|s| to_decimal(s, "equity_stop")).transpose()?;

            let report = sim.run_backtest(strategy, &cli.symbol, &options)?;

            if *verbose {
                println!("\n{:<20} {:>6} {:>4} {:>4} {:>10} {:>10}", "ENTRY", "RESULT", "PRED", "EXIT", "STAKE", "NET");
                println!("{}", "-".repeat(60));
                for trade in &report.trades {
                    println!(
                        "{:<20} {:>6} {:>4} {:>4} {:>10.2} {:>10.2}",
                        trade.entry_time.format("%Y-%m-%d %H:%M:%S"),
                        if trade.result.is_win() { "WIN" } else { "LOSS" },
                        trade.predicted_digit,
                        trade.exit_digit,
                        trade.stake,
                        trade.net_profit
                    );
                }
            }
            println!("{report}");

            if run.save {
                let db = Database::new(&cli.database).await?;
                let id = db.save_backtest(&report).await?;
                println!("Saved run {id}");
            }
        }

        Commands::WalkForward {
            strategy,
            train,
            test,
            step,
            run,
        } => {
            let sim = load_simulator(&cli, run.window)?;
            let options = backtest_options(run)?;
            let config = WalkForwardConfig::new(*train, *test).with_step_size(step.unwrap_or(*test));

            let result = sim.walk_forward_analysis(strategy, &cli.symbol, &config, &options)?;
            println!("{result}");

            if run.save {
                let db = Database::new(&cli.database).await?;
                let id = db.save_walk_forward(&result).await?;
                println!("Saved run {id}");
            }
        }

        Commands::Compare { strategies, run } => {
            let sim = load_simulator(&cli, run.window)?;
            let options = backtest_options(run)?;
            let ids: Vec<&str> = if strategies.is_empty() {
                oracle::BUILTIN_ORACLES.to_vec()
            } else {
                strategies.iter().map(String::as_str).collect()
            };

            let comparison = sim.compare_strategies(&cli.symbol, &ids, &options)?;
            println!("{comparison}");

            if run.save {
                let db = Database::new(&cli.database).await?;
                let id = db.save_comparison(&comparison).await?;
                println!("Saved run {id}");
            }
        }

        Commands::Stake {
            balance,
            win_rate,
            avg_win,
            avg_loss,
            kelly,
            fraction,
            sample_size,
            base_risk,
        } => {
            let balance = to_decimal(*balance, "balance")?;
            let mut engine = RiskEngine::new(RiskConfig::default(), balance)?;
            for tick in load_ticks(&cli)?.iter().filter(|t| t.symbol == cli.symbol) {
                engine.record_tick(tick);
            }

            let context = StakeContext {
                win_rate: *win_rate,
                avg_win: *avg_win,
                avg_loss: *avg_loss,
                variant: KellyVariant::from_str(kelly, *sample_size),
                fraction: *fraction,
                base_risk: to_decimal(*base_risk, "base_risk")?,
                volatility: None,
            };
            let rec = engine.recommended_stake(&cli.symbol, balance, &context);

            println!("\n=== Stake Recommendation: {} ===\n", cli.symbol);
            println!("Kelly ({}):        ${:.2}", context.variant.name(), rec.kelly_stake);
            println!("Digit Volatility:    {:.3}", rec.sizing.volatility);
            println!("Volatility Mult:     {:.2}", rec.sizing.volatility_multiplier);
            println!("Volatility Size:     ${:.2}", rec.sizing.volatility_size);
            match rec.sizing.atr {
                Some(atr) => println!("ATR:                 {atr:.4} (size ${:.2})", rec.sizing.atr_size),
                None => println!("ATR:                 n/a"),
            }
            println!("Regime:              {}", rec.sizing.regime.as_str());
            println!("Recommended:         ${:.2}", rec.stake);
            if let Some(reason) = rec.halted {
                println!("Halted:              {reason}");
            }
        }

        Commands::Stress { positions, capital } => {
            let capital = to_decimal(*capital, "capital")?;
            let mut ledger = PortfolioLedger::new(PortfolioConfig::default(), capital)?;
            for tick in &load_ticks(&cli)? {
                ledger.record_tick(tick);
            }

            let now = Utc::now();
            for entry in positions {
                let (symbol, stake) = parse_position(entry)?;
                if let Admission::Rejected(reason) = ledger.can_add_position(&symbol, stake, None, None) {
                    warn!(symbol = %symbol, reason = %reason, "Position breaks diversification limits");
                }
                ledger.open_position(&symbol, stake, 0, now)?;
            }

            let assessment = ledger.assess_portfolio_risk();
            println!("\n=== Portfolio Risk ===\n");
            println!("Risk Score:          {} ({})", assessment.risk_score, assessment.risk_level.as_str());
            println!("Positions:           {}", assessment.position_count);
            println!("Exposure:            ${:.2}", assessment.total_exposure);
            println!("Effective Bets:      {:.2}", assessment.effective_bets);
            println!(
                "Max Allocation:      {:.1}% ({})",
                assessment.max_allocation * 100.0,
                assessment.max_allocation_symbol.as_deref().unwrap_or("-")
            );
            println!("Avg Correlation:     {:.3}", assessment.average_correlation);
            println!("Volatility:          {:.4}", assessment.portfolio_volatility);
            println!("VaR (99%):           {:.2}%", assessment.value_at_risk_99 * 100.0);
            for rec in &assessment.recommendations {
                println!("  - {rec}");
            }

            let focus = ledger
                .open_stake_by_symbol()
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1))
                .map(|(symbol, _)| symbol);
            let results = ledger.stress_test_portfolio(&StressScenario::standard_set(focus.as_deref()));

            println!("\n{:<20} {:>10} {:>8} {:>8} {:>8}", "SCENARIO", "LOSS", "LOSS %", "LIMIT", "STATUS");
            println!("{}", "-".repeat(58));
            for r in results {
                println!(
                    "{:<20} {:>10.2} {:>7.1}% {:>7.1}% {:>8}",
                    r.scenario,
                    r.loss,
                    r.loss_pct * 100.0,
                    r.var_limit * 100.0,
                    if r.breached { "BREACH" } else { "ok" }
                );
            }
        }

        Commands::Config => {
            let risk = RiskConfig::default();
            let portfolio = PortfolioConfig::default();
            let options = BacktestOptions::default();
            let costs = CostModel::default();

            println!("\n=== Risk Configuration ===\n");
            println!("Circuit Breakers:");
            println!("  Max Drawdown:         {:.0}%", risk.max_drawdown * 100.0);
            println!("  Max Daily Loss:       {}%", risk.max_daily_loss * dec!(100));
            println!("  Max Consecutive Loss: {}", risk.max_consecutive_losses);

            println!("\nStake Sizing:");
            println!("  Stake Bounds:         {}% - {}%", risk.min_stake_fraction * dec!(100), risk.max_stake_fraction * dec!(100));
            println!("  Fallback Stake:       {}%", risk.fallback_stake_fraction * dec!(100));
            println!("  Kelly Multiplier:     {}", risk.kelly_multiplier);
            println!("  Kelly Fraction:       {}", risk.kelly_fraction);
            println!("  Volatility Lookback:  {}", risk.volatility_lookback);
            println!("  Default Volatility:   {}", risk.default_volatility);
            println!("  ATR Period:           {}", risk.atr_period);
            println!("  Trend Threshold:      {}", risk.trend_threshold);

            println!("\n=== Portfolio Configuration ===\n");
            println!("  Max Symbol Alloc:     {:.0}%", portfolio.max_symbol_allocation * 100.0);
            println!("  Max Correlation:      {}", portfolio.max_correlation);
            println!("  Correlation Window:   {}", portfolio.correlation_window);
            println!("  VaR Limit:            {:.0}%", portfolio.var_limit * 100.0);
            println!("  Concentration Limit:  {:.0}%", portfolio.concentration_threshold * 100.0);
            println!("  Min Effective Bets:   {}", portfolio.min_effective_bets);

            println!("\n=== Backtest Defaults ===\n");
            println!("  Contract:             {:?} (payout {})", options.contract, options.payout());
            println!("  Lookback:             {}", options.lookback);
            println!("  Initial Balance:      ${}", options.initial_balance);
            println!("  Confidence:           {}", options.confidence);
            println!("  Periods / Year:       {}", options.periods_per_year);
            println!("  Fee Rate:             {}%", costs.fee_rate * dec!(100));
            println!("  Latency:              {}ms", costs.latency_ms);
            println!("  Adverse Selection:    {}% / 100ms", costs.adverse_selection_per_100ms * dec!(100));
        }

        Commands::History { limit } => {
            let db = Database::new(&cli.database).await?;
            let runs = db.list_runs(*limit).await?;

            if runs.is_empty() {
                println!("No stored runs.");
                return Ok(());
            }
            println!(
                "\n{:<8} {:<12} {:<20} {:<8} {:>7} {:>7} {:>10} {:>7}",
                "ID", "KIND", "STRATEGY", "SYMBOL", "TRADES", "WIN %", "PROFIT", "MAX DD"
            );
            println!("{}", "-".repeat(86));
            for run in runs {
                println!(
                    "{:<8} {:<12} {:<20} {:<8} {:>7} {:>6.1}% {:>10.2} {:>6.1}%",
                    truncate(&run.id, 8),
                    run.kind,
                    truncate(&run.strategy_id, 20),
                    run.symbol,
                    run.total_trades,
                    run.win_rate * 100.0,
                    run.total_profit,
                    run.max_drawdown * 100.0
                );
            }
        }
    }

    Ok(())
}

/// A plain level or directives like `edgeguard=debug,sqlx=warn`.
fn log_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).with_context(|| format!("Invalid log filter {directives:?}"))
}

/// Ticks from `--ticks`, or seeded synthetic ticks for `--symbol`.
fn load_ticks(cli: &Cli) -> Result<Vec<Tick>> {
    match &cli.ticks {
        Some(path) => data::load_ticks(path, cli.decimals),
        None => {
            let start = Utc::now() - Duration::seconds(cli.synthetic as i64);
            info!(symbol = %cli.symbol, count = cli.synthetic, seed = cli.seed, "Using synthetic ticks");
            Ok(data::synthetic_ticks(&cli.symbol, cli.synthetic, cli.seed, start))
        }
    }
}

/// Simulator with every built-in oracle registered and all ticks loaded.
fn load_simulator(cli: &Cli, window: usize) -> Result<BacktestSimulator> {
    let mut sim = BacktestSimulator::new();
    for id in oracle::BUILTIN_ORACLES {
        if let Some(oracle) = oracle::builtin(id, window) {
            sim.register_strategy(id, oracle);
        }
    }
    for (symbol, ticks) in data::split_by_symbol(load_ticks(cli)?) {
        sim.load_history(&symbol, ticks);
    }
    Ok(sim)
}

fn backtest_options(run: &RunArgs) -> Result<BacktestOptions> {
    let contract = ContractType::from_str(&run.contract)
        .with_context(|| format!("Unknown contract type {:?}", run.contract))?;
    Ok(BacktestOptions {
        contract,
        lookback: run.lookback,
        initial_balance: to_decimal(run.balance, "balance")?,
        kelly_variant: KellyVariant::from_str(&run.kelly, 100),
        kelly_fraction: run.fraction,
        min_confidence: run.min_confidence,
        realistic_latency: !run.no_latency,
        cost_model: CostModel {
            fee_rate: to_decimal(run.fee, "fee")?,
            latency_ms: run.latency_ms,
            ..Default::default()
        },
        ..Default::default()
    })
}

fn parse_position(entry: &str) -> Result<(String, Decimal)> {
    let Some((symbol, stake)) = entry.split_once('=') else {
        bail!("Position {entry:?} is not SYMBOL=STAKE");
    };
    let stake: Decimal = stake
        .trim()
        .parse()
        .with_context(|| format!("Invalid stake in {entry:?}"))?;
    Ok((symbol.trim().to_string(), stake))
}

fn to_decimal(value: f64, name: &str) -> Result<Decimal> {
    Decimal::try_from(value).with_context(|| format!("{name} is not a valid number: {value}"))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_accepts_levels_and_directives() {
        assert!(log_filter("info").is_ok());
        assert!(log_filter("edgeguard=debug,sqlx=warn").is_ok());
        assert!(log_filter("edgeguard=loud").is_err());
    }
}
