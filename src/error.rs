//! Typed errors for the risk, portfolio and backtest layers.
//!
//! Recoverable conditions (bad win rates, malformed ladders, zero variance)
//! never reach these types: they are logged and replaced by conservative
//! defaults at the call site.

use thiserror::Error;

/// Errors raised by the risk engine.
#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    /// Configuration rejected at construction.
    #[error("invalid risk config: {0}")]
    InvalidConfig(String),

    /// Input that cannot be recovered into a safe default.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No exit state (trailing stop, partial close rule, scale ladder) for this id.
    #[error("no exit state registered for position {0}")]
    UnknownExitState(String),
}

/// Errors raised by the portfolio ledger.
#[derive(Debug, Error, PartialEq)]
pub enum PortfolioError {
    /// Configuration rejected at construction.
    #[error("invalid portfolio config: {0}")]
    InvalidConfig(String),

    /// Stakes must be strictly positive.
    #[error("invalid stake {stake} for {symbol}: stake must be positive")]
    InvalidStake {
        /// Symbol of the rejected position.
        symbol: String,
        /// Offending stake, rendered.
        stake: String,
    },

    /// Unknown position id.
    #[error("position not found: {0}")]
    PositionNotFound(String),

    /// Positions transition open -> closed exactly once.
    #[error("position already closed: {0}")]
    PositionAlreadyClosed(String),
}

/// Errors raised by the backtest simulator.
#[derive(Debug, Error, PartialEq)]
pub enum BacktestError {
    /// More trades were requested than the tick history can support.
    #[error("insufficient historical data: requested {requested}, history supports {available}")]
    InsufficientHistoricalData {
        /// Trades (or, for walk-forward, ticks) requested by the caller.
        requested: usize,
        /// What the loaded history can supply, in the same unit.
        available: usize,
    },

    /// Strategy id was never registered.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// Another run is in flight on this simulator.
    #[error("a backtest is already running on this simulator")]
    BacktestAlreadyRunning,

    /// No ticks loaded for the symbol.
    #[error("no tick history loaded for {0}")]
    NoHistory(String),

    /// Options rejected before the run started.
    #[error("invalid backtest options: {0}")]
    InvalidOptions(String),

    /// Risk engine could not be built for the run.
    #[error(transparent)]
    Risk(#[from] RiskError),

    /// Portfolio ledger could not be built for the run.
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
}
