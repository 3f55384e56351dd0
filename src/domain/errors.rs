use thiserror::Error;
use tokio::sync::mpsc;

use crate::persistence::DatabaseError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unsupported timeframe: {0} (supported: 1m, 5m, 15m, 1h, 4h, 1d)")]
    UnsupportedTimeframe(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required setting: {0}")]
    Missing(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),

    #[error("Volume must be non-negative, got {0}")]
    NegativeVolume(f64),

    #[error("Candle bounds violated: {0}")]
    InvalidCandle(String),

    #[error("Value must be non-negative")]
    MustBeNonNegative,

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Unknown strategy '{name}' (supported: {})", supported.join(", "))]
    UnknownStrategy { name: String, supported: Vec<String> },

    #[error("Strategy binding not registered: {0}")]
    NotRegistered(String),

    #[error("Strategy binding already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Strategy initialization failed: {0}")]
    Initialization(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

#[derive(Debug, Error, Clone)]
pub enum FeedError {
    #[error("Feed connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Feed protocol error: {0}")]
    Protocol(String),

    #[error("Reconnection limit exceeded after {attempts} attempts")]
    ReconnectionLimitExceeded { attempts: u32 },

    #[error("Tick channel closed")]
    ChannelClosed,
}

impl<T> From<mpsc::error::SendError<T>> for FeedError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        FeedError::ChannelClosed
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Simulation is already running (session {0})")]
    AlreadyRunning(String),

    #[error("Simulation is already starting")]
    AlreadyStarting,

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
