//! Storage boundary for the simulation.
//!
//! Every call is asynchronous and may fail. Callers on the hot path log a failure
//! and keep their in-memory state, so implementations must not assume a write
//! that failed will be retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::position::{Position, Trade};
use crate::domain::entities::signal::StrategySignal;
use crate::domain::services::metrics::PerformanceSnapshot;
use crate::persistence::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Running,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::Stopped => "STOPPED",
            SessionStatus::Failed => "FAILED",
        }
    }
}

#[async_trait]
pub trait SimulationStore: Send + Sync {
    /// Creates a RUNNING session and returns its id.
    async fn create_session(&self, symbols: &[String], strategies: &[String]) -> Result<String, DatabaseError>;

    async fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<(), DatabaseError>;

    /// Returns the generated signal id.
    async fn insert_signal(&self, session_id: &str, signal: &StrategySignal) -> Result<i64, DatabaseError>;

    async fn insert_position(&self, session_id: &str, position: &Position) -> Result<(), DatabaseError>;

    async fn update_unrealized_pnl(
        &self,
        position_id: &str,
        current_price: f64,
        unrealized_pnl: f64,
        unrealized_pnl_pct: f64,
    ) -> Result<(), DatabaseError>;

    /// Writes exit fields and realized P&L of a closed position.
    async fn update_position_on_close(&self, position: &Position) -> Result<(), DatabaseError>;

    async fn insert_trade(&self, session_id: &str, trade: &Trade) -> Result<(), DatabaseError>;

    async fn insert_performance_snapshot(
        &self,
        session_id: &str,
        snapshot: &PerformanceSnapshot,
    ) -> Result<(), DatabaseError>;

    /// Inserts or replaces the bar keyed by (symbol, timeframe, timestamp).
    async fn upsert_candle(&self, candle: &Candle) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn fetch_recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DatabaseError>;
}
