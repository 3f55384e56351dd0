//! Database Models
//!
//! Row shapes for the SQLite tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::candle::{Candle, Timeframe};
use crate::persistence::DatabaseError;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub status: String, // "RUNNING", "STOPPED" or "FAILED"
    pub symbols: String, // JSON array
    pub strategies: String, // JSON array
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SignalRecord {
    pub id: i64,
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub side: String,
    pub price: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: String,
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub status: String, // "OPEN" or "CLOSED"
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub current_price: f64,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub slippage: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: String,
    pub session_id: String,
    pub position_id: String,
    pub symbol: String,
    pub strategy: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub slippage: f64,
    pub realized_pnl: f64,
    pub realized_pnl_pct: f64,
    pub hold_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CandleRecord {
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl TryFrom<CandleRecord> for Candle {
    type Error = DatabaseError;

    fn try_from(record: CandleRecord) -> Result<Self, Self::Error> {
        let timeframe: Timeframe = record
            .timeframe
            .parse()
            .map_err(|e| DatabaseError::QueryError(format!("Stored candle: {}", e)))?;
        Candle::new(
            record.symbol,
            timeframe,
            record.timestamp,
            record.open,
            record.high,
            record.low,
            record.close,
            record.volume,
        )
        .map_err(|e| DatabaseError::QueryError(format!("Stored candle: {}", e)))
    }
}
