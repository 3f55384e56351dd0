//! Database Repository
//!
//! sqlx-backed implementation of [`SimulationStore`].

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::position::{Position, Trade};
use crate::domain::entities::signal::StrategySignal;
use crate::domain::repositories::simulation_store::{SessionStatus, SimulationStore};
use crate::domain::services::metrics::PerformanceSnapshot;

fn query_error(action: &str, e: sqlx::Error) -> DatabaseError {
    error!("Failed to {}: {}", action, e);
    DatabaseError::QueryError(format!("Failed to {}: {}", action, e))
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get session", e))
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get position", e))
    }

    pub async fn list_signals(&self, session_id: &str) -> Result<Vec<SignalRecord>, DatabaseError> {
        sqlx::query_as::<_, SignalRecord>(
            "SELECT * FROM signals WHERE session_id = ?1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list signals", e))
    }

    pub async fn list_trades(&self, session_id: &str) -> Result<Vec<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE session_id = ?1 ORDER BY exit_time DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list trades", e))
    }

    pub async fn count_snapshots(&self, session_id: &str) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM performance_snapshots WHERE session_id = ?1")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| query_error("count snapshots", e))?;
        Ok(count)
    }
}

#[async_trait]
impl SimulationStore for SqliteStore {
    async fn create_session(&self, symbols: &[String], strategies: &[String]) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let symbols = serde_json::to_string(symbols)
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
        let strategies = serde_json::to_string(strategies)
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, status, symbols, strategies, started_at)
            VALUES (?1, 'RUNNING', ?2, ?3, ?4)
            "#,
        )
        .bind(&id)
        .bind(symbols)
        .bind(strategies)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("create session", e))?;

        debug!("Created session: {}", id);
        Ok(id)
    }

    async fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<(), DatabaseError> {
        let stopped_at = (status != SessionStatus::Running).then(Utc::now);
        let rows_affected = sqlx::query(
            "UPDATE sessions SET status = ?1, stopped_at = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(stopped_at)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update session", e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    async fn insert_signal(&self, session_id: &str, signal: &StrategySignal) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (session_id, symbol, strategy, timestamp, side, price, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(session_id)
        .bind(&signal.symbol)
        .bind(&signal.strategy)
        .bind(signal.signal.timestamp)
        .bind(signal.signal.side.as_str())
        .bind(signal.signal.price)
        .bind(signal.signal.confidence)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("insert signal", e))?;

        Ok(result.last_insert_rowid())
    }

    async fn insert_position(&self, session_id: &str, position: &Position) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, session_id, symbol, strategy, status, entry_time, entry_price,
                quantity, fee, current_price, unrealized_pnl, unrealized_pnl_pct
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&position.id)
        .bind(session_id)
        .bind(&position.symbol)
        .bind(&position.strategy)
        .bind(position.status.as_str())
        .bind(position.entry_time)
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.fee)
        .bind(position.current_price)
        .bind(position.unrealized_pnl())
        .bind(position.unrealized_pnl_pct())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("insert position", e))?;

        debug!("Inserted position: {} for {}", position.id, position.symbol);
        Ok(())
    }

    async fn update_unrealized_pnl(
        &self,
        position_id: &str,
        current_price: f64,
        unrealized_pnl: f64,
        unrealized_pnl_pct: f64,
    ) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET current_price = ?1, unrealized_pnl = ?2, unrealized_pnl_pct = ?3
            WHERE id = ?4 AND status = 'OPEN'
            "#,
        )
        .bind(current_price)
        .bind(unrealized_pnl)
        .bind(unrealized_pnl_pct)
        .bind(position_id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update unrealized pnl", e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::NotFound(format!("open position {}", position_id)));
        }
        Ok(())
    }

    async fn update_position_on_close(&self, position: &Position) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'CLOSED', current_price = ?1, unrealized_pnl = NULL,
                unrealized_pnl_pct = NULL, exit_time = ?2, exit_price = ?3,
                slippage = ?4, realized_pnl = ?5, realized_pnl_pct = ?6
            WHERE id = ?7
            "#,
        )
        .bind(position.current_price)
        .bind(position.exit_time)
        .bind(position.exit_price)
        .bind(position.slippage)
        .bind(position.realized_pnl())
        .bind(position.realized_pnl_pct())
        .bind(&position.id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("close position", e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::NotFound(format!("position {}", position.id)));
        }
        Ok(())
    }

    async fn insert_trade(&self, session_id: &str, trade: &Trade) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, session_id, position_id, symbol, strategy, entry_time, entry_price,
                exit_time, exit_price, quantity, fee, slippage, realized_pnl,
                realized_pnl_pct, hold_duration_secs
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&trade.id)
        .bind(session_id)
        .bind(&trade.position_id)
        .bind(&trade.symbol)
        .bind(&trade.strategy)
        .bind(trade.entry_time)
        .bind(trade.entry_price)
        .bind(trade.exit_time)
        .bind(trade.exit_price)
        .bind(trade.quantity)
        .bind(trade.fee)
        .bind(trade.slippage)
        .bind(trade.realized_pnl)
        .bind(trade.realized_pnl_pct)
        .bind(trade.hold_duration_secs)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("insert trade", e))?;

        debug!("Inserted trade: {} ({:+.2})", trade.id, trade.realized_pnl);
        Ok(())
    }

    async fn insert_performance_snapshot(
        &self,
        session_id: &str,
        snapshot: &PerformanceSnapshot,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO performance_snapshots (
                session_id, timestamp, total_pnl, total_pnl_pct, win_rate,
                max_drawdown, total_trades, win_count, lose_count
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(session_id)
        .bind(snapshot.timestamp)
        .bind(snapshot.total_pnl)
        .bind(snapshot.total_pnl_pct)
        .bind(snapshot.win_rate)
        .bind(snapshot.max_drawdown)
        .bind(snapshot.total_trades as i64)
        .bind(snapshot.win_count as i64)
        .bind(snapshot.lose_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("insert performance snapshot", e))?;
        Ok(())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO candles (symbol, timeframe, timestamp, open, high, low, close, volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.timeframe.as_str())
        .bind(candle.timestamp)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("upsert candle", e))?;
        Ok(())
    }

    async fn fetch_recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DatabaseError> {
        let records = sqlx::query_as::<_, CandleRecord>(
            r#"
            SELECT * FROM candles
            WHERE symbol = ?1 AND timeframe = ?2
            ORDER BY timestamp DESC
            LIMIT ?3
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("fetch candles", e))?;

        records.into_iter().map(Candle::try_from).collect()
    }
}
