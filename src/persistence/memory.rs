use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::DatabaseError;
use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::position::{Position, Trade};
use crate::domain::entities::signal::StrategySignal;
use crate::domain::repositories::simulation_store::{SessionStatus, SimulationStore};
use crate::domain::services::metrics::PerformanceSnapshot;

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, SessionStatus>,
    signals: Vec<(i64, String, StrategySignal)>,
    positions: HashMap<String, Position>,
    trades: Vec<Trade>,
    snapshots: Vec<(String, PerformanceSnapshot)>,
    candles: BTreeMap<(String, Timeframe, DateTime<Utc>), Candle>,
}

/// Process-local store. `set_failing(true)` makes every call error, for exercising write-failure paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    fetch_delay_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every `fetch_recent_candles`, like a slow history read.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, DatabaseError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::QueryError("store unavailable".to_string()));
        }
        self.tables
            .lock()
            .map_err(|_| DatabaseError::QueryError("store lock poisoned".to_string()))
    }

    pub fn session_status(&self, id: &str) -> Option<SessionStatus> {
        self.tables().ok()?.sessions.get(id).copied()
    }

    pub fn signals(&self) -> Vec<StrategySignal> {
        self.tables()
            .map(|t| t.signals.iter().map(|(_, _, s)| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.tables().ok()?.positions.get(id).cloned()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.tables().map(|t| t.trades.clone()).unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<PerformanceSnapshot> {
        self.tables()
            .map(|t| t.snapshots.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn candle_count(&self) -> usize {
        self.tables().map(|t| t.candles.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SimulationStore for InMemoryStore {
    async fn create_session(&self, _symbols: &[String], _strategies: &[String]) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.tables()?.sessions.insert(id.clone(), SessionStatus::Running);
        Ok(id)
    }

    async fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<(), DatabaseError> {
        match self.tables()?.sessions.get_mut(session_id) {
            Some(current) => {
                *current = status;
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("session {}", session_id))),
        }
    }

    async fn insert_signal(&self, session_id: &str, signal: &StrategySignal) -> Result<i64, DatabaseError> {
        let mut tables = self.tables()?;
        let id = tables.signals.len() as i64 + 1;
        let mut stored = signal.clone();
        stored.id = Some(id);
        tables.signals.push((id, session_id.to_string(), stored));
        Ok(id)
    }

    async fn insert_position(&self, _session_id: &str, position: &Position) -> Result<(), DatabaseError> {
        self.tables()?
            .positions
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn update_unrealized_pnl(
        &self,
        position_id: &str,
        current_price: f64,
        _unrealized_pnl: f64,
        _unrealized_pnl_pct: f64,
    ) -> Result<(), DatabaseError> {
        match self.tables()?.positions.get_mut(position_id) {
            Some(position) if position.is_open() => {
                position.current_price = current_price;
                Ok(())
            }
            _ => Err(DatabaseError::NotFound(format!("open position {}", position_id))),
        }
    }

    async fn update_position_on_close(&self, position: &Position) -> Result<(), DatabaseError> {
        match self.tables()?.positions.get_mut(&position.id) {
            Some(stored) => {
                *stored = position.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("position {}", position.id))),
        }
    }

    async fn insert_trade(&self, _session_id: &str, trade: &Trade) -> Result<(), DatabaseError> {
        self.tables()?.trades.push(trade.clone());
        Ok(())
    }

    async fn insert_performance_snapshot(
        &self,
        session_id: &str,
        snapshot: &PerformanceSnapshot,
    ) -> Result<(), DatabaseError> {
        self.tables()?
            .snapshots
            .push((session_id.to_string(), snapshot.clone()));
        Ok(())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<(), DatabaseError> {
        self.tables()?.candles.insert(
            (candle.symbol.clone(), candle.timeframe, candle.timestamp),
            candle.clone(),
        );
        Ok(())
    }

    async fn fetch_recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DatabaseError> {
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let tables = self.tables()?;
        Ok(tables
            .candles
            .values()
            .rev()
            .filter(|c| c.symbol == symbol && c.timeframe == timeframe)
            .take(limit)
            .cloned()
            .collect())
    }
}
