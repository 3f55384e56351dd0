use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::domain::entities::candle::Candle;
use crate::domain::entities::position::{net_pnl, pnl_pct, Position, PositionKey, PositionStatus, Trade};
use crate::domain::entities::signal::{Signal, SignalSide};
use crate::domain::repositories::simulation_store::SimulationStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub trade: Trade,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened(Position),
    Closed(ClosedPosition),
    /// Duplicate BUY or SELL without an open position
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub symbol: Option<String>,
    pub strategy: Option<String>,
}

impl PositionFilter {
    fn matches(&self, symbol: &str, strategy: &str) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == symbol)
            && self.strategy.as_deref().map_or(true, |s| s == strategy)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub symbol: Option<String>,
    pub strategy: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSummary {
    pub open_positions_count: usize,
    /// Rounded to 2 decimal places
    pub total_unrealized_pnl: f64,
    pub positions_by_symbol: BTreeMap<String, usize>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Virtual positions for one session.
///
/// In-memory state is authoritative. Store writes happen after the state change
/// and a failed write is only logged.
pub struct PositionLedger {
    session_id: String,
    config: LedgerConfig,
    store: Arc<dyn SimulationStore>,
    open: Mutex<HashMap<PositionKey, Position>>,
    closed: Mutex<Vec<Trade>>,
}

impl PositionLedger {
    pub fn new(session_id: impl Into<String>, config: LedgerConfig, store: Arc<dyn SimulationStore>) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            store,
            open: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    fn open_guard(&self) -> MutexGuard<'_, HashMap<PositionKey, Position>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_guard(&self) -> MutexGuard<'_, Vec<Trade>> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn on_signal(
        &self,
        signal: &Signal,
        symbol: &str,
        strategy: &str,
        execution_price: f64,
    ) -> SignalOutcome {
        match signal.side {
            SignalSide::Buy => match self.open(symbol, strategy, execution_price, signal.timestamp).await {
                Some(position) => SignalOutcome::Opened(position),
                None => SignalOutcome::Ignored,
            },
            SignalSide::Sell => {
                match self
                    .close(symbol, strategy, execution_price, signal.timestamp, None)
                    .await
                {
                    Some(closed) => SignalOutcome::Closed(closed),
                    None => {
                        warn!("SELL signal for {}:{} with no open position, ignoring", symbol, strategy);
                        SignalOutcome::Ignored
                    }
                }
            }
        }
    }

    /// Opens a position unless one is already open for the key.
    pub async fn open(
        &self,
        symbol: &str,
        strategy: &str,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<Position> {
        let key = PositionKey::new(symbol, strategy);
        let position = {
            let mut open = self.open_guard();
            if open.contains_key(&key) {
                warn!("Position already open for {}, ignoring duplicate BUY", key);
                return None;
            }
            let quantity = self.config.position_quantity;
            let position = Position {
                id: Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                strategy: strategy.to_string(),
                entry_time: timestamp,
                entry_price: price,
                quantity,
                fee: price * quantity * self.config.fee_rate,
                current_price: price,
                status: PositionStatus::Open,
                exit_time: None,
                exit_price: None,
                slippage: None,
            };
            open.insert(key, position.clone());
            position
        };

        info!(
            "Opened position {} for {}:{} at {:.2} (qty: {}, fee: {:.4})",
            position.id, symbol, strategy, price, position.quantity, position.fee
        );
        if let Err(e) = self.store.insert_position(&self.session_id, &position).await {
            error!("Failed to persist opened position {}: {}", position.id, e);
        }
        Some(position)
    }

    /// Closes the open position for the key. Slippage defaults to
    /// `exit_price * quantity * slippage_rate`.
    pub async fn close(
        &self,
        symbol: &str,
        strategy: &str,
        exit_price: f64,
        timestamp: DateTime<Utc>,
        slippage: Option<f64>,
    ) -> Option<ClosedPosition> {
        let key = PositionKey::new(symbol, strategy);
        let mut position = self.open_guard().remove(&key)?;

        let slippage = slippage
            .unwrap_or(exit_price * position.quantity * self.config.slippage_rate)
            .max(0.0);
        let realized_pnl = net_pnl(position.quantity, position.entry_price, exit_price, position.fee, slippage);
        let realized_pnl_pct = pnl_pct(realized_pnl, position.entry_price, position.quantity);

        position.status = PositionStatus::Closed;
        position.current_price = exit_price;
        position.exit_time = Some(timestamp);
        position.exit_price = Some(exit_price);
        position.slippage = Some(slippage);

        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            strategy: position.strategy.clone(),
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: timestamp,
            exit_price,
            quantity: position.quantity,
            fee: position.fee,
            slippage,
            realized_pnl,
            realized_pnl_pct,
            hold_duration_secs: (timestamp - position.entry_time).num_seconds().max(0),
        };
        self.closed_guard().push(trade.clone());

        info!(
            "Closed position {} for {} at {:.2}: pnl {:.4} ({:.2}%)",
            position.id, key, exit_price, realized_pnl, realized_pnl_pct
        );
        if let Err(e) = self.store.update_position_on_close(&position).await {
            error!("Failed to persist closed position {}: {}", position.id, e);
        }
        if let Err(e) = self.store.insert_trade(&self.session_id, &trade).await {
            error!("Failed to persist trade {}: {}", trade.id, e);
        }

        Some(ClosedPosition { position, trade })
    }

    /// Marks every open position on the candle's symbol at its close.
    pub async fn mark_to_market(&self, candle: &Candle) -> Vec<Position> {
        self.update_price(&candle.symbol, candle.close).await
    }

    pub async fn update_price(&self, symbol: &str, price: f64) -> Vec<Position> {
        let updated: Vec<Position> = {
            let mut open = self.open_guard();
            open.values_mut()
                .filter(|p| p.symbol == symbol)
                .map(|p| {
                    p.current_price = price;
                    p.clone()
                })
                .collect()
        };

        for position in &updated {
            let pnl = position.unrealized_pnl().unwrap_or(0.0);
            let pct = position.unrealized_pnl_pct().unwrap_or(0.0);
            debug!("Marked {} at {:.2}: unrealized {:.4}", position.id, price, pnl);
            if let Err(e) = self
                .store
                .update_unrealized_pnl(&position.id, price, pnl, pct)
                .await
            {
                error!("Failed to persist mark for position {}: {}", position.id, e);
            }
        }
        updated
    }

    /// Newest entry first.
    pub fn open_positions(&self, filter: &PositionFilter) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .open_guard()
            .values()
            .filter(|p| filter.matches(&p.symbol, &p.strategy))
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));
        positions
    }

    pub fn get_position(&self, symbol: &str, strategy: &str) -> Option<Position> {
        self.open_guard().get(&PositionKey::new(symbol, strategy)).cloned()
    }

    /// Newest exit first, then paginated.
    pub fn closed_trades(&self, filter: &TradeFilter) -> Vec<Trade> {
        let matcher = PositionFilter {
            symbol: filter.symbol.clone(),
            strategy: filter.strategy.clone(),
        };
        let mut trades: Vec<Trade> = self
            .closed_guard()
            .iter()
            .filter(|t| matcher.matches(&t.symbol, &t.strategy))
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.exit_time.cmp(&a.exit_time));
        trades
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Every closed trade of the session in close order.
    pub fn all_closed_trades(&self) -> Vec<Trade> {
        self.closed_guard().clone()
    }

    pub fn summary(&self) -> PositionSummary {
        let open = self.open_guard();
        let mut positions_by_symbol = BTreeMap::new();
        let mut total = 0.0;
        for position in open.values() {
            *positions_by_symbol.entry(position.symbol.clone()).or_insert(0) += 1;
            total += position.unrealized_pnl().unwrap_or(0.0);
        }
        PositionSummary {
            open_positions_count: open.len(),
            total_unrealized_pnl: round2(total),
            positions_by_symbol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::candle::Timeframe;
    use crate::persistence::InMemoryStore;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ledger_with(store: Arc<InMemoryStore>) -> PositionLedger {
        PositionLedger::new("session-1", LedgerConfig::default(), store)
    }

    fn ledger() -> PositionLedger {
        ledger_with(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_close_pnl_matches_reference_trade() {
        let config = LedgerConfig {
            fee_rate: 0.01,
            slippage_rate: 0.0,
            position_quantity: 0.1,
        };
        let ledger = PositionLedger::new("s", config, Arc::new(InMemoryStore::new()));

        let opened = ledger.open("BTC", "ema", 50_000.0, ts(0)).await.unwrap();
        assert!((opened.fee - 50.0).abs() < 1e-9);

        let closed = ledger.close("BTC", "ema", 51_000.0, ts(3600), Some(0.0)).await.unwrap();
        assert!((closed.trade.realized_pnl - 50.0).abs() < 1e-9);
        assert!((closed.trade.realized_pnl_pct - 1.0).abs() < 1e-9);
        assert_eq!(closed.trade.hold_duration_secs, 3600);
        assert_eq!(closed.position.status, PositionStatus::Closed);
        assert!(ledger.get_position("BTC", "ema").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_buy_leaves_position_unchanged() {
        let ledger = ledger();
        let buy = Signal::buy(ts(0), 100.0, 0.8).unwrap();
        let first = ledger.on_signal(&buy, "BTC", "ema", 100.0).await;
        let SignalOutcome::Opened(original) = first else {
            panic!("expected open");
        };

        let again = Signal::buy(ts(60), 120.0, 0.9).unwrap();
        assert_eq!(ledger.on_signal(&again, "BTC", "ema", 120.0).await, SignalOutcome::Ignored);
        assert_eq!(ledger.get_position("BTC", "ema"), Some(original));
        assert_eq!(ledger.summary().open_positions_count, 1);
    }

    #[tokio::test]
    async fn test_sell_without_position_is_noop() {
        let ledger = ledger();
        let sell = Signal::sell(ts(0), 100.0, 0.5).unwrap();
        assert_eq!(ledger.on_signal(&sell, "BTC", "ema", 100.0).await, SignalOutcome::Ignored);
        assert!(ledger.all_closed_trades().is_empty());
    }

    #[tokio::test]
    async fn test_default_slippage_uses_rate() {
        let ledger = ledger();
        ledger.open("BTC", "ema", 100.0, ts(0)).await;
        let closed = ledger.close("BTC", "ema", 110.0, ts(60), None).await.unwrap();
        // 110 * 0.1 * 0.0002
        assert!((closed.trade.slippage - 0.0022).abs() < 1e-12);
        let expected = 0.1 * 10.0 - 0.01 - 0.0022;
        assert!((closed.trade.realized_pnl - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_key_reopens_after_close() {
        let ledger = ledger();
        ledger.open("BTC", "ema", 100.0, ts(0)).await.unwrap();
        ledger.close("BTC", "ema", 101.0, ts(60), None).await.unwrap();
        assert!(ledger.open("BTC", "ema", 102.0, ts(120)).await.is_some());
    }

    #[tokio::test]
    async fn test_mark_to_market_only_touches_symbol() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(store.clone());
        let btc = ledger.open("BTC", "ema", 100.0, ts(0)).await.unwrap();
        ledger.open("ETH", "ema", 10.0, ts(0)).await.unwrap();

        let candle = Candle::new("BTC", Timeframe::OneMinute, ts(60), 100.0, 112.0, 99.0, 110.0, 3.0).unwrap();
        let marked = ledger.mark_to_market(&candle).await;
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].current_price, 110.0);
        assert_eq!(store.position(&btc.id).unwrap().current_price, 110.0);
        assert_eq!(ledger.get_position("ETH", "ema").unwrap().current_price, 10.0);

        // 0.1 * 10 - 0.01
        assert_eq!(ledger.summary().total_unrealized_pnl, 0.99);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_memory_state() {
        let store = Arc::new(InMemoryStore::new());
        store.set_failing(true);
        let ledger = ledger_with(store.clone());

        assert!(ledger.open("BTC", "ema", 100.0, ts(0)).await.is_some());
        assert!(ledger.close("BTC", "ema", 105.0, ts(60), None).await.is_some());
        assert_eq!(ledger.all_closed_trades().len(), 1);
        store.set_failing(false);
        assert!(store.trades().is_empty());
    }

    #[tokio::test]
    async fn test_read_models_filter_and_paginate() {
        let ledger = ledger();
        for (i, symbol) in ["BTC", "ETH", "BTC"].iter().enumerate() {
            let strategy = format!("s{}", i);
            ledger.open(symbol, &strategy, 100.0, ts(i as i64)).await;
            ledger
                .close(symbol, &strategy, 101.0, ts(100 + i as i64), None)
                .await;
        }
        ledger.open("BTC", "live", 100.0, ts(10)).await;
        ledger.open("ETH", "live", 100.0, ts(20)).await;

        let open = ledger.open_positions(&PositionFilter::default());
        assert_eq!(open[0].symbol, "ETH");
        let btc_only = ledger.open_positions(&PositionFilter {
            symbol: Some("BTC".into()),
            strategy: None,
        });
        assert_eq!(btc_only.len(), 1);

        let btc_trades = ledger.closed_trades(&TradeFilter {
            symbol: Some("BTC".into()),
            ..TradeFilter::default()
        });
        assert_eq!(btc_trades.iter().map(|t| t.strategy.as_str()).collect::<Vec<_>>(), vec!["s2", "s0"]);

        let page = ledger.closed_trades(&TradeFilter {
            limit: Some(1),
            offset: 1,
            ..TradeFilter::default()
        });
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].strategy, "s1");

        let summary = ledger.summary();
        assert_eq!(summary.open_positions_count, 2);
        assert_eq!(summary.positions_by_symbol.get("BTC"), Some(&1));
    }
}
