use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use papertrade::application::events::SimulationEvent;
use papertrade::application::services::orchestrator::{Orchestrator, PipelineHealth, StrategySpec};
use papertrade::config::SimulationConfig;
use papertrade::domain::entities::candle::{Candle, Tick, Timeframe};
use papertrade::domain::entities::signal::Signal;
use papertrade::domain::errors::{FeedError, StrategyError};
use papertrade::domain::repositories::simulation_store::{SessionStatus, SimulationStore};
use papertrade::domain::repositories::tick_feed::TickFeed;
use papertrade::domain::services::strategies::{Strategy, StrategyFactory, StrategyParams};
use papertrade::infrastructure::ChannelTickFeed;
use papertrade::persistence::InMemoryStore;
use serde_json::json;
use tokio::sync::{mpsc, watch};

/// Buys on one candle, sells on the next.
struct Flip {
    id: &'static str,
    holding: bool,
}

impl Strategy for Flip {
    fn id(&self) -> &'static str {
        self.id
    }

    fn min_history_window(&self) -> usize {
        1
    }

    fn initialize_with_history(&mut self, _: &[Candle], _: &StrategyParams) -> Result<(), StrategyError> {
        Ok(())
    }

    fn process_candle(&mut self, candle: &Candle) -> Option<Signal> {
        let signal = if self.holding {
            Signal::sell(candle.timestamp, candle.close, 0.9)
        } else {
            Signal::buy(candle.timestamp, candle.close, 0.9)
        };
        self.holding = !self.holding;
        signal.ok()
    }
}

fn build_flip(_: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(Flip { id: "flip", holding: false }))
}

fn build_flop(_: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(Flip { id: "flop", holding: false }))
}

fn minute(n: i64) -> DateTime<Utc> {
    // 1_699_999_980 is a minute boundary
    Utc.timestamp_opt(1_699_999_980 + n * 60, 0).unwrap()
}

fn orchestrator(store: Arc<InMemoryStore>) -> (Orchestrator, mpsc::Receiver<SimulationEvent>) {
    orchestrator_with_buffer(store, 256)
}

fn orchestrator_with_buffer(
    store: Arc<InMemoryStore>,
    buffer: usize,
) -> (Orchestrator, mpsc::Receiver<SimulationEvent>) {
    let mut factory = StrategyFactory::with_builtin();
    factory.register("flip", build_flip);
    factory.register("flop", build_flop);
    let config = SimulationConfig {
        symbols: vec!["KRW-BTC".to_string()],
        timeframe: Timeframe::OneMinute,
        ..SimulationConfig::default()
    };
    let (events_tx, events_rx) = mpsc::channel(buffer);
    (Orchestrator::new(&config, factory, store, events_tx), events_rx)
}

async fn collect(rx: &mut mpsc::Receiver<SimulationEvent>, count: usize) -> Vec<SimulationEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => break,
        }
    }
    events
}

#[tokio::test]
async fn test_ticks_flow_to_signals_positions_and_snapshot() {
    let store = Arc::new(InMemoryStore::new());
    let (orchestrator, mut events) = orchestrator(store.clone());
    let (ticks, feed) = ChannelTickFeed::new("scripted");

    let session_id = orchestrator
        .start(
            &["KRW-BTC".to_string()],
            &[StrategySpec::new("flip", json!({}))],
            Box::new(feed),
        )
        .await
        .unwrap();

    // Minute 0 closes at 100, minute 1 at 110, minute 2 stays open
    for (n, price) in [(0, 99.0), (0, 100.0), (1, 108.0), (1, 110.0), (2, 111.0)] {
        ticks.send(Tick::new("KRW-BTC", price, 1.0, minute(n))).await.unwrap();
    }
    // Ticks for symbols outside the session are ignored
    ticks.send(Tick::new("KRW-ETH", 5.0, 1.0, minute(3))).await.unwrap();

    let received = collect(&mut events, 6).await;
    let kinds: Vec<&str> = received
        .iter()
        .map(|e| match e {
            SimulationEvent::SignalCreated(_) => "signal",
            SimulationEvent::PositionOpened(_) => "opened",
            SimulationEvent::PositionUpdated(_) => "updated",
            SimulationEvent::PositionClosed { .. } => "closed",
            SimulationEvent::PerformanceSnapshot(_) => "snapshot",
        })
        .collect();
    assert_eq!(kinds, vec!["signal", "opened", "updated", "signal", "closed", "snapshot"]);

    match &received[4] {
        SimulationEvent::PositionClosed { trade, .. } => {
            // 0.1 * (110 - 100) - fee 0.01 - slippage 0.0022
            assert!((trade.realized_pnl - 0.9878).abs() < 1e-9);
            assert_eq!(trade.hold_duration_secs, 60);
        }
        other => panic!("unexpected {:?}", other),
    }
    match &received[5] {
        SimulationEvent::PerformanceSnapshot(snapshot) => {
            assert_eq!(snapshot.total_trades, 1);
            assert_eq!(snapshot.win_rate, 1.0);
            assert_eq!(snapshot.max_drawdown, 0.0);
        }
        other => panic!("unexpected {:?}", other),
    }

    let summary = orchestrator.stop().await.unwrap();
    assert_eq!(summary.open_positions_count, 0);

    assert_eq!(store.session_status(&session_id), Some(SessionStatus::Stopped));
    assert_eq!(store.candle_count(), 2);
    assert_eq!(store.signals().len(), 2);
    assert_eq!(store.trades().len(), 1);
    assert_eq!(store.snapshots().len(), 1);

    let ledger = orchestrator.ledger().await.unwrap();
    assert_eq!(ledger.all_closed_trades().len(), 1);
}

#[tokio::test]
async fn test_stored_candles_seed_history_and_are_not_replayed() {
    let store = Arc::new(InMemoryStore::new());
    for n in 0..3 {
        let candle = Candle::new("KRW-BTC", Timeframe::OneMinute, minute(n), 100.0, 101.0, 99.0, 100.0, 1.0).unwrap();
        store.upsert_candle(&candle).await.unwrap();
    }

    let (orchestrator, mut events) = orchestrator(store.clone());
    let (ticks, feed) = ChannelTickFeed::new("scripted");
    orchestrator
        .start(
            &["KRW-BTC".to_string()],
            &[StrategySpec::new("flip", json!({}))],
            Box::new(feed),
        )
        .await
        .unwrap();
    assert_eq!(orchestrator.bindings().await[0].history_loaded, 1);

    // Extends the seeded minute-2 bar, then opens minute 3 and minute 4
    for (n, price) in [(2, 102.0), (3, 105.0), (4, 106.0)] {
        ticks.send(Tick::new("KRW-BTC", price, 1.0, minute(n))).await.unwrap();
    }

    let received = collect(&mut events, 2).await;
    assert!(matches!(&received[0], SimulationEvent::SignalCreated(s) if s.signal.price == 105.0));
    assert!(matches!(&received[1], SimulationEvent::PositionOpened(_)));

    orchestrator.stop().await;
    assert_eq!(store.candle_count(), 4);
}

#[tokio::test]
async fn test_every_close_publishes_a_snapshot() {
    let store = Arc::new(InMemoryStore::new());
    let (orchestrator, mut events) = orchestrator(store.clone());
    let (ticks, feed) = ChannelTickFeed::new("scripted");
    orchestrator
        .start(
            &["KRW-BTC".to_string()],
            &[StrategySpec::new("flip", json!({})), StrategySpec::new("flop", json!({}))],
            Box::new(feed),
        )
        .await
        .unwrap();

    // Both bindings open on minute 0 and close on minute 1
    for (n, price) in [(0, 100.0), (1, 110.0), (2, 111.0)] {
        ticks.send(Tick::new("KRW-BTC", price, 1.0, minute(n))).await.unwrap();
    }

    // Minute 0: (signal, open) twice. Minute 1: 2 updates, then (signal, close, snapshot) twice
    let received = collect(&mut events, 12).await;
    assert_eq!(received.len(), 12);
    let snapshots: Vec<usize> = received
        .iter()
        .filter_map(|e| match e {
            SimulationEvent::PerformanceSnapshot(s) => Some(s.total_trades),
            _ => None,
        })
        .collect();
    let closes = received
        .iter()
        .filter(|e| matches!(e, SimulationEvent::PositionClosed { .. }))
        .count();
    assert_eq!(closes, 2);
    assert_eq!(snapshots, vec![1, 2]);
    assert!(matches!(received.last(), Some(SimulationEvent::PerformanceSnapshot(_))));

    orchestrator.stop().await;
    assert_eq!(store.snapshots().len(), 2);
}

#[tokio::test]
async fn test_full_event_queue_does_not_stall_pipeline() {
    let store = Arc::new(InMemoryStore::new());
    let (orchestrator, mut events) = orchestrator_with_buffer(store.clone(), 1);
    let (ticks, feed) = ChannelTickFeed::new("scripted");
    orchestrator
        .start(
            &["KRW-BTC".to_string()],
            &[StrategySpec::new("flip", json!({}))],
            Box::new(feed),
        )
        .await
        .unwrap();

    // Nobody reads the event queue while these are processed
    for (n, price) in [(0, 100.0), (1, 110.0), (2, 111.0)] {
        ticks.send(Tick::new("KRW-BTC", price, 1.0, minute(n))).await.unwrap();
    }

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while store.trades().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(closed.is_ok());

    let stopped = tokio::time::timeout(Duration::from_secs(5), orchestrator.stop()).await;
    assert!(stopped.is_ok());
    assert_eq!(store.trades().len(), 1);

    let mut queued = 0;
    while events.try_recv().is_ok() {
        queued += 1;
    }
    assert_eq!(queued, 1);
}

struct BrokenFeed;

#[async_trait]
impl TickFeed for BrokenFeed {
    fn name(&self) -> &str {
        "broken"
    }

    async fn run(&mut self, _ticks: mpsc::Sender<Tick>, _shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        Err(FeedError::ReconnectionLimitExceeded { attempts: 10 })
    }
}

#[tokio::test]
async fn test_feed_failure_marks_session_failed() {
    let store = Arc::new(InMemoryStore::new());
    let (orchestrator, _events) = orchestrator(store.clone());
    let mut health = orchestrator.health();

    let session_id = orchestrator
        .start(
            &["KRW-BTC".to_string()],
            &StrategySpec::from_ids(&["ema_crossover".to_string()]),
            Box::new(BrokenFeed),
        )
        .await
        .unwrap();

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if matches!(&*health.borrow_and_update(), PipelineHealth::FeedFailed { .. }) {
                return true;
            }
            if health.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(failed);

    orchestrator.stop().await;
    assert_eq!(store.session_status(&session_id), Some(SessionStatus::Failed));
}
