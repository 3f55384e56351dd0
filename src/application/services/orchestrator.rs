//! Session lifecycle and pipeline wiring.
//!
//! One session runs two tasks: the tick feed, and the pipeline that turns ticks
//! into candles, candles into signals and signals into positions. Everything the
//! pipeline produces leaves through a single [`SimulationEvent`] channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::position_ledger::{PositionLedger, PositionSummary, SignalOutcome};
use super::strategy_runner::{BindingStatus, StrategyRunner};
use crate::application::events::SimulationEvent;
use crate::config::{LedgerConfig, SimulationConfig};
use crate::domain::entities::candle::{Candle, Tick, Timeframe};
use crate::domain::errors::{SimulationError, StrategyError};
use crate::domain::repositories::simulation_store::{SessionStatus, SimulationStore};
use crate::domain::repositories::tick_feed::TickFeed;
use crate::domain::services::candle_builder::MultiCandleBuilder;
use crate::domain::services::metrics::PerformanceSnapshot;
use crate::domain::services::strategies::{StrategyFactory, StrategyParams};
use crate::task_runner::{retry_with_backoff, RetryPolicy};

/// Stored bars loaded per symbol when seeding the candle builders.
const SEED_CANDLES: usize = 100;
const TICK_BUFFER: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineHealth {
    Idle,
    Running { session_id: String },
    FeedFailed { session_id: String, reason: String },
    Stopped { session_id: String },
}

/// A strategy to bind to every session symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySpec {
    pub id: String,
    pub params: StrategyParams,
}

impl StrategySpec {
    pub fn new(id: impl Into<String>, params: StrategyParams) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }

    /// Default parameters for each id.
    pub fn from_ids(ids: &[String]) -> Vec<StrategySpec> {
        ids.iter().map(|id| StrategySpec::new(id.clone(), json!({}))).collect()
    }
}

enum SessionSlot {
    Vacant,
    /// Claimed by a `start` still doing its I/O
    Starting,
    Active(ActiveSession),
}

struct ActiveSession {
    session_id: String,
    runner: Arc<StrategyRunner>,
    ledger: Arc<PositionLedger>,
    shutdown: watch::Sender<bool>,
    feed_task: JoinHandle<()>,
    pipeline_task: JoinHandle<()>,
}

pub struct Orchestrator {
    timeframe: Timeframe,
    ledger_config: LedgerConfig,
    factory: StrategyFactory,
    store: Arc<dyn SimulationStore>,
    events: mpsc::Sender<SimulationEvent>,
    seed_retry: RetryPolicy,
    health: watch::Sender<PipelineHealth>,
    slot: Mutex<SessionSlot>,
    /// Ledger of the latest session, kept after stop for reads
    last_ledger: Mutex<Option<Arc<PositionLedger>>>,
}

impl Orchestrator {
    pub fn new(
        config: &SimulationConfig,
        factory: StrategyFactory,
        store: Arc<dyn SimulationStore>,
        events: mpsc::Sender<SimulationEvent>,
    ) -> Self {
        let (health, _) = watch::channel(PipelineHealth::Idle);
        Self {
            timeframe: config.timeframe,
            ledger_config: config.ledger.clone(),
            factory,
            store,
            events,
            seed_retry: RetryPolicy::exponential(Duration::from_millis(200), Duration::from_secs(2), 3),
            health,
            slot: Mutex::new(SessionSlot::Vacant),
            last_ledger: Mutex::new(None),
        }
    }

    pub fn with_seed_retry(mut self, policy: RetryPolicy) -> Self {
        self.seed_retry = policy;
        self
    }

    pub fn health(&self) -> watch::Receiver<PipelineHealth> {
        self.health.subscribe()
    }

    pub async fn session_id(&self) -> Option<String> {
        match &*self.slot.lock().await {
            SessionSlot::Active(session) => Some(session.session_id.clone()),
            _ => None,
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.slot.lock().await, SessionSlot::Active(_))
    }

    pub async fn ledger(&self) -> Option<Arc<PositionLedger>> {
        self.last_ledger.lock().await.clone()
    }

    pub async fn bindings(&self) -> Vec<BindingStatus> {
        match &*self.slot.lock().await {
            SessionSlot::Active(session) => session.runner.bindings(),
            _ => Vec::new(),
        }
    }

    /// Starts a session for `symbols` x `strategies` fed by `feed`. Returns the session id.
    pub async fn start(
        &self,
        symbols: &[String],
        strategies: &[StrategySpec],
        feed: Box<dyn TickFeed>,
    ) -> Result<String, SimulationError> {
        {
            let mut slot = self.slot.lock().await;
            match &*slot {
                SessionSlot::Active(session) => {
                    return Err(SimulationError::AlreadyRunning(session.session_id.clone()))
                }
                SessionSlot::Starting => return Err(SimulationError::AlreadyStarting),
                SessionSlot::Vacant => *slot = SessionSlot::Starting,
            }
        }

        // The slot lock is not held across the store and feed setup below
        let launched = self.launch(symbols, strategies, feed).await;

        let mut slot = self.slot.lock().await;
        match launched {
            Ok(session) => {
                let session_id = session.session_id.clone();
                *slot = SessionSlot::Active(session);
                Ok(session_id)
            }
            Err(e) => {
                *slot = SessionSlot::Vacant;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        symbols: &[String],
        strategies: &[StrategySpec],
        mut feed: Box<dyn TickFeed>,
    ) -> Result<ActiveSession, SimulationError> {
        let strategy_ids: Vec<String> = strategies.iter().map(|s| s.id.clone()).collect();
        let session_id = self.store.create_session(symbols, &strategy_ids).await?;
        info!(
            "Starting session {} ({} symbols x {} strategies, timeframe {})",
            session_id,
            symbols.len(),
            strategies.len(),
            self.timeframe
        );

        let runner = Arc::new(StrategyRunner::new(
            session_id.clone(),
            self.timeframe,
            self.factory.clone(),
            self.store.clone(),
        ));
        let ledger = Arc::new(PositionLedger::new(
            session_id.clone(),
            self.ledger_config.clone(),
            self.store.clone(),
        ));

        for symbol in symbols {
            for spec in strategies {
                if let Err(e) = runner.register(symbol, &spec.id, spec.params.clone()) {
                    self.abort_start(&session_id).await;
                    return Err(e.into());
                }
            }
        }

        let (builders, dispatched_through) = self.seed_builders(symbols).await;

        for symbol in symbols {
            for spec in strategies {
                match runner.initialize(symbol, &spec.id).await {
                    Ok(_) => {}
                    Err(StrategyError::Storage(e)) => {
                        warn!(
                            "History unavailable for {}:{}: {}, starting cold",
                            symbol, spec.id, e
                        );
                        if let Err(e) = runner.prime(symbol, &spec.id, &[]) {
                            self.abort_start(&session_id).await;
                            return Err(e.into());
                        }
                    }
                    Err(e) => {
                        self.abort_start(&session_id).await;
                        return Err(e.into());
                    }
                }
            }
        }

        // Before the feed task exists, so a fast failure is not overwritten
        self.health.send_replace(PipelineHealth::Running {
            session_id: session_id.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER);

        let feed_session = session_id.clone();
        let feed_store = self.store.clone();
        let feed_health = self.health.clone();
        let feed_task = tokio::spawn(async move {
            let name = feed.name().to_string();
            info!("Tick feed '{}' started", name);
            match feed.run(tick_tx, shutdown_rx).await {
                Ok(()) => info!("Tick feed '{}' finished", name),
                Err(e) => {
                    error!("Tick feed '{}' failed: {}", name, e);
                    if let Err(e) = feed_store
                        .update_session_status(&feed_session, SessionStatus::Failed)
                        .await
                    {
                        error!("Failed to mark session {} failed: {}", feed_session, e);
                    }
                    feed_health.send_replace(PipelineHealth::FeedFailed {
                        session_id: feed_session,
                        reason: e.to_string(),
                    });
                }
            }
        });

        let pipeline = Pipeline {
            timeframe: self.timeframe,
            symbols: symbols.iter().cloned().collect(),
            store: self.store.clone(),
            runner: runner.clone(),
            ledger: ledger.clone(),
            events: self.events.clone(),
            builders,
            dispatched_through,
        };
        let pipeline_task = tokio::spawn(pipeline.run(tick_rx));

        *self.last_ledger.lock().await = Some(ledger.clone());
        Ok(ActiveSession {
            session_id,
            runner,
            ledger,
            shutdown: shutdown_tx,
            feed_task,
            pipeline_task,
        })
    }

    async fn abort_start(&self, session_id: &str) {
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Failed)
            .await
        {
            error!("Failed to mark session {} failed: {}", session_id, e);
        }
    }

    /// Loads stored bars into fresh builders. A symbol whose history cannot be read starts empty.
    async fn seed_builders(&self, symbols: &[String]) -> (MultiCandleBuilder, HashMap<String, DateTime<Utc>>) {
        let mut builders = MultiCandleBuilder::new();
        let mut dispatched_through = HashMap::new();

        for symbol in symbols {
            let task_name = format!("seed candles {}", symbol);
            let store = self.store.clone();
            let timeframe = self.timeframe;
            let history = retry_with_backoff(&task_name, &self.seed_retry, |_| {
                let store = store.clone();
                async move { store.fetch_recent_candles(symbol, timeframe, SEED_CANDLES).await }
            })
            .await;

            match history {
                Ok(history) => {
                    if let Some(newest) = history.iter().map(|c| c.timestamp).max() {
                        dispatched_through.insert(symbol.clone(), newest);
                    }
                    let seeded = builders.seed(symbol, self.timeframe, &history);
                    debug!("Seeded {} builder with {} stored candles", symbol, seeded);
                }
                Err(e) => warn!("Seeding {} failed, starting without history: {}", symbol, e),
            }
        }
        (builders, dispatched_through)
    }

    /// Stops the running session. Safe to call when nothing is running.
    pub async fn stop(&self) -> Option<PositionSummary> {
        let session = {
            let mut slot = self.slot.lock().await;
            match std::mem::replace(&mut *slot, SessionSlot::Vacant) {
                SessionSlot::Active(session) => session,
                other => {
                    *slot = other;
                    return None;
                }
            }
        };
        info!("Stopping session {}", session.session_id);

        // Feed first; the pipeline drains once the tick sender is dropped
        let _ = session.shutdown.send(true);
        if let Err(e) = session.feed_task.await {
            error!("Feed task ended abnormally: {}", e);
        }
        if let Err(e) = session.pipeline_task.await {
            error!("Pipeline task ended abnormally: {}", e);
        }

        let summary = session.ledger.summary();
        info!(
            "Session {} final positions: {} open, unrealized P&L {:.2}, by symbol {:?}",
            session.session_id,
            summary.open_positions_count,
            summary.total_unrealized_pnl,
            summary.positions_by_symbol
        );
        session.runner.clear();

        let failed = matches!(
            &*self.health.borrow(),
            PipelineHealth::FeedFailed { session_id, .. } if session_id == &session.session_id
        );
        if !failed {
            if let Err(e) = self
                .store
                .update_session_status(&session.session_id, SessionStatus::Stopped)
                .await
            {
                error!("Failed to mark session {} stopped: {}", session.session_id, e);
            }
            self.health.send_replace(PipelineHealth::Stopped {
                session_id: session.session_id.clone(),
            });
        }

        info!("Session {} stopped", session.session_id);
        Some(summary)
    }
}

/// State owned by the pipeline task.
struct Pipeline {
    timeframe: Timeframe,
    symbols: HashSet<String>,
    store: Arc<dyn SimulationStore>,
    runner: Arc<StrategyRunner>,
    ledger: Arc<PositionLedger>,
    events: mpsc::Sender<SimulationEvent>,
    builders: MultiCandleBuilder,
    /// Newest bar per symbol already known to strategies through their history
    dispatched_through: HashMap<String, DateTime<Utc>>,
}

impl Pipeline {
    async fn run(mut self, mut ticks: mpsc::Receiver<Tick>) {
        while let Some(tick) = ticks.recv().await {
            self.on_tick(tick).await;
        }
        debug!("Pipeline drained");
    }

    fn emit(&self, event: SimulationEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?} event", event.kind());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("No event consumer, dropping event"),
        }
    }

    async fn on_tick(&mut self, tick: Tick) {
        if !self.symbols.contains(&tick.symbol) {
            debug!("Ignoring tick for unconfigured symbol {}", tick.symbol);
            return;
        }
        if let Some(candle) = self.builders.add_trade(self.timeframe, &tick) {
            self.on_candle(candle).await;
        }
    }

    async fn on_candle(&mut self, candle: Candle) {
        if let Err(e) = self.store.upsert_candle(&candle).await {
            error!("Failed to persist candle {} {}: {}", candle.symbol, candle.timestamp, e);
        }

        if let Some(through) = self.dispatched_through.get(&candle.symbol) {
            if candle.timestamp <= *through {
                debug!("Candle {} {} already in strategy history", candle.symbol, candle.timestamp);
                return;
            }
        }

        for position in self.ledger.mark_to_market(&candle).await {
            self.emit(SimulationEvent::PositionUpdated(position));
        }

        for signal in self.runner.process_candle(&candle).await {
            self.emit(SimulationEvent::SignalCreated(signal.clone()));

            let outcome = self
                .ledger
                .on_signal(&signal.signal, &signal.symbol, &signal.strategy, signal.signal.price)
                .await;
            match outcome {
                SignalOutcome::Opened(position) => self.emit(SimulationEvent::PositionOpened(position)),
                SignalOutcome::Closed(closed) => {
                    self.emit(SimulationEvent::PositionClosed {
                        position: closed.position,
                        trade: closed.trade,
                    });
                    self.publish_snapshot().await;
                }
                SignalOutcome::Ignored => {}
            }
        }
    }

    async fn publish_snapshot(&self) {
        let snapshot = PerformanceSnapshot::from_trades(&self.ledger.all_closed_trades(), Utc::now());
        info!(
            "Performance: {} trades, pnl {:.4} ({:.2}%), win rate {:.2}, max drawdown {:.2}",
            snapshot.total_trades, snapshot.total_pnl, snapshot.total_pnl_pct, snapshot.win_rate, snapshot.max_drawdown
        );
        if let Err(e) = self
            .store
            .insert_performance_snapshot(self.ledger.session_id(), &snapshot)
            .await
        {
            error!("Failed to persist performance snapshot: {}", e);
        }
        self.emit(SimulationEvent::PerformanceSnapshot(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::channel_tick_feed::ChannelTickFeed;
    use crate::persistence::InMemoryStore;

    fn config() -> SimulationConfig {
        SimulationConfig {
            symbols: vec!["BTC".to_string()],
            ..SimulationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_stop_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let (events, _rx) = mpsc::channel(64);
        let orchestrator = Orchestrator::new(&config(), StrategyFactory::with_builtin(), store.clone(), events);
        let symbols = vec!["BTC".to_string()];
        let strategies = StrategySpec::from_ids(&["ema_crossover".to_string()]);

        let (_feed_tx, feed) = ChannelTickFeed::new("test");
        let session_id = orchestrator
            .start(&symbols, &strategies, Box::new(feed))
            .await
            .unwrap();
        assert!(orchestrator.is_running().await);
        assert_eq!(orchestrator.bindings().await.len(), 1);

        let (_tx2, second) = ChannelTickFeed::new("second");
        assert!(matches!(
            orchestrator.start(&symbols, &strategies, Box::new(second)).await,
            Err(SimulationError::AlreadyRunning(_))
        ));

        assert!(orchestrator.stop().await.is_some());
        assert!(orchestrator.stop().await.is_none());
        assert_eq!(store.session_status(&session_id), Some(SessionStatus::Stopped));
        assert_eq!(
            *orchestrator.health().borrow(),
            PipelineHealth::Stopped { session_id }
        );
    }

    #[tokio::test]
    async fn test_slow_start_does_not_block_readers() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fetch_delay(Duration::from_millis(300));
        let (events, _rx) = mpsc::channel(64);
        let orchestrator = Arc::new(Orchestrator::new(&config(), StrategyFactory::with_builtin(), store, events));
        let strategies = StrategySpec::from_ids(&["ema_crossover".to_string()]);

        let starting = {
            let orchestrator = orchestrator.clone();
            let strategies = strategies.clone();
            tokio::spawn(async move {
                let (_feed_tx, feed) = ChannelTickFeed::new("slow");
                orchestrator.start(&["BTC".to_string()], &strategies, Box::new(feed)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // History is still loading
        let running = tokio::time::timeout(Duration::from_millis(100), orchestrator.is_running()).await;
        assert_eq!(running.ok(), Some(false));
        let (_tx, second) = ChannelTickFeed::new("second");
        assert!(matches!(
            orchestrator.start(&["BTC".to_string()], &strategies, Box::new(second)).await,
            Err(SimulationError::AlreadyStarting)
        ));

        let session_id = starting.await.unwrap().unwrap();
        assert_eq!(orchestrator.session_id().await, Some(session_id));
        assert!(orchestrator.stop().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_start_releases_the_slot() {
        let store = Arc::new(InMemoryStore::new());
        let (events, _rx) = mpsc::channel(64);
        let orchestrator = Orchestrator::new(&config(), StrategyFactory::with_builtin(), store, events);

        let (_tx, feed) = ChannelTickFeed::new("bad");
        assert!(orchestrator
            .start(&["BTC".to_string()], &StrategySpec::from_ids(&["martingale".to_string()]), Box::new(feed))
            .await
            .is_err());

        let (_tx, feed) = ChannelTickFeed::new("good");
        assert!(orchestrator
            .start(&["BTC".to_string()], &StrategySpec::from_ids(&["ema_crossover".to_string()]), Box::new(feed))
            .await
            .is_ok());
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_strategy_fails_start() {
        let store = Arc::new(InMemoryStore::new());
        let (events, _rx) = mpsc::channel(64);
        let orchestrator = Orchestrator::new(&config(), StrategyFactory::with_builtin(), store, events);
        let (_tx, feed) = ChannelTickFeed::new("test");

        let result = orchestrator
            .start(
                &["BTC".to_string()],
                &StrategySpec::from_ids(&["martingale".to_string()]),
                Box::new(feed),
            )
            .await;
        assert!(matches!(
            result,
            Err(SimulationError::Strategy(StrategyError::UnknownStrategy { .. }))
        ));
        assert!(!orchestrator.is_running().await);
    }
}
