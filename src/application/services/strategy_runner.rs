use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::position::PositionKey;
use crate::domain::entities::signal::StrategySignal;
use crate::domain::errors::StrategyError;
use crate::domain::repositories::simulation_store::SimulationStore;
use crate::domain::services::strategies::{Strategy, StrategyFactory, StrategyParams};
use crate::task_runner::{retry_with_backoff, RetryPolicy};

struct Binding {
    strategy: Box<dyn Strategy>,
    params: StrategyParams,
    initialized: bool,
    history_loaded: usize,
    signals_emitted: u64,
    last_candle_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingStatus {
    pub symbol: String,
    pub strategy: String,
    pub initialized: bool,
    pub history_loaded: usize,
    pub signals_emitted: u64,
    pub last_candle_at: Option<DateTime<Utc>>,
}

/// Feeds completed candles of one timeframe to every (symbol, strategy) binding.
pub struct StrategyRunner {
    session_id: String,
    timeframe: Timeframe,
    factory: StrategyFactory,
    store: Arc<dyn SimulationStore>,
    history_retry: RetryPolicy,
    bindings: Mutex<BTreeMap<PositionKey, Binding>>,
}

impl StrategyRunner {
    pub fn new(
        session_id: impl Into<String>,
        timeframe: Timeframe,
        factory: StrategyFactory,
        store: Arc<dyn SimulationStore>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            timeframe,
            factory,
            store,
            history_retry: RetryPolicy::exponential(Duration::from_millis(200), Duration::from_secs(2), 3),
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_history_retry(mut self, policy: RetryPolicy) -> Self {
        self.history_retry = policy;
        self
    }

    fn guard(&self) -> MutexGuard<'_, BTreeMap<PositionKey, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn register(&self, symbol: &str, strategy_id: &str, params: StrategyParams) -> Result<(), StrategyError> {
        let key = PositionKey::new(symbol, strategy_id);
        let mut bindings = self.guard();
        if bindings.contains_key(&key) {
            return Err(StrategyError::AlreadyRegistered(key.to_string()));
        }
        let strategy = self.factory.create(strategy_id, &params)?;
        info!(
            "Registered strategy {} for {} (min history: {})",
            strategy_id,
            symbol,
            strategy.min_history_window()
        );
        bindings.insert(
            key,
            Binding {
                strategy,
                params,
                initialized: false,
                history_loaded: 0,
                signals_emitted: 0,
                last_candle_at: None,
            },
        );
        Ok(())
    }

    /// Loads the strategy's history window from the store and primes it.
    /// Returns the number of candles used.
    pub async fn initialize(&self, symbol: &str, strategy_id: &str) -> Result<usize, StrategyError> {
        let key = PositionKey::new(symbol, strategy_id);
        let window = {
            let bindings = self.guard();
            let binding = bindings
                .get(&key)
                .ok_or_else(|| StrategyError::NotRegistered(key.to_string()))?;
            binding.strategy.min_history_window().max(1)
        };

        let task_name = format!("load history {}", key);
        let store = self.store.clone();
        let timeframe = self.timeframe;
        let mut history = retry_with_backoff(&task_name, &self.history_retry, |_| {
            let store = store.clone();
            async move { store.fetch_recent_candles(symbol, timeframe, window).await }
        })
        .await?;

        // Storage returns newest first
        history.reverse();
        self.prime(symbol, strategy_id, &history)
    }

    /// Primes the binding with candles ordered oldest first and marks it initialized.
    /// An empty history runs the strategy cold.
    pub fn prime(&self, symbol: &str, strategy_id: &str, history: &[Candle]) -> Result<usize, StrategyError> {
        let key = PositionKey::new(symbol, strategy_id);
        let mut bindings = self.guard();
        let binding = bindings
            .get_mut(&key)
            .ok_or_else(|| StrategyError::NotRegistered(key.to_string()))?;

        binding
            .strategy
            .initialize_with_history(history, &binding.params)?;
        binding.initialized = true;
        binding.history_loaded = history.len();

        if history.is_empty() {
            warn!("No history for {}, strategy starts cold", key);
        } else {
            info!("Initialized {} with {} historical candles", key, history.len());
        }
        Ok(history.len())
    }

    /// Runs every initialized binding for the candle's symbol, then persists the
    /// resulting signals. All bindings see the candle before any signal is returned.
    pub async fn process_candle(&self, candle: &Candle) -> Vec<StrategySignal> {
        if candle.timeframe != self.timeframe {
            debug!(
                "Ignoring {} candle for {}, runner uses {}",
                candle.timeframe, candle.symbol, self.timeframe
            );
            return Vec::new();
        }

        let emitted: Vec<StrategySignal> = {
            let mut bindings = self.guard();
            bindings
                .iter_mut()
                .filter(|(key, _)| key.symbol == candle.symbol)
                .filter_map(|(key, binding)| {
                    if !binding.initialized {
                        warn!("Skipping candle for {}: binding not initialized", key);
                        return None;
                    }
                    binding.last_candle_at = Some(candle.timestamp);
                    let signal = binding.strategy.process_candle(candle)?;
                    binding.signals_emitted += 1;
                    Some(StrategySignal {
                        id: None,
                        symbol: key.symbol.clone(),
                        strategy: key.strategy.clone(),
                        signal,
                    })
                })
                .collect()
        };

        let mut persisted = Vec::with_capacity(emitted.len());
        for mut signal in emitted {
            info!(
                "Signal {} {} @ {:.2} from {}:{} (confidence {:.2})",
                signal.signal.side.as_str(),
                signal.symbol,
                signal.signal.price,
                signal.symbol,
                signal.strategy,
                signal.signal.confidence
            );
            match self.store.insert_signal(&self.session_id, &signal).await {
                Ok(id) => signal.id = Some(id),
                Err(e) => error!("Failed to persist signal for {}:{}: {}", signal.symbol, signal.strategy, e),
            }
            persisted.push(signal);
        }
        persisted
    }

    pub fn bindings(&self) -> Vec<BindingStatus> {
        self.guard()
            .iter()
            .map(|(key, binding)| BindingStatus {
                symbol: key.symbol.clone(),
                strategy: key.strategy.clone(),
                initialized: binding.initialized,
                history_loaded: binding.history_loaded,
                signals_emitted: binding.signals_emitted,
                last_candle_at: binding.last_candle_at,
            })
            .collect()
    }

    pub fn clear(&self) {
        let removed = {
            let mut bindings = self.guard();
            let count = bindings.len();
            bindings.clear();
            count
        };
        debug!("Cleared {} strategy bindings", removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::Signal;
    use crate::persistence::InMemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    /// BUY on every up candle.
    struct Rising {
        seen: usize,
    }

    impl Strategy for Rising {
        fn id(&self) -> &'static str {
            "rising"
        }

        fn min_history_window(&self) -> usize {
            3
        }

        fn initialize_with_history(&mut self, history: &[Candle], _: &StrategyParams) -> Result<(), StrategyError> {
            self.seen = history.len();
            Ok(())
        }

        fn process_candle(&mut self, candle: &Candle) -> Option<Signal> {
            self.seen += 1;
            (candle.close > candle.open)
                .then(|| Signal::buy(candle.timestamp, candle.close, 0.7).ok())
                .flatten()
        }
    }

    fn build_rising(_: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
        Ok(Box::new(Rising { seen: 0 }))
    }

    fn factory() -> StrategyFactory {
        let mut factory = StrategyFactory::new();
        factory.register("rising", build_rising);
        factory
    }

    fn candle(symbol: &str, minute: i64, open: f64, close: f64) -> Candle {
        let ts = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Candle::new(symbol, Timeframe::OneMinute, ts, open, open.max(close), open.min(close), close, 1.0).unwrap()
    }

    fn runner(store: Arc<InMemoryStore>) -> StrategyRunner {
        StrategyRunner::new("session", Timeframe::OneMinute, factory(), store)
            .with_history_retry(RetryPolicy::fixed(Duration::from_millis(1), 2))
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_unknown_ids() {
        let runner = runner(Arc::new(InMemoryStore::new()));
        runner.register("BTC", "rising", json!({})).unwrap();
        assert!(matches!(
            runner.register("BTC", "rising", json!({})),
            Err(StrategyError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            runner.register("BTC", "martingale", json!({})),
            Err(StrategyError::UnknownStrategy { .. })
        ));
    }

    #[tokio::test]
    async fn test_uninitialized_binding_skips_candles() {
        let store = Arc::new(InMemoryStore::new());
        let runner = runner(store.clone());
        runner.register("BTC", "rising", json!({})).unwrap();

        assert!(runner.process_candle(&candle("BTC", 1, 100.0, 101.0)).await.is_empty());
        assert!(store.signals().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_loads_window_oldest_first() {
        let store = Arc::new(InMemoryStore::new());
        for minute in 0..5 {
            store.upsert_candle(&candle("BTC", minute, 1.0, 1.0)).await.unwrap();
        }
        let runner = runner(store);
        runner.register("BTC", "rising", json!({})).unwrap();

        assert_eq!(runner.initialize("BTC", "rising").await.unwrap(), 3);
        let status = &runner.bindings()[0];
        assert!(status.initialized);
        assert_eq!(status.history_loaded, 3);
    }

    #[tokio::test]
    async fn test_initialize_without_history_runs_cold() {
        let runner = runner(Arc::new(InMemoryStore::new()));
        runner.register("BTC", "rising", json!({})).unwrap();
        assert_eq!(runner.initialize("BTC", "rising").await.unwrap(), 0);
        assert!(runner.bindings()[0].initialized);
    }

    #[tokio::test]
    async fn test_initialize_surfaces_storage_failure() {
        let store = Arc::new(InMemoryStore::new());
        store.set_failing(true);
        let runner = runner(store);
        runner.register("BTC", "rising", json!({})).unwrap();
        assert!(matches!(
            runner.initialize("BTC", "rising").await,
            Err(StrategyError::Storage(_))
        ));
        assert!(!runner.bindings()[0].initialized);
        assert_eq!(runner.prime("BTC", "rising", &[]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_signals_are_persisted_with_ids() {
        let store = Arc::new(InMemoryStore::new());
        let runner = runner(store.clone());
        runner.register("BTC", "rising", json!({})).unwrap();
        runner.register("ETH", "rising", json!({})).unwrap();
        runner.prime("BTC", "rising", &[]).unwrap();
        runner.prime("ETH", "rising", &[]).unwrap();

        let signals = runner.process_candle(&candle("BTC", 1, 100.0, 105.0)).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].symbol, "BTC");
        assert_eq!(signals[0].id, Some(1));
        assert_eq!(store.signals().len(), 1);

        let flat = runner.process_candle(&candle("BTC", 2, 105.0, 104.0)).await;
        assert!(flat.is_empty());
        assert_eq!(runner.bindings()[0].signals_emitted, 1);
    }

    #[tokio::test]
    async fn test_signal_survives_store_failure() {
        let store = Arc::new(InMemoryStore::new());
        let runner = runner(store.clone());
        runner.register("BTC", "rising", json!({})).unwrap();
        runner.prime("BTC", "rising", &[]).unwrap();
        store.set_failing(true);

        let signals = runner.process_candle(&candle("BTC", 1, 100.0, 105.0)).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].id, None);
    }

    #[tokio::test]
    async fn test_other_timeframes_are_ignored() {
        let runner = runner(Arc::new(InMemoryStore::new()));
        runner.register("BTC", "rising", json!({})).unwrap();
        runner.prime("BTC", "rising", &[]).unwrap();

        let ts = Utc.timestamp_opt(0, 0).unwrap();
        let hourly = Candle::new("BTC", Timeframe::OneHour, ts, 1.0, 2.0, 1.0, 2.0, 1.0).unwrap();
        assert!(runner.process_candle(&hourly).await.is_empty());

        runner.clear();
        assert!(runner.bindings().is_empty());
    }
}
