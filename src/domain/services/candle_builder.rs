use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::domain::entities::candle::{Candle, Tick, Timeframe};
use crate::domain::errors::ConfigError;

const DEFAULT_MAX_COMPLETED: usize = 500;

/// Aggregates ticks for one (symbol, timeframe) stream into OHLCV bars.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    symbol: String,
    timeframe: Timeframe,
    current: Option<Candle>,
    /// Recently finalized candles, oldest first
    completed: VecDeque<Candle>,
    max_completed: usize,
}

impl CandleBuilder {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            current: None,
            completed: VecDeque::new(),
            max_completed: DEFAULT_MAX_COMPLETED,
        }
    }

    /// Parses the timeframe up front so a bad value fails at construction.
    pub fn from_timeframe_str(symbol: impl Into<String>, timeframe: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(symbol, timeframe.parse()?))
    }

    pub fn with_max_completed(mut self, max_completed: usize) -> Self {
        self.max_completed = max_completed.max(1);
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Feeds one trade print. Returns the finalized candle when the tick opens a new bucket.
    pub fn add_trade(&mut self, tick: &Tick) -> Option<Candle> {
        if let Err(e) = tick.validate() {
            warn!("Invalid tick for {} at {} dropped: {}", self.symbol, tick.timestamp, e);
            return None;
        }
        let bucket = self.timeframe.bucket_start(tick.timestamp);

        match self.current.as_mut() {
            Some(candle) if candle.timestamp == bucket => {
                candle.apply(tick.price, tick.volume);
                None
            }
            Some(candle) if bucket < candle.timestamp => {
                warn!(
                    "Late tick for {} {} at {} dropped (current bucket {})",
                    self.symbol, self.timeframe, tick.timestamp, candle.timestamp
                );
                None
            }
            _ => {
                let opened = Candle::open_with(
                    &self.symbol,
                    self.timeframe,
                    bucket,
                    tick.price,
                    tick.volume,
                );
                let finished = self.current.replace(opened);
                if let Some(candle) = &finished {
                    self.push_completed(candle.clone());
                }
                finished
            }
        }
    }

    fn push_completed(&mut self, candle: Candle) {
        debug!(
            "Finalized {} {} candle at {}: o={} h={} l={} c={} v={}",
            candle.symbol,
            candle.timeframe,
            candle.timestamp,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume
        );
        self.completed.push_back(candle);
        while self.completed.len() > self.max_completed {
            self.completed.pop_front();
        }
    }

    /// Rebuilds state from stored bars: all but the newest become completed history,
    /// the newest becomes the in-progress candle so later ticks in its bucket extend it.
    pub fn seed(&mut self, history: &[Candle]) -> usize {
        let mut bars: Vec<&Candle> = history
            .iter()
            .filter(|c| c.symbol == self.symbol && c.timeframe == self.timeframe)
            .collect();
        bars.sort_by_key(|c| c.timestamp);
        bars.dedup_by_key(|c| c.timestamp);

        self.current = None;
        self.completed.clear();

        let seeded = bars.len();
        if let Some((last, earlier)) = bars.split_last() {
            for candle in earlier {
                self.completed.push_back((*candle).clone());
            }
            while self.completed.len() > self.max_completed {
                self.completed.pop_front();
            }
            self.current = Some((*last).clone());
        }
        seeded
    }

    pub fn current_candle(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn completed_candles(&self) -> Vec<Candle> {
        self.completed.iter().cloned().collect()
    }

    pub fn clear_completed(&mut self) {
        self.completed.clear();
    }
}

/// Independent builders keyed by (symbol, timeframe), created on first use.
#[derive(Debug, Default)]
pub struct MultiCandleBuilder {
    builders: HashMap<(String, Timeframe), CandleBuilder>,
}

impl MultiCandleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn builder_mut(&mut self, symbol: &str, timeframe: Timeframe) -> &mut CandleBuilder {
        self.builders
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| CandleBuilder::new(symbol, timeframe))
    }

    pub fn add_trade(&mut self, timeframe: Timeframe, tick: &Tick) -> Option<Candle> {
        self.builder_mut(&tick.symbol, timeframe).add_trade(tick)
    }

    pub fn seed(&mut self, symbol: &str, timeframe: Timeframe, history: &[Candle]) -> usize {
        self.builder_mut(symbol, timeframe).seed(history)
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<&CandleBuilder> {
        self.builders.get(&(symbol.to_string(), timeframe))
    }

    pub fn keys(&self) -> Vec<(String, Timeframe)> {
        let mut keys: Vec<_> = self.builders.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn reset(&mut self, symbol: &str, timeframe: Timeframe) -> bool {
        self.builders.remove(&(symbol.to_string(), timeframe)).is_some()
    }
}
