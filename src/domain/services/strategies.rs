use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::domain::entities::candle::Candle;
use crate::domain::entities::signal::Signal;
use crate::domain::errors::StrategyError;
use crate::domain::services::indicators::{Ema, RollingWindow};

/// Strategy parameters as a JSON object; unknown keys are ignored.
pub type StrategyParams = Value;

/// The capability a strategy binding relies on.
pub trait Strategy: Send + Sync {
    fn id(&self) -> &'static str;

    /// Number of closed candles needed before live signals are meaningful.
    fn min_history_window(&self) -> usize;

    /// Primes internal state from candles ordered oldest first.
    fn initialize_with_history(
        &mut self,
        history: &[Candle],
        params: &StrategyParams,
    ) -> Result<(), StrategyError>;

    fn process_candle(&mut self, candle: &Candle) -> Option<Signal>;
}

pub type StrategyConstructor = fn(&StrategyParams) -> Result<Box<dyn Strategy>, StrategyError>;

/// Name-keyed registry of strategy constructors.
#[derive(Clone, Default)]
pub struct StrategyFactory {
    constructors: BTreeMap<String, StrategyConstructor>,
}

impl StrategyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(EmaCrossover::ID, build_ema_crossover);
        factory.register(VolumeBreakout::ID, build_volume_breakout);
        factory
    }

    pub fn register(&mut self, id: impl Into<String>, constructor: StrategyConstructor) {
        self.constructors.insert(id.into(), constructor);
    }

    pub fn supported(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn create(&self, id: &str, params: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
        let constructor = self
            .constructors
            .get(id)
            .ok_or_else(|| StrategyError::UnknownStrategy {
                name: id.to_string(),
                supported: self.supported(),
            })?;
        constructor(params)
    }
}

fn build_ema_crossover(params: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(EmaCrossover::from_params(params)?))
}

fn build_volume_breakout(params: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(VolumeBreakout::from_params(params)?))
}

fn param_usize(params: &StrategyParams, key: &str, default: usize) -> Result<usize, StrategyError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .ok_or_else(|| {
                StrategyError::Initialization(format!("{} must be a positive integer, got {}", key, value))
            }),
    }
}

fn param_f64(params: &StrategyParams, key: &str, default: f64) -> Result<f64, StrategyError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_f64()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| {
                StrategyError::Initialization(format!("{} must be a positive number, got {}", key, value))
            }),
    }
}

/// BUY when the fast EMA crosses above the slow EMA, SELL on the opposite cross.
pub struct EmaCrossover {
    fast: Ema,
    slow: Ema,
    last_spread: Option<f64>,
}

impl EmaCrossover {
    pub const ID: &'static str = "ema_crossover";

    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self, StrategyError> {
        if fast_period >= slow_period {
            return Err(StrategyError::Initialization(format!(
                "fast_period ({}) must be shorter than slow_period ({})",
                fast_period, slow_period
            )));
        }
        Ok(Self {
            fast: Ema::new(fast_period),
            slow: Ema::new(slow_period),
            last_spread: None,
        })
    }

    pub fn from_params(params: &StrategyParams) -> Result<Self, StrategyError> {
        Self::new(
            param_usize(params, "fast_period", 9)?,
            param_usize(params, "slow_period", 21)?,
        )
    }

    /// Returns (previous spread, current spread, slow EMA) once both averages are warm.
    fn observe(&mut self, candle: &Candle) -> Option<(f64, f64, f64)> {
        let fast = self.fast.update(candle.close);
        let slow = self.slow.update(candle.close);
        let (fast, slow) = fast.zip(slow)?;
        let spread = fast - slow;
        let previous = self.last_spread.replace(spread)?;
        Some((previous, spread, slow))
    }
}

impl Strategy for EmaCrossover {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn min_history_window(&self) -> usize {
        self.slow.period() + 1
    }

    fn initialize_with_history(
        &mut self,
        history: &[Candle],
        params: &StrategyParams,
    ) -> Result<(), StrategyError> {
        *self = Self::from_params(params)?;
        for candle in history {
            self.observe(candle);
        }
        debug!("{} primed with {} candles", Self::ID, history.len());
        Ok(())
    }

    fn process_candle(&mut self, candle: &Candle) -> Option<Signal> {
        let (previous, current, slow) = self.observe(candle)?;
        let confidence = if slow > 0.0 {
            (0.5 + (current.abs() / slow) * 50.0).min(1.0)
        } else {
            0.5
        };

        if previous <= 0.0 && current > 0.0 {
            Signal::buy(candle.timestamp, candle.close, confidence).ok()
        } else if previous >= 0.0 && current < 0.0 {
            Signal::sell(candle.timestamp, candle.close, confidence).ok()
        } else {
            None
        }
    }
}

/// BUY on a close above the lookback high with elevated volume, SELL on a close below the lookback low.
pub struct VolumeBreakout {
    lookback: usize,
    volume_multiplier: f64,
    highs: RollingWindow,
    lows: RollingWindow,
    volumes: RollingWindow,
}

impl VolumeBreakout {
    pub const ID: &'static str = "volume_breakout";

    pub fn new(lookback: usize, volume_multiplier: f64) -> Self {
        Self {
            lookback,
            volume_multiplier,
            highs: RollingWindow::new(lookback),
            lows: RollingWindow::new(lookback),
            volumes: RollingWindow::new(lookback),
        }
    }

    pub fn from_params(params: &StrategyParams) -> Result<Self, StrategyError> {
        Ok(Self::new(
            param_usize(params, "lookback", 20)?,
            param_f64(params, "volume_multiplier", 1.5)?,
        ))
    }

    fn remember(&mut self, candle: &Candle) {
        self.highs.push(candle.high);
        self.lows.push(candle.low);
        self.volumes.push(candle.volume);
    }

    fn evaluate(&self, candle: &Candle) -> Option<Signal> {
        if !self.highs.is_full() {
            return None;
        }
        let highest = self.highs.max()?;
        let lowest = self.lows.min()?;
        let avg_volume = self.volumes.mean()?;
        let volume_floor = avg_volume * self.volume_multiplier;

        if candle.close > highest && candle.volume > volume_floor {
            let ratio = if volume_floor > 0.0 { candle.volume / volume_floor } else { 2.0 };
            Signal::buy(candle.timestamp, candle.close, (ratio / 2.0).clamp(0.5, 1.0)).ok()
        } else if candle.close < lowest {
            let depth = if lowest > 0.0 { (lowest - candle.close) / lowest } else { 0.0 };
            Signal::sell(candle.timestamp, candle.close, (0.5 + depth * 10.0).min(1.0)).ok()
        } else {
            None
        }
    }
}

impl Strategy for VolumeBreakout {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn min_history_window(&self) -> usize {
        self.lookback
    }

    fn initialize_with_history(
        &mut self,
        history: &[Candle],
        params: &StrategyParams,
    ) -> Result<(), StrategyError> {
        *self = Self::from_params(params)?;
        for candle in history {
            self.remember(candle);
        }
        Ok(())
    }

    fn process_candle(&mut self, candle: &Candle) -> Option<Signal> {
        let signal = self.evaluate(candle);
        self.remember(candle);
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::candle::Timeframe;
    use crate::domain::entities::signal::SignalSide;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn candle(i: i64, close: f64, volume: f64) -> Candle {
        Candle::new(
            "BTC",
            Timeframe::OneMinute,
            Utc.timestamp_opt(i * 60, 0).unwrap(),
            close,
            close,
            close,
            close,
            volume,
        )
        .unwrap()
    }

    #[test]
    fn test_factory_rejects_unknown_id() {
        let factory = StrategyFactory::with_builtin();
        match factory.create("martingale", &json!({})) {
            Err(StrategyError::UnknownStrategy { supported, .. }) => {
                assert_eq!(supported, vec!["ema_crossover", "volume_breakout"]);
            }
            _ => panic!("expected UnknownStrategy"),
        }
    }

    #[test]
    fn test_factory_applies_params() {
        let factory = StrategyFactory::with_builtin();
        let strategy = factory
            .create("ema_crossover", &json!({"fast_period": 2, "slow_period": 4}))
            .unwrap();
        assert_eq!(strategy.min_history_window(), 5);
        assert!(factory
            .create("ema_crossover", &json!({"fast_period": 5, "slow_period": 3}))
            .is_err());
        assert!(factory.create("volume_breakout", &json!({"lookback": "x"})).is_err());
    }

    #[test]
    fn test_ema_crossover_signals_on_cross() {
        let params = json!({"fast_period": 2, "slow_period": 3});
        let mut strategy = EmaCrossover::from_params(&params).unwrap();
        let history: Vec<Candle> = (0..5).map(|i| candle(i, 100.0 - i as f64, 1.0)).collect();
        strategy.initialize_with_history(&history, &params).unwrap();

        let mut signals = Vec::new();
        for (i, close) in [(5, 110.0), (6, 120.0), (7, 80.0), (8, 60.0)] {
            if let Some(signal) = strategy.process_candle(&candle(i, close, 1.0)) {
                signals.push(signal.side);
            }
        }
        assert_eq!(signals, vec![SignalSide::Buy, SignalSide::Sell]);
    }

    #[test]
    fn test_volume_breakout_requires_volume() {
        let params = json!({"lookback": 3, "volume_multiplier": 2.0});
        let mut strategy = VolumeBreakout::from_params(&params).unwrap();
        let history: Vec<Candle> = (0..3).map(|i| candle(i, 100.0, 1.0)).collect();
        strategy.initialize_with_history(&history, &params).unwrap();

        assert!(strategy.process_candle(&candle(3, 105.0, 1.0)).is_none());
        let buy = strategy.process_candle(&candle(4, 110.0, 10.0)).unwrap();
        assert_eq!(buy.side, SignalSide::Buy);
        assert!(buy.confidence >= 0.5 && buy.confidence <= 1.0);

        let sell = strategy.process_candle(&candle(5, 90.0, 1.0)).unwrap();
        assert_eq!(sell.side, SignalSide::Sell);
    }
}
