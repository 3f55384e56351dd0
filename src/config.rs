use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::entities::candle::Timeframe;
use crate::domain::errors::ConfigError;

/// Pricing assumptions for virtual fills.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub fee_rate: f64,
    pub slippage_rate: f64,
    /// Fixed unit quantity for every opened position
    pub position_quantity: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001,
            slippage_rate: 0.0002,
            position_quantity: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_global_events: usize,
    pub max_events_per_symbol: usize,
    /// Outbound queue depth per connection; a full queue counts as a failed delivery
    pub client_buffer: usize,
    /// Pipeline to hub queue depth; events beyond it are dropped with a warning
    pub event_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl: Duration::from_secs(24 * 3600),
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_global_events: 10_000,
            max_events_per_symbol: 1_000,
            client_buffer: 256,
            event_buffer: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.upbit.com/websocket/v1".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub host: String,
    pub port: u16,
    /// `memory` selects the in-process store
    pub database_url: String,
    pub timeframe: Timeframe,
    pub symbols: Vec<String>,
    pub strategies: Vec<String>,
    pub ledger: LedgerConfig,
    pub broadcast: BroadcastConfig,
    pub feed: FeedConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_url: "sqlite://papertrade.db".to_string(),
            timeframe: Timeframe::OneMinute,
            symbols: vec!["KRW-BTC".to_string()],
            strategies: vec!["ema_crossover".to_string()],
            ledger: LedgerConfig::default(),
            broadcast: BroadcastConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

/// Parses `key` when present. Values that fail to parse or fall outside `valid`
/// are logged and replaced by `default`.
fn parse_or_default<T, F>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: T, valid: F) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
    F: Fn(&T) -> bool,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            tracing::warn!("Invalid {} value: {}, using default: {}", key, value, default);
            default
        }
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default: {}", key, raw, e, default);
            default
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl SimulationConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<SimulationConfig, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<SimulationConfig, ConfigError> {
        let mut config = SimulationConfig::default();

        if let Some(host) = lookup("PAPERTRADE_HOST") {
            config.host = host;
        }
        config.port = parse_or_default(lookup, "PAPERTRADE_PORT", config.port, |p| *p > 0);
        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(timeframe) = lookup("TIMEFRAME") {
            config.timeframe = timeframe.parse()?;
        }
        if let Some(symbols) = lookup("SYMBOLS") {
            let symbols = parse_list(&symbols);
            if symbols.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "SYMBOLS".to_string(),
                    value: "(empty)".to_string(),
                });
            }
            config.symbols = symbols;
        }
        if let Some(strategies) = lookup("STRATEGIES") {
            config.strategies = parse_list(&strategies);
        }

        let ledger = &mut config.ledger;
        ledger.fee_rate = parse_or_default(lookup, "FEE_RATE", ledger.fee_rate, |v| (0.0..1.0).contains(v));
        ledger.slippage_rate =
            parse_or_default(lookup, "SLIPPAGE_RATE", ledger.slippage_rate, |v| (0.0..1.0).contains(v));
        ledger.position_quantity =
            parse_or_default(lookup, "POSITION_QUANTITY", ledger.position_quantity, |v| *v > 0.0);

        let broadcast = &mut config.broadcast;
        if let Some(secret) = lookup("JWT_SECRET") {
            broadcast.jwt_secret = secret;
        }
        let hours = parse_or_default(lookup, "TOKEN_EXPIRY_HOURS", 24u64, |h| *h > 0);
        broadcast.token_ttl = Duration::from_secs(hours * 3600);
        let auth = parse_or_default(lookup, "AUTH_TIMEOUT_SECS", 10u64, |s| *s > 0);
        broadcast.auth_timeout = Duration::from_secs(auth);
        let heartbeat = parse_or_default(lookup, "HEARTBEAT_INTERVAL_SECS", 30u64, |s| *s > 0);
        broadcast.heartbeat_interval = Duration::from_secs(heartbeat);
        broadcast.max_global_events =
            parse_or_default(lookup, "MAX_GLOBAL_EVENTS", broadcast.max_global_events, |v| *v > 0);
        broadcast.max_events_per_symbol =
            parse_or_default(lookup, "MAX_EVENTS_PER_SYMBOL", broadcast.max_events_per_symbol, |v| *v > 0);
        broadcast.event_buffer = parse_or_default(lookup, "EVENT_BUFFER_SIZE", broadcast.event_buffer, |v| *v > 0);

        let feed = &mut config.feed;
        if let Some(url) = lookup("FEED_URL") {
            feed.url = url;
        }
        let delay = parse_or_default(lookup, "FEED_RECONNECT_DELAY_SECS", 5u64, |_| true);
        feed.reconnect_delay = Duration::from_secs(delay);
        feed.max_reconnect_attempts =
            parse_or_default(lookup, "FEED_MAX_RECONNECT_ATTEMPTS", feed.max_reconnect_attempts, |v| *v > 0);

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SimulationConfig::from_lookup(&lookup_from(&[])).unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.ledger.fee_rate, 0.001);
        assert_eq!(config.ledger.slippage_rate, 0.0002);
        assert_eq!(config.broadcast.auth_timeout, Duration::from_secs(10));
        assert_eq!(config.broadcast.max_global_events, 10_000);
        assert_eq!(config.broadcast.event_buffer, 4096);
        assert_eq!(config.feed.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_overrides_parse() {
        let lookup = lookup_from(&[
            ("SYMBOLS", "KRW-BTC, KRW-ETH ,"),
            ("STRATEGIES", "ema_crossover,volume_breakout"),
            ("TIMEFRAME", "5m"),
            ("FEE_RATE", "0.002"),
            ("HEARTBEAT_INTERVAL_SECS", "15"),
            ("JWT_SECRET", "s3cret"),
        ]);
        let config = SimulationConfig::from_lookup(&lookup).unwrap();
        assert_eq!(config.symbols, vec!["KRW-BTC", "KRW-ETH"]);
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.timeframe, Timeframe::FiveMinutes);
        assert_eq!(config.ledger.fee_rate, 0.002);
        assert_eq!(config.broadcast.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.broadcast.jwt_secret, "s3cret");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let lookup = lookup_from(&[("FEE_RATE", "2.0"), ("POSITION_QUANTITY", "abc"), ("PAPERTRADE_PORT", "0")]);
        let config = SimulationConfig::from_lookup(&lookup).unwrap();
        assert_eq!(config.ledger.fee_rate, 0.001);
        assert_eq!(config.ledger.position_quantity, 0.1);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_unsupported_timeframe_is_error() {
        let result = SimulationConfig::from_lookup(&lookup_from(&[("TIMEFRAME", "3m")]));
        assert_eq!(result.unwrap_err(), ConfigError::UnsupportedTimeframe("3m".to_string()));
    }
}
