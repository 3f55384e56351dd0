//! Trade-print feed over an Upbit-style public websocket.
//!
//! After connecting, the feed sends `[{"ticket": ..}, {"type": "trade", "codes": [..]}]`
//! and receives one JSON trade object per frame (text or binary).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::domain::entities::candle::Tick;
use crate::domain::errors::FeedError;
use crate::domain::repositories::tick_feed::TickFeed;
use crate::task_runner::RetryPolicy;

#[derive(Debug, Deserialize)]
struct TradeFrame {
    #[serde(alias = "cd")]
    code: String,
    #[serde(alias = "tp")]
    trade_price: f64,
    #[serde(alias = "tv")]
    trade_volume: f64,
    /// Milliseconds since epoch
    #[serde(alias = "ttms")]
    trade_timestamp: i64,
}

/// Parses one trade frame. Frames of other types (status, errors) yield `None`.
pub fn parse_trade(payload: &[u8]) -> Option<Tick> {
    let frame: TradeFrame = serde_json::from_slice(payload).ok()?;
    if frame.trade_price <= 0.0 {
        return None;
    }
    let timestamp: DateTime<Utc> = Utc.timestamp_millis_opt(frame.trade_timestamp).single()?;
    let tick = Tick::new(frame.code, frame.trade_price, frame.trade_volume, timestamp);
    tick.validate().ok()?;
    Some(tick)
}

fn subscription_frame(symbols: &[String]) -> String {
    json!([
        {"ticket": Uuid::new_v4().to_string()},
        {"type": "trade", "codes": symbols},
    ])
    .to_string()
}

enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

pub struct WebSocketTickFeed {
    config: FeedConfig,
    symbols: Vec<String>,
}

impl WebSocketTickFeed {
    pub fn new(config: FeedConfig, symbols: Vec<String>) -> Self {
        Self { config, symbols }
    }

    fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.config.reconnect_delay, self.config.max_reconnect_attempts)
    }

    /// One connection lifetime. Errors before the stream opens are connection failures.
    async fn session(
        &self,
        url: &Url,
        ticks: &mpsc::Sender<Tick>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, FeedError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        write
            .send(Message::Text(subscription_frame(&self.symbols)))
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        info!("Connected to {} for {:?}", url, self.symbols);

        loop {
            tokio::select! {
                frame = read.next() => {
                    let payload = match frame {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(SessionEnd::Disconnected("closed by server".to_string()));
                        }
                        Some(Err(e)) => return Ok(SessionEnd::Disconnected(e.to_string())),
                    };

                    match parse_trade(&payload) {
                        Some(tick) => ticks.send(tick).await?,
                        None => debug!("Ignoring non-trade frame ({} bytes)", payload.len()),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TickFeed for WebSocketTickFeed {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn run(&mut self, ticks: mpsc::Sender<Tick>, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        let url = Url::parse(&self.config.url).map_err(|e| FeedError::ConnectionFailed(format!("Invalid URL: {}", e)))?;
        let policy = self.reconnect_policy();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let reason = match self.session(&url, &ticks, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Err(FeedError::ChannelClosed) => return Err(FeedError::ChannelClosed),
                Ok(SessionEnd::Disconnected(reason)) => {
                    // The connection was up, so the budget starts over
                    failures = 0;
                    reason
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            if failures >= policy.max_attempts {
                error!("Feed gave up after {} reconnect attempts: {}", failures, reason);
                return Err(FeedError::ReconnectionLimitExceeded { attempts: failures });
            }

            let delay = policy.delay_after(failures);
            warn!(
                "Feed disconnected ({}), reconnect attempt {}/{} in {:?}",
                reason, failures, policy.max_attempts, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
