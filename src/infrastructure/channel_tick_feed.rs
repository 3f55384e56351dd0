use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::domain::entities::candle::Tick;
use crate::domain::errors::FeedError;
use crate::domain::repositories::tick_feed::TickFeed;

/// Relays ticks pushed into an in-process channel. Ends when every sender is dropped.
pub struct ChannelTickFeed {
    name: String,
    source: mpsc::Receiver<Tick>,
}

impl ChannelTickFeed {
    pub fn new(name: impl Into<String>) -> (mpsc::Sender<Tick>, Self) {
        let (tx, rx) = mpsc::channel(1024);
        (
            tx,
            Self {
                name: name.into(),
                source: rx,
            },
        )
    }
}

#[async_trait]
impl TickFeed for ChannelTickFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, ticks: mpsc::Sender<Tick>, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        loop {
            tokio::select! {
                tick = self.source.recv() => match tick {
                    Some(tick) => ticks.send(tick).await?,
                    None => {
                        debug!("Feed '{}' source closed", self.name);
                        return Ok(());
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
