use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::domain::entities::candle::Tick;
use crate::domain::errors::FeedError;

/// Source of trade prints.
///
/// `run` owns the connection for its whole lifetime, including reconnects.
/// It returns `Ok(())` when `shutdown` flips to `true` or the upstream ends cleanly,
/// and an error when the feed can no longer deliver ticks.
#[async_trait]
pub trait TickFeed: Send {
    fn name(&self) -> &str;

    async fn run(
        &mut self,
        ticks: mpsc::Sender<Tick>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), FeedError>;
}
