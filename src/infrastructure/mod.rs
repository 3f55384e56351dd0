//! Tick feed adapters.

pub mod channel_tick_feed;
pub mod websocket_tick_feed;

pub use channel_tick_feed::ChannelTickFeed;
pub use websocket_tick_feed::WebSocketTickFeed;
