pub mod history;
pub mod hub;
pub mod messages;
pub mod websocket_handler;

pub use history::{EventHistory, Replay};
pub use hub::{BroadcastHub, ClientHandle};
pub use messages::{ClientMessage, ControlMessage, ErrorCode, Event, EventId, EventKind, HeartbeatData, ServerMessage};
pub use websocket_handler::websocket_handler;
