use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::hub::BroadcastHub;
use super::messages::{ControlMessage, ErrorCode};
use crate::auth::AuthenticatedUser;

/// `GET /ws`
pub async fn websocket_handler(ws: WebSocketUpgrade, State(hub): State<Arc<BroadcastHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

enum AuthOutcome {
    Accepted(AuthenticatedUser),
    Rejected(ControlMessage),
    Disconnected,
}

/// Waits for the first text frame until the deadline; control frames do not count.
async fn await_auth(receiver: &mut SplitStream<WebSocket>, hub: &BroadcastHub) -> AuthOutcome {
    let deadline = Instant::now() + hub.config().auth_timeout;
    loop {
        let frame = match timeout_at(deadline, receiver.next()).await {
            Err(_) => {
                warn!("Client did not authenticate within {:?}", hub.config().auth_timeout);
                return AuthOutcome::Rejected(ControlMessage::error(
                    ErrorCode::AuthTimeout,
                    "Authentication timeout",
                ));
            }
            Ok(None) | Ok(Some(Err(_))) => return AuthOutcome::Disconnected,
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                return match hub.authenticate(&text) {
                    Ok(user) => AuthOutcome::Accepted(user),
                    Err(message) => AuthOutcome::Rejected(message),
                };
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return AuthOutcome::Disconnected,
            Message::Binary(_) => {
                return AuthOutcome::Rejected(ControlMessage::error(ErrorCode::AuthFailed, "Authentication failed"))
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sender, mut receiver) = socket.split();

    let user = match await_auth(&mut receiver, &hub).await {
        AuthOutcome::Accepted(user) => user,
        AuthOutcome::Rejected(message) => {
            if let Ok(text) = serde_json::to_string(&message) {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        AuthOutcome::Disconnected => {
            debug!("Connection closed before authentication");
            return;
        }
    };

    let (client, mut outbound) = hub.register(user).await;
    let client_id = client.client_id.clone();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let receive_hub = hub.clone();
    let receive_client = client.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            let keep_open = match result {
                Ok(Message::Text(text)) => receive_hub.handle_client_text(&receive_client, &text).await,
                Ok(Message::Binary(_)) => {
                    warn!("Binary frames not supported");
                    true
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => true,
                Ok(Message::Close(_)) => false,
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    false
                }
            };
            if !keep_open {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task ended for client: {}", client_id);
            receive_task.abort();
        }
        _ = &mut receive_task => {
            debug!("Receive task ended for client: {}", client_id);
            send_task.abort();
        }
        _ = client.kicked() => {
            debug!("Client {} dropped by hub", client_id);
            receive_task.abort();
            send_task.abort();
        }
    }

    hub.unregister(&client_id).await;
    info!("WebSocket disconnected: {}", client_id);
}
