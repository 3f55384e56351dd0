use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::EventHistory;
use super::messages::{ClientMessage, ControlMessage, ErrorCode, EventId, EventKind, HeartbeatData};
use crate::application::events::SimulationEvent;
use crate::auth::{verify_token, AuthError, AuthenticatedUser, Permission};
use crate::config::BroadcastConfig;

/// One authenticated connection as seen by the hub.
#[derive(Debug)]
pub struct ClientHandle {
    pub client_id: String,
    pub user: AuthenticatedUser,
    pub connected_at: DateTime<Utc>,
    subscriptions: StdRwLock<HashSet<String>>,
    /// 0 until the first delivery
    last_event_id: AtomicU64,
    outbound: mpsc::Sender<String>,
    kicked: Notify,
}

impl ClientHandle {
    pub fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(symbol)
    }

    pub fn last_event_id(&self) -> Option<EventId> {
        match self.last_event_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(EventId(id)),
        }
    }

    fn advance(&self, id: EventId) {
        self.last_event_id.fetch_max(id.0, Ordering::SeqCst);
    }

    fn sorted_subscriptions(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.subscriptions().into_iter().collect();
        symbols.sort();
        symbols
    }

    /// Non-blocking enqueue; false when the queue is full or the writer is gone.
    fn push(&self, text: String) -> bool {
        self.outbound.try_send(text).is_ok()
    }

    /// Resolves once the hub has dropped this client.
    pub async fn kicked(&self) {
        self.kicked.notified().await
    }
}

/// Fan-out point for simulation events to authenticated streaming clients.
pub struct BroadcastHub {
    config: BroadcastConfig,
    subscribe_permission: Permission,
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
    history: EventHistory,
}

impl BroadcastHub {
    pub fn new(config: BroadcastConfig) -> Self {
        let history = EventHistory::new(config.max_global_events, config.max_events_per_symbol);
        Self {
            config,
            subscribe_permission: Permission::Read,
            clients: RwLock::new(HashMap::new()),
            history,
        }
    }

    /// Overrides the permission that gates subscribe and sync.
    pub fn with_subscribe_permission(mut self, permission: Permission) -> Self {
        self.subscribe_permission = permission;
        self
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn history(&self) -> &EventHistory {
        &self.history
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Validates the first frame of a connection. The error is the message to send before closing.
    pub fn authenticate(&self, text: &str) -> Result<AuthenticatedUser, ControlMessage> {
        let rejected = |reason: String| {
            warn!("Authentication rejected: {}", reason);
            ControlMessage::error(ErrorCode::AuthFailed, "Authentication failed")
        };

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Auth { token }) => {
                verify_token(&token, &self.config.jwt_secret).map_err(|e: AuthError| rejected(e.to_string()))
            }
            Ok(_) => Err(rejected("first message was not auth".to_string())),
            Err(e) => Err(rejected(format!("unreadable auth frame: {}", e))),
        }
    }

    pub async fn register(&self, user: AuthenticatedUser) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.config.client_buffer.max(1));
        let client = Arc::new(ClientHandle {
            client_id: Uuid::new_v4().to_string(),
            user,
            connected_at: Utc::now(),
            subscriptions: StdRwLock::new(HashSet::new()),
            last_event_id: AtomicU64::new(0),
            outbound: tx,
            kicked: Notify::new(),
        });

        let established = ControlMessage::ConnectionEstablished {
            client_id: client.client_id.clone(),
            user: client.user.user_id.clone(),
            role: client.user.role.as_str().to_string(),
            timestamp: client.connected_at,
        };
        self.send_control(&client, &established);

        let count = {
            let mut clients = self.clients.write().await;
            clients.insert(client.client_id.clone(), client.clone());
            clients.len()
        };
        info!(
            "Client {} connected (user: {}, role: {}, total: {})",
            client.client_id, client.user.user_id, client.user.role, count
        );
        (client, rx)
    }

    pub async fn unregister(&self, client_id: &str) -> bool {
        let removed = self.clients.write().await.remove(client_id).is_some();
        if removed {
            info!("Client {} disconnected", client_id);
        }
        removed
    }

    async fn drop_clients(&self, client_ids: &[String]) {
        if client_ids.is_empty() {
            return;
        }
        let mut clients = self.clients.write().await;
        for id in client_ids {
            if let Some(client) = clients.remove(id) {
                warn!("Dropping client {}: delivery failed", id);
                client.kicked.notify_one();
            }
        }
    }

    fn send_control(&self, client: &ClientHandle, message: &ControlMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => client.push(text),
            Err(e) => {
                error!("Failed to serialize control message: {}", e);
                false
            }
        }
    }

    pub async fn broadcast(&self, event: &SimulationEvent) -> usize {
        self.publish(event.kind(), event.symbol().map(str::to_string), event.payload())
            .await
    }

    /// Records one event and delivers the same envelope to every matching client.
    /// Returns the number of clients that accepted it.
    pub async fn publish(&self, kind: EventKind, symbol: Option<String>, data: Value) -> usize {
        let event = self.history.record(kind, symbol, data);
        let text = match serde_json::to_string(&*event) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize event {}: {}", event.event_id, e);
                return 0;
            }
        };

        let targets: Vec<Arc<ClientHandle>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|client| match (kind.is_symbol_scoped(), event.symbol.as_deref()) {
                    (true, Some(symbol)) => client.is_subscribed(symbol),
                    _ => true,
                })
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for client in targets {
            if client.push(text.clone()) {
                client.advance(event.event_id);
                delivered += 1;
            } else {
                failed.push(client.client_id.clone());
            }
        }
        self.drop_clients(&failed).await;

        debug!("Event {} ({:?}) delivered to {} clients", event.event_id, kind, delivered);
        delivered
    }

    pub async fn send_heartbeats(&self) -> usize {
        let clients: Vec<Arc<ClientHandle>> = self.clients.read().await.values().cloned().collect();
        let heartbeat = ControlMessage::heartbeat(None);

        let mut failed = Vec::new();
        for client in &clients {
            if !self.send_control(client, &heartbeat) {
                failed.push(client.client_id.clone());
            }
        }
        self.drop_clients(&failed).await;
        clients.len() - failed.len()
    }

    pub fn spawn_heartbeat(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        hub.send_heartbeats().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Heartbeat task stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Forwards pipeline events until every sender is dropped.
    pub fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::Receiver<SimulationEvent>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                hub.broadcast(&event).await;
            }
            debug!("Event pump stopped");
        })
    }

    /// Handles one text frame from an authenticated client. Returns false when the
    /// connection should be closed.
    pub async fn handle_client_text(&self, client: &Arc<ClientHandle>, text: &str) -> bool {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                return self.send_control(client, &ControlMessage::error(ErrorCode::InvalidJson, e.to_string()));
            }
        };
        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                return self.send_control(
                    client,
                    &ControlMessage::error(ErrorCode::InvalidMessage, e.to_string()),
                );
            }
        };

        match message {
            ClientMessage::Auth { .. } => self.send_control(
                client,
                &ControlMessage::error(ErrorCode::InvalidMessage, "Already authenticated"),
            ),
            ClientMessage::Subscribe { symbols } => self.subscribe(client, symbols),
            ClientMessage::Unsubscribe { symbols } => self.unsubscribe(client, symbols),
            ClientMessage::Ping => self.send_control(client, &ControlMessage::heartbeat(Some(HeartbeatData::Pong))),
            ClientMessage::Sync { last_event_id, symbols } => self.sync(client, last_event_id, symbols).await,
        }
    }

    fn permission_denied(&self, client: &ClientHandle, action: &str) -> bool {
        warn!(
            "Client {} ({}) denied {}: missing {:?} permission",
            client.client_id, client.user.role, action, self.subscribe_permission
        );
        self.send_control(
            client,
            &ControlMessage::error(
                ErrorCode::PermissionDenied,
                format!("Role '{}' may not {}", client.user.role, action),
            ),
        )
    }

    fn subscribe(&self, client: &ClientHandle, symbols: Vec<String>) -> bool {
        if !client.user.role.has_permission(self.subscribe_permission) {
            return self.permission_denied(client, "subscribe");
        }
        client
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(symbols);
        let symbols = client.sorted_subscriptions();
        debug!("Client {} subscribed to {:?}", client.client_id, symbols);
        self.send_control(client, &ControlMessage::SubscribeAck { symbols })
    }

    fn unsubscribe(&self, client: &ClientHandle, symbols: Vec<String>) -> bool {
        {
            let mut subscriptions = client.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
            for symbol in &symbols {
                subscriptions.remove(symbol);
            }
        }
        let symbols = client.sorted_subscriptions();
        self.send_control(client, &ControlMessage::UnsubscribeAck { symbols })
    }

    async fn sync(&self, client: &ClientHandle, cursor: Option<EventId>, symbols: Vec<String>) -> bool {
        if !client.user.role.has_permission(self.subscribe_permission) {
            return self.permission_denied(client, "sync");
        }

        let filter: HashSet<String> = if symbols.is_empty() {
            client.subscriptions()
        } else {
            symbols.into_iter().collect()
        };
        let replay = self.history.replay(cursor, &filter);

        let mut resent_count = 0;
        for event in &replay.events {
            let text = match serde_json::to_string(&**event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Sync for client {} failed: {}", client.client_id, e);
                    return self.send_control(client, &ControlMessage::error(ErrorCode::SyncFailed, e.to_string()));
                }
            };
            // Replay waits for queue space instead of dropping the client
            if client.outbound.send(text).await.is_err() {
                return false;
            }
            client.advance(event.event_id);
            resent_count += 1;
        }

        if replay.fallback {
            warn!(
                "Client {} cursor {:?} no longer retained, resent {} events",
                client.client_id, cursor, resent_count
            );
            let notice = HeartbeatData::SyncFallback {
                reason: "history_truncated".to_string(),
                resent_count,
            };
            if !self.send_control(client, &ControlMessage::heartbeat(Some(notice))) {
                return false;
            }
        }

        info!("Client {} synced {} events", client.client_id, resent_count);
        self.send_control(
            client,
            &ControlMessage::heartbeat(Some(HeartbeatData::SyncComplete { resent_count })),
        )
    }
}
