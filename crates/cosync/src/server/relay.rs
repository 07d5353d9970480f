//! WebSocket relay.
//!
//! The relay is the deployable counterpart of the in-memory hub: clients
//! authenticate, subscribe to channels and publish events, and every
//! publish fans out to the channel's other subscribers (the sender is
//! excluded). Operation events are additionally mirrored into the durable
//! operation store so reconciliation sees live traffic.
//!
//! Each connection runs in its own task with a dedicated outgoing queue;
//! a shared registry maps connections to channels; a broadcast channel
//! signals shutdown to every loop.

use super::auth::{AcceptAllAuthProvider, AuthProvider, AuthenticatedUser};
use super::ServerConfig;
use crate::error::{SyncError, SyncResult};
use crate::operation::Operation;
use crate::resource::ResourceRef;
use crate::store::OperationStore;
use crate::transport::EVENT_OPERATION;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

/// Messages sent from client to relay.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    /// Authentication request.
    Auth { token: String },

    /// Subscribe to a channel.
    Subscribe { channel: String },

    /// Unsubscribe from a channel.
    Unsubscribe { channel: String },

    /// Publish an event to a channel.
    Publish {
        channel: String,
        event: String,
        payload: Value,
    },

    /// Ping for connection health.
    Ping,
}

/// Messages sent from relay to client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    /// Authentication succeeded.
    AuthSuccess { user_id: String },

    /// Authentication failed.
    AuthError { message: String },

    /// Subscription confirmed.
    Subscribed { channel: String },

    /// Unsubscription confirmed.
    Unsubscribed { channel: String },

    /// An event published by another subscriber.
    Event {
        channel: String,
        event: String,
        payload: Value,
        sender: String,
    },

    /// Error message.
    Error { code: String, message: String },

    /// Pong response to ping.
    Pong,
}

impl RelayServerMessage {
    /// Create an error message.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One relay connection's registry entry.
struct RelayConnection {
    /// Authenticated user, once the auth handshake completed.
    user: Option<AuthenticatedUser>,
    /// Channels this connection subscribed to.
    channels: HashSet<String>,
    /// Outgoing queue drained by the connection's writer task.
    tx: mpsc::UnboundedSender<RelayServerMessage>,
}

impl RelayConnection {
    fn new(tx: mpsc::UnboundedSender<RelayServerMessage>) -> Self {
        Self {
            user: None,
            channels: HashSet::new(),
            tx,
        }
    }

    fn send(&self, message: RelayServerMessage) {
        // a closed queue means the connection is tearing down
        let _ = self.tx.send(message);
    }
}

/// Subscriber registry shared by all connection tasks.
#[derive(Default)]
struct RelayRegistry {
    connections: HashMap<Uuid, RelayConnection>,
    channels: HashMap<String, HashSet<Uuid>>,
}

impl RelayRegistry {
    fn add(&mut self, conn_id: Uuid, tx: mpsc::UnboundedSender<RelayServerMessage>) {
        self.connections.insert(conn_id, RelayConnection::new(tx));
    }

    fn remove(&mut self, conn_id: Uuid) {
        if let Some(conn) = self.connections.remove(&conn_id) {
            for channel in conn.channels {
                self.drop_subscriber(&channel, conn_id);
            }
        }
    }

    fn set_authenticated(&mut self, conn_id: Uuid, user: AuthenticatedUser) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.user = Some(user);
        }
    }

    fn is_authenticated(&self, conn_id: Uuid) -> bool {
        self.connections
            .get(&conn_id)
            .is_some_and(|conn| conn.user.is_some())
    }

    fn subscribe(&mut self, conn_id: Uuid, channel: String) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.channels.insert(channel.clone());
            self.channels.entry(channel).or_default().insert(conn_id);
        }
    }

    fn unsubscribe(&mut self, conn_id: Uuid, channel: &str) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.channels.remove(channel);
        }
        self.drop_subscriber(channel, conn_id);
    }

    fn drop_subscriber(&mut self, channel: &str, conn_id: Uuid) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    fn send_to(&self, conn_id: Uuid, message: RelayServerMessage) {
        if let Some(conn) = self.connections.get(&conn_id) {
            conn.send(message);
        }
    }

    /// Deliver to every subscriber of `channel` except `exclude`.
    /// Returns the delivery count.
    fn broadcast(&self, channel: &str, message: RelayServerMessage, exclude: Uuid) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for id in subscribers {
            if *id == exclude {
                continue;
            }
            if let Some(conn) = self.connections.get(id) {
                conn.send(message.clone());
                delivered += 1;
            }
        }
        delivered
    }
}

/// Relay statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayStats {
    /// Active connections.
    pub connections: usize,
    /// Channels with at least one subscriber.
    pub channels: usize,
}

/// Handle for triggering relay shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the relay to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// The WebSocket relay server.
pub struct RelayServer<A: AuthProvider = AcceptAllAuthProvider> {
    config: ServerConfig,
    auth: Arc<A>,
    store: Arc<dyn OperationStore>,
    registry: Arc<RwLock<RelayRegistry>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer<AcceptAllAuthProvider> {
    /// Create a relay with default authentication (accepts all).
    pub fn new(config: ServerConfig, store: Arc<dyn OperationStore>) -> Self {
        Self::with_auth(config, store, AcceptAllAuthProvider)
    }
}

impl<A: AuthProvider + 'static> RelayServer<A> {
    /// Create a relay with custom authentication.
    pub fn with_auth(config: ServerConfig, store: Arc<dyn OperationStore>, auth: A) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            auth: Arc::new(auth),
            store,
            registry: Arc::new(RwLock::new(RelayRegistry::default())),
            shutdown_tx,
        }
    }

    /// Get a shutdown handle.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Current relay statistics.
    pub async fn stats(&self) -> RelayStats {
        let registry = self.registry.read().await;
        RelayStats {
            connections: registry.connections.len(),
            channels: registry.channels.len(),
        }
    }

    /// Bind the configured relay address and accept connections until
    /// shutdown is signaled.
    pub async fn run(&self) -> SyncResult<()> {
        let addr = self.config.relay_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|err| SyncError::Bind {
            addr: addr.clone(),
            reason: err.to_string(),
        })?;

        tracing::info!("Relay listening on {}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(err) => tracing::error!("Failed to accept connection: {}", err),
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Relay received shutdown signal");
                    break;
                }
            }
        }

        tracing::info!("Relay shutdown complete");
        Ok(())
    }

    /// Handle a new connection in its own task.
    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let registry = Arc::clone(&self.registry);
        let auth = Arc::clone(&self.auth);
        let store = Arc::clone(&self.store);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(err) => {
                    tracing::error!("WebSocket handshake failed for {}: {}", peer, err);
                    return;
                }
            };
            let (mut ws_tx, mut ws_rx) = ws_stream.split();

            let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<RelayServerMessage>();
            let conn_id = Uuid::new_v4();
            registry.write().await.add(conn_id, msg_tx);
            tracing::debug!("Connection {} accepted from {}", conn_id, peer);

            // Outgoing message forwarder
            let outgoing = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    match msg.to_json() {
                        Ok(json) => {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::error!("Failed to serialize relay message: {}", err);
                        }
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                handle_message(&registry, auth.as_ref(), &store, conn_id, &text)
                                    .await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::debug!("Connection {} closed", conn_id);
                                break;
                            }
                            Some(Err(err)) => {
                                tracing::error!("WebSocket error for {}: {}", conn_id, err);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Connection {} received shutdown signal", conn_id);
                        break;
                    }
                }
            }

            outgoing.abort();
            registry.write().await.remove(conn_id);
        });
    }
}

/// Handle one incoming client message.
async fn handle_message<A: AuthProvider>(
    registry: &RwLock<RelayRegistry>,
    auth: &A,
    store: &Arc<dyn OperationStore>,
    conn_id: Uuid,
    text: &str,
) {
    let msg: RelayClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            registry
                .read()
                .await
                .send_to(conn_id, RelayServerMessage::error("parse_error", err.to_string()));
            return;
        }
    };

    match msg {
        RelayClientMessage::Auth { token } => {
            if registry.read().await.is_authenticated(conn_id) {
                registry.read().await.send_to(
                    conn_id,
                    RelayServerMessage::error("already_authenticated", "Already authenticated"),
                );
                return;
            }
            match auth.authenticate(&token).await {
                Ok(user) => {
                    let user_id = user.user_id.clone();
                    let mut reg = registry.write().await;
                    reg.set_authenticated(conn_id, user);
                    reg.send_to(conn_id, RelayServerMessage::AuthSuccess { user_id });
                }
                Err(message) => {
                    registry
                        .read()
                        .await
                        .send_to(conn_id, RelayServerMessage::AuthError { message });
                }
            }
        }

        RelayClientMessage::Subscribe { channel } => {
            let mut reg = registry.write().await;
            if !reg.is_authenticated(conn_id) {
                reg.send_to(
                    conn_id,
                    RelayServerMessage::error("not_authenticated", "Must authenticate first"),
                );
                return;
            }
            reg.subscribe(conn_id, channel.clone());
            reg.send_to(conn_id, RelayServerMessage::Subscribed { channel });
        }

        RelayClientMessage::Unsubscribe { channel } => {
            let mut reg = registry.write().await;
            reg.unsubscribe(conn_id, &channel);
            reg.send_to(conn_id, RelayServerMessage::Unsubscribed { channel });
        }

        RelayClientMessage::Publish {
            channel,
            event,
            payload,
        } => {
            let sender = {
                let reg = registry.read().await;
                let Some(conn) = reg.connections.get(&conn_id) else {
                    return;
                };
                let Some(user) = conn.user.as_ref() else {
                    conn.send(RelayServerMessage::error(
                        "not_authenticated",
                        "Must authenticate first",
                    ));
                    return;
                };
                if !conn.channels.contains(&channel) {
                    conn.send(RelayServerMessage::error(
                        "not_subscribed",
                        "Must subscribe to the channel first",
                    ));
                    return;
                }
                user.user_id.clone()
            };

            if event == EVENT_OPERATION {
                record_operation(store, &channel, &payload);
            }

            let delivered = registry.read().await.broadcast(
                &channel,
                RelayServerMessage::Event {
                    channel: channel.clone(),
                    event,
                    payload,
                    sender,
                },
                conn_id,
            );
            tracing::debug!(%channel, delivered, "publish fanned out");
        }

        RelayClientMessage::Ping => {
            registry.read().await.send_to(conn_id, RelayServerMessage::Pong);
        }
    }
}

/// Mirror operation traffic into the durable log so reconciliation sees
/// live publishes. Non-operation channels and malformed payloads are
/// skipped.
fn record_operation(store: &Arc<dyn OperationStore>, channel: &str, payload: &Value) {
    let Some(resource) = ResourceRef::from_channel_name(channel) else {
        return;
    };
    match serde_json::from_value::<Operation>(payload.clone()) {
        Ok(op) => {
            if let Err(err) = store.append(&resource, op) {
                tracing::warn!(channel, "Operation not recorded: {}", err);
            }
        }
        Err(err) => {
            tracing::warn!(channel, "Ignoring malformed operation payload: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::operation::OperationDraft;
    use crate::store::MemoryOperationStore;
    use serde_json::json;

    async fn add_conn(
        registry: &RwLock<RelayRegistry>,
    ) -> (Uuid, mpsc::UnboundedReceiver<RelayServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        registry.write().await.add(conn_id, tx);
        (conn_id, rx)
    }

    fn test_store() -> (Arc<MemoryOperationStore>, Arc<dyn OperationStore>) {
        let mem = Arc::new(MemoryOperationStore::new());
        let store: Arc<dyn OperationStore> = mem.clone();
        (mem, store)
    }

    fn sample_operation_payload() -> Value {
        let mut clock = VectorClock::new();
        clock.set("alice", 1);
        let op = OperationDraft::update("title", json!("hello")).into_operation(
            "alice", clock, 1_000,
        );
        serde_json::to_value(&op).unwrap()
    }

    // ========== Wire Format Tests ==========

    #[test]
    fn test_client_message_parsing() {
        let msg: RelayClientMessage =
            serde_json::from_str(r#"{"type":"auth","token":"secret"}"#).unwrap();
        assert!(matches!(msg, RelayClientMessage::Auth { token } if token == "secret"));

        let msg: RelayClientMessage = serde_json::from_str(
            r#"{"type":"publish","channel":"workflow:wf-1","event":"operation","payload":{}}"#,
        )
        .unwrap();
        match msg {
            RelayClientMessage::Publish { channel, event, .. } => {
                assert_eq!(channel, "workflow:wf-1");
                assert_eq!(event, "operation");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(serde_json::from_str::<RelayClientMessage>(r#"{"type":"join"}"#).is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = RelayServerMessage::Event {
            channel: "workflow:wf-1".to_string(),
            event: "operation".to_string(),
            payload: json!({ "path": "title" }),
            sender: "alice".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains("workflow:wf-1"));
        assert!(json.contains(r#""sender":"alice""#));

        let pong = RelayServerMessage::Pong.to_json().unwrap();
        assert!(pong.contains(r#""type":"pong""#));
    }

    // ========== Registry Tests ==========

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = RwLock::new(RelayRegistry::default());
        let (alice, mut alice_rx) = add_conn(&registry).await;
        let (bob, mut bob_rx) = add_conn(&registry).await;
        let (_, mut carol_rx) = add_conn(&registry).await;

        {
            let mut reg = registry.write().await;
            reg.subscribe(alice, "workflow:wf-1".to_string());
            reg.subscribe(bob, "workflow:wf-1".to_string());
            // carol not subscribed
        }

        let delivered = registry.read().await.broadcast(
            "workflow:wf-1",
            RelayServerMessage::Pong,
            alice,
        );

        assert_eq!(delivered, 1);
        assert!(bob_rx.try_recv().is_ok());
        assert!(alice_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_drops_subscriptions() {
        let registry = RwLock::new(RelayRegistry::default());
        let (alice, _alice_rx) = add_conn(&registry).await;

        {
            let mut reg = registry.write().await;
            reg.subscribe(alice, "workflow:wf-1".to_string());
            assert_eq!(reg.channels.len(), 1);
            reg.remove(alice);
            assert!(reg.channels.is_empty());
            assert!(reg.connections.is_empty());
        }
    }

    // ========== Message Handling Tests ==========

    #[tokio::test]
    async fn test_auth_flow() {
        let registry = RwLock::new(RelayRegistry::default());
        let (_, store) = test_store();
        let (conn, mut rx) = add_conn(&registry).await;

        handle_message(
            &registry,
            &AcceptAllAuthProvider,
            &store,
            conn,
            r#"{"type":"auth","token":"alice"}"#,
        )
        .await;

        match rx.try_recv().unwrap() {
            RelayServerMessage::AuthSuccess { user_id } => assert_eq!(user_id, "alice"),
            other => panic!("unexpected message: {:?}", other),
        }

        // second auth is rejected
        handle_message(
            &registry,
            &AcceptAllAuthProvider,
            &store,
            conn,
            r#"{"type":"auth","token":"alice"}"#,
        )
        .await;
        match rx.try_recv().unwrap() {
            RelayServerMessage::Error { code, .. } => assert_eq!(code, "already_authenticated"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_requires_auth() {
        let registry = RwLock::new(RelayRegistry::default());
        let (_, store) = test_store();
        let (conn, mut rx) = add_conn(&registry).await;

        handle_message(
            &registry,
            &AcceptAllAuthProvider,
            &store,
            conn,
            r#"{"type":"subscribe","channel":"workflow:wf-1"}"#,
        )
        .await;

        match rx.try_recv().unwrap() {
            RelayServerMessage::Error { code, .. } => assert_eq!(code, "not_authenticated"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_other_subscribers() {
        let registry = RwLock::new(RelayRegistry::default());
        let (mem, store) = test_store();
        let provider = AcceptAllAuthProvider;
        let (alice, mut alice_rx) = add_conn(&registry).await;
        let (bob, mut bob_rx) = add_conn(&registry).await;

        for (conn, token) in [(alice, "alice"), (bob, "bob")] {
            handle_message(
                &registry,
                &provider,
                &store,
                conn,
                &format!(r#"{{"type":"auth","token":"{token}"}}"#),
            )
            .await;
            handle_message(
                &registry,
                &provider,
                &store,
                conn,
                r#"{"type":"subscribe","channel":"workflow:wf-1"}"#,
            )
            .await;
        }
        // drain auth + subscribe acks
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let publish = json!({
            "type": "publish",
            "channel": "workflow:wf-1",
            "event": "operation",
            "payload": sample_operation_payload(),
        });
        handle_message(&registry, &provider, &store, alice, &publish.to_string()).await;

        match bob_rx.try_recv().unwrap() {
            RelayServerMessage::Event { channel, event, sender, .. } => {
                assert_eq!(channel, "workflow:wf-1");
                assert_eq!(event, "operation");
                assert_eq!(sender, "alice");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(alice_rx.try_recv().is_err());

        // operation traffic landed in the durable log
        let recorded = mem
            .operations_since(&ResourceRef::workflow("wf-1"), 0)
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_publish_requires_subscription() {
        let registry = RwLock::new(RelayRegistry::default());
        let (mem, store) = test_store();
        let (conn, mut rx) = add_conn(&registry).await;

        handle_message(
            &registry,
            &AcceptAllAuthProvider,
            &store,
            conn,
            r#"{"type":"auth","token":"alice"}"#,
        )
        .await;
        let _ = rx.try_recv();

        let publish = json!({
            "type": "publish",
            "channel": "workflow:wf-1",
            "event": "operation",
            "payload": sample_operation_payload(),
        });
        handle_message(&registry, &AcceptAllAuthProvider, &store, conn, &publish.to_string())
            .await;

        match rx.try_recv().unwrap() {
            RelayServerMessage::Error { code, .. } => assert_eq!(code, "not_subscribed"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(mem
            .operations_since(&ResourceRef::workflow("wf-1"), 0)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_reports_parse_error() {
        let registry = RwLock::new(RelayRegistry::default());
        let (_, store) = test_store();
        let (conn, mut rx) = add_conn(&registry).await;

        handle_message(&registry, &AcceptAllAuthProvider, &store, conn, "not json").await;

        match rx.try_recv().unwrap() {
            RelayServerMessage::Error { code, .. } => assert_eq!(code, "parse_error"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let registry = RwLock::new(RelayRegistry::default());
        let (_, store) = test_store();
        let (conn, mut rx) = add_conn(&registry).await;

        handle_message(
            &registry,
            &AcceptAllAuthProvider,
            &store,
            conn,
            r#"{"type":"ping"}"#,
        )
        .await;
        assert!(matches!(rx.try_recv().unwrap(), RelayServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_presence_channel_publish_is_not_recorded() {
        let registry = RwLock::new(RelayRegistry::default());
        let (mem, store) = test_store();
        let provider = AcceptAllAuthProvider;
        let (alice, mut alice_rx) = add_conn(&registry).await;
        let (bob, mut bob_rx) = add_conn(&registry).await;

        for (conn, token) in [(alice, "alice"), (bob, "bob")] {
            handle_message(
                &registry,
                &provider,
                &store,
                conn,
                &format!(r#"{{"type":"auth","token":"{token}"}}"#),
            )
            .await;
            handle_message(
                &registry,
                &provider,
                &store,
                conn,
                r#"{"type":"subscribe","channel":"presence:workflow:wf-1"}"#,
            )
            .await;
        }
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let publish = json!({
            "type": "publish",
            "channel": "presence:workflow:wf-1",
            "event": "presence",
            "payload": { "userId": "alice" },
        });
        handle_message(&registry, &provider, &store, alice, &publish.to_string()).await;

        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            RelayServerMessage::Event { .. }
        ));
        assert!(mem
            .operations_since(&ResourceRef::workflow("wf-1"), 0)
            .unwrap()
            .is_empty());
    }

    // ========== Server Tests ==========

    #[tokio::test]
    async fn test_relay_server_creation() {
        let (_, store) = test_store();
        let relay = RelayServer::new(ServerConfig::with_ports(0, 0), store);
        let stats = relay.stats().await;
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.channels, 0);
    }

    #[test]
    fn test_shutdown_handle() {
        let (_, store) = test_store();
        let relay = RelayServer::new(ServerConfig::default(), store);
        let handle = relay.shutdown_handle();
        handle.shutdown();
    }
}
