//! Buffer aggregator.
//!
//! Fans buffer updates out to WebSocket clients. Local sessions are served
//! from the [`TerminalManager`]; in HQ mode sessions owned by a remote are
//! proxied over one pooled upstream connection per remote.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use termhub_buffer::{BufferError, BufferSubscription, TerminalManager, encode_snapshot};
use termhub_core::SessionId;
use termhub_hq::{RegistryEvent, RemoteRegistry, RemoteServer};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    protocol::{ClientControl, Outbound, ServerMessage, decode_frame, encode_frame},
    upstream::{UpstreamConnector, UpstreamEvent, UpstreamLink},
};

/// Identifier of a connected client.
pub type ClientId = Uuid;

/// Channel feeding one client socket.
pub type ClientSender = mpsc::UnboundedSender<Outbound>;

/// Aggregator error.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Remote {remote} unavailable: {reason}")]
    UpstreamUnavailable { remote: String, reason: String },
    #[error("Timed out connecting to remote {0}")]
    UpstreamTimeout(String),
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Upper bound on opening an upstream connection.
    pub connect_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

enum ClientSubscription {
    Local(BufferSubscription),
    Remote { remote_id: String },
}

struct ClientState {
    tx: ClientSender,
    subscriptions: HashMap<SessionId, ClientSubscription>,
}

struct RemoteLink {
    link_id: u64,
    control: mpsc::UnboundedSender<String>,
    /// Per-session count of clients watching through this link.
    sessions: HashMap<SessionId, usize>,
    forwarder: JoinHandle<()>,
}

impl RemoteLink {
    fn send(&self, control: &ClientControl) {
        let _ = self.control.send(control.to_json());
    }

    fn close(self) {
        self.forwarder.abort();
    }
}

#[derive(Default)]
struct AggregatorState {
    clients: HashMap<ClientId, ClientState>,
    remotes: HashMap<String, RemoteLink>,
}

impl AggregatorState {
    /// Drop one remote-session reference. Closes the link when it was the
    /// last session on it.
    fn release_remote_session(&mut self, remote_id: &str, session_id: &str) {
        let Some(link) = self.remotes.get_mut(remote_id) else {
            return;
        };
        let Some(count) = link.sessions.get_mut(session_id) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        link.sessions.remove(session_id);
        link.send(&ClientControl::Unsubscribe {
            session_id: session_id.to_string(),
        });
        if link.sessions.is_empty() {
            if let Some(link) = self.remotes.remove(remote_id) {
                tracing::debug!(remote_id, "Closing idle upstream connection");
                link.close();
            }
        }
    }

    fn remove_subscription(&mut self, client_id: ClientId, session_id: &str) -> bool {
        let removed = self
            .clients
            .get_mut(&client_id)
            .and_then(|client| client.subscriptions.remove(session_id));
        match removed {
            Some(ClientSubscription::Local(mut subscription)) => {
                subscription.unsubscribe();
                true
            }
            Some(ClientSubscription::Remote { remote_id }) => {
                self.release_remote_session(&remote_id, session_id);
                true
            }
            None => false,
        }
    }

    fn remove_client(&mut self, client_id: ClientId) -> bool {
        let Some(client) = self.clients.remove(&client_id) else {
            return false;
        };
        for (session_id, subscription) in client.subscriptions {
            match subscription {
                ClientSubscription::Local(mut subscription) => subscription.unsubscribe(),
                ClientSubscription::Remote { remote_id } => {
                    self.release_remote_session(&remote_id, &session_id);
                }
            }
        }
        true
    }

    /// Forget every subscription routed through `remote_id` and tell the
    /// affected clients.
    fn drop_remote(&mut self, remote_id: &str, reason: &str) -> usize {
        if let Some(link) = self.remotes.remove(remote_id) {
            link.close();
        }
        let mut affected = 0;
        for client in self.clients.values_mut() {
            let lost: Vec<SessionId> = client
                .subscriptions
                .iter()
                .filter(|(_, sub)| {
                    matches!(sub, ClientSubscription::Remote { remote_id: owner } if owner == remote_id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for session_id in lost {
                client.subscriptions.remove(&session_id);
                let _ = client
                    .tx
                    .send(ServerMessage::session_error(&session_id, reason).into());
                affected += 1;
            }
        }
        affected
    }
}

/// Routes buffer updates from local terminals and remote upstreams to
/// subscribed clients.
pub struct BufferAggregator {
    terminals: Arc<TerminalManager>,
    registry: Option<Arc<RemoteRegistry>>,
    connector: Arc<dyn UpstreamConnector>,
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
    next_link_id: AtomicU64,
    registry_listener: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl BufferAggregator {
    /// Create an aggregator. Pass a registry to enable HQ routing.
    #[must_use]
    pub fn new(
        terminals: Arc<TerminalManager>,
        registry: Option<Arc<RemoteRegistry>>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Arc<Self> {
        Self::with_config(terminals, registry, connector, AggregatorConfig::default())
    }

    #[must_use]
    pub fn with_config(
        terminals: Arc<TerminalManager>,
        registry: Option<Arc<RemoteRegistry>>,
        connector: Arc<dyn UpstreamConnector>,
        config: AggregatorConfig,
    ) -> Arc<Self> {
        let aggregator = Arc::new_cyclic(|this| Self {
            terminals,
            registry,
            connector,
            config,
            state: Mutex::new(AggregatorState::default()),
            next_link_id: AtomicU64::new(1),
            registry_listener: Mutex::new(None),
            this: this.clone(),
        });
        aggregator.listen_to_registry();
        aggregator
    }

    fn state(&self) -> MutexGuard<'_, AggregatorState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn listen_to_registry(&self) {
        let Some(registry) = &self.registry else {
            return;
        };
        let mut events = registry.subscribe();
        let this = self.this.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Aggregator missed registry events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(aggregator) = this.upgrade() else {
                    break;
                };
                match event {
                    RegistryEvent::Registered(remote) => aggregator.on_remote_registered(&remote),
                    RegistryEvent::Unregistered(remote) => {
                        aggregator.on_remote_unregistered(&remote.id);
                    }
                }
            }
        });
        *self
            .registry_listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
    }

    /// Register a client and send it the welcome message.
    pub fn handle_client_connection(&self, tx: ClientSender) -> ClientId {
        let client_id = Uuid::new_v4();
        let _ = tx.send(ServerMessage::welcome().into());
        self.state().clients.insert(
            client_id,
            ClientState {
                tx,
                subscriptions: HashMap::new(),
            },
        );
        tracing::debug!(%client_id, "Buffer client connected");
        client_id
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state().clients.len()
    }

    /// Number of open upstream connections.
    #[must_use]
    pub fn upstream_count(&self) -> usize {
        self.state().remotes.len()
    }

    fn send_to(&self, client_id: ClientId, message: Outbound) {
        if let Some(client) = self.state().clients.get(&client_id) {
            let _ = client.tx.send(message);
        }
    }

    /// Handle one JSON control message from a client.
    pub async fn handle_client_message(&self, client_id: ClientId, text: &str) {
        let control = match serde_json::from_str::<ClientControl>(text) {
            Ok(control) => control,
            Err(e) => {
                tracing::debug!(%client_id, "Invalid client message: {e}");
                self.send_to(
                    client_id,
                    ServerMessage::Error {
                        session_id: None,
                        message: format!("Invalid message: {e}"),
                    }
                    .into(),
                );
                return;
            }
        };

        match control {
            ClientControl::Subscribe { session_id } => {
                if let Err(e) = self.subscribe(client_id, &session_id).await {
                    tracing::debug!(%client_id, %session_id, "Subscribe failed: {e}");
                    self.send_to(
                        client_id,
                        ServerMessage::session_error(&session_id, e.to_string()).into(),
                    );
                }
            }
            ClientControl::Unsubscribe { session_id } => {
                self.unsubscribe(client_id, &session_id);
            }
            ClientControl::Ping => self.send_to(
                client_id,
                ServerMessage::Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                }
                .into(),
            ),
        }
    }

    /// Subscribe a client to a session, routing to the owning remote when
    /// one is known. Replaces an existing subscription to the same session.
    ///
    /// # Errors
    /// Returns an error if the session is unknown or its remote cannot be
    /// reached.
    pub async fn subscribe(&self, client_id: ClientId, session_id: &str) -> Result<(), AggregatorError> {
        self.unsubscribe(client_id, session_id);

        let remote = self
            .registry
            .as_ref()
            .and_then(|registry| registry.get_remote_by_session_id(session_id));
        match remote {
            Some(remote) => {
                self.subscribe_to_remote_session(client_id, session_id, &remote)
                    .await
            }
            None => self.subscribe_to_local_session(client_id, session_id).await,
        }
    }

    /// Serve a session from the local terminal manager. The client gets the
    /// current screen followed by a `subscribed` message, then only newer
    /// screens.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session does not exist locally.
    pub async fn subscribe_to_local_session(
        &self,
        client_id: ClientId,
        session_id: &str,
    ) -> Result<(), AggregatorError> {
        let Some(tx) = self.state().clients.get(&client_id).map(|c| c.tx.clone()) else {
            return Ok(());
        };

        let announced = AtomicBool::new(false);
        let subscription = self
            .terminals
            .subscribe_with_snapshot(session_id, move |id, snapshot| {
                let frame = encode_frame(id, &encode_snapshot(&snapshot));
                let _ = tx.send(Outbound::Binary(frame));
                if !announced.swap(true, Ordering::Relaxed) {
                    let _ = tx.send(
                        ServerMessage::Subscribed {
                            session_id: id.to_string(),
                        }
                        .into(),
                    );
                }
            })
            .await
            .map_err(|e| match e {
                BufferError::SessionNotFound(id) => AggregatorError::SessionNotFound(id),
                other => AggregatorError::Buffer(other),
            })?;

        if let Some(client) = self.state().clients.get_mut(&client_id) {
            client
                .subscriptions
                .insert(session_id.to_string(), ClientSubscription::Local(subscription));
        }
        tracing::debug!(%client_id, session_id, "Subscribed to local session");
        Ok(())
    }

    /// Proxy a session owned by `remote`, reusing the pooled upstream
    /// connection when one is open.
    ///
    /// # Errors
    /// Returns `UpstreamUnavailable` or `UpstreamTimeout` if no upstream
    /// connection could be opened.
    pub async fn subscribe_to_remote_session(
        &self,
        client_id: ClientId,
        session_id: &str,
        remote: &RemoteServer,
    ) -> Result<(), AggregatorError> {
        let connected = self.state().remotes.contains_key(&remote.id);
        let fresh = if connected {
            None
        } else {
            let link = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(remote),
            )
            .await
            .map_err(|_| AggregatorError::UpstreamTimeout(remote.name.clone()))??;
            Some(link)
        };

        let mut state = self.state();
        if !state.clients.contains_key(&client_id) {
            return Ok(());
        }
        if let Some(link) = fresh {
            if state.remotes.contains_key(&remote.id) {
                tracing::debug!(remote_id = %remote.id, "Discarding duplicate upstream connection");
            } else {
                let link = self.open_link(&remote.id, link);
                state.remotes.insert(remote.id.clone(), link);
            }
        }
        let Some(link) = state.remotes.get_mut(&remote.id) else {
            return Err(AggregatorError::UpstreamUnavailable {
                remote: remote.name.clone(),
                reason: "connection closed".to_string(),
            });
        };

        let count = link.sessions.entry(session_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            link.send(&ClientControl::Subscribe {
                session_id: session_id.to_string(),
            });
        }

        if let Some(client) = state.clients.get_mut(&client_id) {
            client.subscriptions.insert(
                session_id.to_string(),
                ClientSubscription::Remote {
                    remote_id: remote.id.clone(),
                },
            );
            let _ = client.tx.send(
                ServerMessage::Subscribed {
                    session_id: session_id.to_string(),
                }
                .into(),
            );
        }
        tracing::debug!(%client_id, session_id, remote_id = %remote.id, "Subscribed to remote session");
        Ok(())
    }

    fn open_link(&self, remote_id: &str, link: UpstreamLink) -> RemoteLink {
        let UpstreamLink {
            control,
            mut events,
        } = link;
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let this = self.this.clone();
        let id = remote_id.to_string();

        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(aggregator) = this.upgrade() else {
                    return;
                };
                match event {
                    UpstreamEvent::Frame(frame) => {
                        aggregator.forward_buffer_to_clients(&id, frame);
                    }
                    UpstreamEvent::SessionError {
                        session_id,
                        message,
                    } => {
                        aggregator.handle_upstream_error(&id, &session_id, &message);
                    }
                }
            }
            if let Some(aggregator) = this.upgrade() {
                aggregator.handle_upstream_closed(&id, link_id);
            }
        });

        RemoteLink {
            link_id,
            control,
            sessions: HashMap::new(),
            forwarder,
        }
    }

    /// Deliver a frame received from `remote_id` to every client subscribed
    /// to that session through that remote. Returns how many clients got it.
    pub fn forward_buffer_to_clients(&self, remote_id: &str, frame: Bytes) -> usize {
        let session_id = match decode_frame(&frame) {
            Ok((session_id, _)) => session_id.to_string(),
            Err(e) => {
                tracing::warn!(remote_id, "Dropping malformed upstream frame: {e}");
                return 0;
            }
        };

        let mut state = self.state();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (client_id, client) in &state.clients {
            let routed = matches!(
                client.subscriptions.get(&session_id),
                Some(ClientSubscription::Remote { remote_id: owner }) if owner == remote_id
            );
            if !routed {
                continue;
            }
            if client.tx.send(Outbound::Binary(frame.clone())).is_ok() {
                delivered += 1;
            } else {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            state.remove_client(client_id);
        }
        delivered
    }

    /// Relay a remote's rejection of `session_id` to every client watching it
    /// through `remote_id`, then drop those subscriptions. Returns how many
    /// clients were told.
    pub fn handle_upstream_error(&self, remote_id: &str, session_id: &str, message: &str) -> usize {
        let mut state = self.state();
        let watching: Vec<ClientId> = state
            .clients
            .iter()
            .filter(|(_, client)| {
                matches!(
                    client.subscriptions.get(session_id),
                    Some(ClientSubscription::Remote { remote_id: owner }) if owner == remote_id
                )
            })
            .map(|(client_id, _)| *client_id)
            .collect();
        for client_id in &watching {
            if let Some(client) = state.clients.get(client_id) {
                let _ = client
                    .tx
                    .send(ServerMessage::session_error(session_id, message).into());
            }
            state.remove_subscription(*client_id, session_id);
        }
        if !watching.is_empty() {
            tracing::info!(remote_id, session_id, affected = watching.len(), "Remote rejected session: {message}");
        }
        watching.len()
    }

    /// Cancel one subscription. Unknown subscriptions are ignored.
    pub fn unsubscribe(&self, client_id: ClientId, session_id: &str) {
        if self.state().remove_subscription(client_id, session_id) {
            tracing::debug!(%client_id, session_id, "Unsubscribed");
        }
    }

    /// Release everything a disconnected client held.
    pub fn handle_client_disconnect(&self, client_id: ClientId) {
        if self.state().remove_client(client_id) {
            tracing::debug!(%client_id, "Buffer client disconnected");
        }
    }

    /// Upstream connections are opened lazily on first subscribe.
    pub fn on_remote_registered(&self, remote: &RemoteServer) {
        tracing::debug!(remote_id = %remote.id, name = %remote.name, "Remote available for buffer routing");
    }

    /// Tear down the upstream for a departed remote and notify clients that
    /// were watching its sessions.
    pub fn on_remote_unregistered(&self, remote_id: &str) {
        let affected = self
            .state()
            .drop_remote(remote_id, "Remote server disconnected");
        if affected > 0 {
            tracing::info!(remote_id, affected, "Dropped subscriptions of unregistered remote");
        }
    }

    fn handle_upstream_closed(&self, remote_id: &str, link_id: u64) {
        let mut state = self.state();
        let current = state
            .remotes
            .get(remote_id)
            .is_some_and(|link| link.link_id == link_id);
        if !current {
            return;
        }
        let affected = state.drop_remote(remote_id, "Upstream connection lost");
        tracing::warn!(remote_id, affected, "Upstream connection closed");
    }

    /// Drop all clients and upstream connections.
    pub fn destroy(&self) {
        if let Some(task) = self
            .registry_listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let mut state = self.state();
        let clients: Vec<ClientId> = state.clients.keys().copied().collect();
        for client_id in clients {
            state.remove_client(client_id);
        }
        for (_, link) in state.remotes.drain() {
            link.close();
        }
        tracing::info!("Buffer aggregator destroyed");
    }
}
