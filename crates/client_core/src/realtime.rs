//! Realtime channel: at most one live connection per authenticated session.
//!
//! The [`ConnectionManager`] owns the connection slot. Other components get a
//! read-only [`Connection`] handle through [`ConnectionManager::current`] and
//! may only register or remove event handlers on it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::UserId,
    protocol::{EventKind, ServerEvent},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings, error::RealtimeError, lock, presence::PresenceTracker, ClientEvent,
};

/// Decoded server frames, ending when the channel closes.
pub type EventStream = BoxStream<'static, Result<ServerEvent, RealtimeError>>;

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Opens a channel bound to `user_id`; the id travels as connection metadata.
    async fn open(&self, user_id: &UserId) -> Result<EventStream, RealtimeError>;
}

pub struct WsConnector {
    settings: ClientSettings,
}

impl WsConnector {
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn open(&self, user_id: &UserId) -> Result<EventStream, RealtimeError> {
        let url = self
            .settings
            .websocket_url(user_id)
            .map_err(|err| RealtimeError::Connect(err.to_string()))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RealtimeError::Connect(format!("{url}: {err}")))?;

        let frames = futures::stream::unfold(ws_stream, |mut ws| async move {
            loop {
                match ws.next().await? {
                    Ok(WsMessage::Text(text)) => return Some((decode_frame(&text), ws)),
                    Ok(WsMessage::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(err) => return Some((Err(RealtimeError::Receive(err.to_string())), ws)),
                }
            }
        });
        Ok(frames.boxed())
    }
}

pub(crate) fn decode_frame(text: &str) -> Result<ServerEvent, RealtimeError> {
    serde_json::from_str(text).map_err(|err| RealtimeError::Malformed(err.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

pub struct Connection {
    user_id: UserId,
    state: Mutex<ConnectionState>,
    handlers: Mutex<Vec<(HandlerId, EventKind, Handler)>>,
    next_handler: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            state: Mutex::new(ConnectionState::Connecting),
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            reader: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Registers `handler` for every frame of `kind`. Handlers run in registration order.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).push((id, kind, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(handler_id, _, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.handlers)
            .iter()
            .filter(|(_, handler_kind, _)| *handler_kind == kind)
            .count()
    }

    pub(crate) fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        // Handlers may take other locks; never call them with ours held.
        let handlers: Vec<Handler> = lock(&self.handlers)
            .iter()
            .filter(|(_, handler_kind, _)| *handler_kind == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn attach_reader(&self, reader: JoinHandle<()>) {
        *lock(&self.reader) = Some(reader);
    }

    /// Stops reading and drops every handler. Returns whether the connection was live.
    fn close(&self) -> bool {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        lock(&self.handlers).clear();
        let mut state = lock(&self.state);
        let was_live = *state != ConnectionState::Disconnected;
        *state = ConnectionState::Disconnected;
        was_live
    }
}

// State changes are published while this lock is held, so the bus sees them in slot order.
type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

fn holds(current: &Option<Arc<Connection>>, connection: &Arc<Connection>) -> bool {
    current
        .as_ref()
        .is_some_and(|slot| Arc::ptr_eq(slot, connection))
}

pub struct ConnectionManager {
    connector: Arc<dyn RealtimeConnector>,
    presence: Arc<PresenceTracker>,
    events: broadcast::Sender<ClientEvent>,
    current: Slot,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        presence: Arc<PresenceTracker>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            connector,
            presence,
            events,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current(&self) -> Option<Arc<Connection>> {
        lock(&self.current).clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.current()
            .map(|connection| connection.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Opens the channel for `user_id` unless one is already connected or connecting.
    ///
    /// Connect failures are logged and leave the manager `Disconnected`; they are
    /// never returned to the caller.
    pub(crate) async fn connect(&self, user_id: &UserId) {
        let connection = {
            let mut current = lock(&self.current);
            if let Some(existing) = current.as_ref() {
                if existing.state() != ConnectionState::Disconnected {
                    debug!(
                        user_id = %existing.user_id(),
                        state = ?existing.state(),
                        "realtime: already connected"
                    );
                    return;
                }
            }
            let connection = Arc::new(Connection::new(user_id.clone()));
            self.install_presence_handler(&connection);
            *current = Some(Arc::clone(&connection));
            publish_state(&self.events, ConnectionState::Connecting);
            connection
        };
        info!(user_id = %user_id, "realtime: connecting");

        let stream = match self.connector.open(user_id).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "realtime: connect error");
                connection.close();
                let mut current = lock(&self.current);
                // A disconnect during the handshake already reported the teardown.
                if holds(&current, &connection) {
                    *current = None;
                    publish_state(&self.events, ConnectionState::Disconnected);
                }
                return;
            }
        };

        let current = lock(&self.current);
        if !holds(&current, &connection) {
            debug!(user_id = %user_id, "realtime: connection torn down during handshake");
            return;
        }
        connection.set_state(ConnectionState::Connected);
        connection.attach_reader(tokio::spawn(read_events(
            Arc::clone(&connection),
            stream,
            Arc::clone(&self.current),
            Arc::clone(&self.presence),
            self.events.clone(),
        )));
        publish_state(&self.events, ConnectionState::Connected);
        info!(user_id = %user_id, "realtime: connected");
    }

    /// Closes the current connection, if any. Safe to call repeatedly.
    pub(crate) fn disconnect(&self) {
        let mut current = lock(&self.current);
        let Some(connection) = current.take() else {
            return;
        };
        let was_live = connection.close();
        self.presence.clear();
        if was_live {
            publish_state(&self.events, ConnectionState::Disconnected);
        }
        drop(current);
        info!(user_id = %connection.user_id(), "realtime: disconnected");
    }

    fn install_presence_handler(&self, connection: &Connection) {
        let presence = Arc::clone(&self.presence);
        let events = self.events.clone();
        connection.on(EventKind::OnlineUsers, move |event| {
            if let ServerEvent::OnlineUsers(ids) = event {
                debug!(count = ids.len(), "realtime: online users updated");
                presence.replace(ids.iter().cloned());
                let _ = events.send(ClientEvent::OnlineUsersChanged(presence.online_users()));
            }
        });
    }
}

fn publish_state(events: &broadcast::Sender<ClientEvent>, state: ConnectionState) {
    let _ = events.send(ClientEvent::ConnectionStateChanged(state));
}

async fn read_events(
    connection: Arc<Connection>,
    mut stream: EventStream,
    slot: Slot,
    presence: Arc<PresenceTracker>,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(event) => connection.dispatch(&event),
            Err(RealtimeError::Malformed(err)) => {
                warn!(error = %err, "realtime: skipping malformed frame");
            }
            Err(err) => {
                warn!(user_id = %connection.user_id(), error = %err, "realtime: channel failed");
                break;
            }
        }
    }

    info!(user_id = %connection.user_id(), "realtime: channel closed");
    let current = lock(&slot);
    if !holds(&current, &connection) {
        return;
    }
    presence.clear();
    connection.set_state(ConnectionState::Disconnected);
    publish_state(&events, ConnectionState::Disconnected);
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
