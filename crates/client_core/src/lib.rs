use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use shared::domain::{AuthUser, Correspondent, Message, UserId};
use tokio::sync::broadcast;

pub mod config;
pub mod conversation;
pub mod error;
pub mod presence;
pub mod realtime;
pub mod session;
pub mod transport;

pub use config::{load_settings_from, ClientSettings};
pub use conversation::{ConversationStore, ImagePayload, MessageDraft};
pub use error::{ClientError, RealtimeError};
pub use presence::PresenceTracker;
pub use realtime::{
    Connection, ConnectionManager, ConnectionState, EventStream, RealtimeConnector, WsConnector,
};
pub use session::{SessionGate, SessionStore};
pub use transport::{ApiTransport, HttpTransport, Method, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// User-visible notification (a toast, a status line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Notice(Notice),
    SessionChanged(Option<AuthUser>),
    ConnectionStateChanged(ConnectionState),
    OnlineUsersChanged(Vec<UserId>),
    /// An incoming message from the selected correspondent was appended.
    MessageReceived(Message),
}

/// The stores wired together around one connection manager and one event bus.
pub struct ChatClient {
    session: Arc<SessionStore>,
    conversations: Arc<ConversationStore>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, TransportError> {
        let api = Arc::new(HttpTransport::new(settings.api_url.clone())?);
        let connector = Arc::new(WsConnector::new(settings.clone()));
        Ok(Self::with_dependencies(api, connector))
    }

    pub fn with_dependencies(
        api: Arc<dyn ApiTransport>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let presence = Arc::new(PresenceTracker::new());
        let connection = Arc::new(ConnectionManager::new(
            connector,
            presence,
            events.clone(),
        ));
        let session = Arc::new(SessionStore::new(
            Arc::clone(&api),
            Arc::clone(&connection),
            events.clone(),
        ));
        let conversations = Arc::new(ConversationStore::new(
            api,
            Arc::clone(&connection),
            events.clone(),
        ));
        Self {
            session,
            conversations,
            connection,
            events,
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn presence(&self) -> &PresenceTracker {
        self.connection.presence()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Selects `correspondent`, moves the message subscription over to it, then
    /// loads its history.
    pub async fn open_conversation(
        &self,
        correspondent: Correspondent,
    ) -> Result<Vec<Message>, ClientError> {
        let correspondent_id = correspondent.id.clone();
        self.conversations
            .set_selected_correspondent(Some(correspondent));
        self.conversations.subscribe_to_messages();
        self.conversations.get_messages(&correspondent_id).await
    }

    pub fn close_conversation(&self) {
        self.conversations.unsubscribe_from_messages();
        self.conversations.set_selected_correspondent(None);
    }
}

// State locks are never held across an await. A poisoned lock is recovered as-is.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a busy flag raised until the guard drops. With `counting`, each drop
/// also bumps a completion counter.
pub(crate) struct InFlight<'a> {
    flag: &'a AtomicBool,
    completions: Option<&'a AtomicU64>,
}

impl<'a> InFlight<'a> {
    pub(crate) fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self {
            flag,
            completions: None,
        }
    }

    pub(crate) fn counting(mut self, completions: &'a AtomicU64) -> Self {
        self.completions = Some(completions);
        self
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        if let Some(completions) = self.completions {
            completions.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
