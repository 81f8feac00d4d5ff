use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    domain::{Correspondent, Message, UserId},
    protocol::{EventKind, SendMessageRequest, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    lock,
    realtime::{Connection, ConnectionManager, HandlerId},
    transport::{get_json, send_json, ApiTransport, Method},
    ClientEvent, InFlight, Notice,
};

const USERS_FAILED: &str = "Failed to load users";
const MESSAGES_FAILED: &str = "Failed to load messages";
const SEND_FAILED: &str = "Failed to send message";

/// Image attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// `data:image/png;base64,....` as produced by a file picker, or bare base64.
    DataUri(String),
    Bytes(Vec<u8>),
}

impl ImagePayload {
    /// Base64 body without any data-URI prefix.
    pub fn encode(&self) -> String {
        match self {
            ImagePayload::DataUri(raw) => match raw.split_once(',') {
                Some((_, data)) => data.to_string(),
                None => raw.clone(),
            },
            ImagePayload::Bytes(bytes) => STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDraft {
    pub text: Option<String>,
    pub image: Option<ImagePayload>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn image(image: ImagePayload) -> Self {
        Self {
            text: None,
            image: Some(image),
        }
    }

    /// Wire body, or `None` when the draft carries neither text nor an image.
    pub fn into_request(self) -> Option<SendMessageRequest> {
        let text = self.text.filter(|text| !text.trim().is_empty());
        let image = self
            .image
            .map(|image| image.encode())
            .filter(|encoded| !encoded.is_empty());
        if text.is_none() && image.is_none() {
            return None;
        }
        Some(SendMessageRequest { text, image })
    }
}

#[derive(Default)]
struct ConversationState {
    users: Vec<Correspondent>,
    selected: Option<Correspondent>,
    messages: Vec<Message>,
    // Bumped by every history fetch and selection change; a fetch whose epoch is
    // no longer current lost the race and is not applied.
    history_epoch: u64,
}

impl ConversationState {
    fn selected_id(&self) -> Option<&UserId> {
        self.selected.as_ref().map(|correspondent| &correspondent.id)
    }

    fn append(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|known| known.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

/// Handle for the incoming-message handler. Releasing it removes the handler.
pub struct MessageSubscription {
    connection: Arc<Connection>,
    handler: HandlerId,
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.connection.off(self.handler);
    }
}

/// Correspondent list, current selection and the selected conversation's history.
pub struct ConversationStore {
    api: Arc<dyn ApiTransport>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
    state: Arc<Mutex<ConversationState>>,
    subscription: Mutex<Option<MessageSubscription>>,
    is_users_loading: AtomicBool,
    is_messages_loading: AtomicBool,
}

impl ConversationStore {
    pub fn new(
        api: Arc<dyn ApiTransport>,
        connection: Arc<ConnectionManager>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            connection,
            events,
            state: Arc::new(Mutex::new(ConversationState::default())),
            subscription: Mutex::new(None),
            is_users_loading: AtomicBool::new(false),
            is_messages_loading: AtomicBool::new(false),
        }
    }

    pub fn users(&self) -> Vec<Correspondent> {
        lock(&self.state).users.clone()
    }

    pub fn selected_correspondent(&self) -> Option<Correspondent> {
        lock(&self.state).selected.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.state).messages.clone()
    }

    pub fn is_users_loading(&self) -> bool {
        self.is_users_loading.load(Ordering::Acquire)
    }

    pub fn is_messages_loading(&self) -> bool {
        self.is_messages_loading.load(Ordering::Acquire)
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    /// Refreshes the correspondent list. On failure the cached list is kept.
    pub async fn get_users(&self) -> Result<Vec<Correspondent>, ClientError> {
        let _loading = InFlight::raise(&self.is_users_loading);
        match get_json::<Vec<Correspondent>>(self.api.as_ref(), "/message/users").await {
            Ok(users) => {
                lock(&self.state).users = users.clone();
                Ok(users)
            }
            Err(err) => Err(self.fail(err.into(), USERS_FAILED)),
        }
    }

    /// Fetches the history with `correspondent_id` and replaces the local one with it.
    ///
    /// The fetched list is always returned; it is only applied when no newer fetch
    /// or selection change happened while it was in flight.
    pub async fn get_messages(
        &self,
        correspondent_id: &UserId,
    ) -> Result<Vec<Message>, ClientError> {
        let _loading = InFlight::raise(&self.is_messages_loading);
        let epoch = {
            let mut state = lock(&self.state);
            state.history_epoch += 1;
            state.history_epoch
        };

        let path = format!("/message/{correspondent_id}");
        match get_json::<Vec<Message>>(self.api.as_ref(), &path).await {
            Ok(messages) => {
                let mut state = lock(&self.state);
                if state.history_epoch == epoch {
                    state.messages = messages.clone();
                } else {
                    debug!(
                        correspondent_id = %correspondent_id,
                        "discarding history superseded while in flight"
                    );
                }
                Ok(messages)
            }
            Err(err) => Err(self.fail(err.into(), MESSAGES_FAILED)),
        }
    }

    /// Changes the selection only. Callers fetch history and resubscribe themselves.
    pub fn set_selected_correspondent(&self, correspondent: Option<Correspondent>) {
        let mut state = lock(&self.state);
        let changed = state.selected_id() != correspondent.as_ref().map(|c| &c.id);
        if changed {
            state.history_epoch += 1;
        }
        state.selected = correspondent;
    }

    pub async fn send_message(&self, draft: MessageDraft) -> Result<Message, ClientError> {
        let Some(recipient) = self.selected_correspondent() else {
            return Err(self.fail(ClientError::NoRecipient, SEND_FAILED));
        };
        let Some(request) = draft.into_request() else {
            return Err(self.fail(ClientError::EmptyMessage, SEND_FAILED));
        };

        debug!(
            recipient_id = %recipient.id,
            has_text = request.text.is_some(),
            has_image = request.image.is_some(),
            "sending message"
        );
        let path = format!("/message/send/{}", recipient.id);
        match send_json::<_, Message>(self.api.as_ref(), Method::Post, &path, Some(&request))
            .await
        {
            Ok(message) => {
                lock(&self.state).append(message.clone());
                Ok(message)
            }
            Err(err) => Err(self.fail(err.into(), SEND_FAILED)),
        }
    }

    /// Installs the incoming-message handler on the live connection, replacing any
    /// previous one. Returns `false`, leaving any existing handler in place, when
    /// nothing is selected or no connection exists.
    pub fn subscribe_to_messages(&self) -> bool {
        let mut slot = lock(&self.subscription);

        let Some(selected_id) = lock(&self.state).selected_id().cloned() else {
            return false;
        };
        let Some(connection) = self.connection.current() else {
            debug!(correspondent_id = %selected_id, "no realtime connection to subscribe on");
            return false;
        };

        slot.take();
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let handler = connection.on(EventKind::NewMessage, move |event| {
            let ServerEvent::NewMessage(message) = event else {
                return;
            };
            let accepted = {
                let mut state = lock(&state);
                // Checked per delivery so a selection change takes effect immediately.
                state.selected_id() == Some(&message.sender_id) && state.append(message.clone())
            };
            if accepted {
                let _ = events.send(ClientEvent::MessageReceived(message.clone()));
            }
        });
        info!(correspondent_id = %selected_id, "subscribed to incoming messages");
        *slot = Some(MessageSubscription {
            connection,
            handler,
        });
        true
    }

    pub fn unsubscribe_from_messages(&self) {
        if lock(&self.subscription).take().is_some() {
            debug!("unsubscribed from incoming messages");
        }
    }

    fn fail(&self, err: ClientError, fallback: &str) -> ClientError {
        warn!(error = %err, notice = fallback, "conversation operation failed");
        let _ = self
            .events
            .send(ClientEvent::Notice(Notice::error(err.notice_text(fallback))));
        err
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
