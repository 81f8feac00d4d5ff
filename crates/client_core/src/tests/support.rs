//! In-process fakes for the transport and realtime seams.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{channel::mpsc, StreamExt};
use serde_json::Value;
use shared::{
    domain::{AuthUser, Correspondent, Message, MessageId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{broadcast, oneshot};

use crate::{
    conversation::ConversationStore,
    error::RealtimeError,
    presence::PresenceTracker,
    realtime::{ConnectionManager, EventStream, RealtimeConnector},
    session::SessionStore,
    transport::{ApiTransport, Method, TransportError},
    ClientEvent, Notice,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

struct Reply {
    result: Result<Value, TransportError>,
    release: Option<oneshot::Receiver<()>>,
}

#[derive(Default)]
pub(crate) struct FakeApi {
    replies: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

fn route(method: Method, path: &str) -> (String, String) {
    (format!("{method:?}"), path.to_string())
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, method: Method, path: &str, result: Result<Value, TransportError>) {
        self.replies
            .lock()
            .expect("replies")
            .entry(route(method, path))
            .or_default()
            .push_back(Reply {
                result,
                release: None,
            });
    }

    /// Queues a reply that is held back until the returned sender fires.
    pub fn reply_gated(
        &self,
        method: Method,
        path: &str,
        result: Result<Value, TransportError>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .expect("replies")
            .entry(route(method, path))
            .or_default()
            .push_back(Reply {
                result,
                release: Some(rx),
            });
        tx
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl ApiTransport for FakeApi {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.requests.lock().expect("requests").push(RecordedRequest {
            method,
            path: path.to_string(),
            body,
        });
        let reply = self
            .replies
            .lock()
            .expect("replies")
            .get_mut(&route(method, path))
            .and_then(VecDeque::pop_front);
        let Some(reply) = reply else {
            return Err(TransportError::Network(format!("no fake reply for {path}")));
        };
        if let Some(release) = reply.release {
            let _ = release.await;
        }
        reply.result
    }
}

pub(crate) fn server_error(status: u16, message: &str) -> TransportError {
    TransportError::Server {
        status,
        message: Some(message.to_string()),
    }
}

type FrameSender = mpsc::UnboundedSender<Result<ServerEvent, RealtimeError>>;

#[derive(Default)]
pub(crate) struct FakeConnector {
    opened: Mutex<Vec<UserId>>,
    refuse: AtomicBool,
    channels: Mutex<Vec<FrameSender>>,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let connector = Self::default();
        connector.refuse.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    /// Holds the next handshake open until the returned sender fires.
    pub fn hold_next_open(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock().expect("hold") = Some(rx);
        tx
    }

    pub fn opened(&self) -> Vec<UserId> {
        self.opened.lock().expect("opened").clone()
    }

    pub fn push(&self, frame: Result<ServerEvent, RealtimeError>) {
        let channels = self.channels.lock().expect("channels");
        let latest = channels.last().expect("no channel opened");
        latest.unbounded_send(frame).expect("channel open");
    }

    /// Ends the most recent channel as if the server hung up.
    pub fn hang_up(&self) {
        if let Some(latest) = self.channels.lock().expect("channels").pop() {
            latest.close_channel();
        }
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn open(&self, user_id: &UserId) -> Result<EventStream, RealtimeError> {
        self.opened.lock().expect("opened").push(user_id.clone());
        let hold = self.hold.lock().expect("hold").take();
        if let Some(hold) = hold {
            let _ = hold.await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RealtimeError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        self.channels.lock().expect("channels").push(tx);
        Ok(rx.boxed())
    }
}

pub(crate) struct Harness {
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
    pub connection: Arc<ConnectionManager>,
    pub session: SessionStore,
    pub conversations: ConversationStore,
    pub events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_connector(FakeConnector::new())
    }

    pub fn with_connector(connector: Arc<FakeConnector>) -> Self {
        let api = FakeApi::new();
        let (events_tx, events) = broadcast::channel(256);
        let connection = Arc::new(ConnectionManager::new(
            connector.clone(),
            Arc::new(PresenceTracker::new()),
            events_tx.clone(),
        ));
        let session = SessionStore::new(api.clone(), Arc::clone(&connection), events_tx.clone());
        let conversations =
            ConversationStore::new(api.clone(), Arc::clone(&connection), events_tx);
        Self {
            api,
            connector,
            connection,
            session,
            conversations,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Notice(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

pub(crate) fn auth_user(id: &str) -> AuthUser {
    AuthUser {
        id: UserId::from(id),
        full_name: format!("User {id}"),
        email: format!("{id}@example.com"),
        profile_pic: String::new(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
    }
}

pub(crate) fn correspondent(id: &str) -> Correspondent {
    Correspondent {
        id: UserId::from(id),
        full_name: format!("User {id}"),
        profile_pic: String::new(),
    }
}

pub(crate) fn message(id: &str, sender: &str, receiver: &str, text: &str) -> Message {
    Message {
        id: MessageId::from(id),
        sender_id: UserId::from(sender),
        receiver_id: UserId::from(receiver),
        text: Some(text.to_string()),
        image: None,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("serialize fixture")
}
