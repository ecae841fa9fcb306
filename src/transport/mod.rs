// Transport layer for chatsync
// HTTP request/response calls and the bidirectional event channel the
// chat session is fed from. Both sit behind traits so the session can be
// driven by the real backend or by in-process fakes.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use crate::chat::ChatError;
use crate::models::{PeerProfile, RawMessage};

pub mod http;
pub mod memory;
pub mod socket;
pub mod socket_io;

pub use http::HttpChatApi;
pub use memory::MemoryChannel;
pub use socket::SocketChannel;

// Event names used on the wire
pub mod event_names {
    pub const JOIN: &str = "join";
    pub const CHECK_ONLINE_STATUS: &str = "checkOnlineStatus";
    pub const MESSAGE_READ: &str = "messageRead";
    pub const USER_ONLINE: &str = "userOnline";
    pub const USER_OFFLINE: &str = "userOffline";
    pub const ONLINE_STATUS_RESPONSE: &str = "onlineStatusResponse";
    pub const RECEIVE_MESSAGE: &str = "receiveMessage";
    pub const MESSAGE_READ_UPDATE: &str = "messageReadUpdate";
}

/// Events pushed to us by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    UserOnline(String),
    UserOffline(String),
    OnlineStatusResponse { user_id: String, is_online: bool },
    ReceiveMessage(RawMessage),
    MessageReadUpdate { message_id: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineStatusPayload {
    user_id: String,
    #[serde(default)]
    is_online: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadUpdatePayload {
    message_id: String,
}

impl InboundEvent {
    /// Decode a named event and its first argument.
    ///
    /// Returns `Ok(None)` for events this client does not listen to.
    pub fn from_wire(name: &str, data: Value) -> Result<Option<Self>, ChatError> {
        let malformed = |e: serde_json::Error| ChatError::MalformedEvent(format!("{}: {}", name, e));

        let event = match name {
            event_names::USER_ONLINE => InboundEvent::UserOnline(user_id_from(name, data)?),
            event_names::USER_OFFLINE => InboundEvent::UserOffline(user_id_from(name, data)?),
            event_names::ONLINE_STATUS_RESPONSE => {
                let payload: OnlineStatusPayload = serde_json::from_value(data).map_err(malformed)?;
                InboundEvent::OnlineStatusResponse {
                    user_id: payload.user_id,
                    is_online: payload.is_online,
                }
            }
            event_names::RECEIVE_MESSAGE => {
                InboundEvent::ReceiveMessage(serde_json::from_value(data).map_err(malformed)?)
            }
            event_names::MESSAGE_READ_UPDATE => {
                let payload: ReadUpdatePayload = serde_json::from_value(data).map_err(malformed)?;
                InboundEvent::MessageReadUpdate {
                    message_id: payload.message_id,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

// Presence events carry either a bare id or `{ "userId": ... }` depending on the emitter.
fn user_id_from(name: &str, data: Value) -> Result<String, ChatError> {
    match data {
        Value::String(id) if !id.is_empty() => Ok(id),
        Value::Object(ref map) => map
            .get("userId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::MalformedEvent(format!("{}: missing userId", name))),
        other => Err(ChatError::MalformedEvent(format!("{}: unexpected payload {}", name, other))),
    }
}

/// Read acknowledgement sent to the original sender of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAck {
    pub message_id: String,
    pub reader_id: String,
    pub sender_id: String,
}

/// Events we emit to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Join(String),
    CheckOnlineStatus(String),
    MessageRead(ReadAck),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Join(_) => event_names::JOIN,
            OutboundEvent::CheckOnlineStatus(_) => event_names::CHECK_ONLINE_STATUS,
            OutboundEvent::MessageRead(_) => event_names::MESSAGE_READ,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::Join(user_id) => json!(user_id),
            OutboundEvent::CheckOnlineStatus(peer_id) => json!(peer_id),
            OutboundEvent::MessageRead(ack) => json!(ack),
        }
    }
}

/// Body of a `POST /chat/send` request.
#[derive(Debug, Clone, PartialEq)]
pub enum SendRequest {
    Text {
        receiver_id: String,
        message: String,
        client_id: Option<String>,
    },
    Image {
        receiver_id: String,
        file_name: String,
        bytes: Vec<u8>,
        mime: String,
        client_id: Option<String>,
    },
}

/// Request/response side of the backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_peer(&self, peer_id: &str) -> Result<PeerProfile>;
    async fn fetch_history(&self, peer_id: &str) -> Result<Vec<RawMessage>>;
    /// Persist a message and return the stored copy with its permanent id.
    async fn send_message(&self, request: SendRequest) -> Result<RawMessage>;
}

/// Push side of the backend. One connection is shared by the whole process;
/// each chat session holds its own [`Subscription`].
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Queue an event for delivery. Fire and forget.
    fn emit(&self, event: OutboundEvent) -> Result<()>;
    fn subscribe(&self) -> Subscription;
    async fn disconnect(&self) -> Result<()>;
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<InboundEvent>)>,
    // Set once the channel has shut down; later subscriptions start closed
    closed: bool,
}

/// Fan-out registry shared between a channel implementation and the
/// subscriptions it hands out.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<SubscriberList>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // Id 0 is never registered; its sender is dropped here so `recv` ends at once
        let id = match self.inner.lock() {
            Ok(mut list) if !list.closed => {
                list.next_id += 1;
                let id = list.next_id;
                list.senders.push((id, tx));
                debug!("Registered event subscription {}", id);
                id
            }
            Ok(_) => {
                warn!("Event channel is shut down, handing out a closed subscription");
                0
            }
            Err(_) => {
                error!("Failed to lock subscriber list, handing out a closed subscription");
                0
            }
        };

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every live subscriber, dropping closed ones.
    pub fn broadcast(&self, event: &InboundEvent) {
        if let Ok(mut list) = self.inner.lock() {
            list.senders.retain(|(id, tx)| {
                let alive = tx.send(event.clone()).is_ok();
                if !alive {
                    debug!("Subscription {} closed, removing", id);
                }
                alive
            });
        } else {
            error!("Failed to lock subscriber list");
        }
    }

    /// Drop every sender so that pending `recv` calls observe the end of the stream.
    pub fn close_all(&self) {
        if let Ok(mut list) = self.inner.lock() {
            list.closed = true;
            list.senders.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|list| list.senders.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a stream of inbound events. Unregisters itself when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
    registry: Weak<Mutex<SubscriberList>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the channel has been shut down.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut list) = registry.lock() {
                list.senders.retain(|(id, _)| *id != self.id);
                debug!("Removed event subscription {}", self.id);
            }
        }
    }
}
