// Chat session reconciliation
// A ChatSession merges fetched history, optimistic local sends and pushed
// events into one ordered timeline, and tracks peer presence and read state.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod history;
pub mod presence;
pub mod read_receipts;
pub mod store;

pub use presence::PresenceTracker;
pub use store::{Ingest, MessageStore};

use crate::models::{DeliveryStatus, Message, PeerProfile, PresenceStatus, ViewportMetrics};
use crate::transport::{ChatApi, EventChannel, InboundEvent, OutboundEvent, SendRequest, Subscription};

/// Errors raised by the chat session
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("Chat not available: {0}")]
    Unavailable(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Message {0} is not awaiting a retry")]
    NotRetryable(String),

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("Event channel closed")]
    ChannelClosed,
}

/// Tunables for a chat session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Distance from the bottom of the view, in layout units, that still counts as "near".
    pub near_bottom_threshold: f64,
    /// Acknowledge messages as they arrive while the session is active.
    pub ack_on_arrival: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            near_bottom_threshold: 50.0,
            ack_on_arrival: true,
        }
    }
}

/// What an inbound event changed, so a front end knows what to redraw.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Timeline,
    Presence(PresenceStatus),
    Ignored,
}

pub struct ChatSession {
    local_user_id: String,
    peer: PeerProfile,
    store: MessageStore,
    presence: PresenceTracker,
    api: Arc<dyn ChatApi>,
    channel: Arc<dyn EventChannel>,
    subscription: Option<Subscription>,
    // Requests of sends not yet confirmed, kept for retries
    outgoing: HashMap<String, SendRequest>,
    // Staged sends whose pushed echo arrived before they were delivered
    confirmed_by_echo: HashMap<String, String>,
    active: bool,
    config: SessionConfig,
}

impl ChatSession {
    /// Open the conversation with `peer_id`.
    ///
    /// The subscription is taken before the history fetch so that events
    /// pushed meanwhile are queued and applied after the history is in place.
    pub async fn open(
        api: Arc<dyn ChatApi>,
        channel: Arc<dyn EventChannel>,
        local_user_id: &str,
        peer_id: &str,
        config: SessionConfig,
    ) -> Result<Self, ChatError> {
        info!("Opening chat session with {}", peer_id);
        let subscription = channel.subscribe();

        if let Err(e) = channel.emit(OutboundEvent::Join(local_user_id.to_string())) {
            warn!("Failed to join room {}: {}", local_user_id, e);
        }

        let mut presence = PresenceTracker::new(peer_id);
        if let Err(e) = presence.request_status(channel.as_ref()) {
            warn!("Failed to request online status of {}: {}", peer_id, e);
        }

        let (peer, history) = history::load_conversation(api.as_ref(), peer_id).await?;

        let mut store = MessageStore::new();
        let loaded = store.load_history(history);
        info!("Chat session with {} ready ({} messages)", peer.name, loaded);

        Ok(ChatSession {
            local_user_id: local_user_id.to_string(),
            peer,
            store,
            presence,
            api,
            channel,
            subscription: Some(subscription),
            outgoing: HashMap::new(),
            confirmed_by_echo: HashMap::new(),
            active: true,
            config,
        })
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn peer(&self) -> &PeerProfile {
        &self.peer
    }

    pub fn presence(&self) -> PresenceStatus {
        self.presence.current()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Foreground/background switch. Arrivals are only acknowledged while active.
    pub fn set_active(&mut self, active: bool) {
        debug!("Chat session with {} active: {}", self.presence.peer_id(), active);
        self.active = active;
    }

    /// Apply one inbound event to the session state.
    pub fn handle_event(&mut self, event: InboundEvent) -> SessionUpdate {
        match event {
            InboundEvent::UserOnline(user_id) => {
                let changed = self.presence.on_online(&user_id);
                self.presence_update(changed)
            }
            InboundEvent::UserOffline(user_id) => {
                let changed = self.presence.on_offline(&user_id);
                self.presence_update(changed)
            }
            InboundEvent::OnlineStatusResponse { user_id, is_online } => {
                let changed = self.presence.on_status_response(&user_id, is_online);
                self.presence_update(changed)
            }
            InboundEvent::ReceiveMessage(raw) => match Message::try_from(raw) {
                Ok(message) => self.receive(message),
                Err(e) => {
                    warn!("Discarding pushed message: {}", e);
                    SessionUpdate::Ignored
                }
            },
            InboundEvent::MessageReadUpdate { message_id } => {
                if read_receipts::apply_read_update(&mut self.store, &self.local_user_id, &message_id) {
                    debug!("Message {} was read by {}", message_id, self.presence.peer_id());
                    SessionUpdate::Timeline
                } else {
                    SessionUpdate::Ignored
                }
            }
        }
    }

    /// Wait for the next inbound event and apply it.
    pub async fn next_update(&mut self) -> Result<SessionUpdate, ChatError> {
        let subscription = self.subscription.as_mut().ok_or(ChatError::ChannelClosed)?;
        let event = subscription.recv().await;
        match event {
            Some(event) => Ok(self.handle_event(event)),
            None => Err(ChatError::ChannelClosed),
        }
    }

    /// Apply every event already queued, without waiting.
    pub fn drain_events(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        loop {
            let event = match self.subscription.as_mut().and_then(Subscription::try_recv) {
                Some(event) => event,
                None => break,
            };
            updates.push(self.handle_event(event));
        }
        updates
    }

    /// Send a text message: stage it, then deliver it.
    ///
    /// On failure the entry stays in the timeline as `Failed` and the error is
    /// returned; [`ChatSession::retry_send`] sends it again.
    pub async fn send_text(&mut self, body: &str) -> Result<String, ChatError> {
        let temp_id = self.stage_text(body)?;
        self.deliver(&temp_id).await
    }

    pub async fn send_image(&mut self, file_name: &str, bytes: Vec<u8>, mime: &str) -> Result<String, ChatError> {
        let temp_id = self.stage_image(file_name, bytes, mime);
        self.deliver(&temp_id).await
    }

    /// Put a text message in the timeline without waiting for the server.
    /// Returns its temporary id, to be passed to [`ChatSession::deliver`].
    pub fn stage_text(&mut self, body: &str) -> Result<String, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let draft = Message::draft(&self.local_user_id, self.presence.peer_id(), body);
        let request = SendRequest::Text {
            receiver_id: draft.receiver_id.clone(),
            message: body.to_string(),
            client_id: draft.client_ref.clone(),
        };
        Ok(self.stage(draft, request))
    }

    pub fn stage_image(&mut self, file_name: &str, bytes: Vec<u8>, mime: &str) -> String {
        let draft = Message::draft(&self.local_user_id, self.presence.peer_id(), file_name);
        let request = SendRequest::Image {
            receiver_id: draft.receiver_id.clone(),
            file_name: file_name.to_string(),
            bytes,
            mime: mime.to_string(),
            client_id: draft.client_ref.clone(),
        };
        self.stage(draft, request)
    }

    /// Issue the send request for a staged message and reconcile the result.
    pub async fn deliver(&mut self, temp_id: &str) -> Result<String, ChatError> {
        if let Some(id) = self.confirmed_by_echo.remove(temp_id) {
            debug!("Message {} already confirmed by its echo as {}", temp_id, id);
            return Ok(id);
        }
        self.dispatch(temp_id).await
    }

    /// Resend a message whose earlier attempt failed.
    pub async fn retry_send(&mut self, temp_id: &str) -> Result<String, ChatError> {
        if !self.outgoing.contains_key(temp_id) {
            return Err(ChatError::UnknownMessage(temp_id.to_string()));
        }
        if !self.store.mark_sending(temp_id) {
            return Err(ChatError::NotRetryable(temp_id.to_string()));
        }
        info!("Retrying send of {}", temp_id);
        self.dispatch(temp_id).await
    }

    /// Messages whose last send attempt failed.
    pub fn failed_messages(&self) -> Vec<&Message> {
        self.store
            .iter()
            .filter(|m| m.delivery == DeliveryStatus::Failed)
            .collect()
    }

    /// Read detection from scroll position: when the view is near the bottom,
    /// every unread message addressed to us is acknowledged.
    pub fn on_viewport(&mut self, metrics: ViewportMetrics) -> Vec<String> {
        if !metrics.is_near_bottom(self.config.near_bottom_threshold) {
            return Vec::new();
        }
        self.acknowledge_visible()
    }

    /// Acknowledge every unread message addressed to us.
    pub fn acknowledge_visible(&mut self) -> Vec<String> {
        read_receipts::acknowledge_all(&mut self.store, self.channel.as_ref(), &self.local_user_id)
    }

    /// Acknowledge a single message, e.g. when it is tapped.
    pub fn acknowledge(&mut self, message_id: &str) -> bool {
        read_receipts::acknowledge(&mut self.store, self.channel.as_ref(), &self.local_user_id, message_id)
    }

    /// End the session and release its event subscription.
    pub fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            debug!("Releasing subscription {}", subscription.id());
        }
        if !self.outgoing.is_empty() {
            warn!("Closing chat session with {} unconfirmed sends", self.outgoing.len());
        }
        info!("Closed chat session with {}", self.presence.peer_id());
    }

    fn presence_update(&self, changed: bool) -> SessionUpdate {
        if changed {
            SessionUpdate::Presence(self.presence.current())
        } else {
            SessionUpdate::Ignored
        }
    }

    fn receive(&mut self, message: Message) -> SessionUpdate {
        if !message.is_between(&self.local_user_id, self.presence.peer_id()) {
            debug!("Ignoring message {} from another conversation", message.id);
            return SessionUpdate::Ignored;
        }

        let id = message.id.clone();
        // A failed send is never delivered again, only staged ones wait for `deliver`
        let echoes_staged = self.echoes_staged_send(&message);
        match self.store.ingest_remote(message) {
            Ingest::Duplicate => return SessionUpdate::Ignored,
            Ingest::Resolved { temp_id } => {
                debug!("Pushed echo {} confirmed pending send {}", id, temp_id);
                self.outgoing.remove(&temp_id);
                if echoes_staged {
                    self.confirmed_by_echo.insert(temp_id, id.clone());
                }
            }
            Ingest::Inserted => {}
        }

        if self.active && self.config.ack_on_arrival {
            self.acknowledge(&id);
        }
        SessionUpdate::Timeline
    }

    fn echoes_staged_send(&self, message: &Message) -> bool {
        let Some(client_ref) = message.client_ref.as_deref() else {
            return false;
        };
        self.store.iter().any(|m| {
            m.client_ref.as_deref() == Some(client_ref)
                && m.delivery == DeliveryStatus::Sending
                && self.store.is_pending(&m.id)
        })
    }

    fn stage(&mut self, draft: Message, request: SendRequest) -> String {
        let temp_id = self.store.append_optimistic(draft);
        self.outgoing.insert(temp_id.clone(), request);
        debug!("Staged message {}", temp_id);
        temp_id
    }

    async fn dispatch(&mut self, temp_id: &str) -> Result<String, ChatError> {
        let request = self
            .outgoing
            .get(temp_id)
            .cloned()
            .ok_or_else(|| ChatError::UnknownMessage(temp_id.to_string()))?;

        let result = self
            .api
            .send_message(request)
            .await
            .map_err(ChatError::from)
            .and_then(Message::try_from);

        match result {
            Ok(confirmed) => {
                let id = confirmed.id.clone();
                self.store.resolve_optimistic(temp_id, confirmed);
                self.outgoing.remove(temp_id);
                info!("Message {} confirmed as {}", temp_id, id);
                Ok(id)
            }
            Err(e) => {
                error!("Failed to send message {}: {}", temp_id, e);
                self.store.fail_optimistic(temp_id);
                Err(e)
            }
        }
    }
}
