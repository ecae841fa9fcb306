// Common test utilities for integration tests
// A scripted request/response backend plus builders for wire payloads.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::LevelFilter;
use serde_json::{json, Value};

use chatsync::transport::{ChatApi, MemoryChannel, SendRequest};
use chatsync::{ChatSession, PeerProfile, RawMessage, SessionConfig};

pub const LOCAL: &str = "me";
pub const PEER: &str = "peer";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

#[derive(Default)]
struct Script {
    peer_fails: bool,
    history_fails: bool,
    history: Vec<RawMessage>,
    // Outcome of each upcoming send, consumed in order. Empty means success.
    send_outcomes: VecDeque<Result<(), String>>,
    next_server_id: u32,
    sent: Vec<SendRequest>,
}

/// Request/response backend driven by a script instead of a server.
///
/// Successful sends return a copy with ids `srv1`, `srv2`, ... and echo the
/// request's `client_id`.
#[derive(Clone, Default)]
pub struct ScriptedApi {
    script: Arc<Mutex<Script>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: Vec<RawMessage>) -> Self {
        let api = Self::new();
        api.script.lock().unwrap().history = history;
        api
    }

    pub fn failing_history() -> Self {
        let api = Self::new();
        api.script.lock().unwrap().history_fails = true;
        api
    }

    pub fn failing_peer() -> Self {
        let api = Self::new();
        api.script.lock().unwrap().peer_fails = true;
        api
    }

    pub fn fail_next_send(&self, reason: &str) {
        self.script
            .lock()
            .unwrap()
            .send_outcomes
            .push_back(Err(reason.to_string()));
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.script.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn fetch_peer(&self, peer_id: &str) -> Result<PeerProfile> {
        if self.script.lock().unwrap().peer_fails {
            return Err(anyhow!("HTTP error 404: user not found"));
        }
        Ok(PeerProfile {
            id: peer_id.to_string(),
            name: "sam".to_string(),
            profile_image: None,
        })
    }

    async fn fetch_history(&self, _peer_id: &str) -> Result<Vec<RawMessage>> {
        let script = self.script.lock().unwrap();
        if script.history_fails {
            return Err(anyhow!("connection refused"));
        }
        Ok(script.history.clone())
    }

    async fn send_message(&self, request: SendRequest) -> Result<RawMessage> {
        let mut script = self.script.lock().unwrap();
        script.sent.push(request.clone());
        if let Some(Err(reason)) = script.send_outcomes.pop_front() {
            return Err(anyhow!(reason));
        }

        script.next_server_id += 1;
        let id = format!("srv{}", script.next_server_id);
        let stored = match request {
            SendRequest::Text {
                receiver_id,
                message,
                client_id,
            } => RawMessage {
                id: Some(id),
                message: Some(message),
                sender_id: Some(LOCAL.to_string()),
                receiver_id: Some(receiver_id),
                timestamp: Some(chrono::Utc::now()),
                read: Some(false),
                client_id,
                ..RawMessage::default()
            },
            SendRequest::Image {
                receiver_id,
                file_name,
                client_id,
                ..
            } => RawMessage {
                id: Some(id),
                message: Some(file_name.clone()),
                file_url: Some(format!("https://cdn.example.com/{}", file_name)),
                sender_id: Some(LOCAL.to_string()),
                receiver_id: Some(receiver_id),
                timestamp: Some(chrono::Utc::now()),
                read: Some(false),
                client_id,
            },
        };
        Ok(stored)
    }
}

/// Wire payload of a stored message, as the history endpoint and
/// `receiveMessage` carry it.
pub fn wire_message(id: &str, sender: &str, receiver: &str, body: &str, timestamp: &str, read: bool) -> Value {
    json!({
        "_id": id,
        "message": body,
        "sender_id": sender,
        "receiver_id": receiver,
        "timestamp": timestamp,
        "read": read
    })
}

pub fn raw_message(id: &str, sender: &str, receiver: &str, body: &str, timestamp: &str, read: bool) -> RawMessage {
    serde_json::from_value(wire_message(id, sender, receiver, body, timestamp, read)).unwrap()
}

/// Open a session between LOCAL and PEER over the given fakes.
pub async fn open_session(api: &ScriptedApi, channel: &MemoryChannel) -> ChatSession {
    setup_logging();
    ChatSession::open(
        Arc::new(api.clone()),
        Arc::new(channel.clone()),
        LOCAL,
        PEER,
        SessionConfig::default(),
    )
    .await
    .expect("session should open")
}
