use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

/// A single chat message as held by the session timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub body: String,
    pub attachment_url: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    /// Idempotency key for locally originated sends, echoed back by servers that support it.
    pub client_ref: Option<String>,
    pub delivery: DeliveryStatus,
}

impl Message {
    /// Build an unsent draft from the local user to `receiver_id`.
    pub fn draft(sender_id: &str, receiver_id: &str, body: &str) -> Self {
        Message {
            id: format!("tmp-{}", uuid::Uuid::new_v4()),
            body: body.to_string(),
            attachment_url: None,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            sent_at: Utc::now(),
            is_read: false,
            client_ref: Some(uuid::Uuid::new_v4().to_string()),
            delivery: DeliveryStatus::Sending,
        }
    }

    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        self.receiver_id == user_id
    }

    /// True when the two participants are exactly `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryStatus {
    Sending, // Optimistic entry, not yet acknowledged
    Sent,    // Persisted by the server (also every remote or historical message)
    Failed,  // Send request failed, retryable
}

/// Profile of the conversation peer, as returned by `GET /user/details/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

impl PeerProfile {
    /// Single upper-case initial used when there is no avatar.
    pub fn initial(&self) -> char {
        self.name
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or('?')
    }
}

/// Message as it travels over HTTP and the event channel.
///
/// Every field is optional on the way in so that a malformed payload can be
/// reported instead of failing the whole frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl TryFrom<RawMessage> for Message {
    type Error = crate::chat::ChatError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        use crate::chat::ChatError;

        let id = raw
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChatError::MalformedEvent("message without id".to_string()))?;
        let sender_id = raw
            .sender_id
            .ok_or_else(|| ChatError::MalformedEvent(format!("message {} without sender_id", id)))?;
        let receiver_id = raw
            .receiver_id
            .ok_or_else(|| ChatError::MalformedEvent(format!("message {} without receiver_id", id)))?;

        Ok(Message {
            id,
            body: raw.message.unwrap_or_default(),
            attachment_url: raw.file_url,
            sender_id,
            receiver_id,
            sent_at: raw.timestamp.unwrap_or_else(Utc::now),
            is_read: raw.read.unwrap_or(false),
            client_ref: raw.client_id,
            delivery: DeliveryStatus::Sent,
        })
    }
}

// The backend sends ISO strings from the history endpoint but epoch millis
// from some socket emitters. Anything else is logged and dropped so the
// message falls back to its arrival time instead of failing the whole page.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(value) => value,
        None => return Ok(None),
    };

    let parsed = match &value {
        serde_json::Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        serde_json::Value::Number(number) => number
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        serde_json::Value::Null => return Ok(None),
        _ => None,
    };

    if parsed.is_none() {
        warn!("Ignoring unparseable message timestamp {}", value);
    }
    Ok(parsed)
}

/// Peer connectivity as last reported by the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline, // Also the "unknown" state before the first report
}

impl PresenceStatus {
    pub fn from_online(is_online: bool) -> Self {
        if is_online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == PresenceStatus::Online
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "Online"),
            PresenceStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// Scroll geometry of the conversation view, used for read detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    pub offset_y: f64,
    pub content_height: f64,
    pub viewport_height: f64,
}

impl ViewportMetrics {
    pub fn is_near_bottom(&self, threshold: f64) -> bool {
        self.offset_y >= self.content_height - self.viewport_height - threshold
    }
}
