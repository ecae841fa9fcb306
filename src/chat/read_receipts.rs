// Read receipt propagation
// Marking a received message read is a local update plus a one-way
// `messageRead` emission to the original sender. The two are not atomic:
// a failed emission is logged and the local read state is kept.

use log::{debug, warn};

use super::store::MessageStore;
use crate::models::Message;
use crate::transport::{EventChannel, OutboundEvent, ReadAck};

/// A message needs acknowledging when it was sent to us by someone else and
/// has not been read yet.
pub fn is_eligible(message: &Message, local_user_id: &str) -> bool {
    message.is_addressed_to(local_user_id) && message.sender_id != local_user_id && !message.is_read
}

/// Mark one message read and tell its sender. Returns false when the
/// message is unknown or not eligible.
pub fn acknowledge(
    store: &mut MessageStore,
    channel: &dyn EventChannel,
    local_user_id: &str,
    message_id: &str,
) -> bool {
    let sender_id = match store.get(message_id) {
        Some(message) if is_eligible(message, local_user_id) => message.sender_id.clone(),
        Some(_) => return false,
        None => {
            debug!("Cannot acknowledge unknown message {}", message_id);
            return false;
        }
    };

    store.mark_read(message_id);

    let ack = ReadAck {
        message_id: message_id.to_string(),
        reader_id: local_user_id.to_string(),
        sender_id,
    };
    if let Err(e) = channel.emit(OutboundEvent::MessageRead(ack)) {
        warn!("Failed to send read receipt for {}: {}", message_id, e);
    } else {
        debug!("Sent read receipt for {}", message_id);
    }
    true
}

/// Acknowledge every eligible message in the timeline, oldest first.
pub fn acknowledge_all(store: &mut MessageStore, channel: &dyn EventChannel, local_user_id: &str) -> Vec<String> {
    let eligible: Vec<String> = store
        .iter()
        .filter(|m| is_eligible(m, local_user_id))
        .map(|m| m.id.clone())
        .collect();

    eligible
        .into_iter()
        .filter(|id| acknowledge(store, channel, local_user_id, id))
        .collect()
}

/// Apply a `messageReadUpdate` push. Only messages we sent can be read by the peer.
pub fn apply_read_update(store: &mut MessageStore, local_user_id: &str, message_id: &str) -> bool {
    match store.get(message_id) {
        Some(message) if message.sender_id == local_user_id => store.mark_read(message_id),
        Some(_) => {
            debug!("Ignoring read update for message {} we did not send", message_id);
            false
        }
        None => {
            debug!("Read update for unknown message {}", message_id);
            false
        }
    }
}
