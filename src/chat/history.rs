// Conversation loading
// Peer profile and message history are fetched together when a session
// opens. Either failing makes the conversation unavailable; nothing is retried.

use log::{error, info, warn};

use super::ChatError;
use crate::models::{Message, PeerProfile};
use crate::transport::ChatApi;

pub async fn load_conversation(api: &dyn ChatApi, peer_id: &str) -> Result<(PeerProfile, Vec<Message>), ChatError> {
    let (peer, history) = tokio::try_join!(api.fetch_peer(peer_id), api.fetch_history(peer_id)).map_err(|e| {
        error!("Failed to load chat data for {}: {:#}", peer_id, e);
        ChatError::Unavailable(format!("{:#}", e))
    })?;

    let total = history.len();
    let messages: Vec<Message> = history
        .into_iter()
        .filter_map(|raw| match Message::try_from(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping history entry: {}", e);
                None
            }
        })
        .collect();

    info!("Loaded {} of {} history messages with {}", messages.len(), total, peer_id);
    Ok((peer, messages))
}
