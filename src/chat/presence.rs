// Peer presence tracking for a chat session
// The event channel is shared by the whole process, so every update is
// checked against the tracked peer before it is applied.

use anyhow::Result;
use log::{debug, info};

use crate::models::PresenceStatus;
use crate::transport::{EventChannel, OutboundEvent};

pub struct PresenceTracker {
    peer_id: String,
    status: PresenceStatus,
    requested: bool,
}

impl PresenceTracker {
    pub fn new(peer_id: &str) -> Self {
        PresenceTracker {
            peer_id: peer_id.to_string(),
            status: PresenceStatus::default(),
            requested: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Ask the server for the peer's current status. The answer, if any,
    /// arrives later as `onlineStatusResponse`; there is no timeout.
    pub fn request_status(&mut self, channel: &dyn EventChannel) -> Result<()> {
        debug!("Requesting online status of {}", self.peer_id);
        channel.emit(OutboundEvent::CheckOnlineStatus(self.peer_id.clone()))?;
        self.requested = true;
        Ok(())
    }

    pub fn has_requested(&self) -> bool {
        self.requested
    }

    pub fn on_online(&mut self, user_id: &str) -> bool {
        self.apply(user_id, PresenceStatus::Online)
    }

    pub fn on_offline(&mut self, user_id: &str) -> bool {
        self.apply(user_id, PresenceStatus::Offline)
    }

    pub fn on_status_response(&mut self, user_id: &str, is_online: bool) -> bool {
        self.apply(user_id, PresenceStatus::from_online(is_online))
    }

    pub fn current(&self) -> PresenceStatus {
        self.status
    }

    // Returns true when the tracked status changed
    fn apply(&mut self, user_id: &str, status: PresenceStatus) -> bool {
        if user_id != self.peer_id {
            return false;
        }
        if self.status == status {
            return false;
        }
        info!("{} is now {}", self.peer_id, status);
        self.status = status;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;

    #[test]
    fn test_defaults_to_offline_until_told_otherwise() {
        let channel = MemoryChannel::new();
        let mut tracker = PresenceTracker::new("peerA");
        tracker.request_status(&channel).unwrap();

        assert!(tracker.has_requested());
        assert_eq!(
            channel.emitted(),
            vec![OutboundEvent::CheckOnlineStatus("peerA".into())]
        );
        // no response ever arrives
        assert_eq!(tracker.current(), PresenceStatus::Offline);
    }

    #[test]
    fn test_ignores_other_peers() {
        let mut tracker = PresenceTracker::new("peerA");
        assert!(!tracker.on_online("peerB"));
        assert!(!tracker.on_status_response("peerB", true));
        assert_eq!(tracker.current(), PresenceStatus::Offline);

        assert!(tracker.on_online("peerA"));
        assert!(!tracker.on_offline("peerB"));
        assert_eq!(tracker.current(), PresenceStatus::Online);
    }

    #[test]
    fn test_push_updates_follow_latest_event() {
        let mut tracker = PresenceTracker::new("peerA");
        assert!(tracker.on_status_response("peerA", true));
        assert!(!tracker.on_online("peerA"));
        assert!(tracker.on_offline("peerA"));
        assert_eq!(tracker.current(), PresenceStatus::Offline);
    }
}
