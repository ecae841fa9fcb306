// Integration tests for the chat session over in-process transports
mod common;

use std::sync::Arc;

use serde_json::json;

use chatsync::transport::{EventChannel, InboundEvent, MemoryChannel, OutboundEvent, ReadAck, SendRequest};
use chatsync::{ChatError, ChatSession, DeliveryStatus, PresenceStatus, SessionConfig, SessionUpdate, ViewportMetrics};
use common::{open_session, raw_message, setup_logging, wire_message, ScriptedApi, LOCAL, PEER};

fn read_acks(channel: &MemoryChannel) -> Vec<ReadAck> {
    channel
        .emitted()
        .into_iter()
        .filter_map(|event| match event {
            OutboundEvent::MessageRead(ack) => Some(ack),
            _ => None,
        })
        .collect()
}

fn ids(session: &ChatSession) -> Vec<String> {
    session.snapshot().into_iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn test_open_joins_room_and_requests_presence() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let session = open_session(&api, &channel).await;

    assert_eq!(
        channel.emitted(),
        vec![
            OutboundEvent::Join(LOCAL.to_string()),
            OutboundEvent::CheckOnlineStatus(PEER.to_string()),
        ]
    );
    assert_eq!(session.peer().name, "sam");
    assert_eq!(session.presence(), PresenceStatus::Offline);
    assert!(session.is_active());
    assert_eq!(channel.subscriber_count(), 1);
}

#[tokio::test]
async fn test_history_is_ordered_and_not_acknowledged_on_load() {
    let api = ScriptedApi::with_history(vec![
        raw_message("2", PEER, LOCAL, "second", "2024-06-04T10:01:00Z", false),
        raw_message("1", LOCAL, PEER, "first", "2024-06-04T10:00:00Z", true),
        raw_message("3", LOCAL, PEER, "third", "2024-06-04T10:02:00Z", false),
    ]);
    let channel = MemoryChannel::new();
    let session = open_session(&api, &channel).await;

    assert_eq!(ids(&session), vec!["1", "2", "3"]);
    assert!(read_acks(&channel).is_empty());
}

#[tokio::test]
async fn test_history_skips_malformed_entries() {
    let mut broken = raw_message("x", PEER, LOCAL, "no id", "2024-06-04T10:00:00Z", false);
    broken.id = None;
    let api = ScriptedApi::with_history(vec![
        broken,
        raw_message("1", PEER, LOCAL, "ok", "2024-06-04T10:00:00Z", false),
    ]);
    let channel = MemoryChannel::new();
    let session = open_session(&api, &channel).await;

    assert_eq!(ids(&session), vec!["1"]);
}

#[tokio::test]
async fn test_history_entry_with_bad_timestamp_still_loads() {
    let api = ScriptedApi::with_history(vec![
        raw_message("1", PEER, LOCAL, "on time", "2024-06-04T10:00:00Z", true),
        raw_message("2", PEER, LOCAL, "odd clock", "2024-06-04 10:01:00", false),
    ]);
    let channel = MemoryChannel::new();
    let session = open_session(&api, &channel).await;

    // the unparseable entry takes its arrival time, so it sorts last
    assert_eq!(ids(&session), vec!["1", "2"]);
}

#[tokio::test]
async fn test_viewport_near_bottom_acknowledges_unread_incoming() {
    let api = ScriptedApi::with_history(vec![
        raw_message("1", PEER, LOCAL, "old", "2024-06-04T10:00:00Z", true),
        raw_message("2", PEER, LOCAL, "new", "2024-06-04T10:01:00Z", false),
        raw_message("3", LOCAL, PEER, "mine", "2024-06-04T10:02:00Z", false),
    ]);
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let far_above = ViewportMetrics {
        offset_y: 100.0,
        content_height: 2000.0,
        viewport_height: 600.0,
    };
    assert!(session.on_viewport(far_above).is_empty());
    assert!(read_acks(&channel).is_empty());

    let at_bottom = ViewportMetrics {
        offset_y: 1400.0,
        ..far_above
    };
    assert_eq!(session.on_viewport(at_bottom), vec!["2".to_string()]);
    assert!(session.store().get("2").unwrap().is_read);
    // our own unread message stays unread until the peer reads it
    assert!(!session.store().get("3").unwrap().is_read);

    assert_eq!(
        read_acks(&channel),
        vec![ReadAck {
            message_id: "2".to_string(),
            reader_id: LOCAL.to_string(),
            sender_id: PEER.to_string(),
        }]
    );

    // a second pass has nothing left to acknowledge
    assert!(session.on_viewport(at_bottom).is_empty());
    assert_eq!(read_acks(&channel).len(), 1);
}

#[tokio::test]
async fn test_tap_acknowledges_single_message() {
    let api = ScriptedApi::with_history(vec![
        raw_message("1", PEER, LOCAL, "a", "2024-06-04T10:00:00Z", false),
        raw_message("2", PEER, LOCAL, "b", "2024-06-04T10:01:00Z", false),
    ]);
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    assert!(session.acknowledge("1"));
    assert!(!session.acknowledge("1"));
    assert!(!session.acknowledge("missing"));
    assert!(!session.store().get("2").unwrap().is_read);
    assert_eq!(read_acks(&channel).len(), 1);
}

#[tokio::test]
async fn test_optimistic_send_is_replaced_by_confirmed_copy() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let temp_id = session.stage_text("hello").unwrap();
    assert_eq!(ids(&session), vec![temp_id.clone()]);
    assert_eq!(session.store().get(&temp_id).unwrap().delivery, DeliveryStatus::Sending);

    let id = session.deliver(&temp_id).await.unwrap();
    assert_eq!(id, "srv1");
    assert_eq!(ids(&session), vec!["srv1"]);

    let confirmed = session.store().get("srv1").unwrap();
    assert_eq!(confirmed.body, "hello");
    assert_eq!(confirmed.delivery, DeliveryStatus::Sent);
    assert!(!session.store().contains(&temp_id));

    match &api.sent()[0] {
        SendRequest::Text {
            receiver_id,
            message,
            client_id,
        } => {
            assert_eq!(receiver_id, PEER);
            assert_eq!(message, "hello");
            assert!(client_id.is_some());
        }
        other => panic!("Expected a text request, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    assert!(matches!(session.send_text("   ").await, Err(ChatError::EmptyMessage)));
    assert!(session.store().is_empty());
    assert!(api.sent().is_empty());
}

#[tokio::test]
async fn test_image_send_carries_attachment() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let id = session
        .send_image("cat.png", vec![0x89, 0x50, 0x4e, 0x47], "image/png")
        .await
        .unwrap();

    let message = session.store().get(&id).unwrap();
    assert_eq!(message.body, "cat.png");
    assert_eq!(message.attachment_url.as_deref(), Some("https://cdn.example.com/cat.png"));
    assert!(matches!(&api.sent()[0], SendRequest::Image { mime, .. } if mime == "image/png"));
}

#[tokio::test]
async fn test_failed_send_stays_visible_and_can_be_retried() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    api.fail_next_send("HTTP error 500");
    let temp_id = session.stage_text("flaky").unwrap();
    let err = session.deliver(&temp_id).await.unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));

    assert_eq!(session.store().get(&temp_id).unwrap().delivery, DeliveryStatus::Failed);
    assert_eq!(session.failed_messages().len(), 1);

    let id = session.retry_send(&temp_id).await.unwrap();
    assert_eq!(ids(&session), vec![id]);
    assert!(session.failed_messages().is_empty());

    // both attempts carried the same idempotency key
    let sent = api.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);

    assert!(matches!(
        session.retry_send(&temp_id).await,
        Err(ChatError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn test_retry_of_message_in_flight_is_refused() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let temp_id = session.stage_text("still sending").unwrap();
    assert!(matches!(
        session.retry_send(&temp_id).await,
        Err(ChatError::NotRetryable(_))
    ));
    assert!(api.sent().is_empty());
}

#[tokio::test]
async fn test_echo_with_client_id_confirms_staged_send() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let temp_id = session.stage_text("hi").unwrap();
    let client_ref = session.store().get(&temp_id).unwrap().client_ref.clone().unwrap();

    let mut echo = wire_message("srv7", LOCAL, PEER, "hi", "2024-06-04T10:00:00Z", false);
    echo["client_id"] = json!(client_ref);
    channel.push_wire("receiveMessage", echo);

    assert_eq!(session.drain_events(), vec![SessionUpdate::Timeline]);
    assert_eq!(ids(&session), vec!["srv7"]);

    // the send was already confirmed, no request goes out
    assert_eq!(session.deliver(&temp_id).await.unwrap(), "srv7");
    assert!(api.sent().is_empty());
    assert_eq!(ids(&session), vec!["srv7"]);
}

#[tokio::test]
async fn test_echo_before_response_folds_into_one_entry() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let temp_id = session.stage_text("race").unwrap();

    // an echo without correlation key lands first under the permanent id
    channel.push_wire(
        "receiveMessage",
        wire_message("srv1", LOCAL, PEER, "race", "2024-06-04T10:00:00Z", false),
    );
    session.drain_events();
    assert_eq!(session.store().len(), 2);

    assert_eq!(session.deliver(&temp_id).await.unwrap(), "srv1");
    assert_eq!(ids(&session), vec!["srv1"]);
    assert_eq!(session.store().get("srv1").unwrap().delivery, DeliveryStatus::Sent);
}

#[tokio::test]
async fn test_duplicate_delivery_is_ignored() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let payload = wire_message("m1", PEER, LOCAL, "twice", "2024-06-04T10:00:00Z", false);
    channel.push_wire("receiveMessage", payload.clone());
    channel.push_wire("receiveMessage", payload);

    assert_eq!(
        session.drain_events(),
        vec![SessionUpdate::Timeline, SessionUpdate::Ignored]
    );
    assert_eq!(ids(&session), vec!["m1"]);
    // acknowledged once, on first arrival
    assert_eq!(read_acks(&channel).len(), 1);
}

#[tokio::test]
async fn test_pushed_messages_are_merged_in_time_order() {
    let api = ScriptedApi::with_history(vec![raw_message(
        "h1",
        PEER,
        LOCAL,
        "history",
        "2024-06-04T10:00:00Z",
        true,
    )]);
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    channel.push_wire(
        "receiveMessage",
        wire_message("late", PEER, LOCAL, "later", "2024-06-04T10:05:00Z", false),
    );
    channel.push_wire(
        "receiveMessage",
        wire_message("early", PEER, LOCAL, "earlier", "2024-06-04T09:00:00Z", false),
    );
    session.drain_events();

    assert_eq!(ids(&session), vec!["early", "h1", "late"]);
}

#[tokio::test]
async fn test_messages_from_other_conversations_are_ignored() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    channel.push_wire(
        "receiveMessage",
        wire_message("x1", "someone-else", LOCAL, "wrong chat", "2024-06-04T10:00:00Z", false),
    );

    assert_eq!(session.drain_events(), vec![SessionUpdate::Ignored]);
    assert!(session.store().is_empty());
    assert!(read_acks(&channel).is_empty());
}

#[tokio::test]
async fn test_malformed_pushed_message_is_discarded() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    // no id: decodes, but cannot become a timeline message
    channel.push_wire(
        "receiveMessage",
        json!({"message": "ghost", "sender_id": PEER, "receiver_id": LOCAL}),
    );
    // not even an object: dropped by the channel
    channel.push_wire("receiveMessage", json!(42));
    channel.push_wire(
        "receiveMessage",
        wire_message("ok", PEER, LOCAL, "fine", "2024-06-04T10:00:00Z", false),
    );

    assert_eq!(
        session.drain_events(),
        vec![SessionUpdate::Ignored, SessionUpdate::Timeline]
    );
    assert_eq!(ids(&session), vec!["ok"]);
}

#[tokio::test]
async fn test_inactive_session_does_not_acknowledge_arrivals() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    session.set_active(false);
    channel.push_wire(
        "receiveMessage",
        wire_message("m1", PEER, LOCAL, "while away", "2024-06-04T10:00:00Z", false),
    );
    session.drain_events();

    assert!(!session.store().get("m1").unwrap().is_read);
    assert!(read_acks(&channel).is_empty());

    session.set_active(true);
    assert_eq!(session.acknowledge_visible(), vec!["m1".to_string()]);
    assert_eq!(read_acks(&channel).len(), 1);
}

#[tokio::test]
async fn test_read_update_marks_only_our_messages() {
    let api = ScriptedApi::with_history(vec![
        raw_message("mine", LOCAL, PEER, "hi", "2024-06-04T10:00:00Z", false),
        raw_message("theirs", PEER, LOCAL, "yo", "2024-06-04T10:01:00Z", false),
    ]);
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    channel.push_wire("messageReadUpdate", json!({"messageId": "mine"}));
    channel.push_wire("messageReadUpdate", json!({"messageId": "theirs"}));
    channel.push_wire("messageReadUpdate", json!({"messageId": "unknown"}));

    assert_eq!(
        session.drain_events(),
        vec![SessionUpdate::Timeline, SessionUpdate::Ignored, SessionUpdate::Ignored]
    );
    assert!(session.store().get("mine").unwrap().is_read);
    assert!(!session.store().get("theirs").unwrap().is_read);
}

#[tokio::test]
async fn test_presence_follows_peer_only() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    channel.push_wire("userOnline", json!("someone-else"));
    channel.push_wire("userOnline", json!(PEER));
    channel.push_wire("userOnline", json!({"userId": PEER}));
    channel.push_wire("userOffline", json!(PEER));
    channel.push(InboundEvent::OnlineStatusResponse {
        user_id: PEER.to_string(),
        is_online: true,
    });

    assert_eq!(
        session.drain_events(),
        vec![
            SessionUpdate::Ignored,
            SessionUpdate::Presence(PresenceStatus::Online),
            SessionUpdate::Ignored,
            SessionUpdate::Presence(PresenceStatus::Offline),
            SessionUpdate::Presence(PresenceStatus::Online),
        ]
    );
    assert_eq!(session.presence(), PresenceStatus::Online);
}

#[tokio::test]
async fn test_presence_stays_offline_without_response() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(session.drain_events().is_empty());
    assert_eq!(session.presence(), PresenceStatus::Offline);
}

#[tokio::test]
async fn test_next_update_waits_for_pushed_event() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    let pusher = channel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        pusher.push_wire(
            "receiveMessage",
            wire_message("m1", PEER, LOCAL, "later", "2024-06-04T10:00:00Z", false),
        );
    });

    assert_eq!(session.next_update().await.unwrap(), SessionUpdate::Timeline);
    assert_eq!(ids(&session), vec!["m1"]);
}

#[tokio::test]
async fn test_next_update_reports_closed_channel() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    channel.disconnect().await.unwrap();
    assert!(matches!(session.next_update().await, Err(ChatError::ChannelClosed)));
}

#[tokio::test]
async fn test_open_failure_reports_unavailable_and_releases_subscription() {
    setup_logging();
    for api in [ScriptedApi::failing_history(), ScriptedApi::failing_peer()] {
        let channel = MemoryChannel::new();
        let result = ChatSession::open(
            Arc::new(api),
            Arc::new(channel.clone()),
            LOCAL,
            PEER,
            SessionConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(ChatError::Unavailable(_))));
        assert_eq!(channel.subscriber_count(), 0);
    }
}

#[tokio::test]
async fn test_close_releases_subscription() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    let session = open_session(&api, &channel).await;
    assert_eq!(channel.subscriber_count(), 1);

    session.close();
    assert_eq!(channel.subscriber_count(), 0);

    // later pushes reach nobody and do not fail
    channel.push_wire(
        "receiveMessage",
        wire_message("m1", PEER, LOCAL, "after close", "2024-06-04T10:00:00Z", false),
    );
}

#[tokio::test]
async fn test_events_queued_during_open_are_applied_afterwards() {
    let api = ScriptedApi::with_history(vec![raw_message(
        "h1",
        PEER,
        LOCAL,
        "history",
        "2024-06-04T10:00:00Z",
        true,
    )]);
    let channel = MemoryChannel::new();
    let mut session = open_session(&api, &channel).await;

    // a redelivery of a history message and a presence report
    channel.push_wire(
        "receiveMessage",
        wire_message("h1", PEER, LOCAL, "history", "2024-06-04T10:00:00Z", true),
    );
    channel.push_wire("onlineStatusResponse", json!({"userId": PEER, "isOnline": true}));

    assert_eq!(
        session.drain_events(),
        vec![SessionUpdate::Ignored, SessionUpdate::Presence(PresenceStatus::Online)]
    );
    assert_eq!(ids(&session), vec!["h1"]);
}

#[tokio::test]
async fn test_session_on_shut_down_channel_reports_closed() {
    let api = ScriptedApi::new();
    let channel = MemoryChannel::new();
    channel.disconnect().await.unwrap();

    let mut session = open_session(&api, &channel).await;
    assert!(matches!(session.next_update().await, Err(ChatError::ChannelClosed)));
}
