#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for topic sessions on a live socket loop.
//!
//! Covers request/reply correlation, join status transitions, misuse errors
//! and server-initiated topic events, using the loopback transport from
//! `tests/common`.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lobby_session::protocol::{Message, ReplyStatus};
use lobby_session::{
    JoinStatus, RejectReason, SessionError, SessionEvent, Socket, SocketConfig, TopicSession,
};
use serde_json::json;
use tokio::sync::mpsc::Receiver;
use tokio_test::{assert_pending, assert_ready};

use common::{loopback, next_event, settle, MockServer};

fn start() -> (Socket, Receiver<SessionEvent>, MockServer) {
    let (transport, server) = loopback();
    let config = SocketConfig::default().with_heartbeat_interval(None);
    let (socket, events) = Socket::start(transport, config);
    (socket, events, server)
}

/// Join `topic` and accept it. Returns the join ref.
async fn joined(topic: &TopicSession, server: &mut MockServer) -> String {
    let pending = topic.join().unwrap();
    let join = server.next_frame().await;
    server.reply_ok(&join, json!({}));
    pending.await.unwrap();
    assert_eq!(topic.status(), JoinStatus::Joined);
    join.join_ref.unwrap()
}

/// Reply to `to` the way servers that do not echo `join_ref` do.
fn reply_untagged(server: &MockServer, to: &Message) {
    server.send(&Message {
        join_ref: None,
        msg_ref: to.msg_ref.clone(),
        topic: to.topic.clone(),
        event: "phx_reply".into(),
        payload: json!({"status": "ok", "response": {}}),
    });
}

fn counter(topic: &TopicSession, event: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    topic.on(event, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    count
}

// ════════════════════════════════════════════════════════════════════
// Join
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_join_while_joining_sends_nothing() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({"user_name": "alice"}));

    let mut first = tokio_test::task::spawn(topic.join().unwrap());
    assert_pending!(first.poll());

    assert!(matches!(
        topic.join(),
        Err(SessionError::AlreadyJoining { ref topic }) if topic.as_str() == "room:1"
    ));

    let join = server.next_frame().await;
    assert_eq!(join.event, "phx_join");
    server.assert_silent(Duration::from_millis(50)).await;

    server.reply_ok(&join, json!({"welcome": true}));
    settle().await;
    let reply = assert_ready!(first.poll()).unwrap();
    assert_eq!(reply.response, json!({"welcome": true}));

    assert!(matches!(
        topic.join(),
        Err(SessionError::AlreadyJoined { .. })
    ));
    server.assert_silent(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn rejected_join_marks_errored_and_can_retry() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));

    let pending = topic.join().unwrap();
    let join = server.next_frame().await;
    server.reply_error(&join, json!({"reason": "unauthorized"}));

    let reply = pending.await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(reply.reject_reason(), Some(RejectReason::Unauthorized));
    assert_eq!(topic.status(), JoinStatus::Errored);

    let retry = joined(&topic, &mut server).await;
    assert_ne!(Some(retry), join.join_ref);
}

#[tokio::test]
async fn replies_without_join_ref_still_settle_the_status() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));

    let pending = topic.join().unwrap();
    let join = server.next_frame().await;
    reply_untagged(&server, &join);
    assert!(pending.await.unwrap().is_ok());
    assert_eq!(topic.status(), JoinStatus::Joined);

    let pending = topic.leave().unwrap();
    let leave = server.next_frame().await;
    assert_eq!(leave.join_ref, join.join_ref);
    reply_untagged(&server, &leave);
    assert!(pending.await.unwrap().is_ok());
    assert_eq!(topic.status(), JoinStatus::Left);
}

// ════════════════════════════════════════════════════════════════════
// Push
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn push_before_join_is_not_joined() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));

    assert!(matches!(
        topic.push("move", json!({})),
        Err(SessionError::NotJoined { .. })
    ));
    server.assert_silent(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn out_of_order_replies_resolve_their_own_requests() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    let join_ref = joined(&topic, &mut server).await;

    let first = topic.push("move", json!({"n": 1})).unwrap();
    let second = topic.push("move", json!({"n": 2})).unwrap();
    let frame_a = server.next_frame().await;
    let frame_b = server.next_frame().await;
    assert_eq!(frame_a.join_ref.as_deref(), Some(join_ref.as_str()));
    assert_ne!(frame_a.msg_ref, frame_b.msg_ref);

    server.reply_ok(&frame_b, json!({"n": 2}));
    server.reply_ok(&frame_a, json!({"n": 1}));

    assert_eq!(first.await.unwrap().response, json!({"n": 1}));
    assert_eq!(second.await.unwrap().response, json!({"n": 2}));
}

#[tokio::test]
async fn error_reply_to_push_is_data() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    joined(&topic, &mut server).await;

    let pending = topic.push("move", json!({})).unwrap();
    let push = server.next_frame().await;
    server.reply_error(&push, json!({"reason": "illegal move"}));

    let reply = pending.await.unwrap();
    assert!(!reply.is_ok());
    assert_eq!(topic.status(), JoinStatus::Joined);
    assert!(matches!(
        reply.into_result(),
        Err(SessionError::ProtocolRejected { .. })
    ));
}

// ════════════════════════════════════════════════════════════════════
// Leave
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn leave_when_not_joined_is_a_local_no_op() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));

    let reply = topic.leave().unwrap().await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(topic.status(), JoinStatus::Left);
    server.assert_silent(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn leave_round_trip_and_double_leave() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    let join_ref = joined(&topic, &mut server).await;

    let pending = topic.leave().unwrap();
    assert_eq!(topic.status(), JoinStatus::Leaving);
    assert!(matches!(
        topic.leave(),
        Err(SessionError::AlreadyLeaving { .. })
    ));

    let leave = server.next_frame().await;
    assert_eq!(leave.event, "phx_leave");
    assert_eq!(leave.join_ref.as_deref(), Some(join_ref.as_str()));
    server.reply_ok(&leave, json!({}));

    assert!(pending.await.unwrap().is_ok());
    assert_eq!(topic.status(), JoinStatus::Left);
}

#[tokio::test]
async fn refused_leave_keeps_the_topic_joined() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    joined(&topic, &mut server).await;

    let pending = topic.leave().unwrap();
    let leave = server.next_frame().await;
    server.reply_error(&leave, json!({}));

    assert!(!pending.await.unwrap().is_ok());
    assert_eq!(topic.status(), JoinStatus::Joined);
}

#[tokio::test]
async fn leave_during_join_abandons_it() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    let ticks = counter(&topic, "tick");

    let pending = topic.join().unwrap();
    assert!(topic.leave().unwrap().await.unwrap().is_ok());
    assert_eq!(topic.status(), JoinStatus::Left);

    let join = server.next_frame().await;
    let leave = server.next_frame().await;
    assert_eq!(leave.event, "phx_leave");
    assert_eq!(leave.join_ref, join.join_ref);

    server.reply_ok(&join, json!({}));
    // The late reply still reaches the abandoned join, but changes nothing.
    assert!(pending.await.unwrap().is_ok());
    assert_eq!(topic.status(), JoinStatus::Left);

    server.push("room:1", "tick", json!({}));
    settle().await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}

// ════════════════════════════════════════════════════════════════════
// Inbound routing
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stale_join_ref_pushes_are_dropped() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    let ticks = counter(&topic, "tick");

    let old_ref = joined(&topic, &mut server).await;
    let pending = topic.leave().unwrap();
    let leave = server.next_frame().await;
    server.reply_ok(&leave, json!({}));
    pending.await.unwrap();
    let new_ref = joined(&topic, &mut server).await;

    server.push_with_join_ref(&old_ref, "room:1", "tick", json!({}));
    server.push_with_join_ref(&new_ref, "room:1", "tick", json!({}));
    server.push("room:1", "tick", json!({}));
    settle().await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_handlers_do_not_block_later_ones() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    topic.on("tick", |_| Err("bad payload".into()));
    topic.on("tick", |_| panic!("handler bug"));
    let ticks = counter(&topic, "tick");
    joined(&topic, &mut server).await;

    server.push("room:1", "tick", json!({}));
    server.push("room:1", "tick", json!({}));
    settle().await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn server_error_marks_topic_errored() {
    let (socket, _events, mut server) = start();
    let topic = socket.topic("room:1", json!({}));
    let errors = counter(&topic, "phx_error");
    let join_ref = joined(&topic, &mut server).await;

    server.push_with_join_ref(&join_ref, "room:1", "phx_error", json!({}));
    settle().await;
    assert_eq!(topic.status(), JoinStatus::Errored);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(matches!(
        topic.push("move", json!({})),
        Err(SessionError::NotJoined { .. })
    ));
}

// ════════════════════════════════════════════════════════════════════
// Connection loss
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disconnect_resolves_pending_with_connection_lost() {
    let (socket, mut events, mut server) = start();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    let topic = socket.topic("room:1", json!({}));
    joined(&topic, &mut server).await;

    let pending = topic.push("move", json!({})).unwrap();
    let _push = server.next_frame().await;
    server.close();

    assert!(matches!(pending.await, Err(SessionError::ConnectionLost)));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected { reason: None }
    );
    assert_eq!(topic.status(), JoinStatus::Errored);
    assert!(!socket.is_connected());
    assert!(matches!(topic.join(), Err(SessionError::NotConnected)));
}

#[tokio::test]
async fn missed_heartbeat_closes_the_connection() {
    let (transport, mut server) = loopback();
    let config = SocketConfig::default().with_heartbeat_interval(Some(Duration::from_millis(30)));
    let (_socket, mut events) = Socket::start(transport, config);
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    let beat = server.next_raw_frame().await;
    assert_eq!(beat.topic, "phoenix");
    assert_eq!(beat.event, "heartbeat");
    assert_eq!(beat.payload, json!({}));

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            reason: Some("heartbeat timeout".into())
        }
    );
    assert!(server.closed.load(Ordering::Acquire));
}

#[tokio::test]
async fn answered_heartbeats_keep_the_connection() {
    let (transport, mut server) = loopback();
    let config = SocketConfig::default().with_heartbeat_interval(Some(Duration::from_millis(30)));
    let (socket, _events) = Socket::start(transport, config);

    for _ in 0..3 {
        let beat = server.next_raw_frame().await;
        server.reply_ok(&beat, json!({}));
    }
    assert!(socket.is_connected());
}
