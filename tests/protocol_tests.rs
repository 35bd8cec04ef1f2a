#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for the lobby session client.
//!
//! Decodes JSON fixtures shaped like real Phoenix server output and checks
//! the exact bytes of the frames the client produces.

use lobby_session::presence::{PresenceDiff, PresenceState};
use lobby_session::protocol::{
    GameAssigned, GameListing, JoinGameRequest, Message, ReplyPayload, ReplyStatus, UserParams,
    PHX_CLOSE, PHX_ERROR, PHX_REPLY, PRESENCE_DIFF,
};
use lobby_session::RejectReason;
use serde_json::{json, Value};

// ════════════════════════════════════════════════════════════════════
// Helper
// ════════════════════════════════════════════════════════════════════

fn frame(text: &str) -> Message {
    serde_json::from_str(text).expect("fixture decodes")
}

fn reply_of(msg: &Message) -> ReplyPayload {
    assert_eq!(msg.event, PHX_REPLY);
    serde_json::from_value(msg.payload.clone()).expect("reply payload decodes")
}

// ════════════════════════════════════════════════════════════════════
// Server fixtures
// ════════════════════════════════════════════════════════════════════

#[test]
fn lobby_join_reply_fixture() {
    let msg = frame(
        r#"["3","3","lobby:lobby","phx_reply",{"response":{"games":[{"name":"g1","players":1}]},"status":"ok"}]"#,
    );
    assert_eq!(msg.join_ref.as_deref(), Some("3"));
    assert_eq!(msg.msg_ref.as_deref(), Some("3"));
    assert!(msg.is_reply());

    let reply = reply_of(&msg);
    assert_eq!(reply.status, ReplyStatus::Ok);
    let listing: GameListing = serde_json::from_value(reply.response).unwrap();
    assert_eq!(listing.games, json!([{"name": "g1", "players": 1}]));
}

#[test]
fn rejected_join_reply_fixture() {
    let msg = frame(
        r#"["5","5","game:g1","phx_reply",{"response":{"reason":"unmatched topic"},"status":"error"}]"#,
    );
    let reply = reply_of(&msg);
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(
        RejectReason::from_response(&reply.response),
        RejectReason::UnmatchedTopic
    );
}

#[test]
fn heartbeat_reply_fixture() {
    let msg = frame(r#"[null,"9","phoenix","phx_reply",{"response":{},"status":"ok"}]"#);
    assert_eq!(msg.join_ref, None);
    assert_eq!(msg.topic, "phoenix");
    assert_eq!(reply_of(&msg).response, json!({}));
}

#[test]
fn presence_diff_fixture() {
    let msg = frame(
        r#"["3",null,"lobby:lobby","presence_diff",{"joins":{"bob":{"metas":[{"online_at":"1700000100","phx_ref":"F2"}]}},"leaves":{"alice":{"metas":[{"online_at":"1700000000","phx_ref":"F1"}]}}}]"#,
    );
    assert_eq!(msg.event, PRESENCE_DIFF);
    let diff: PresenceDiff = serde_json::from_value(msg.payload).unwrap();
    assert_eq!(diff.joins["bob"].metas[0].phx_ref.as_deref(), Some("F2"));
    assert_eq!(diff.leaves["alice"].metas[0].phx_ref.as_deref(), Some("F1"));
}

#[test]
fn presence_state_keeps_server_order() {
    let state: PresenceState = serde_json::from_value(json!({
        "zoe": {"metas": [{"phx_ref": "1"}]},
        "adam": {"metas": [{"phx_ref": "2"}]},
    }))
    .unwrap();
    let keys: Vec<&String> = state.keys().collect();
    assert_eq!(keys, ["zoe", "adam"]);
}

#[test]
fn channel_lifecycle_events_fixture() {
    let error = frame(r#"["3","3","game:g1","phx_error",{}]"#);
    assert_eq!(error.event, PHX_ERROR);
    let close = frame(r#"["3","4","game:g1","phx_close",{}]"#);
    assert_eq!(close.event, PHX_CLOSE);
}

#[test]
fn game_assigned_tolerates_extra_and_missing_fields() {
    let assigned: GameAssigned =
        serde_json::from_value(json!({"game_name": "g1", "players": 2})).unwrap();
    assert_eq!(assigned.game_name.as_deref(), Some("g1"));

    let bare: GameAssigned = serde_json::from_value(json!({})).unwrap();
    assert_eq!(bare.game_name, None);
}

#[test]
fn non_array_frames_are_rejected() {
    assert!(serde_json::from_str::<Message>(r#"{"topic":"lobby:lobby"}"#).is_err());
    assert!(serde_json::from_str::<Message>(r#"[null,null,"t","e",{},"extra"]"#).is_err());
    assert!(serde_json::from_str::<Message>(r#"[1,2,"t","e",{}]"#).is_err());
}

// ════════════════════════════════════════════════════════════════════
// Client frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn join_frame_bytes() {
    let msg = Message {
        join_ref: Some("1".into()),
        msg_ref: Some("1".into()),
        topic: "lobby:lobby".into(),
        event: "phx_join".into(),
        payload: serde_json::to_value(UserParams {
            user_name: "alice".into(),
        })
        .unwrap(),
    };
    assert_eq!(
        serde_json::to_string(&msg).unwrap(),
        r#"["1","1","lobby:lobby","phx_join",{"user_name":"alice"}]"#
    );
}

#[test]
fn join_game_push_bytes() {
    let msg = Message {
        join_ref: Some("1".into()),
        msg_ref: Some("4".into()),
        topic: "lobby:lobby".into(),
        event: "join_game".into(),
        payload: serde_json::to_value(JoinGameRequest {
            game_name: "g7".into(),
        })
        .unwrap(),
    };
    let value: Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(
        value,
        json!(["1", "4", "lobby:lobby", "join_game", {"game_name": "g7"}])
    );
}
