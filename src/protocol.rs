//! Wire-compatible protocol types for Phoenix-style channels.
//!
//! Every frame on the socket is a JSON array
//! `[join_ref, ref, topic, event, payload]` (the V2 JSON serializer). The
//! reserved `phx_*` events drive the subscription lifecycle; everything else
//! is an application event routed to the topic's handlers.
//!
//! The lobby and game payloads at the bottom of this module describe the
//! application protocol spoken on top of the channels. Fields the client
//! only relays (game lists, game state) stay as [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Reserved topics and events ──────────────────────────────────────

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";
/// Join request / server-side join.
pub const PHX_JOIN: &str = "phx_join";
/// Leave request.
pub const PHX_LEAVE: &str = "phx_leave";
/// Reply to any client request, correlated by ref.
pub const PHX_REPLY: &str = "phx_reply";
/// The server-side channel crashed.
pub const PHX_ERROR: &str = "phx_error";
/// The server closed the channel.
pub const PHX_CLOSE: &str = "phx_close";
/// Socket keep-alive, sent on [`PHOENIX_TOPIC`].
pub const HEARTBEAT: &str = "heartbeat";

/// Serializer version negotiated through the endpoint query string.
pub const SERIALIZER_VSN: &str = "2.0.0";

// ── Lobby / game events ─────────────────────────────────────────────

/// Default well-known lobby topic.
pub const DEFAULT_LOBBY_TOPIC: &str = "lobby:lobby";
/// Prefix of per-game topics; the game id follows.
pub const GAME_TOPIC_PREFIX: &str = "game:";
/// Full presence snapshot.
pub const PRESENCE_STATE: &str = "presence_state";
/// Incremental presence update.
pub const PRESENCE_DIFF: &str = "presence_diff";
/// Lobby broadcast of the open games.
pub const GAME_LIST: &str = "game_list";
/// Lobby push creating a new game.
pub const NEW_GAME: &str = "new_game";
/// Lobby push joining an existing game.
pub const JOIN_GAME: &str = "join_game";
/// Game topic broadcast of the current game state.
pub const GAME_STATE: &str = "game_state";

/// Build the WebSocket endpoint for a Phoenix socket mount.
///
/// ```
/// use lobby_session::protocol::websocket_endpoint;
///
/// assert_eq!(
///     websocket_endpoint("ws://localhost:4000/socket"),
///     "ws://localhost:4000/socket/websocket?vsn=2.0.0"
/// );
/// ```
pub fn websocket_endpoint(socket_url: &str) -> String {
    format!(
        "{}/websocket?vsn={SERIALIZER_VSN}",
        socket_url.trim_end_matches('/')
    )
}

// ── Frames ──────────────────────────────────────────────────────────

/// One frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireFrame", into = "WireFrame")]
pub struct Message {
    /// Ref of the `phx_join` that opened the subscription this frame belongs to.
    pub join_ref: Option<String>,
    /// Ref of a client request, echoed back on its `phx_reply`.
    pub msg_ref: Option<String>,
    /// Topic name.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

/// Positional array form used on the wire.
#[derive(Serialize, Deserialize)]
struct WireFrame(Option<String>, Option<String>, String, String, Value);

impl From<WireFrame> for Message {
    fn from(WireFrame(join_ref, msg_ref, topic, event, payload): WireFrame) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        }
    }
}

impl From<Message> for WireFrame {
    fn from(msg: Message) -> Self {
        Self(msg.join_ref, msg.msg_ref, msg.topic, msg.event, msg.payload)
    }
}

impl Message {
    /// Build a heartbeat frame with the given ref.
    pub fn heartbeat(msg_ref: String) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref),
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Returns `true` for `phx_reply` frames.
    pub fn is_reply(&self) -> bool {
        self.event == PHX_REPLY
    }
}

// ── Replies ─────────────────────────────────────────────────────────

/// Outcome carried by a `phx_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// The request was accepted.
    Ok,
    /// The request was rejected.
    Error,
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

// ── Lobby / game payloads ───────────────────────────────────────────

/// Join parameters for both the lobby and game topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserParams {
    pub user_name: String,
}

/// Payload of the `new_game` lobby push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGameRequest {
    pub user_name: String,
    pub private: bool,
}

/// Payload of the `join_game` lobby push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGameRequest {
    pub game_name: String,
}

/// Ok response to `new_game` / `join_game`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameAssigned {
    #[serde(default)]
    pub game_name: Option<String>,
}

/// Ok response to the lobby join, and payload of `game_list` broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameListing {
    #[serde(default)]
    pub games: Value,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_encodes_as_positional_array() {
        let msg = Message {
            join_ref: Some("1".into()),
            msg_ref: Some("2".into()),
            topic: "lobby:lobby".into(),
            event: PHX_JOIN.into(),
            payload: json!({"user_name": "alice"}),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!(["1", "2", "lobby:lobby", "phx_join", {"user_name": "alice"}])
        );
    }

    #[test]
    fn broadcast_with_null_refs_decodes() {
        let msg: Message =
            serde_json::from_str(r#"[null,null,"lobby:lobby","game_list",{"games":[]}]"#).unwrap();
        assert_eq!(msg.join_ref, None);
        assert_eq!(msg.msg_ref, None);
        assert_eq!(msg.event, GAME_LIST);
        assert!(!msg.is_reply());
    }

    #[test]
    fn short_array_is_rejected() {
        let result = serde_json::from_str::<Message>(r#"[null,null,"lobby:lobby"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn heartbeat_targets_phoenix_topic() {
        let encoded = serde_json::to_string(&Message::heartbeat("7".into())).unwrap();
        assert_eq!(encoded, r#"[null,"7","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn reply_payload_without_response_defaults_to_null() {
        let reply: ReplyPayload = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert!(reply.response.is_null());
    }

    #[test]
    fn new_game_request_shape() {
        let value = serde_json::to_value(NewGameRequest {
            user_name: "alice".into(),
            private: false,
        })
        .unwrap();
        assert_eq!(value, json!({"user_name": "alice", "private": false}));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        assert_eq!(
            websocket_endpoint("wss://example.com/socket/"),
            "wss://example.com/socket/websocket?vsn=2.0.0"
        );
    }
}
