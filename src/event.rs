//! Notifications delivered to the UI layer.

use serde_json::Value;

/// Events emitted on the channel returned by
/// [`SessionCoordinator::start`](crate::coordinator::SessionCoordinator::start).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport loop started (synthetic, always first).
    Connected,
    /// Outcome of the lobby join issued by `register_user`.
    Registered {
        accepted: bool,
        /// The join reply's `response`, verbatim.
        response: Value,
    },
    /// Open games, from the lobby join reply or a `game_list` broadcast.
    GotGameList { games: Value },
    /// Users present in the lobby after a presence update.
    GotUserList { users: Vec<String> },
    /// Outcome of moving into a game topic.
    JoinedGameChannel {
        game_name: String,
        joined: bool,
        response: Value,
    },
    /// A `game_state` broadcast on the game topic.
    GotGameState { state: Value },
    /// The server refused a `new_game` / `join_game` request.
    GameRequestRejected {
        request: &'static str,
        response: Value,
    },
    /// The transport loop exited. Always the last event.
    Disconnected { reason: Option<String> },
}
