//! Lifecycle states of topic sessions and of the session coordinator.

use std::fmt;

/// Join status of a single topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinStatus {
    /// Created; no join has been requested yet.
    #[default]
    Idle,
    /// `phx_join` sent, waiting for the reply.
    Joining,
    /// The server accepted the join.
    Joined,
    /// `phx_leave` sent, waiting for the reply.
    Leaving,
    /// The subscription ended (leave acknowledged, or closed by the server).
    Left,
    /// The server rejected the join, the topic crashed, or the socket dropped.
    Errored,
}

/// States of the lobby → game migration state machine.
///
/// `Disconnected` means "holds no topic session"; the underlying socket may
/// still be up. Use [`SessionCoordinator::is_connected`] for the socket itself.
///
/// [`SessionCoordinator::is_connected`]: crate::coordinator::SessionCoordinator::is_connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No lobby or game session.
    #[default]
    Disconnected,
    /// Lobby join in flight.
    JoiningLobby,
    /// Member of the lobby topic.
    InLobby,
    /// Game create/join request or lobby leave in flight.
    StartingGame,
    /// Lobby left; game join in flight.
    JoiningGame,
    /// Member of a game topic.
    InGame,
    /// The game topic rejected the join. The lobby was already left.
    GameJoinFailed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::JoiningLobby => "joining lobby",
            Self::InLobby => "in lobby",
            Self::StartingGame => "starting game",
            Self::JoiningGame => "joining game",
            Self::InGame => "in game",
            Self::GameJoinFailed => "game join failed",
        };
        f.write_str(name)
    }
}
