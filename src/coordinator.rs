//! Lobby → game migration state machine.
//!
//! [`SessionCoordinator`] owns at most one lobby session and one game session
//! on a shared [`Socket`]. UI intents are `&mut self` methods, so two intents
//! can never interleave; each one awaits its replies in sequence. In
//! particular the lobby `phx_leave` is acknowledged before the game
//! `phx_join` is sent, so the server never sees the client in both topics.
//!
//! ```text
//! Disconnected ──register_user──▶ JoiningLobby ──ok──▶ InLobby
//!      ▲                              │ error             │ start_new_game / join_game
//!      └──────────────────────────────┘                   ▼
//!                                  GameJoinFailed ◀── JoiningGame ◀── StartingGame
//!                                                         │ ok
//!                                                         ▼
//!                                                       InGame
//! ```
//!
//! Events raised by topic handlers are held back until the join that enabled
//! them has been reported, so the UI always sees `Registered` before the first
//! `GotUserList` and `JoinedGameChannel` before the first `GotGameState`.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::event::SessionEvent;
use crate::presence::{PresenceDiff, PresenceSet, PresenceState};
use crate::protocol::{
    GameAssigned, GameListing, JoinGameRequest, NewGameRequest, UserParams, DEFAULT_LOBBY_TOPIC,
    GAME_LIST, GAME_STATE, GAME_TOPIC_PREFIX, JOIN_GAME, NEW_GAME, PRESENCE_DIFF, PRESENCE_STATE,
};
use crate::socket::{emit_event, Socket, SocketConfig};
use crate::state::{JoinStatus, SessionState};
use crate::topic::{PendingReply, Reply, TopicSession};
use crate::transport::Transport;

// ── Configuration ───────────────────────────────────────────────────

/// Coordinator configuration.
///
/// # Example
///
/// ```
/// use lobby_session::SessionConfig;
///
/// let config = SessionConfig::default()
///     .with_lobby_topic("lobby:eu")
///     .with_private_games(true);
/// assert_eq!(config.lobby_topic, "lobby:eu");
/// assert_eq!(config.game_topic_prefix, "game:");
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Topic joined by [`SessionCoordinator::register_user`].
    ///
    /// Defaults to `"lobby:lobby"`.
    pub lobby_topic: String,
    /// Prefix prepended to the game id to form the game topic.
    ///
    /// Defaults to `"game:"`.
    pub game_topic_prefix: String,
    /// Value of the `private` flag sent with `new_game`.
    ///
    /// Defaults to `false`.
    pub private_games: bool,
    /// Settings for the underlying socket.
    pub socket: SocketConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lobby_topic: DEFAULT_LOBBY_TOPIC.to_string(),
            game_topic_prefix: GAME_TOPIC_PREFIX.to_string(),
            private_games: false,
            socket: SocketConfig::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_lobby_topic(mut self, topic: impl Into<String>) -> Self {
        self.lobby_topic = topic.into();
        self
    }

    #[must_use]
    pub fn with_game_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.game_topic_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_private_games(mut self, private: bool) -> Self {
        self.private_games = private;
        self
    }

    #[must_use]
    pub fn with_socket(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }
}

// ── Intent parameters ───────────────────────────────────────────────

/// Parameters of [`SessionCoordinator::join_game`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGameParams {
    pub user_name: String,
    pub game_name: String,
}

impl JoinGameParams {
    pub fn new(user_name: impl Into<String>, game_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            game_name: game_name.into(),
        }
    }
}

/// A player action forwarded to the game topic: `action` is the event name.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerAction {
    pub action: String,
    pub payload: Value,
}

impl PlayerAction {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }
}

// ── Event gate ──────────────────────────────────────────────────────

enum GateState {
    Holding(Vec<SessionEvent>),
    Open,
    Closed,
}

/// Orders handler-raised events after the join outcome they depend on.
///
/// Starts out holding. [`open_with`](Self::open_with) emits the join outcome
/// followed by everything held; [`discard`](Self::discard) drops it all,
/// including whatever a late handler still produces.
#[derive(Clone)]
struct EventGate {
    tx: mpsc::Sender<SessionEvent>,
    state: Arc<Mutex<GateState>>,
}

impl EventGate {
    fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            tx,
            state: Arc::new(Mutex::new(GateState::Holding(Vec::new()))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        match &mut *self.lock() {
            GateState::Holding(held) => held.push(event),
            GateState::Open => emit_event(&self.tx, event),
            GateState::Closed => debug!("dropping event from a discarded session"),
        }
    }

    fn open_with(&self, leading: impl IntoIterator<Item = SessionEvent>) {
        let mut state = self.lock();
        let held = match mem::replace(&mut *state, GateState::Open) {
            GateState::Holding(held) => held,
            GateState::Open | GateState::Closed => Vec::new(),
        };
        // Emitted under the lock so a concurrent handler cannot overtake.
        for event in leading.into_iter().chain(held) {
            emit_event(&self.tx, event);
        }
    }

    fn discard(&self) {
        *self.lock() = GateState::Closed;
    }
}

fn lock_presence(presence: &Mutex<PresenceSet>) -> MutexGuard<'_, PresenceSet> {
    presence.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `games` of a lobby join reply or `game_list` push; an empty list if absent.
fn game_list(payload: &Value) -> Value {
    serde_json::from_value::<GameListing>(payload.clone())
        .ok()
        .map(|listing| listing.games)
        .filter(|games| !games.is_null())
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

/// `game_state` pushes carry the state under `game`; older servers send it bare.
fn game_state(payload: &Value) -> Value {
    payload
        .get("game")
        .cloned()
        .unwrap_or_else(|| payload.clone())
}

// ── Coordinator ─────────────────────────────────────────────────────

/// Drives one user from the lobby into a game.
pub struct SessionCoordinator {
    socket: Socket,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    state: SessionState,
    lobby: Option<TopicSession>,
    game: Option<TopicSession>,
    game_name: Option<String>,
    presence: Arc<Mutex<PresenceSet>>,
}

impl SessionCoordinator {
    /// Start the socket over `transport`; the receiver carries every
    /// [`SessionEvent`] for the UI.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        transport: impl Transport,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (socket, events_rx) = Socket::start(transport, config.socket.clone());
        let events = socket.event_sender();
        let coordinator = Self {
            socket,
            config,
            events,
            state: SessionState::Disconnected,
            lobby: None,
            game: None,
            game_name: None,
            presence: Arc::new(Mutex::new(PresenceSet::new())),
        };
        (coordinator, events_rx)
    }

    /// Current state. Always [`Disconnected`](SessionState::Disconnected)
    /// once the socket is gone.
    pub fn state(&self) -> SessionState {
        if self.socket.is_connected() {
            self.state
        } else {
            SessionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Users present in the lobby, in insertion order. Empty once the
    /// socket is gone.
    pub fn present_users(&self) -> Vec<String> {
        if !self.socket.is_connected() {
            return Vec::new();
        }
        lock_presence(&self.presence).keys()
    }

    /// `None` when no lobby session is held or the socket is gone.
    pub fn lobby_status(&self) -> Option<JoinStatus> {
        self.held(&self.lobby).map(TopicSession::status)
    }

    /// `None` when no game session is held or the socket is gone.
    pub fn game_status(&self) -> Option<JoinStatus> {
        self.held(&self.game).map(TopicSession::status)
    }

    /// Game id of the current or last attempted game topic.
    pub fn game_name(&self) -> Option<&str> {
        if !self.socket.is_connected() {
            return None;
        }
        self.game_name.as_deref()
    }

    fn held<'a>(&self, session: &'a Option<TopicSession>) -> Option<&'a TopicSession> {
        session.as_ref().filter(|_| self.socket.is_connected())
    }

    /// Join the lobby as `user_name`.
    ///
    /// Allowed while [`Disconnected`](SessionState::Disconnected) or after
    /// [`GameJoinFailed`](SessionState::GameJoinFailed). A rejected join is
    /// reported as `Registered { accepted: false }` and returns `Ok`.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] in any other state,
    /// [`SessionError::NotConnected`] / [`SessionError::ConnectionLost`] if
    /// the socket is or goes down.
    pub async fn register_user(&mut self, user_name: impl Into<String>) -> Result<()> {
        self.check_connection()?;
        if !matches!(
            self.state,
            SessionState::Disconnected | SessionState::GameJoinFailed
        ) {
            return Err(self.invalid("register a user"));
        }

        let user_name = user_name.into();
        self.game = None;
        self.game_name = None;
        lock_presence(&self.presence).clear();

        let params = serde_json::to_value(UserParams { user_name })?;
        let lobby = self.socket.topic(self.config.lobby_topic.clone(), params);
        let gate = EventGate::new(self.events.clone());
        self.bind_lobby(&lobby, &gate);

        let pending = lobby.join().map_err(|e| self.fail(e))?;
        self.state = SessionState::JoiningLobby;
        self.lobby = Some(lobby);
        let reply = self.settle(pending).await?;

        if reply.is_ok() {
            info!(topic = %self.config.lobby_topic, "joined lobby");
            self.state = SessionState::InLobby;
            let games = game_list(&reply.response);
            gate.open_with([
                SessionEvent::Registered {
                    accepted: true,
                    response: reply.response,
                },
                SessionEvent::GotGameList { games },
            ]);
        } else {
            warn!(
                topic = %self.config.lobby_topic,
                reason = ?reply.reject_reason(),
                "lobby join rejected"
            );
            gate.discard();
            self.lobby = None;
            lock_presence(&self.presence).clear();
            self.state = SessionState::Disconnected;
            emit_event(
                &self.events,
                SessionEvent::Registered {
                    accepted: false,
                    response: reply.response,
                },
            );
        }
        Ok(())
    }

    /// Ask the lobby for a new game, then move into it.
    ///
    /// # Errors
    ///
    /// Same as [`join_game`](Self::join_game).
    pub async fn start_new_game(&mut self, user_name: impl Into<String>) -> Result<()> {
        self.check_connection()?;
        if self.state != SessionState::InLobby {
            return Err(self.invalid("start a new game"));
        }
        let user_name = user_name.into();
        let request = NewGameRequest {
            user_name: user_name.clone(),
            private: self.config.private_games,
        };
        let payload = serde_json::to_value(request)?;
        match self.request_game(NEW_GAME, payload, None).await? {
            Some(game_name) => self.migrate_to_game(user_name, game_name).await,
            None => Ok(()),
        }
    }

    /// Ask the lobby to join an existing game, then move into it.
    ///
    /// Rejections (`GameRequestRejected`, or `JoinedGameChannel { joined:
    /// false }`) are reported as events and return `Ok`.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless [`InLobby`](SessionState::InLobby);
    /// [`SessionError::NotConnected`] / [`SessionError::ConnectionLost`] if the
    /// socket is or goes down.
    pub async fn join_game(&mut self, params: JoinGameParams) -> Result<()> {
        self.check_connection()?;
        if self.state != SessionState::InLobby {
            return Err(self.invalid("join a game"));
        }
        let JoinGameParams {
            user_name,
            game_name,
        } = params;
        let payload = serde_json::to_value(JoinGameRequest {
            game_name: game_name.clone(),
        })?;
        match self.request_game(JOIN_GAME, payload, Some(game_name)).await? {
            Some(game_name) => self.migrate_to_game(user_name, game_name).await,
            None => Ok(()),
        }
    }

    /// Forward a player action to the game topic.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless [`InGame`](SessionState::InGame).
    pub fn push_player_action(&self, action: PlayerAction) -> Result<PendingReply> {
        if !self.socket.is_connected() {
            return Err(SessionError::NotConnected);
        }
        match (&self.game, self.state) {
            (Some(game), SessionState::InGame) => game.push(action.action, action.payload),
            _ => Err(self.invalid("push a player action")),
        }
    }

    /// Close the socket and drop every session.
    pub async fn shutdown(&mut self) {
        self.socket.shutdown().await;
        self.teardown();
    }

    // ── Steps ───────────────────────────────────────────────────────

    fn bind_lobby(&self, lobby: &TopicSession, gate: &EventGate) {
        let presence = Arc::clone(&self.presence);
        let events = gate.clone();
        lobby.on(PRESENCE_STATE, move |payload| {
            let snapshot: PresenceState = serde_json::from_value(payload.clone())?;
            let users = {
                let mut set = lock_presence(&presence);
                set.sync_state(snapshot);
                set.keys()
            };
            events.emit(SessionEvent::GotUserList { users });
            Ok(())
        });

        let presence = Arc::clone(&self.presence);
        let events = gate.clone();
        lobby.on(PRESENCE_DIFF, move |payload| {
            let diff: PresenceDiff = serde_json::from_value(payload.clone())?;
            let users = {
                let mut set = lock_presence(&presence);
                set.sync_diff(diff);
                set.keys()
            };
            events.emit(SessionEvent::GotUserList { users });
            Ok(())
        });

        let events = gate.clone();
        lobby.on(GAME_LIST, move |payload| {
            events.emit(SessionEvent::GotGameList {
                games: game_list(payload),
            });
            Ok(())
        });
    }

    /// Push `new_game` / `join_game` on the lobby. `None` means rejected.
    ///
    /// A `requested` name always wins over one in the reply.
    async fn request_game(
        &mut self,
        event: &'static str,
        payload: Value,
        requested: Option<String>,
    ) -> Result<Option<String>> {
        let pushed = match &self.lobby {
            Some(lobby) => lobby.push(event, payload),
            None => return Err(self.invalid("request a game")),
        };
        let pending = pushed.map_err(|e| self.fail(e))?;
        self.state = SessionState::StartingGame;
        let reply = self.settle(pending).await?;

        if !reply.is_ok() {
            warn!(request = event, reason = ?reply.reject_reason(), "game request rejected");
            self.state = SessionState::InLobby;
            emit_event(
                &self.events,
                SessionEvent::GameRequestRejected {
                    request: event,
                    response: reply.response,
                },
            );
            return Ok(None);
        }

        let assigned = requested.or_else(|| {
            serde_json::from_value::<GameAssigned>(reply.response.clone())
                .ok()
                .and_then(|assigned| assigned.game_name)
        });
        if assigned.is_none() {
            warn!(request = event, "game request accepted without a game name");
            self.state = SessionState::InLobby;
            emit_event(
                &self.events,
                SessionEvent::GameRequestRejected {
                    request: event,
                    response: reply.response,
                },
            );
        }
        Ok(assigned)
    }

    /// Leave the lobby and, once the server confirmed it, join the game.
    async fn migrate_to_game(&mut self, user_name: String, game_name: String) -> Result<()> {
        let left = match &self.lobby {
            Some(lobby) => lobby.leave(),
            None => return Err(self.invalid("leave the lobby")),
        };
        let pending = left.map_err(|e| self.fail(e))?;
        let reply = self.settle(pending).await?;

        if !reply.is_ok() {
            warn!(game = %game_name, reason = ?reply.reject_reason(), "lobby refused the leave");
            self.state = SessionState::InLobby;
            emit_event(
                &self.events,
                SessionEvent::JoinedGameChannel {
                    game_name,
                    joined: false,
                    response: reply.response,
                },
            );
            return Ok(());
        }

        debug!("left lobby");
        self.lobby = None;
        lock_presence(&self.presence).clear();
        self.join_game_topic(user_name, game_name).await
    }

    async fn join_game_topic(&mut self, user_name: String, game_name: String) -> Result<()> {
        if self.lobby.is_some() {
            return Err(self.invalid("join a game topic"));
        }
        self.state = SessionState::JoiningGame;

        let topic = format!("{}{}", self.config.game_topic_prefix, game_name);
        let params = serde_json::to_value(UserParams { user_name })?;
        let game = self.socket.topic(topic, params);
        let gate = EventGate::new(self.events.clone());
        let events = gate.clone();
        game.on(GAME_STATE, move |payload| {
            events.emit(SessionEvent::GotGameState {
                state: game_state(payload),
            });
            Ok(())
        });

        let pending = game.join().map_err(|e| self.fail(e))?;
        self.game = Some(game);
        self.game_name = Some(game_name.clone());
        let reply = self.settle(pending).await?;

        if reply.is_ok() {
            info!(game = %game_name, "joined game");
            self.state = SessionState::InGame;
            gate.open_with([SessionEvent::JoinedGameChannel {
                game_name,
                joined: true,
                response: reply.response,
            }]);
        } else {
            warn!(game = %game_name, reason = ?reply.reject_reason(), "game join rejected");
            gate.discard();
            self.game = None;
            self.state = SessionState::GameJoinFailed;
            emit_event(
                &self.events,
                SessionEvent::JoinedGameChannel {
                    game_name,
                    joined: false,
                    response: reply.response,
                },
            );
        }
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn settle(&mut self, pending: PendingReply) -> Result<Reply> {
        match pending.await {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reset to `Disconnected` if the socket or a held session is gone.
    fn check_connection(&mut self) -> Result<()> {
        if !self.socket.is_connected() {
            self.teardown();
            return Err(SessionError::NotConnected);
        }
        let dead = |session: &Option<TopicSession>| {
            session
                .as_ref()
                .is_some_and(|s| matches!(s.status(), JoinStatus::Errored | JoinStatus::Left))
        };
        let lost = match self.state {
            SessionState::InLobby => dead(&self.lobby),
            SessionState::InGame => dead(&self.game),
            _ => false,
        };
        if lost {
            warn!(state = %self.state, "server closed the current topic");
            self.teardown();
        }
        Ok(())
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        if matches!(
            err,
            SessionError::ConnectionLost | SessionError::NotConnected
        ) {
            warn!(state = %self.state, "connection lost: {err}");
            self.teardown();
        }
        err
    }

    fn invalid(&self, intent: &'static str) -> SessionError {
        let err = SessionError::InvalidState {
            state: self.state(),
            intent,
        };
        debug!("rejected intent: {err}");
        err
    }

    fn teardown(&mut self) {
        self.lobby = None;
        self.game = None;
        self.game_name = None;
        lock_presence(&self.presence).clear();
        self.state = SessionState::Disconnected;
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("state", &self.state())
            .field("lobby", &self.lobby)
            .field("game", &self.game)
            .finish()
    }
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

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn gate_holds_until_opened() {
        let (tx, mut rx) = mpsc::channel(8);
        let gate = EventGate::new(tx);
        gate.emit(SessionEvent::GotUserList {
            users: vec!["bob".into()],
        });
        assert!(drain(&mut rx).is_empty());

        gate.open_with([SessionEvent::Connected]);
        gate.emit(SessionEvent::GotGameState { state: json!(1) });
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Connected,
                SessionEvent::GotUserList {
                    users: vec!["bob".into()]
                },
                SessionEvent::GotGameState { state: json!(1) },
            ]
        );
    }

    #[test]
    fn discarded_gate_drops_everything() {
        let (tx, mut rx) = mpsc::channel(8);
        let gate = EventGate::new(tx);
        gate.emit(SessionEvent::GotGameState { state: json!(1) });
        gate.discard();
        gate.emit(SessionEvent::GotGameState { state: json!(2) });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn game_list_defaults_to_empty() {
        assert_eq!(game_list(&json!({"games": ["g1"]})), json!(["g1"]));
        assert_eq!(game_list(&json!({})), json!([]));
        assert_eq!(game_list(&json!(null)), json!([]));
    }

    #[test]
    fn game_state_unwraps_game_field() {
        assert_eq!(game_state(&json!({"game": {"turn": 2}})), json!({"turn": 2}));
        assert_eq!(game_state(&json!({"turn": 2})), json!({"turn": 2}));
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.lobby_topic, "lobby:lobby");
        assert_eq!(config.game_topic_prefix, "game:");
        assert!(!config.private_games);
    }
}
