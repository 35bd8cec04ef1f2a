//! # Lobby Session Example
//!
//! Walks one player through a Phoenix lobby server:
//!
//! 1. Connect to the socket over WebSocket
//! 2. Register in the lobby and print presence updates
//! 3. Create a game (or join `LOBBY_GAME` if set) and move into it
//! 4. Print game state until Ctrl+C or disconnect
//!
//! ## Running
//!
//! ```sh
//! # Start the lobby server on localhost:4000, then:
//! cargo run --example lobby_session
//!
//! # Override the socket URL, the player name or join an existing game:
//! LOBBY_SOCKET_URL=ws://my-server:4000/socket LOBBY_USER=bob LOBBY_GAME=g1 \
//!     cargo run --example lobby_session
//! ```

use lobby_session::{
    JoinGameParams, PlayerAction, SessionConfig, SessionCoordinator, SessionEvent, SessionState,
    WebSocketTransport,
};

/// Default socket mount when `LOBBY_SOCKET_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:4000/socket";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for frame-level output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("LOBBY_SOCKET_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let user = std::env::var("LOBBY_USER").unwrap_or_else(|_| "rust-player".to_string());
    let game = std::env::var("LOBBY_GAME").ok();
    tracing::info!("Connecting to {url} as {user}");

    // ── Connect ─────────────────────────────────────────────────────
    let transport = WebSocketTransport::connect_socket(&url).await?;
    let (mut session, mut events) = SessionCoordinator::start(transport, SessionConfig::default());

    // Events arrive independently of the intents below.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Registered { accepted, .. } => {
                    tracing::info!("Registered: {accepted}");
                }
                SessionEvent::GotGameList { games } => tracing::info!("Open games: {games}"),
                SessionEvent::GotUserList { users } => {
                    tracing::info!("In lobby: {}", users.join(", "));
                }
                SessionEvent::JoinedGameChannel {
                    game_name, joined, ..
                } => tracing::info!("Game {game_name}: joined={joined}"),
                SessionEvent::GotGameState { state } => tracing::info!("Game state: {state}"),
                SessionEvent::GameRequestRejected { request, response } => {
                    tracing::warn!("{request} rejected: {response}");
                }
                SessionEvent::Disconnected { reason } => {
                    let reason = reason.as_deref().unwrap_or("server closed");
                    tracing::warn!("Disconnected: {reason}");
                    break;
                }
                SessionEvent::Connected => tracing::info!("Socket connected"),
            }
        }
    });

    // ── Lobby → game ────────────────────────────────────────────────
    session.register_user(user.as_str()).await?;
    if session.state() == SessionState::InLobby {
        match game {
            Some(game_name) => session.join_game(JoinGameParams::new(user, game_name)).await?,
            None => session.start_new_game(user).await?,
        }
    }

    if session.state() == SessionState::InGame {
        let reply = session
            .push_player_action(PlayerAction::new("ready", serde_json::json!({})))?
            .await?;
        tracing::info!("ready acknowledged: {}", reply.is_ok());
    }

    // ── Wait ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down");
    session.shutdown().await;
    let _ = printer.await;
    Ok(())
}
