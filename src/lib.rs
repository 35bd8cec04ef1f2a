//! # Lobby Session
//!
//! Client-side session manager for a Phoenix-style channel server: join a
//! lobby topic, track who is present, then move into a game topic.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement the [`Transport`] trait for any backend
//! - **Phoenix V2 wire format**: `[join_ref, ref, topic, event, payload]` JSON frames
//! - **WebSocket built-in**: the default `transport-websocket` feature provides `WebSocketTransport`
//! - **Presence tracking**: [`PresenceSet`] folds `presence_state` / `presence_diff`
//! - **Event-driven**: typed [`SessionEvent`]s arrive on a channel
//!
//! ## Layers
//!
//! - [`Socket`] runs the background transport loop: ref correlation,
//!   topic routing and heartbeats.
//! - [`TopicSession`] is one topic subscription with `join`, `leave`, `push`
//!   and event handlers; requests return an awaitable [`PendingReply`].
//! - [`SessionCoordinator`] drives the lobby → game migration for a UI.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn run() -> lobby_session::error::Result<()> {
//! use lobby_session::{SessionConfig, SessionCoordinator, SessionEvent, WebSocketTransport};
//!
//! let transport = WebSocketTransport::connect_socket("ws://localhost:4000/socket").await?;
//! let (mut session, mut events) = SessionCoordinator::start(transport, SessionConfig::default());
//!
//! session.register_user("alice").await?;
//! session.start_new_game("alice").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::GotGameState { state } => println!("{state}"),
//!         SessionEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "tokio-runtime")]
pub mod coordinator;
pub mod error;
pub mod event;
pub mod presence;
pub mod protocol;
pub mod reject;
#[cfg(feature = "tokio-runtime")]
pub mod socket;
pub mod state;
#[cfg(feature = "tokio-runtime")]
pub mod topic;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
#[cfg(feature = "tokio-runtime")]
pub use coordinator::{JoinGameParams, PlayerAction, SessionConfig, SessionCoordinator};
pub use error::SessionError;
pub use event::SessionEvent;
pub use presence::PresenceSet;
pub use reject::RejectReason;
#[cfg(feature = "tokio-runtime")]
pub use socket::{Socket, SocketConfig};
pub use state::{JoinStatus, SessionState};
#[cfg(feature = "tokio-runtime")]
pub use topic::{PendingReply, Reply, TopicSession};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
