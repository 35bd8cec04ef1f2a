//! Transport abstraction underneath the channel socket.
//!
//! The [`Transport`] trait is a bidirectional text message channel between the
//! client and the server. Every message is one serialized channel frame, so a
//! transport implementation owns its framing (WebSocket frames, length-prefixed
//! TCP, an in-process channel in tests).
//!
//! Connecting is not part of this trait: endpoints, TLS and proxies differ per
//! transport. Connect first, then hand the transport to
//! `SessionCoordinator::start` or `Socket::start`. A transport that ends ends
//! the session; reconnecting means starting a new coordinator.
//!
//! # Example: channel-backed transport
//!
//! Useful when frames already arrive through some other task, e.g. a relay
//! or a test harness.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use lobby_session::error::SessionError;
//! use lobby_session::transport::Transport;
//! use tokio::sync::mpsc;
//!
//! struct Relay {
//!     up: mpsc::UnboundedSender<String>,
//!     down: mpsc::UnboundedReceiver<String>,
//! }
//!
//! #[async_trait]
//! impl Transport for Relay {
//!     async fn send(&mut self, frame: String) -> Result<(), SessionError> {
//!         self.up
//!             .send(frame)
//!             .map_err(|e| SessionError::TransportSend(e.to_string()))
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SessionError>> {
//!         self.down.recv().await.map(Ok)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SessionError> {
//!         self.down.close();
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SessionError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete frame and
/// each call to [`recv`](Transport::recv) returns one complete frame.
///
/// `Box<dyn Transport>` works too; the trait is object-safe.
///
/// # Cancel safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the socket loop
/// polls it inside `tokio::select!`. Channel-based implementations (e.g.
/// wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<(), SessionError>;

    /// Receive the next frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, SessionError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), SessionError>;
}
