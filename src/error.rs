//! Error types for the lobby session client.

use thiserror::Error;

use crate::state::SessionState;

/// Errors that can occur when using the lobby session client.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the socket is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The socket dropped while a request was waiting for its reply.
    #[error("connection lost before the server replied")]
    ConnectionLost,

    /// The server answered a join or push with an error reply.
    #[error("server rejected the request: {response}")]
    ProtocolRejected {
        /// The `response` field of the error reply, verbatim.
        response: serde_json::Value,
    },

    /// `join` was called while a join on the same topic is still pending.
    #[error("topic {topic} is already joining")]
    AlreadyJoining {
        /// Topic name.
        topic: String,
    },

    /// `join` was called on a topic that is already joined.
    #[error("topic {topic} is already joined")]
    AlreadyJoined {
        /// Topic name.
        topic: String,
    },

    /// `leave` was called while a leave on the same topic is still pending.
    #[error("topic {topic} is already leaving")]
    AlreadyLeaving {
        /// Topic name.
        topic: String,
    },

    /// `push` was called on a topic that is not joined.
    #[error("topic {topic} is not joined")]
    NotJoined {
        /// Topic name.
        topic: String,
    },

    /// A coordinator intent was issued in a state that does not accept it.
    #[error("cannot {intent} while {state}")]
    InvalidState {
        /// The coordinator state at the time of the call.
        state: SessionState,
        /// The rejected intent.
        intent: &'static str,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for lobby session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
