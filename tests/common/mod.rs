#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for lobby session integration tests.
//!
//! Provides an in-process [`LoopbackTransport`] whose far end is a scripted
//! [`MockServer`]: the test reads the frames the client sent and answers
//! them by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lobby_session::protocol::{Message, PHX_REPLY};
use lobby_session::{SessionError, SessionEvent, Transport};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Upper bound for any single wait in the tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(2);

// ── LoopbackTransport ───────────────────────────────────────────────

/// Client half of an in-process connection.
pub struct LoopbackTransport {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<Option<Result<String, SessionError>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::TransportClosed);
        }
        self.outgoing
            .send(message)
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        // A `None` item or a dropped server both read as a clean close.
        self.incoming.recv().await.flatten()
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ── MockServer ──────────────────────────────────────────────────────

/// Server half of an in-process connection.
pub struct MockServer {
    received: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<Option<Result<String, SessionError>>>,
    /// Set once the client called `close()`.
    pub closed: Arc<AtomicBool>,
}

/// Create a connected transport / server pair.
pub fn loopback() -> (LoopbackTransport, MockServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        LoopbackTransport {
            outgoing: client_tx,
            incoming: client_rx,
            closed: Arc::clone(&closed),
        },
        MockServer {
            received: server_rx,
            outgoing: server_tx,
            closed,
        },
    )
}

impl MockServer {
    /// Next frame the client sent, skipping heartbeats.
    pub async fn next_frame(&mut self) -> Message {
        loop {
            let text = tokio::time::timeout(STEP_TIMEOUT, self.received.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client transport dropped");
            let frame: Message = serde_json::from_str(&text).expect("client sent a valid frame");
            if frame.topic != "phoenix" {
                return frame;
            }
        }
    }

    /// Next frame, including heartbeats.
    pub async fn next_raw_frame(&mut self) -> Message {
        let text = tokio::time::timeout(STEP_TIMEOUT, self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport dropped");
        serde_json::from_str(&text).expect("client sent a valid frame")
    }

    /// Frame the client sent, if any is already queued.
    pub fn try_frame(&mut self) -> Option<Message> {
        self.received
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("client sent a valid frame"))
    }

    /// Assert the client sends nothing else within `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(Some(text)) = tokio::time::timeout(wait, self.received.recv()).await {
            panic!("unexpected client frame: {text}");
        }
    }

    pub fn send(&self, frame: &Message) {
        self.send_raw(serde_json::to_string(frame).unwrap());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.outgoing.send(Some(Ok(text.into())));
    }

    pub fn reply(&self, to: &Message, status: &str, response: Value) {
        self.send(&Message {
            join_ref: to.join_ref.clone(),
            msg_ref: to.msg_ref.clone(),
            topic: to.topic.clone(),
            event: PHX_REPLY.into(),
            payload: json!({"status": status, "response": response}),
        });
    }

    pub fn reply_ok(&self, to: &Message, response: Value) {
        self.reply(to, "ok", response);
    }

    pub fn reply_error(&self, to: &Message, response: Value) {
        self.reply(to, "error", response);
    }

    /// Broadcast `event` on `topic` (no join ref, like a channel broadcast).
    pub fn push(&self, topic: &str, event: &str, payload: Value) {
        self.send(&Message {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        });
    }

    /// Push tagged with a specific join ref.
    pub fn push_with_join_ref(&self, join_ref: &str, topic: &str, event: &str, payload: Value) {
        self.send(&Message {
            join_ref: Some(join_ref.into()),
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        });
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        let _ = self.outgoing.send(None);
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Next event, failing the test after [`STEP_TIMEOUT`].
pub async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Events already queued, without waiting.
pub fn queued_events(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Give the transport loop a moment to process what was sent.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
