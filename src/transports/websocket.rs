//! WebSocket transport using `tokio-tungstenite`.
//!
//! Phoenix sockets are mounted at a path such as `/socket`; the WebSocket
//! endpoint lives under it at `/socket/websocket?vsn=2.0.0`. Use
//! [`WebSocketTransport::connect_socket`] with the mount URL, or
//! [`WebSocketTransport::connect`] with a full endpoint URL. Both `ws://` and
//! `wss://` work; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! Only available with the `transport-websocket` feature (on by default).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::error::SessionError;
use crate::protocol::websocket_endpoint;
use crate::transport::Transport;

/// The underlying WebSocket stream, public so callers can build one with
/// custom TLS or headers and pass it to [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// Channel frames travel as WebSocket text frames. [`recv`](Transport::recv)
/// is cancel-safe: dropping its future before completion loses nothing.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Connect to a full WebSocket endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Io`] if the URL is invalid or the handshake
    /// fails. I/O error kinds are preserved; other failures map to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        tracing::debug!(url = %url, "connecting to WebSocket endpoint");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SessionError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "WebSocket connection established");
        Ok(Self::from_stream(stream))
    }

    /// Connect to a Phoenix socket mount such as `ws://host:4000/socket`.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn connect_socket(socket_url: &str) -> Result<Self, SessionError> {
        Self::connect(&websocket_endpoint(socket_url)).await
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// [`connect`](Self::connect) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, SessionError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| SessionError::Timeout)?
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::TransportClosed);
        }
        self.stream
            .send(WsMessage::Text(message.into()))
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(SessionError::TransportReceive(e.to_string()))),
            };

            match msg {
                WsMessage::Text(text) => return Some(Ok(text.to_string())),
                WsMessage::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                WsMessage::Binary(bytes) => {
                    tracing::warn!(
                        len = bytes.len(),
                        "skipping binary frame; only the JSON serializer is supported"
                    );
                }
                WsMessage::Frame(_) => {
                    tracing::debug!("skipping raw WebSocket frame");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
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
    use crate::protocol::{Message, PHX_JOIN, PHX_REPLY};
    use serde_json::json;
    use tokio::net::TcpListener;

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accept one WebSocket connection on an ephemeral port and hand it to `handler`.
    /// Returns the socket mount URL (without the `/websocket` suffix).
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}/socket")
    }

    #[test]
    fn websocket_transport_is_send_and_debug() {
        fn assert_traits<T: Send + std::fmt::Debug>() {}
        assert_traits::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let err = WebSocketTransport::connect("not a url").await.unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        let err = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
    }

    #[tokio::test]
    async fn join_frame_round_trips_through_a_server() {
        let url = serve_once(|mut ws| async move {
            let Some(Ok(WsMessage::Text(text))) = ws.next().await else {
                return;
            };
            let join: Message = serde_json::from_str(&text).unwrap();
            let reply = Message {
                join_ref: join.join_ref.clone(),
                msg_ref: join.msg_ref.clone(),
                topic: join.topic.clone(),
                event: PHX_REPLY.into(),
                payload: json!({"status": "ok", "response": {"games": []}}),
            };
            ws.send(WsMessage::Text(serde_json::to_string(&reply).unwrap().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect_socket(&url).await.unwrap();
        let join = Message {
            join_ref: Some("1".into()),
            msg_ref: Some("1".into()),
            topic: "lobby:lobby".into(),
            event: PHX_JOIN.into(),
            payload: json!({"user_name": "alice"}),
        };
        transport.send(serde_json::to_string(&join).unwrap()).await.unwrap();

        let text = transport.recv().await.unwrap().unwrap();
        let reply: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.event, PHX_REPLY);
        assert_eq!(reply.msg_ref.as_deref(), Some("1"));

        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_skipped() {
        let url = serve_once(|mut ws| async move {
            ws.send(WsMessage::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.send(WsMessage::Text("[null,null,\"t\",\"e\",{}]".into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect_socket(&url).await.unwrap();
        let text = transport.recv().await.unwrap().unwrap();
        assert_eq!(text, "[null,null,\"t\",\"e\",{}]");
    }

    #[tokio::test]
    async fn send_after_close_fails_and_close_is_idempotent() {
        let url = serve_once(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect_socket(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportClosed));
    }
}
