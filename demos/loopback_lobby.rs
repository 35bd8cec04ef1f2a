//! # Loopback Lobby Example
//!
//! Runs the full lobby → game flow against an in-process fake server, so
//! it needs no network. Useful for seeing the frame order on the wire:
//!
//! ```sh
//! RUST_LOG=lobby_session=debug cargo run --example loopback_lobby
//! ```

use async_trait::async_trait;
use lobby_session::protocol::Message;
use lobby_session::{
    PlayerAction, SessionConfig, SessionCoordinator, SessionError, SessionEvent, Transport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ── Loopback transport ──────────────────────────────────────────────

struct Loopback {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        self.to_server
            .send(message)
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

// ── Fake server ─────────────────────────────────────────────────────

fn outgoing(
    join_ref: Option<String>,
    msg_ref: Option<String>,
    topic: &str,
    event: &str,
    payload: Value,
) -> String {
    let msg = Message {
        join_ref,
        msg_ref,
        topic: topic.to_string(),
        event: event.to_string(),
        payload,
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

/// Accepts everything: one open game, one other player, one game-state push.
async fn fake_server(
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
) {
    while let Some(text) = from_client.recv().await {
        let Ok(msg) = serde_json::from_str::<Message>(&text) else {
            continue;
        };
        println!("server <- {text}");

        let reply = |response: Value| {
            outgoing(
                msg.join_ref.clone(),
                msg.msg_ref.clone(),
                &msg.topic,
                "phx_reply",
                json!({"status": "ok", "response": response}),
            )
        };

        let mut frames = Vec::new();
        match (msg.topic.as_str(), msg.event.as_str()) {
            ("lobby:lobby", "phx_join") => {
                let me = msg.payload["user_name"].as_str().unwrap_or("me").to_string();
                frames.push(reply(json!({"games": ["open-1"]})));
                frames.push(outgoing(
                    msg.join_ref.clone(),
                    None,
                    &msg.topic,
                    "presence_state",
                    json!({
                        "carol": {"metas": [{"phx_ref": "c1"}]},
                        (me): {"metas": [{"phx_ref": "m1"}]}
                    }),
                ));
            }
            ("lobby:lobby", "new_game") => frames.push(reply(json!({"game_name": "demo-1"}))),
            (topic, "phx_join") if topic.starts_with("game:") => {
                frames.push(reply(json!({})));
                frames.push(outgoing(
                    None,
                    None,
                    topic,
                    "game_state",
                    json!({"game": {"turn": 0, "players": ["carol"]}}),
                ));
            }
            _ => frames.push(reply(json!({}))),
        }

        for frame in frames {
            println!("server -> {frame}");
            if to_client.send(frame).is_err() {
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    tokio::spawn(fake_server(server_rx, server_tx));

    let transport = Loopback {
        to_server: client_tx,
        from_server: client_rx,
    };
    let (mut session, mut events) = SessionCoordinator::start(transport, SessionConfig::default());

    session.register_user("alice").await?;
    session.start_new_game("alice").await?;
    let reply = session
        .push_player_action(PlayerAction::new("move", json!({"cell": 4})))?
        .await?;
    println!("move acknowledged: {}", reply.is_ok());

    session.shutdown().await;
    while let Some(event) = events.recv().await {
        println!("event: {event:?}");
        if matches!(event, SessionEvent::Disconnected { .. }) {
            break;
        }
    }
    Ok(())
}
