//! The channel socket: one background loop per connection.
//!
//! [`Socket`] is a thin handle that talks to a background transport loop over
//! an unbounded MPSC channel. The loop owns the [`Transport`], the table of
//! requests waiting for a `phx_reply` (keyed by ref) and the routing table
//! from topic name to the [`TopicSession`] that currently owns it. It
//! multiplexes outbound commands, inbound frames, heartbeat ticks and the
//! shutdown signal with `tokio::select!`.
//!
//! When the transport goes away every waiting request is resolved with
//! [`SessionError::ConnectionLost`], every routed topic becomes
//! [`Errored`](JoinStatus::Errored), and a final
//! [`SessionEvent::Disconnected`] is delivered. Nothing is retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::{Result, SessionError};
use crate::event::SessionEvent;
use crate::protocol::{Message, PHOENIX_TOPIC, PHX_CLOSE, PHX_ERROR};
use crate::state::JoinStatus;
use crate::topic::{Reply, TopicSession, TopicShared};
use crate::transport::Transport;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default heartbeat period, matching the server's idle timeout budget.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// Socket-level tuning.
///
/// # Example
///
/// ```
/// use lobby_session::socket::SocketConfig;
/// use std::time::Duration;
///
/// let config = SocketConfig::default()
///     .with_event_channel_capacity(512)
///     .with_heartbeat_interval(None);
/// assert_eq!(config.event_channel_capacity, 512);
/// assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped with a warning so
    /// the transport loop never blocks. `Disconnected` is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long [`Socket::shutdown`] waits for the loop before aborting it.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Heartbeat period. A heartbeat still unanswered when the next one is
    /// due closes the connection. `None` disables heartbeats.
    ///
    /// Defaults to **30 seconds**.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

impl SocketConfig {
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// A zero timeout aborts the transport loop immediately on shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval.filter(|period| !period.is_zero());
        self
    }
}

// ── Commands ────────────────────────────────────────────────────────

pub(crate) enum RequestKind {
    Join,
    Leave,
    Push,
}

/// A request whose `phx_reply` is awaited.
pub(crate) struct PendingRequest {
    pub(crate) kind: RequestKind,
    pub(crate) topic: Arc<TopicShared>,
    /// Join ref the request was sent under; replies need not echo it.
    pub(crate) join_ref: Option<String>,
    pub(crate) reply_tx: oneshot::Sender<Result<Reply>>,
}

pub(crate) enum Command {
    /// Send a frame, optionally registering it for reply correlation.
    Push {
        message: Message,
        request: Option<PendingRequest>,
    },
    /// Route inbound frames for the topic to this session.
    Route { topic: Arc<TopicShared> },
    /// Stop routing to this session (if it still owns the topic).
    Unroute { topic: Arc<TopicShared> },
}

// ── Shared state ────────────────────────────────────────────────────

struct SocketState {
    connected: AtomicBool,
    next_ref: AtomicU64,
}

impl SocketState {
    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Cheap handle used by topic sessions to reach the loop.
#[derive(Clone)]
pub(crate) struct SocketLink {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<SocketState>,
}

impl SocketLink {
    pub(crate) fn make_ref(&self) -> String {
        self.state.make_ref()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| SessionError::NotConnected)
    }
}

// ── Socket handle ───────────────────────────────────────────────────

/// Handle to a running channel socket.
///
/// Created via [`Socket::start`], which spawns the transport loop and returns
/// this handle together with the event receiver. Topic sessions are opened
/// with [`Socket::topic`].
pub struct Socket {
    link: SocketLink,
    event_tx: mpsc::Sender<SessionEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl Socket {
    /// Start the transport loop over a connected transport.
    ///
    /// The first event on the receiver is always
    /// [`Connected`](SessionEvent::Connected) and the last one
    /// [`Disconnected`](SessionEvent::Disconnected).
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        transport: impl Transport,
        config: SocketConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // tokio panics on a zero capacity.
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(SocketState {
            connected: AtomicBool::new(true),
            next_ref: AtomicU64::new(1),
        });

        let task = tokio::spawn(transport_loop(
            transport,
            cmd_rx,
            event_tx.clone(),
            Arc::clone(&state),
            shutdown_rx,
            config.heartbeat_interval,
        ));

        let socket = Self {
            link: SocketLink { cmd_tx, state },
            event_tx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (socket, event_rx)
    }

    /// Open an idle session for `topic`, joined later with `params`.
    pub fn topic(&self, topic: impl Into<String>, params: Value) -> TopicSession {
        TopicSession::new(self.link.clone(), topic.into(), params)
    }

    /// Returns `true` while the transport loop is running.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Sender half of the event channel, for events raised outside the loop.
    pub(crate) fn event_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.event_tx.clone()
    }

    /// Close the transport and stop the loop.
    ///
    /// Requests still waiting for a reply resolve with
    /// [`SessionError::ConnectionLost`].
    pub async fn shutdown(&mut self) {
        debug!("Socket: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Abort the loop if it does not finish in time so it cannot detach.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("transport loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("transport loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("transport loop aborted: {join_err}");
                    }
                }
            }
        }

        self.link.state.connected.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("connected", &self.is_connected())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // No executor to drive a graceful close from `Drop`; abort instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Transport loop ──────────────────────────────────────────────────

/// Loop-owned bookkeeping.
struct Router {
    pending: HashMap<String, PendingRequest>,
    routes: HashMap<String, Arc<TopicShared>>,
    heartbeat_ref: Option<String>,
}

impl Router {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            routes: HashMap::new(),
            heartbeat_ref: None,
        }
    }

    fn route(&mut self, topic: Arc<TopicShared>) {
        debug!(topic = topic.topic(), "routing topic");
        self.routes.insert(topic.topic().to_string(), topic);
    }

    fn unroute(&mut self, topic: &Arc<TopicShared>) {
        let owned = self
            .routes
            .get(topic.topic())
            .is_some_and(|current| Arc::ptr_eq(current, topic));
        if owned {
            debug!(topic = topic.topic(), "unrouting topic");
            self.routes.remove(topic.topic());
        }
    }

    /// Handle one inbound frame.
    fn dispatch(&mut self, msg: Message) {
        if msg.is_reply() {
            self.resolve(msg);
            return;
        }
        if msg.topic == PHOENIX_TOPIC {
            return;
        }

        let Some(topic) = self.routes.get(&msg.topic).cloned() else {
            debug!(topic = %msg.topic, event = %msg.event, "dropping frame for unrouted topic");
            return;
        };
        if !topic.is_member(msg.join_ref.as_deref()) {
            debug!(topic = %msg.topic, event = %msg.event, "dropping frame from a previous join");
            return;
        }

        match msg.event.as_str() {
            PHX_ERROR => {
                warn!(topic = %msg.topic, "server-side channel errored");
                topic.set_status(JoinStatus::Errored);
                self.unroute(&topic);
            }
            PHX_CLOSE => {
                debug!(topic = %msg.topic, "server closed channel");
                topic.set_status(JoinStatus::Left);
                self.unroute(&topic);
            }
            _ => {}
        }
        topic.dispatch(&msg.event, &msg.payload);
    }

    /// Correlate a `phx_reply` with its request.
    fn resolve(&mut self, msg: Message) {
        let Some(msg_ref) = msg.msg_ref.as_deref() else {
            debug!(topic = %msg.topic, "reply without ref");
            return;
        };
        if self.heartbeat_ref.as_deref() == Some(msg_ref) {
            self.heartbeat_ref = None;
            return;
        }
        let Some(request) = self.pending.remove(msg_ref) else {
            debug!(topic = %msg.topic, %msg_ref, "reply for unknown ref");
            return;
        };

        let reply = Reply::from_payload(msg.payload);
        let join_ref = request.join_ref.as_deref();
        let topic = &request.topic;
        match request.kind {
            RequestKind::Join => {
                let next = if reply.is_ok() {
                    JoinStatus::Joined
                } else {
                    JoinStatus::Errored
                };
                if topic.transition(join_ref, JoinStatus::Joining, next) && !reply.is_ok() {
                    self.unroute(topic);
                }
            }
            RequestKind::Leave => {
                if reply.is_ok() {
                    if topic.transition(join_ref, JoinStatus::Leaving, JoinStatus::Left) {
                        self.unroute(topic);
                    }
                } else {
                    topic.transition(join_ref, JoinStatus::Leaving, JoinStatus::Joined);
                }
            }
            RequestKind::Push => {}
        }

        if request.reply_tx.send(Ok(reply)).is_err() {
            debug!(%msg_ref, "reply receiver dropped");
        }
    }

    /// Release every waiter and mark routed topics errored.
    fn fail_all(&mut self) {
        for (_, request) in self.pending.drain() {
            let _ = request.reply_tx.send(Err(SessionError::ConnectionLost));
        }
        for (_, topic) in self.routes.drain() {
            if topic.status() != JoinStatus::Left {
                topic.set_status(JoinStatus::Errored);
            }
        }
    }
}

fn heartbeat_timer(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    })
}

async fn next_heartbeat(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Background transport loop.
///
/// Exits when the command channel closes, the shutdown signal fires, the
/// transport closes or fails, or a heartbeat goes unanswered.
async fn transport_loop(
    mut transport: impl Transport,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
    state: Arc<SocketState>,
    mut shutdown_rx: oneshot::Receiver<()>,
    heartbeat_interval: Option<Duration>,
) {
    debug!("transport loop started");
    emit_event(&event_tx, SessionEvent::Connected);

    let mut router = Router::new();
    let mut heartbeat = heartbeat_timer(heartbeat_interval);

    let reason = loop {
        tokio::select! {
            // Branch 1: outgoing command from a topic session
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Push { message, request }) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("failed to serialize frame: {e}");
                                if let Some(request) = request {
                                    let _ = request
                                        .reply_tx
                                        .send(Err(SessionError::Serialization(e)));
                                }
                                continue;
                            }
                        };
                        if let (Some(request), Some(msg_ref)) = (request, message.msg_ref) {
                            router.pending.insert(msg_ref, request);
                        }
                        debug!(topic = %message.topic, event = %message.event, "sending frame");
                        if let Err(e) = transport.send(json).await {
                            error!("transport send error: {e}");
                            break Some(format!("transport send error: {e}"));
                        }
                    }
                    Some(Command::Route { topic }) => router.route(topic),
                    Some(Command::Unroute { topic }) => router.unroute(&topic),
                    // Every handle dropped.
                    None => {
                        debug!("command channel closed, shutting down transport loop");
                        let _ = transport.close().await;
                        break Some("socket dropped".into());
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                let _ = transport.close().await;
                break Some("client shut down".into());
            }

            // Branch 3: heartbeat
            () = next_heartbeat(&mut heartbeat) => {
                if router.heartbeat_ref.is_some() {
                    warn!("heartbeat timeout, closing connection");
                    let _ = transport.close().await;
                    break Some("heartbeat timeout".into());
                }
                let msg_ref = state.make_ref();
                router.heartbeat_ref = Some(msg_ref.clone());
                let frame = Message::heartbeat(msg_ref);
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if let Err(e) = transport.send(json).await {
                            error!("transport send error: {e}");
                            break Some(format!("transport send error: {e}"));
                        }
                    }
                    Err(e) => error!("failed to serialize heartbeat: {e}"),
                }
            }

            // Branch 4: incoming frame from the server
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<Message>(&text) {
                        Ok(msg) => router.dispatch(msg),
                        Err(e) => warn!("failed to decode frame: {e} (raw: {text})"),
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        break Some(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!("transport closed by server");
                        break None;
                    }
                }
            }
        }
    };

    state.connected.store(false, Ordering::Release);
    router.fail_all();
    emit_disconnected(&event_tx, reason).await;
    debug!("transport loop exited");
}

/// Emit an event without blocking. A full channel drops the event with a warning.
pub(crate) fn emit_event(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// `Disconnected` is the last event and must not be dropped, so it waits for room.
async fn emit_disconnected(event_tx: &mpsc::Sender<SessionEvent>, reason: Option<String>) {
    let event = SessionEvent::Disconnected { reason };
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
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
    use async_trait::async_trait;
    use serde_json::json;

    /// In-process transport whose server side is driven by the test.
    struct ChannelTransport {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<Result<String>>,
    }

    struct ServerEnd {
        rx: mpsc::UnboundedReceiver<String>,
        tx: mpsc::UnboundedSender<Result<String>>,
    }

    impl ServerEnd {
        async fn frame(&mut self) -> Message {
            let text = self.rx.recv().await.expect("client frame");
            serde_json::from_str(&text).unwrap()
        }

        fn send(&self, msg: &Message) {
            self.tx.send(Ok(serde_json::to_string(msg).unwrap())).unwrap();
        }

        fn reply(&self, to: &Message, status: &str, response: Value) {
            self.send(&Message {
                join_ref: to.join_ref.clone(),
                msg_ref: to.msg_ref.clone(),
                topic: to.topic.clone(),
                event: "phx_reply".into(),
                payload: json!({"status": status, "response": response}),
            });
        }
    }

    fn pair() -> (ChannelTransport, ServerEnd) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: client_tx,
                rx: client_rx,
            },
            ServerEnd {
                rx: server_rx,
                tx: server_tx,
            },
        )
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.tx
                .send(message)
                .map_err(|e| SessionError::TransportSend(e.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.rx.recv().await
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn quiet() -> SocketConfig {
        SocketConfig::default().with_heartbeat_interval(None)
    }

    #[tokio::test]
    async fn first_event_is_connected() {
        let (transport, _server) = pair();
        let (mut socket, mut events) = Socket::start(transport, quiet());
        assert_eq!(events.recv().await, Some(SessionEvent::Connected));
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn refs_are_unique_and_increasing() {
        let (transport, _server) = pair();
        let (mut socket, _events) = Socket::start(transport, quiet());
        let a: u64 = socket.link.make_ref().parse().unwrap();
        let b: u64 = socket.link.make_ref().parse().unwrap();
        assert!(b > a);
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn join_reply_marks_topic_joined() {
        let (transport, mut server) = pair();
        let (mut socket, _events) = Socket::start(transport, quiet());

        let topic = socket.topic("room:1", json!({"user_name": "alice"}));
        let pending = topic.join().unwrap();
        assert_eq!(topic.status(), JoinStatus::Joining);

        let join = server.frame().await;
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.join_ref, join.msg_ref);
        assert_eq!(join.payload, json!({"user_name": "alice"}));
        server.reply(&join, "ok", json!({}));

        assert!(pending.await.unwrap().is_ok());
        assert_eq!(topic.status(), JoinStatus::Joined);
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_is_sent_on_phoenix_topic() {
        let (transport, mut server) = pair();
        let config =
            SocketConfig::default().with_heartbeat_interval(Some(Duration::from_millis(20)));
        let (mut socket, _events) = Socket::start(transport, config);

        let beat = server.frame().await;
        assert_eq!(beat.topic, PHOENIX_TOPIC);
        assert_eq!(beat.event, "heartbeat");
        assert!(beat.join_ref.is_none());
        server.reply(&beat, "ok", json!({}));

        let next = server.frame().await;
        assert_eq!(next.event, "heartbeat");
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn missed_heartbeat_disconnects() {
        let (transport, mut server) = pair();
        let config =
            SocketConfig::default().with_heartbeat_interval(Some(Duration::from_millis(20)));
        let (_socket, mut events) = Socket::start(transport, config);

        let _unanswered = server.frame().await;
        assert_eq!(events.recv().await, Some(SessionEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Disconnected {
                reason: Some("heartbeat timeout".into())
            })
        );
    }

    #[tokio::test]
    async fn undecodable_frame_is_skipped() {
        let (transport, mut server) = pair();
        let (mut socket, _events) = Socket::start(transport, quiet());

        let topic = socket.topic("room:1", json!({}));
        let pending = topic.join().unwrap();
        let join = server.frame().await;
        server.tx.send(Ok("{not a frame".into())).unwrap();
        server.reply(&join, "ok", json!({}));

        assert!(pending.await.unwrap().is_ok());
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_pending_requests() {
        let (transport, mut server) = pair();
        let (mut socket, _events) = Socket::start(transport, quiet());

        let topic = socket.topic("room:1", json!({}));
        let pending = topic.join().unwrap();
        let _join = server.frame().await;

        socket.shutdown().await;
        assert!(matches!(pending.await, Err(SessionError::ConnectionLost)));
        assert_eq!(topic.status(), JoinStatus::Errored);
        assert!(!socket.is_connected());
        assert!(matches!(topic.join(), Err(SessionError::NotConnected)));
    }
}
