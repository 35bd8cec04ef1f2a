//! One subscription to a named topic.
//!
//! A [`TopicSession`] is created [`Idle`](JoinStatus::Idle) by
//! [`Socket::topic`](crate::socket::Socket::topic). Register handlers with
//! [`on`](TopicSession::on) before calling [`join`](TopicSession::join) so the
//! pushes the server sends right after accepting the join are not missed.
//!
//! [`join`](TopicSession::join), [`leave`](TopicSession::leave) and
//! [`push`](TopicSession::push) check the join status synchronously and
//! return misuse errors without touching the network. On success they return
//! a [`PendingReply`] that resolves once the server answers. Replies are
//! matched by ref, so pushes on one topic may complete in any order.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{Message, ReplyPayload, ReplyStatus, PHX_JOIN, PHX_LEAVE};
use crate::reject::RejectReason;
use crate::socket::{Command, PendingRequest, RequestKind, SocketLink};
use crate::state::JoinStatus;

/// Error type handlers may return. Failures are logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of event handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

struct Binding {
    event: String,
    handler: Handler,
}

// ── Reply ───────────────────────────────────────────────────────────

/// The server's answer to a join, leave or push.
///
/// An error reply is data, not an `Err`: inspect [`status`](Reply::status) or
/// use [`into_result`](Reply::into_result) to turn it into
/// [`SessionError::ProtocolRejected`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub response: Value,
}

impl Reply {
    pub(crate) fn from_payload(payload: Value) -> Self {
        match serde_json::from_value::<ReplyPayload>(payload.clone()) {
            Ok(ReplyPayload { status, response }) => Self { status, response },
            Err(e) => {
                warn!("malformed reply payload: {e}");
                Self {
                    status: ReplyStatus::Error,
                    response: payload,
                }
            }
        }
    }

    /// Reply synthesized for requests that complete without a round-trip.
    fn local_ok() -> Self {
        Self {
            status: ReplyStatus::Ok,
            response: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// `Ok(response)` for ok replies, [`SessionError::ProtocolRejected`] otherwise.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            ReplyStatus::Ok => Ok(self.response),
            ReplyStatus::Error => Err(SessionError::ProtocolRejected {
                response: self.response,
            }),
        }
    }

    /// Structured reason of an error reply; `None` for ok replies.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self.status {
            ReplyStatus::Ok => None,
            ReplyStatus::Error => Some(RejectReason::from_response(&self.response)),
        }
    }
}

// ── PendingReply ────────────────────────────────────────────────────

/// A request waiting for its reply.
///
/// Resolves to the server's [`Reply`], or to [`SessionError::ConnectionLost`]
/// if the socket goes away first. Dropping it does not cancel the request.
#[must_use = "a PendingReply does nothing unless awaited"]
#[derive(Debug)]
pub struct PendingReply {
    inner: PendingInner,
}

#[derive(Debug)]
enum PendingInner {
    Waiting(oneshot::Receiver<Result<Reply>>),
    Ready(Option<Reply>),
}

impl PendingReply {
    fn waiting(rx: oneshot::Receiver<Result<Reply>>) -> Self {
        Self {
            inner: PendingInner::Waiting(rx),
        }
    }

    fn ready(reply: Reply) -> Self {
        Self {
            inner: PendingInner::Ready(Some(reply)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or(Err(SessionError::ConnectionLost))),
            // A second poll after completion has nothing left to hand out.
            PendingInner::Ready(slot) => {
                Poll::Ready(slot.take().ok_or(SessionError::ConnectionLost))
            }
        }
    }
}

// ── Shared topic state ──────────────────────────────────────────────

struct TopicInner {
    status: JoinStatus,
    join_ref: Option<String>,
    bindings: Vec<Binding>,
}

/// State shared between a [`TopicSession`] and the socket loop.
pub(crate) struct TopicShared {
    topic: String,
    inner: Mutex<TopicInner>,
}

impl TopicShared {
    fn new(topic: String) -> Self {
        Self {
            topic,
            inner: Mutex::new(TopicInner {
                status: JoinStatus::Idle,
                join_ref: None,
                bindings: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn status(&self) -> JoinStatus {
        self.lock().status
    }

    pub(crate) fn set_status(&self, status: JoinStatus) {
        self.lock().status = status;
    }

    /// Move to `to` only if currently `from` and still on `join_ref`.
    pub(crate) fn transition(
        &self,
        join_ref: Option<&str>,
        from: JoinStatus,
        to: JoinStatus,
    ) -> bool {
        let mut inner = self.lock();
        if inner.status != from || inner.join_ref.as_deref() != join_ref {
            return false;
        }
        debug!(topic = %self.topic, ?from, ?to, "topic status");
        inner.status = to;
        true
    }

    /// Whether a frame tagged with `join_ref` belongs to the current join.
    /// Untagged frames (broadcasts) always belong.
    pub(crate) fn is_member(&self, join_ref: Option<&str>) -> bool {
        match join_ref {
            None => true,
            Some(join_ref) => self.lock().join_ref.as_deref() == Some(join_ref),
        }
    }

    /// Run every handler bound to `event`, in registration order.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<Handler> = self
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.event == event)
            .map(|binding| Arc::clone(&binding.handler))
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(topic = %self.topic, event, "handler failed: {e}");
                }
                Err(_) => {
                    warn!(topic = %self.topic, event, "handler panicked");
                }
            }
        }
    }
}

// ── TopicSession ────────────────────────────────────────────────────

/// Handle to one topic subscription.
pub struct TopicSession {
    shared: Arc<TopicShared>,
    params: Value,
    link: SocketLink,
}

impl TopicSession {
    pub(crate) fn new(link: SocketLink, topic: String, params: Value) -> Self {
        Self {
            shared: Arc::new(TopicShared::new(topic)),
            params,
            link,
        }
    }

    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    pub fn status(&self) -> JoinStatus {
        self.shared.status()
    }

    /// Ref of the current (or last) join request.
    pub fn join_ref(&self) -> Option<String> {
        self.shared.lock().join_ref.clone()
    }

    /// Bind `handler` to every unsolicited push named `event`.
    ///
    /// Handlers run on the socket loop and must not block. A handler that
    /// returns an error or panics is logged and skipped; the others still run.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.lock().bindings.push(Binding {
            event: event.into(),
            handler: Arc::new(handler),
        });
    }

    /// Request to join the topic with the params given at creation.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyJoining`], [`SessionError::AlreadyJoined`] or
    /// [`SessionError::AlreadyLeaving`] if a request is in flight or the topic
    /// is joined; [`SessionError::NotConnected`] if the socket is gone. No
    /// frame is sent in any of these cases.
    pub fn join(&self) -> Result<PendingReply> {
        if !self.link.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let join_ref = self.link.make_ref();
        {
            let mut inner = self.shared.lock();
            match inner.status {
                JoinStatus::Joining => {
                    return Err(self.misuse(SessionError::AlreadyJoining {
                        topic: self.shared.topic.clone(),
                    }))
                }
                JoinStatus::Joined => {
                    return Err(self.misuse(SessionError::AlreadyJoined {
                        topic: self.shared.topic.clone(),
                    }))
                }
                JoinStatus::Leaving => {
                    return Err(self.misuse(SessionError::AlreadyLeaving {
                        topic: self.shared.topic.clone(),
                    }))
                }
                JoinStatus::Idle | JoinStatus::Left | JoinStatus::Errored => {}
            }
            inner.status = JoinStatus::Joining;
            inner.join_ref = Some(join_ref.clone());
        }
        debug!(topic = %self.shared.topic, %join_ref, "joining");

        let routed = self.link.send(Command::Route {
            topic: Arc::clone(&self.shared),
        });
        if let Err(e) = routed {
            self.shared.set_status(JoinStatus::Errored);
            return Err(e);
        }

        let message = Message {
            join_ref: Some(join_ref.clone()),
            msg_ref: Some(join_ref),
            topic: self.shared.topic.clone(),
            event: PHX_JOIN.to_string(),
            payload: self.params.clone(),
        };
        self.request(message, RequestKind::Join)
    }

    /// Leave the topic.
    ///
    /// From [`Joined`](JoinStatus::Joined) this sends `phx_leave` and resolves
    /// on the server's reply. In any other settled status the session moves to
    /// [`Left`](JoinStatus::Left) at once and the returned reply is already
    /// resolved ok. A pending join is abandoned and a `phx_leave` is sent
    /// without waiting for an answer. The server's late answer to the join
    /// still resolves that join's [`PendingReply`] with whatever it said, but
    /// the session stays [`Left`](JoinStatus::Left) and its handlers no
    /// longer fire. Check [`status`](TopicSession::status), not the join
    /// reply, after an abandoned join.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyLeaving`] if a leave is already in flight.
    pub fn leave(&self) -> Result<PendingReply> {
        let (previous, join_ref) = {
            let mut inner = self.shared.lock();
            let previous = inner.status;
            match previous {
                JoinStatus::Leaving => {
                    return Err(self.misuse(SessionError::AlreadyLeaving {
                        topic: self.shared.topic.clone(),
                    }))
                }
                JoinStatus::Joined => inner.status = JoinStatus::Leaving,
                JoinStatus::Idle | JoinStatus::Joining | JoinStatus::Left | JoinStatus::Errored => {
                    inner.status = JoinStatus::Left;
                }
            }
            (previous, inner.join_ref.clone())
        };

        let message = Message {
            join_ref,
            msg_ref: Some(self.link.make_ref()),
            topic: self.shared.topic.clone(),
            event: PHX_LEAVE.to_string(),
            payload: Value::Object(serde_json::Map::new()),
        };

        match previous {
            JoinStatus::Joined => {
                debug!(topic = %self.shared.topic, "leaving");
                self.request(message, RequestKind::Leave)
            }
            JoinStatus::Joining => {
                debug!(topic = %self.shared.topic, "abandoning pending join");
                let _ = self.link.send(Command::Unroute {
                    topic: Arc::clone(&self.shared),
                });
                let _ = self.link.send(Command::Push {
                    message,
                    request: None,
                });
                Ok(PendingReply::ready(Reply::local_ok()))
            }
            _ => Ok(PendingReply::ready(Reply::local_ok())),
        }
    }

    /// Send an application event on the topic.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotJoined`] unless the topic is
    /// [`Joined`](JoinStatus::Joined); [`SessionError::NotConnected`] if the
    /// socket is gone.
    pub fn push(&self, event: impl Into<String>, payload: Value) -> Result<PendingReply> {
        let join_ref = {
            let inner = self.shared.lock();
            if inner.status != JoinStatus::Joined {
                return Err(SessionError::NotJoined {
                    topic: self.shared.topic.clone(),
                });
            }
            inner.join_ref.clone()
        };
        let message = Message {
            join_ref,
            msg_ref: Some(self.link.make_ref()),
            topic: self.shared.topic.clone(),
            event: event.into(),
            payload,
        };
        self.request(message, RequestKind::Push)
    }

    fn request(&self, message: Message, kind: RequestKind) -> Result<PendingReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PendingRequest {
            kind,
            topic: Arc::clone(&self.shared),
            join_ref: message.join_ref.clone(),
            reply_tx,
        };
        if let Err(e) = self.link.send(Command::Push {
            message,
            request: Some(request),
        }) {
            self.shared.set_status(JoinStatus::Errored);
            return Err(e);
        }
        Ok(PendingReply::waiting(reply_rx))
    }

    fn misuse(&self, err: SessionError) -> SessionError {
        debug!(topic = %self.shared.topic, "rejected request: {err}");
        err
    }
}

impl std::fmt::Debug for TopicSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSession")
            .field("topic", &self.shared.topic)
            .field("status", &self.status())
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

    #[test]
    fn error_reply_becomes_protocol_rejected() {
        let reply = Reply::from_payload(json!({
            "status": "error",
            "response": {"reason": "unauthorized"}
        }));
        assert!(!reply.is_ok());
        assert_eq!(reply.reject_reason(), Some(RejectReason::Unauthorized));
        assert!(matches!(
            reply.into_result(),
            Err(SessionError::ProtocolRejected { .. })
        ));
    }

    #[test]
    fn malformed_reply_is_treated_as_error() {
        let reply = Reply::from_payload(json!("garbage"));
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.response, json!("garbage"));
    }

    fn bind<F>(shared: &TopicShared, event: &str, handler: F)
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        shared.lock().bindings.push(Binding {
            event: event.into(),
            handler: Arc::new(handler),
        });
    }

    #[test]
    fn dispatch_isolates_failing_handlers() {
        let shared = TopicShared::new("room:1".into());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&calls);
        bind(&shared, "tick", move |_| {
            log.lock().unwrap().push("first");
            Err("boom".into())
        });
        bind(&shared, "tick", |_| panic!("handler bug"));
        let log = Arc::clone(&calls);
        bind(&shared, "tick", move |_| {
            log.lock().unwrap().push("third");
            Ok(())
        });
        let log = Arc::clone(&calls);
        bind(&shared, "other", move |_| {
            log.lock().unwrap().push("other");
            Ok(())
        });

        shared.dispatch("tick", &json!({}));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn membership_follows_current_join_ref() {
        let shared = TopicShared::new("room:1".into());
        shared.lock().join_ref = Some("4".into());
        assert!(shared.is_member(None));
        assert!(shared.is_member(Some("4")));
        assert!(!shared.is_member(Some("1")));
    }

    #[test]
    fn transition_requires_matching_status_and_ref() {
        let shared = TopicShared::new("room:1".into());
        {
            let mut inner = shared.lock();
            inner.status = JoinStatus::Joining;
            inner.join_ref = Some("2".into());
        }
        assert!(!shared.transition(Some("1"), JoinStatus::Joining, JoinStatus::Joined));
        assert!(!shared.transition(Some("2"), JoinStatus::Leaving, JoinStatus::Left));
        assert!(shared.transition(Some("2"), JoinStatus::Joining, JoinStatus::Joined));
        assert_eq!(shared.status(), JoinStatus::Joined);
    }

    #[tokio::test]
    async fn ready_reply_resolves_immediately() {
        let reply = PendingReply::ready(Reply::local_ok()).await.unwrap();
        assert!(reply.is_ok());
        assert!(reply.response.is_null());
    }

    #[tokio::test]
    async fn dropped_sender_resolves_connection_lost() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let outcome = PendingReply::waiting(rx).await;
        assert!(matches!(outcome, Err(SessionError::ConnectionLost)));
    }
}
