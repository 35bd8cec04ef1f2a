//! Structured view over server rejection payloads.
//!
//! Phoenix-style servers reject joins and pushes with an error reply whose
//! `response` is conventionally `{"reason": "<text>"}`. The reasons the
//! framework itself produces are mapped to dedicated variants; anything an
//! application channel chooses to send is kept as [`RejectReason::Other`].

use std::fmt;

use serde_json::Value;

/// Why the server refused a join or push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The channel's join callback refused the client.
    Unauthorized,
    /// No channel is mounted for the requested topic.
    UnmatchedTopic,
    /// The channel process crashed while handling the join.
    JoinCrashed,
    /// Application-defined reason, or a payload without a `reason` string.
    Other(String),
}

impl RejectReason {
    /// Extract the reason from an error reply's `response` payload.
    pub fn from_response(response: &Value) -> Self {
        let Some(reason) = response.get("reason").and_then(Value::as_str) else {
            return Self::Other(response.to_string());
        };
        match reason {
            "unauthorized" => Self::Unauthorized,
            "unmatched topic" => Self::UnmatchedTopic,
            "join crashed" => Self::JoinCrashed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns a human-readable description of this reason.
    pub fn description(&self) -> &str {
        match self {
            Self::Unauthorized => {
                "The server refused the join. Check the user name and join parameters."
            }
            Self::UnmatchedTopic => {
                "The server has no channel for this topic. The game may have ended or the name is wrong."
            }
            Self::JoinCrashed => {
                "The server-side channel crashed while joining. Please try again."
            }
            Self::Other(reason) => reason,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
