//! Reconciled view of who is present on a topic.
//!
//! The server sends one `presence_state` snapshot right after a join and
//! `presence_diff` updates afterwards. [`PresenceSet`] folds both into a
//! single map keyed by user. Keys keep insertion order so the UI sees a
//! stable list between updates, but nothing guarantees the order survives a
//! new snapshot.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One connection's metadata for a present user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Server-assigned reference of the tracked connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phx_ref: Option<String>,
    /// Everything else the server tracked for this connection.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PresenceMeta {
    /// Whether `other` describes the same connection.
    fn same_connection(&self, other: &Self) -> bool {
        match (&self.phx_ref, &other.phx_ref) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

/// All connections of one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub metas: Vec<PresenceMeta>,
}

/// Full presence snapshot, as carried by `presence_state`.
pub type PresenceState = IndexMap<String, Presence>;

/// Incremental presence update, as carried by `presence_diff`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// The reconciled membership view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSet {
    entries: PresenceState,
}

impl PresenceSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with `snapshot`.
    pub fn sync_state(&mut self, snapshot: PresenceState) {
        self.entries = snapshot;
    }

    /// Fold an incremental update: leaves first, then joins.
    ///
    /// A key that leaves and joins in the same diff ends up present with the
    /// joined metas.
    pub fn sync_diff(&mut self, diff: PresenceDiff) {
        for (key, left) in diff.leaves {
            let Some(current) = self.entries.get_mut(&key) else {
                continue;
            };
            current
                .metas
                .retain(|meta| !left.metas.iter().any(|gone| gone.same_connection(meta)));
            if current.metas.is_empty() {
                self.entries.shift_remove(&key);
            }
        }

        for (key, joined) in diff.joins {
            match self.entries.get_mut(&key) {
                Some(current) => {
                    let mut metas: Vec<PresenceMeta> = current
                        .metas
                        .drain(..)
                        .filter(|meta| !joined.metas.iter().any(|new| new.same_connection(meta)))
                        .collect();
                    metas.extend(joined.metas);
                    current.metas = metas;
                }
                None => {
                    self.entries.insert(key, joined);
                }
            }
        }
    }

    /// Present user keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Metas tracked for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Presence> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Presence)> {
        self.entries.iter()
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

    fn state(value: Value) -> PresenceState {
        serde_json::from_value(value).unwrap()
    }

    fn diff(value: Value) -> PresenceDiff {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn snapshot_replaces_previous_contents() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({"alice": {"metas": [{"phx_ref": "a1"}]}})));
        set.sync_state(state(json!({"bob": {"metas": [{"phx_ref": "b1"}]}})));
        assert_eq!(set.keys(), vec!["bob".to_string()]);
    }

    #[test]
    fn snapshot_preserves_wire_order() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({
            "zed": {"metas": [{"phx_ref": "z"}]},
            "amy": {"metas": [{"phx_ref": "a"}]},
        })));
        assert_eq!(set.keys(), vec!["zed".to_string(), "amy".to_string()]);
    }

    #[test]
    fn diff_replaces_leaving_user_with_joining_user() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({"alice": {"metas": [{"phx_ref": "a1"}]}})));
        set.sync_diff(diff(json!({
            "joins": {"bob": {"metas": [{"phx_ref": "b1"}]}},
            "leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}},
        })));
        assert_eq!(set.keys(), vec!["bob".to_string()]);
    }

    #[test]
    fn leave_and_rejoin_in_one_diff_keeps_join_metas() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({"alice": {"metas": [{"phx_ref": "a1", "device": "old"}]}})));
        set.sync_diff(diff(json!({
            "joins": {"alice": {"metas": [{"phx_ref": "a2", "device": "new"}]}},
            "leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}},
        })));
        let alice = set.get("alice").unwrap();
        assert_eq!(alice.metas.len(), 1);
        assert_eq!(alice.metas[0].phx_ref.as_deref(), Some("a2"));
        assert_eq!(alice.metas[0].fields["device"], json!("new"));
    }

    #[test]
    fn leaving_one_connection_keeps_the_others() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({
            "alice": {"metas": [{"phx_ref": "a1"}, {"phx_ref": "a2"}]}
        })));
        set.sync_diff(diff(json!({"leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}}})));
        let refs: Vec<_> = set
            .get("alice")
            .unwrap()
            .metas
            .iter()
            .map(|m| m.phx_ref.clone())
            .collect();
        assert_eq!(refs, vec![Some("a2".to_string())]);
    }

    #[test]
    fn join_of_known_user_appends_new_connection() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({"alice": {"metas": [{"phx_ref": "a1"}]}})));
        set.sync_diff(diff(json!({"joins": {"alice": {"metas": [{"phx_ref": "a2"}]}}})));
        assert_eq!(set.get("alice").unwrap().metas.len(), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn leave_of_unknown_user_is_ignored() {
        let mut set = PresenceSet::new();
        set.sync_diff(diff(json!({"leaves": {"ghost": {"metas": [{"phx_ref": "g"}]}}})));
        assert!(set.is_empty());
    }

    #[test]
    fn metas_without_ref_match_by_content() {
        let mut set = PresenceSet::new();
        set.sync_state(state(json!({"alice": {"metas": [{"online_at": 1}, {"online_at": 2}]}})));
        set.sync_diff(diff(json!({"leaves": {"alice": {"metas": [{"online_at": 1}]}}})));
        let alice = set.get("alice").unwrap();
        assert_eq!(alice.metas.len(), 1);
        assert_eq!(alice.metas[0].fields["online_at"], json!(2));
    }
}
