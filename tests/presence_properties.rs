#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Property-based tests for presence reconciliation
//!
//! 1. **Snapshot authority**: after `sync_state(S)` the set equals `S`
//! 2. **Key algebra**: after a diff, keys = (previous \ leaves) ∪ joins
//! 3. **Rejoin wins**: a key that leaves and joins in one diff keeps only the joined metas
//! 4. **Partial leave**: removing one connection keeps the user while others remain

use std::collections::{BTreeMap, BTreeSet};

use lobby_session::presence::{Presence, PresenceDiff, PresenceMeta, PresenceSet, PresenceState};
use proptest::prelude::*;
use serde_json::Map;

fn meta(phx_ref: String) -> PresenceMeta {
    PresenceMeta {
        phx_ref: Some(phx_ref),
        fields: Map::new(),
    }
}

/// `key → n` becomes `key → [tag-key-0 .. tag-key-n]`.
fn presences(shape: &BTreeMap<String, usize>, tag: &str) -> PresenceState {
    shape
        .iter()
        .map(|(key, count)| {
            let metas = (0..*count).map(|i| meta(format!("{tag}-{key}-{i}"))).collect();
            (key.clone(), Presence { metas })
        })
        .collect()
}

fn shape() -> impl Strategy<Value = BTreeMap<String, usize>> {
    prop::collection::btree_map("[a-h]", 1usize..4, 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_snapshot_replaces_everything(
        before in shape(),
        diff_joins in shape(),
        snapshot in shape(),
    ) {
        let mut set = PresenceSet::new();
        set.sync_state(presences(&before, "s"));
        set.sync_diff(PresenceDiff {
            joins: presences(&diff_joins, "j"),
            leaves: PresenceState::new(),
        });

        let expected = presences(&snapshot, "t");
        set.sync_state(expected.clone());

        prop_assert_eq!(set.len(), expected.len());
        for (key, presence) in set.iter() {
            prop_assert_eq!(expected.get(key), Some(presence));
        }
    }

    #[test]
    fn prop_diff_key_algebra(
        before in shape(),
        leaving in prop::collection::btree_set("[a-h]", 0..6),
        joining in shape(),
    ) {
        let previous = presences(&before, "s");
        let mut set = PresenceSet::new();
        set.sync_state(previous.clone());

        // Leaves name every current connection of the leaving keys, plus a
        // few keys that were never present.
        let leaves: PresenceState = leaving
            .iter()
            .map(|key| {
                let presence = previous.get(key).cloned().unwrap_or_else(|| Presence {
                    metas: vec![meta(format!("ghost-{key}"))],
                });
                (key.clone(), presence)
            })
            .collect();
        let joins = presences(&joining, "j");

        set.sync_diff(PresenceDiff { joins: joins.clone(), leaves });

        let expected: BTreeSet<String> = before
            .keys()
            .filter(|key| !leaving.contains(*key))
            .chain(joining.keys())
            .cloned()
            .collect();
        let actual: BTreeSet<String> = set.keys().into_iter().collect();
        prop_assert_eq!(actual, expected);

        for (key, joined) in &joins {
            let present = set.get(key).unwrap();
            if leaving.contains(key) {
                prop_assert_eq!(present, joined);
            } else {
                let tail = &present.metas[present.metas.len() - joined.metas.len()..];
                prop_assert_eq!(tail, joined.metas.as_slice());
            }
        }
    }

    #[test]
    fn prop_partial_leave_keeps_user(
        count in 2usize..5,
        gone in 0usize..5,
    ) {
        let gone = gone % count;
        let mut shape = BTreeMap::new();
        shape.insert("alice".to_string(), count);
        let mut set = PresenceSet::new();
        set.sync_state(presences(&shape, "s"));

        let mut leaves = PresenceState::new();
        leaves.insert(
            "alice".into(),
            Presence { metas: vec![meta(format!("s-alice-{gone}"))] },
        );
        set.sync_diff(PresenceDiff { joins: PresenceState::new(), leaves });

        let remaining = set.get("alice").unwrap();
        prop_assert_eq!(remaining.metas.len(), count - 1);
        let gone_ref = format!("s-alice-{gone}");
        prop_assert!(remaining
            .metas
            .iter()
            .all(|m| m.phx_ref.as_deref() != Some(gone_ref.as_str())));
    }
}

#[test]
fn presence_wire_payloads_decode() {
    let snapshot: PresenceState = serde_json::from_str(
        r#"{"alice": {"metas": [{"phx_ref": "F1", "online_at": "1700000000"}]}}"#,
    )
    .unwrap();
    let alice = &snapshot["alice"].metas[0];
    assert_eq!(alice.phx_ref.as_deref(), Some("F1"));
    assert_eq!(alice.fields["online_at"], "1700000000");

    let diff: PresenceDiff = serde_json::from_str(r#"{"joins": {}}"#).unwrap();
    assert!(diff.leaves.is_empty());
}
