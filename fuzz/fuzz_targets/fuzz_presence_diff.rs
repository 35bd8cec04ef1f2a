#![no_main]

use libfuzzer_sys::fuzz_target;
use lobby_session::presence::{PresenceDiff, PresenceSet, PresenceState};

fuzz_target!(|data: &[u8]| {
    // First line: snapshot, rest: one diff per line.
    let text = String::from_utf8_lossy(data);
    let mut lines = text.lines();

    let mut set = PresenceSet::new();
    if let Some(Ok(snapshot)) = lines.next().map(serde_json::from_str::<PresenceState>) {
        set.sync_state(snapshot);
    }

    for line in lines {
        let Ok(diff) = serde_json::from_str::<PresenceDiff>(line) else {
            continue;
        };
        let rejoined: Vec<String> = diff.joins.keys().cloned().collect();
        set.sync_diff(diff);
        for key in rejoined {
            assert!(set.contains(&key), "joined key {key} missing after diff");
        }
    }
});
