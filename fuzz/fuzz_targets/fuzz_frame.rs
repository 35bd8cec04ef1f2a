#![no_main]

use libfuzzer_sys::fuzz_target;
use lobby_session::protocol::{Message, ReplyPayload};

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = serde_json::from_slice::<Message>(data) else {
        return;
    };

    // A decoded frame must encode back to something that decodes to itself.
    let encoded = serde_json::to_string(&msg).expect("decoded frame re-encodes");
    let again: Message = serde_json::from_str(&encoded).expect("encoded frame decodes");
    assert_eq!(again, msg);

    if msg.is_reply() {
        let _ = serde_json::from_value::<ReplyPayload>(msg.payload);
    }
});
