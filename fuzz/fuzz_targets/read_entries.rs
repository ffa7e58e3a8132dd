#![no_main]

use libfuzzer_sys::fuzz_target;
use the_shada::{
  codec,
  frame::Frame,
  read::entries,
};

// Anything that decodes must survive another encode and decode unchanged.
// Payload bytes are compared since float values may not equal themselves.
fuzz_target!(|data: &[u8]| {
  for entry in entries(data) {
    let Ok(entry) = entry else {
      continue;
    };
    let Ok(payload) = codec::encode(&entry) else {
      continue;
    };
    let frame = Frame {
      kind: entry.kind_id(),
      timestamp: entry.timestamp,
      payload: payload.clone(),
      offset: 0,
    };
    let decoded = codec::decode(frame).expect("re-encoded entry must decode");
    assert_eq!(decoded.kind_id(), entry.kind_id());
    assert_eq!(codec::encode(&decoded).expect("decoded entry must encode"), payload);
  }
});
