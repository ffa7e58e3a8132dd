#![no_main]

use libfuzzer_sys::fuzz_target;
use the_shada::{
  MemoryState,
  ShadaConfig,
  read::entries,
  write::write_to,
};

// Merging with arbitrary previous contents never fails and always produces a
// file that reads back cleanly.
fuzz_target!(|data: &[u8]| {
  let config = ShadaConfig {
    max_kbyte: 0,
    ..ShadaConfig::default()
  };
  let mut out = Vec::new();
  write_to(&mut out, Some(data), &config, &MemoryState::new()).expect("merge must not fail");
  for entry in entries(out.as_slice()) {
    entry.expect("merged output must decode");
  }
});
