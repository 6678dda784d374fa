//! Fuzz target for recording deserialization.
//!
//! Recordings are loaded from disk or received from a host, so the bytes are untrusted.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - A loaded recording always matches the expected header and state size
//! - A loaded recording serializes again

#![no_main]

use deltaplay::{Replay, ReplayHeader};
use libfuzzer_sys::fuzz_target;

const STATE_SIZE: u32 = 16;

fuzz_target!(|data: &[u8]| {
    let expected = ReplayHeader::new(0x0BAD_F00D, 7, STATE_SIZE);
    if let Ok(replay) = Replay::from_bytes(data, &expected) {
        assert_eq!(replay.header(), &expected);
        assert_eq!(replay.start_state().len(), STATE_SIZE as usize);
        assert!(replay.to_bytes().is_ok());
    }
});
