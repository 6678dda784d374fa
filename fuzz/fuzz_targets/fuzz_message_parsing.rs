//! Fuzz target for wire framing and message deserialization.
//!
//! Arbitrary bytes are split into frames and decoded directly, then pushed through a
//! [`MessageChannel`] reading from an in-memory stream, in the chunk sizes the input picks.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - Oversized length prefixes are rejected before allocating
//! - Every decoded message re-encodes

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use deltaplay::__internal::MessageChannel;
use deltaplay::network::codec::{decode_exact, encode_frame, split_frame, FrameSplit};
use deltaplay::{MemoryStream, Message, NonBlockingStream};

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    /// Bytes written to the link.
    data: Vec<u8>,
    /// Sizes of the writes the bytes are split into.
    chunks: Vec<u8>,
    /// Malformed frame tolerance (0-7).
    max_malformed: u8,
}

fuzz_target!(|input: FuzzInput| {
    // Direct decoding: walk the frames until the buffer runs out or framing breaks
    let mut rest = input.data.as_slice();
    while let Ok(FrameSplit::Complete { payload, consumed }) = split_frame(rest) {
        if let Ok(msg) = decode_exact::<Message>(payload) {
            let mut out = Vec::new();
            let _ = encode_frame(&msg, &mut out);
        }
        rest = &rest[consumed..];
    }

    // Through the channel, as a session would read it
    let (mut writer, reader) = MemoryStream::pair();
    let mut channel = MessageChannel::new(Box::new(reader), u32::from(input.max_malformed % 8), None);
    let mut offset = 0;
    for chunk in input.chunks.iter().take(256) {
        let end = (offset + usize::from(*chunk).max(1)).min(input.data.len());
        if offset >= end {
            break;
        }
        let _ = writer.write(&input.data[offset..end]);
        offset = end;
        if channel.receive().is_err() {
            return;
        }
    }
    drop(writer);
    let _ = channel.receive();
    let _ = channel.remote_closed();
});
