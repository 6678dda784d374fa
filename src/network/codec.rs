//! Binary codec for network message serialization.
//!
//! All bincode use goes through this module so every peer encodes with the same
//! configuration. On top of plain encode/decode it provides the stream framing used by
//! [`MessageChannel`](crate::network::channel::MessageChannel): every frame is a `u32`
//! little-endian length followed by exactly that many payload bytes.
//!
//! # Examples
//!
//! ```
//! use deltaplay::network::codec::{decode, encode, encode_frame, split_frame, FrameSplit};
//!
//! let bytes = encode(&42u32).expect("encoding should succeed");
//! let (decoded, read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!((decoded, read), (42, 4));
//!
//! let mut wire = Vec::new();
//! encode_frame(&42u32, &mut wire).expect("framing should succeed");
//! match split_frame(&wire).expect("frame fits") {
//!     FrameSplit::Complete { payload, consumed } => {
//!         assert_eq!(payload, &bytes[..]);
//!         assert_eq!(consumed, wire.len());
//!     }
//!     FrameSplit::Incomplete => unreachable!(),
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Size of the length prefix in front of every frame.
pub const LEN_PREFIX: usize = 4;

/// Largest payload a frame may declare. Large enough for a spectator start snapshot of
/// any realistic core.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

// `standard()` with fixed-size integers keeps message sizes independent of the values,
// so an input packet always has the same length on the wire.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Why bytes could not be produced or understood.
///
/// Bincode errors only expose their `Display` text, which is kept as a `String`. These only
/// occur on corrupted input or oversized values, never in normal play.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Serialization failed.
    Encode(String),
    /// The bytes are not a valid encoding of the expected type.
    Decode(String),
    /// A frame declared (or would need) a payload larger than [`MAX_FRAME_LEN`].
    FrameTooLarge {
        /// The declared payload length.
        len: usize,
        /// The maximum payload length.
        max: usize,
    },
    /// The payload decoded without using all of its bytes.
    TrailingBytes {
        /// Bytes the decoder consumed.
        consumed: usize,
        /// Bytes the frame declared.
        len: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(message) => write!(f, "encode failed: {message}"),
            Self::Decode(message) => write!(f, "decode failed: {message}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds the maximum of {max} bytes")
            },
            Self::TrailingBytes { consumed, len } => write!(
                f,
                "payload declared {len} bytes but only {consumed} were decoded"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a value from the front of `bytes`. Returns it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Decodes a value that must occupy all of `bytes`.
pub fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let (value, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            len: bytes.len(),
        });
    }
    Ok(value)
}

/// Appends `value` to `out` as one length-prefixed frame. Returns the total bytes appended.
///
/// On error `out` is left as it was.
pub fn encode_frame<T: Serialize>(value: &T, out: &mut Vec<u8>) -> CodecResult<usize> {
    let start = out.len();
    out.extend_from_slice(&[0; LEN_PREFIX]);
    let payload_len = match bincode::serde::encode_into_std_write(value, &mut *out, config()) {
        Ok(len) if len <= MAX_FRAME_LEN => len,
        Ok(len) => {
            out.truncate(start);
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        },
        Err(err) => {
            out.truncate(start);
            return Err(CodecError::Encode(err.to_string()));
        },
    };
    out[start..start + LEN_PREFIX].copy_from_slice(&(payload_len as u32).to_le_bytes());
    Ok(LEN_PREFIX + payload_len)
}

/// Outcome of looking for a frame at the front of a receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameSplit<'a> {
    /// A whole frame is buffered.
    Complete {
        /// The payload, without the length prefix.
        payload: &'a [u8],
        /// Bytes to drop from the buffer, prefix included.
        consumed: usize,
    },
    /// More bytes are needed.
    Incomplete,
}

/// Looks for one complete frame at the start of `buf`.
///
/// A declared length above [`MAX_FRAME_LEN`] is an error: the stream can no longer be
/// resynchronized, because the frame boundary is unknown.
pub fn split_frame(buf: &[u8]) -> CodecResult<FrameSplit<'_>> {
    let Some(prefix) = buf.get(..LEN_PREFIX) else {
        return Ok(FrameSplit::Incomplete);
    };
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    match buf.get(LEN_PREFIX..LEN_PREFIX + len) {
        Some(payload) => Ok(FrameSplit::Complete {
            payload,
            consumed: LEN_PREFIX + len,
        }),
        None => Ok(FrameSplit::Incomplete),
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{Message, MessageBody};
    use crate::{Frame, InputWords};

    fn input_message(frame: u32) -> Message {
        Message::new(MessageBody::Input {
            frame: Frame::new(frame),
            words: InputWords::new([frame, 1, 2]),
        })
    }

    #[test]
    fn message_round_trip() {
        let original = input_message(7);
        let bytes = encode(&original).unwrap();
        let (decoded, len): (Message, _) = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn input_messages_have_fixed_size() {
        let small = encode(&input_message(0)).unwrap();
        let large = encode(&input_message(u32::MAX)).unwrap();
        assert_eq!(small.len(), large.len());
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let mut bytes = encode(&input_message(3)).unwrap();
        let len = bytes.len();
        bytes.push(0);
        let err = decode_exact::<Message>(&bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::TrailingBytes {
                consumed: len,
                len: len + 1
            }
        );
    }

    #[test]
    fn decode_rejects_truncated_data() {
        let bytes = encode(&input_message(3)).unwrap();
        assert!(decode_exact::<Message>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn frame_prefix_is_little_endian_length() {
        let mut wire = Vec::new();
        let total = encode_frame(&0x0102_0304u32, &mut wire).unwrap();
        assert_eq!(total, 8);
        assert_eq!(&wire[..4], &[4, 0, 0, 0]);
        assert_eq!(&wire[4..], &[4, 3, 2, 1]);
    }

    #[test]
    fn split_frame_waits_for_whole_frame() {
        let mut wire = Vec::new();
        encode_frame(&input_message(1), &mut wire).unwrap();
        assert_eq!(split_frame(&wire[..2]).unwrap(), FrameSplit::Incomplete);
        assert_eq!(
            split_frame(&wire[..wire.len() - 1]).unwrap(),
            FrameSplit::Incomplete
        );
        assert!(matches!(
            split_frame(&wire).unwrap(),
            FrameSplit::Complete { consumed, .. } if consumed == wire.len()
        ));
    }

    #[test]
    fn split_frame_rejects_oversized_length() {
        let wire = u32::MAX.to_le_bytes();
        assert!(matches!(
            split_frame(&wire),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn back_to_back_frames_split_in_order() {
        let mut wire = Vec::new();
        encode_frame(&input_message(1), &mut wire).unwrap();
        encode_frame(&input_message(2), &mut wire).unwrap();
        let FrameSplit::Complete { payload, consumed } = split_frame(&wire).unwrap() else {
            panic!("first frame incomplete");
        };
        assert_eq!(decode_exact::<Message>(payload).unwrap(), input_message(1));
        let FrameSplit::Complete { payload, .. } = split_frame(&wire[consumed..]).unwrap() else {
            panic!("second frame incomplete");
        };
        assert_eq!(decode_exact::<Message>(payload).unwrap(), input_message(2));
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::FrameTooLarge { len: 100, max: 10 };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("10"));
        assert_eq!(
            CodecError::Decode("unexpected end".to_owned()).to_string(),
            "decode failed: unexpected end"
        );
    }
}
