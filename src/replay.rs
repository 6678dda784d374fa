//! Confirmed-input recordings and the header that guards transferred snapshots.
//!
//! A host keeps every confirmed frame's inputs together with the snapshot of the first
//! confirmed frame. The same data feeds spectators live and can be exported as a
//! [`Replay`] to re-run the session offline.

use serde::{Deserialize, Serialize};

use crate::network::codec;
use crate::{
    CoreOperation, CoreState, Frame, FrameInputs, InputWords, NetplayError, NETPLAY_MAGIC,
    PROTOCOL_VERSION,
};

/// Magic + version pair plus the content identity a snapshot was produced with.
///
/// Any snapshot that crosses a process boundary (spectator start, saved recording) carries
/// one, and is rejected unless it matches what the receiver negotiated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayHeader {
    /// Always [`NETPLAY_MAGIC`].
    pub magic: u32,
    /// Always [`PROTOCOL_VERSION`] of the writer.
    pub version: u32,
    /// Core implementation hash.
    pub core_magic: u32,
    /// Content CRC.
    pub content_crc: u32,
    /// Snapshot size in bytes.
    pub state_size: u32,
}

impl ReplayHeader {
    /// Header for snapshots of the given core and content, stamped with this build's
    /// magic and protocol version.
    #[must_use]
    pub const fn new(core_magic: u32, content_crc: u32, state_size: u32) -> Self {
        Self {
            magic: NETPLAY_MAGIC,
            version: PROTOCOL_VERSION,
            core_magic,
            content_crc,
            state_size,
        }
    }

    /// Checks a received header against the one this side expects.
    pub fn validate(&self, expected: &ReplayHeader) -> Result<(), NetplayError> {
        if self.magic != expected.magic || self.version != expected.version {
            return Err(NetplayError::ProtocolVersionMismatch {
                local_magic: expected.magic,
                local_version: expected.version,
                remote_magic: self.magic,
                remote_version: self.version,
            });
        }
        if self.core_magic != expected.core_magic
            || self.content_crc != expected.content_crc
            || self.state_size != expected.state_size
        {
            return Err(NetplayError::MalformedPacket {
                context: format!(
                    "snapshot header {:?} does not match negotiated {:?}",
                    self, expected
                ),
            });
        }
        Ok(())
    }

    /// Checks that `blob` has the size this header declares.
    pub fn validate_blob(&self, blob: &[u8]) -> Result<(), NetplayError> {
        if blob.len() != self.state_size as usize {
            return Err(NetplayError::InvalidStateSize {
                expected: self.state_size as usize,
                actual: blob.len(),
            });
        }
        Ok(())
    }
}

/// Inputs of one confirmed frame, mapped to controller ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedInput {
    /// The confirmed frame.
    pub frame: Frame,
    /// Input per port.
    pub ports: [InputWords; 2],
}

impl FinalizedInput {
    /// The inputs to hand to the core when running this frame.
    #[must_use]
    pub const fn as_frame_inputs(&self) -> FrameInputs {
        FrameInputs {
            frame: self.frame,
            ports: self.ports,
            replay: false,
        }
    }
}

/// A recording: a starting snapshot and every confirmed frame after it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    header: ReplayHeader,
    start_frame: Frame,
    start_state: Vec<u8>,
    inputs: Vec<FinalizedInput>,
}

impl Replay {
    /// Starts a recording from the snapshot of `start_frame`.
    pub fn new(
        header: ReplayHeader,
        start_frame: Frame,
        start_state: Vec<u8>,
    ) -> Result<Self, NetplayError> {
        header.validate_blob(&start_state)?;
        Ok(Self {
            header,
            start_frame,
            start_state,
            inputs: Vec::new(),
        })
    }

    /// Appends the next confirmed frame. Frames must be contiguous.
    pub fn push(&mut self, input: FinalizedInput) -> Result<(), NetplayError> {
        let expected = self.next_frame();
        if input.frame != expected {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "recording expects frame {}, got {}",
                    expected, input.frame
                ),
            });
        }
        self.inputs.push(input);
        Ok(())
    }

    /// The frame the next pushed input must have.
    #[must_use]
    pub fn next_frame(&self) -> Frame {
        self.start_frame.add(self.inputs.len() as u32)
    }

    /// The header the recording was made with.
    #[must_use]
    pub fn header(&self) -> &ReplayHeader {
        &self.header
    }

    /// The frame of the starting snapshot.
    #[must_use]
    pub fn start_frame(&self) -> Frame {
        self.start_frame
    }

    /// The starting snapshot.
    #[must_use]
    pub fn start_state(&self) -> &[u8] {
        &self.start_state
    }

    /// The recorded inputs, oldest first.
    #[must_use]
    pub fn inputs(&self) -> &[FinalizedInput] {
        &self.inputs
    }

    /// Loads the starting snapshot into `core` and runs every recorded frame.
    pub fn play<C: CoreState>(&self, core: &mut C) -> Result<(), NetplayError> {
        if core.state_size() != self.header.state_size as usize {
            return Err(NetplayError::InvalidStateSize {
                expected: self.header.state_size as usize,
                actual: core.state_size(),
            });
        }
        if !core.load_state(&self.start_state) {
            return Err(NetplayError::CoreStateFailed {
                operation: CoreOperation::Load,
                frame: self.start_frame,
            });
        }
        for input in &self.inputs {
            core.run_frame(&input.as_frame_inputs());
        }
        Ok(())
    }

    /// Serializes the recording.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetplayError> {
        codec::encode(self).map_err(|err| NetplayError::InternalError {
            context: err.to_string(),
        })
    }

    /// Deserializes a recording and checks it against the header this side expects.
    pub fn from_bytes(bytes: &[u8], expected: &ReplayHeader) -> Result<Self, NetplayError> {
        let replay: Replay =
            codec::decode_exact(bytes).map_err(|err| NetplayError::MalformedPacket {
                context: err.to_string(),
            })?;
        replay.header.validate(expected)?;
        replay.header.validate_blob(&replay.start_state)?;
        let contiguous = replay
            .inputs
            .iter()
            .enumerate()
            .all(|(i, input)| input.frame == replay.start_frame.add(i as u32));
        if !contiguous {
            return Err(NetplayError::MalformedPacket {
                context: "recording frames are not contiguous".to_owned(),
            });
        }
        Ok(replay)
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

    struct Sum(u32);

    impl CoreState for Sum {
        fn state_size(&self) -> usize {
            4
        }
        fn save_state(&self, buf: &mut [u8]) -> bool {
            buf.copy_from_slice(&self.0.to_le_bytes());
            true
        }
        fn load_state(&mut self, buf: &[u8]) -> bool {
            let mut bytes = [0; 4];
            bytes.copy_from_slice(buf);
            self.0 = u32::from_le_bytes(bytes);
            true
        }
        fn run_frame(&mut self, inputs: &FrameInputs) {
            self.0 = self
                .0
                .wrapping_mul(31)
                .wrapping_add(inputs.port(0).word(0))
                .wrapping_add(inputs.port(1).word(0) << 8);
        }
    }

    fn finalized(frame: u32, a: u32, b: u32) -> FinalizedInput {
        FinalizedInput {
            frame: Frame::new(frame),
            ports: [InputWords::new([a, 0, 0]), InputWords::new([b, 0, 0])],
        }
    }

    fn header() -> ReplayHeader {
        ReplayHeader::new(0xC0DE, 0xF00D, 4)
    }

    #[test]
    fn header_rejects_other_protocol_version() {
        let mut theirs = header();
        theirs.version += 1;
        assert!(matches!(
            theirs.validate(&header()),
            Err(NetplayError::ProtocolVersionMismatch { .. })
        ));
    }

    #[test]
    fn header_rejects_other_content() {
        let mut theirs = header();
        theirs.content_crc ^= 1;
        assert!(matches!(
            theirs.validate(&header()),
            Err(NetplayError::MalformedPacket { .. })
        ));
    }

    #[test]
    fn new_rejects_wrong_blob_size() {
        assert!(matches!(
            Replay::new(header(), Frame::ZERO, vec![0; 3]),
            Err(NetplayError::InvalidStateSize {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn push_requires_contiguous_frames() {
        let mut replay = Replay::new(header(), Frame::new(10), vec![0; 4]).unwrap();
        replay.push(finalized(10, 1, 2)).unwrap();
        assert!(replay.push(finalized(12, 1, 2)).is_err());
        assert_eq!(replay.next_frame(), Frame::new(11));
    }

    #[test]
    fn play_reproduces_direct_simulation() {
        let mut replay = Replay::new(header(), Frame::ZERO, 5u32.to_le_bytes().to_vec()).unwrap();
        let mut direct = Sum(5);
        for frame in 0..20 {
            let input = finalized(frame, frame, frame * 3);
            direct.run_frame(&input.as_frame_inputs());
            replay.push(input).unwrap();
        }
        let mut core = Sum(0);
        replay.play(&mut core).unwrap();
        assert_eq!(core.0, direct.0);
    }

    #[test]
    fn bytes_round_trip_and_reject_foreign_header() {
        let mut replay = Replay::new(header(), Frame::new(3), vec![1, 2, 3, 4]).unwrap();
        replay.push(finalized(3, 9, 9)).unwrap();
        let bytes = replay.to_bytes().unwrap();
        assert_eq!(Replay::from_bytes(&bytes, &header()).unwrap(), replay);

        let other = ReplayHeader::new(0xC0DE, 0xBEEF, 4);
        assert!(Replay::from_bytes(&bytes, &other).is_err());
        assert!(Replay::from_bytes(&bytes[..bytes.len() - 1], &header()).is_err());
    }
}
