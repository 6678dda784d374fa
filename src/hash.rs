//! FNV-1a hashing for values that must match across processes.
//!
//! The core magic exchanged in the handshake, and the snapshot digests tests compare between
//! sessions, have to be identical on every peer and every run. `std`'s `DefaultHasher` is
//! randomly seeded, so it is not an option here.
//!
//! ```
//! use deltaplay::hash::{fnv1a_bytes, Fnv1a};
//! use std::hash::Hasher;
//!
//! let mut hasher = Fnv1a::new();
//! hasher.write(b"snap");
//! hasher.write(b"shot");
//! assert_eq!(hasher.finish(), fnv1a_bytes(b"snapshot"));
//! ```
//!
//! FNV-1a only catches accidental mismatches. It is not a cryptographic hash.

use std::hash::Hasher;

use crate::PROTOCOL_VERSION;

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0100_0000_01b3;

/// Incremental 64-bit FNV-1a.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fnv1a(u64);

impl Fnv1a {
    /// A hasher at the FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(OFFSET_BASIS)
    }

    /// Feeds one more chunk. Chunk boundaries do not affect the result.
    #[inline]
    #[must_use]
    pub const fn chain(mut self, bytes: &[u8]) -> Self {
        let mut i = 0;
        while i < bytes.len() {
            self.0 = (self.0 ^ bytes[i] as u64).wrapping_mul(PRIME);
            i += 1;
        }
        self
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Fnv1a {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        *self = self.chain(bytes);
    }
}

/// FNV-1a of a byte string, e.g. a serialized snapshot. Matches the reference test vectors.
#[must_use]
pub const fn fnv1a_bytes(bytes: &[u8]) -> u64 {
    Fnv1a::new().chain(bytes).0
}

/// Identifies a core build on the wire.
///
/// Mixes the core's name and version with [`PROTOCOL_VERSION`], so two peers only agree when
/// they run the same core build over the same protocol.
///
/// ```
/// use deltaplay::hash::core_magic;
///
/// assert_eq!(core_magic("nes", "1.0"), core_magic("nes", "1.0"));
/// assert_ne!(core_magic("nes", "1.0"), core_magic("nes", "1.1"));
/// ```
#[must_use]
pub fn core_magic(name: &str, version: &str) -> u32 {
    let hash = Fnv1a::new()
        .chain(name.as_bytes())
        .chain(&[0])
        .chain(version.as_bytes())
        .chain(&PROTOCOL_VERSION.to_le_bytes())
        .finish();
    // fold so both halves contribute
    (hash ^ (hash >> 32)) as u32
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

    #[test]
    fn reference_vectors() {
        assert_eq!(fnv1a_bytes(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_bytes(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_bytes(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn chunking_does_not_matter() {
        let mut split = Fnv1a::default();
        split.write(b"foo");
        split.write(b"");
        split.write(b"bar");
        assert_eq!(split.finish(), fnv1a_bytes(b"foobar"));
        assert_eq!(Fnv1a::new().chain(b"fo").chain(b"obar"), split);
    }

    #[test]
    fn core_magic_separates_name_and_version() {
        assert_ne!(core_magic("ab", "c"), core_magic("a", "bc"));
        assert_ne!(core_magic("nes", ""), core_magic("snes", ""));
    }
}
