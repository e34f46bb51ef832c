//! Frame header implementation with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 12-byte structure serialized as raw binary
//! (Big Endian). It carries no routing data — routing lives in the JSON
//! envelope — only the length prefix and the magic marker the decoder scans
//! for when resynchronizing after malformed input.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// Fixed 12-byte frame header (Big Endian network byte order).
///
/// Layout on the wire:
/// `[magic: 4][version: 1][flags: 1][reserved: 2][payload_size: 4]`
///
/// Fields are stored as raw byte arrays to avoid alignment issues. All
/// 12-byte patterns are valid bit patterns, so casting untrusted bytes with
/// `zerocopy` cannot cause undefined behavior; semantic validation (magic,
/// version, size limit) happens in [`FrameHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: [u8; 4],
    version: u8,
    flags: u8,
    reserved: [u8; 2],
    pub(crate) payload_size: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header (12 bytes).
    pub const SIZE: usize = 12;

    /// Magic marker: "TETH" in ASCII (0x5445_5448).
    ///
    /// Doubles as the resynchronization anchor: after a malformed frame the
    /// decoder scans forward for this sequence.
    pub const MAGIC: u32 = 0x5445_5448;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (4 MB).
    ///
    /// Large enough for any LLM request body or terminal burst, small
    /// enough that a corrupt length prefix cannot trigger a giant
    /// allocation.
    pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;

    /// Create a new header with zero payload size.
    ///
    /// The payload size is fixed up by [`crate::Frame::new`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            flags: 0,
            reserved: [0; 2],
            payload_size: [0; 4],
        }
    }

    /// Parse a header from wire bytes (zero-copy, safe).
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooShort`] if fewer than 12 bytes
    /// - [`ProtocolError::InvalidMagic`] if the magic marker is wrong
    /// - [`ProtocolError::UnsupportedVersion`] on a version mismatch
    /// - [`ProtocolError::PayloadTooLarge`] if the claimed size exceeds
    ///   [`Self::MAX_PAYLOAD_SIZE`]
    ///
    /// Validation is ordered cheapest-first so garbage bytes fail fast.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol magic marker.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Payload size in bytes (max 4 MB).
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Set the payload size.
    pub fn set_payload_size(&mut self, size: u32) {
        self.payload_size = size.to_be_bytes();
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self::new()
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("payload_size", &self.payload_size())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}
