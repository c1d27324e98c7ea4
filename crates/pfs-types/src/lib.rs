#![forbid(unsafe_code)]
//! Core types and on-disk codecs for pocketfs.
//!
//! The backing file is a 4-byte geometry header followed by `block_count`
//! fixed-size block records. Every multi-byte integer on disk is
//! little-endian. This crate owns the unit-carrying index types, the codec
//! for each record shape, and the slice read helpers the other crates parse
//! with.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte length of the backing-file geometry header.
pub const STORAGE_HEADER_SIZE: usize = 4;

/// Byte length of a block header (`in_use: u8`, `prev: u16`, `next: u16`).
pub const BLOCK_HEADER_SIZE: usize = 5;

/// Byte length of a directory entry (`kind: u8`, two region ids).
pub const DIR_ENTRY_SIZE: usize = 5;

/// Fixed prefix of a file metadata record (`length: u64`, `name_len: u8`).
pub const FILE_RECORD_FIXED_SIZE: usize = 9;

/// Fixed prefix of a directory metadata record (`name_len: u8`).
pub const DIR_RECORD_FIXED_SIZE: usize = 1;

/// Maximum name length; names are stored with a `u8` length prefix.
pub const MAX_NAME_LEN: usize = 255;

/// Capacity of the descriptor table.
pub const MAX_DESCRIPTORS: usize = 256;

/// Default payload bytes per block for a freshly formatted image.
pub const DEFAULT_BLOCK_SIZE: u16 = 10;

/// Default block count for a freshly formatted image.
pub const DEFAULT_BLOCK_COUNT: u16 = 128;

/// On-disk sentinel meaning "no block" in `prev`/`next` links.
pub const INVALID_BLOCK_LINK: u16 = 0xFFFF;

/// Index of a block within the backing file's block array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u16);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// Unit-carrying wrapper to keep byte offsets and block indices apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A region is identified by the index of its head block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u16);

impl BlockIndex {
    /// Reserved head block of the root directory region.
    pub const ROOT: Self = Self(0);
}

impl RegionId {
    /// The root directory content region.
    pub const ROOT: Self = Self(0);

    /// The head block of this region's chain.
    #[must_use]
    pub fn head(self) -> BlockIndex {
        BlockIndex(self.0)
    }
}

impl From<BlockIndex> for RegionId {
    fn from(head: BlockIndex) -> Self {
        Self(head.0)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode an optional block link to its on-disk `u16`.
#[must_use]
pub fn encode_link(link: Option<BlockIndex>) -> u16 {
    link.map_or(INVALID_BLOCK_LINK, |block| block.0)
}

/// Decode an on-disk `u16` link, mapping the sentinel to `None`.
#[must_use]
pub fn decode_link(raw: u16) -> Option<BlockIndex> {
    (raw != INVALID_BLOCK_LINK).then_some(BlockIndex(raw))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("invalid directory entry kind: {value:#x}")]
    InvalidEntryKind { value: u8 },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Storage geometry ────────────────────────────────────────────────────────

/// Validated block geometry of a backing file.
///
/// `block_size` is the payload length; each on-disk block record additionally
/// carries a [`BLOCK_HEADER_SIZE`]-byte header. Both fields are `u16`, which
/// caps the image at 65535 blocks and reserves `0xFFFF` as the link sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGeometry {
    block_size: u16,
    block_count: u16,
}

impl StorageGeometry {
    /// Create a geometry if both dimensions are non-zero.
    pub fn new(block_size: u16, block_count: u16) -> Result<Self, ParseError> {
        if block_size == 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be non-zero",
            });
        }
        if block_count == 0 {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "must be non-zero",
            });
        }
        Ok(Self {
            block_size,
            block_count,
        })
    }

    /// Parse the 4-byte backing-file header.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let block_size = read_le_u16(data, 0)?;
        let block_count = read_le_u16(data, 2)?;
        Self::new(block_size, block_count)
    }

    #[must_use]
    pub fn encode(self) -> [u8; STORAGE_HEADER_SIZE] {
        let size = self.block_size.to_le_bytes();
        let count = self.block_count.to_le_bytes();
        [size[0], size[1], count[0], count[1]]
    }

    #[must_use]
    pub fn block_size(self) -> u16 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(self) -> u16 {
        self.block_count
    }

    /// On-disk span of one block record (header + payload).
    #[must_use]
    pub fn block_span(self) -> u64 {
        u64::from(self.block_size) + BLOCK_HEADER_SIZE as u64
    }

    /// Absolute byte offset of block `index`'s header.
    ///
    /// All offset math here fits a `u64` by construction: both geometry
    /// dimensions and the in-block position are at most `u16::MAX`.
    #[must_use]
    pub fn block_offset(self, index: BlockIndex) -> ByteOffset {
        ByteOffset(STORAGE_HEADER_SIZE as u64 + self.block_span() * u64::from(index.0))
    }

    /// Absolute byte offset of block `index`'s payload.
    #[must_use]
    pub fn payload_offset(self, index: BlockIndex) -> ByteOffset {
        ByteOffset(self.block_offset(index).0 + BLOCK_HEADER_SIZE as u64)
    }

    /// Absolute byte offset of position `pos` inside block `index`'s payload.
    #[must_use]
    pub fn payload_at(self, index: BlockIndex, pos: usize) -> ByteOffset {
        ByteOffset(self.payload_offset(index).0 + pos as u64)
    }

    /// Total backing-file length for this geometry.
    #[must_use]
    pub fn image_len(self) -> u64 {
        STORAGE_HEADER_SIZE as u64 + self.block_span() * u64::from(self.block_count)
    }

    /// Whether `index` addresses a block inside this geometry.
    #[must_use]
    pub fn contains(self, index: BlockIndex) -> bool {
        index.0 < self.block_count
    }
}

impl Default for StorageGeometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
        }
    }
}

// ── Block header ────────────────────────────────────────────────────────────

/// In-memory form of a block's 5-byte on-disk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub in_use: bool,
    pub prev: Option<BlockIndex>,
    pub next: Option<BlockIndex>,
}

impl BlockHeader {
    /// Header of a free block: not in use, both links cleared.
    pub const FREE: Self = Self {
        in_use: false,
        prev: None,
        next: None,
    };

    /// Header of a freshly allocated chain head.
    pub const HEAD: Self = Self {
        in_use: true,
        prev: None,
        next: None,
    };

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let bytes = ensure_slice(data, 0, BLOCK_HEADER_SIZE)?;
        let in_use = match bytes[0] {
            0 => false,
            1 => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "in_use",
                    reason: "must be 0 or 1",
                });
            }
        };
        Ok(Self {
            in_use,
            prev: decode_link(read_le_u16(bytes, 1)?),
            next: decode_link(read_le_u16(bytes, 3)?),
        })
    }

    #[must_use]
    pub fn encode(self) -> [u8; BLOCK_HEADER_SIZE] {
        let prev = encode_link(self.prev).to_le_bytes();
        let next = encode_link(self.next).to_le_bytes();
        [u8::from(self.in_use), prev[0], prev[1], next[0], next[1]]
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Kind tag of a 5-byte directory entry.
///
/// `Null` terminates a directory's entry list; `Unused` is a tombstone left
/// by unlink/rmdir and is reusable for later insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Null = 0,
    Unused = 1,
    File = 2,
    Dir = 3,
}

impl EntryKind {
    pub fn from_byte(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Unused),
            2 => Ok(Self::File),
            3 => Ok(Self::Dir),
            _ => Err(ParseError::InvalidEntryKind { value }),
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Unused => "unused",
            Self::File => "file",
            Self::Dir => "dir",
        };
        f.write_str(name)
    }
}

/// Decoded 5-byte directory entry.
///
/// The region fields are meaningful only for `File` and `Dir` entries; the
/// codec round-trips them for the other kinds regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEntry {
    pub kind: EntryKind,
    pub metadata: RegionId,
    pub content: RegionId,
}

impl RawEntry {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let bytes = ensure_slice(data, 0, DIR_ENTRY_SIZE)?;
        Ok(Self {
            kind: EntryKind::from_byte(bytes[0])?,
            metadata: RegionId(read_le_u16(bytes, 1)?),
            content: RegionId(read_le_u16(bytes, 3)?),
        })
    }

    #[must_use]
    pub fn encode(self) -> [u8; DIR_ENTRY_SIZE] {
        let metadata = self.metadata.0.to_le_bytes();
        let content = self.content.0.to_le_bytes();
        [
            self.kind.as_byte(),
            metadata[0],
            metadata[1],
            content[0],
            content[1],
        ]
    }
}

// ── Metadata records ────────────────────────────────────────────────────────

/// File metadata record: `length: u64 LE`, `name_len: u8`, `name`.
///
/// The length is always 8 bytes on disk, independent of the host word
/// width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub length: u64,
    pub name: Vec<u8>,
}

impl FileRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.name.len() <= MAX_NAME_LEN);
        let mut out = Vec::with_capacity(FILE_RECORD_FIXED_SIZE + self.name.len());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.push(self.name.len() as u8);
        out.extend_from_slice(&self.name);
        out
    }
}

/// Directory metadata record: `name_len: u8`, `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub name: Vec<u8>,
}

impl DirRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.name.len() <= MAX_NAME_LEN);
        let mut out = Vec::with_capacity(DIR_RECORD_FIXED_SIZE + self.name.len());
        out.push(self.name.len() as u8);
        out.extend_from_slice(&self.name);
        out
    }
}
