#![forbid(unsafe_code)]
//! Block-chained storage engine.
//!
//! Presents variable-length *regions* — byte streams identified by the index
//! of their head block — on top of fixed-size blocks allocated inside one
//! flat backing file. Blocks carry a 5-byte header (`in_use`, `prev`, `next`)
//! forming doubly-linked chains; a region grows by appending blocks and is
//! never relocated.
//!
//! One region cursor exists per [`Storage`]. Callers switch it between
//! regions with [`Storage::jump_to_region`] and stream bytes through
//! [`Storage::read`] / [`Storage::write`] / [`Storage::seek`].

use pfs_error::{PfsError, Result};
use pfs_types::{
    BlockHeader, BlockIndex, ByteOffset, RegionId, StorageGeometry, STORAGE_HEADER_SIZE,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` positioned I/O carries no shared seek
/// offset; the engine's in-memory cursor is the only cursor there is.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing backing file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create a new backing file of exactly `len` zero bytes.
    ///
    /// Fails if the path already exists.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests and benchmarks.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(parking_lot::Mutex::new(vec![0_u8; len])),
        }
    }

    /// Copy of the current contents, for structural assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let start = pfs_types::u64_to_usize(offset.0, "read_offset").map_err(PfsError::Format)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(PfsError::Format(pfs_types::ParseError::InvalidField {
                field: "read_range",
                reason: "overflow",
            }))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(PfsError::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let start = pfs_types::u64_to_usize(offset.0, "write_offset").map_err(PfsError::Format)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(PfsError::Format(pfs_types::ParseError::InvalidField {
                field: "write_range",
                reason: "overflow",
            }))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(PfsError::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Storage ─────────────────────────────────────────────────────────────────

/// The block most recently jumped to, with the cursor's position inside it.
///
/// `pos` ranges over `0..=block_size`: a cursor resting exactly at
/// `block_size` has consumed the block but not yet advanced. The next read,
/// write or forward seek performs the jump (or, for writes at the chain
/// tail, the allocation). Filling a block therefore never extends the chain
/// by itself.
#[derive(Debug, Clone, Copy)]
struct CurrentBlock {
    index: BlockIndex,
    header: BlockHeader,
    pos: usize,
}

/// Block engine and region cursor over one backing device.
#[derive(Debug)]
pub struct Storage<D> {
    device: D,
    geometry: StorageGeometry,
    current: CurrentBlock,
    region_pos: u64,
}

impl<D: ByteDevice> Storage<D> {
    /// Format `device` with `geometry` and open the result.
    ///
    /// Writes the geometry header, marks block 0 as the in-use head of the
    /// root directory region, and leaves every other block free with a
    /// zeroed payload.
    pub fn format(device: D, geometry: StorageGeometry) -> Result<Self> {
        if device.len_bytes() < geometry.image_len() {
            return Err(PfsError::Format(pfs_types::ParseError::InvalidField {
                field: "backing_file",
                reason: "shorter than the requested geometry",
            }));
        }

        device.write_all_at(ByteOffset::ZERO, &geometry.encode())?;

        let mut record = vec![0_u8; usize::from(geometry.block_size()) + pfs_types::BLOCK_HEADER_SIZE];
        for raw in 0..geometry.block_count() {
            let index = BlockIndex(raw);
            let header = if index == BlockIndex::ROOT {
                BlockHeader::HEAD
            } else {
                BlockHeader::FREE
            };
            record[..pfs_types::BLOCK_HEADER_SIZE].copy_from_slice(&header.encode());
            device.write_all_at(geometry.block_offset(index), &record)?;
        }

        debug!(
            target: "pfs::block",
            event = "format",
            block_size = geometry.block_size(),
            block_count = geometry.block_count(),
        );

        Self::open(device)
    }

    /// Open a device already formatted as a backing file.
    ///
    /// Reads and validates the geometry header, then seats the cursor at the
    /// root region.
    pub fn open(device: D) -> Result<Self> {
        let mut header = [0_u8; STORAGE_HEADER_SIZE];
        device.read_exact_at(ByteOffset::ZERO, &mut header)?;
        let geometry = StorageGeometry::parse(&header).map_err(PfsError::Format)?;

        if device.len_bytes() < geometry.image_len() {
            return Err(PfsError::Format(pfs_types::ParseError::InvalidField {
                field: "backing_file",
                reason: "shorter than its stored geometry",
            }));
        }

        debug!(
            target: "pfs::block",
            event = "open",
            block_size = geometry.block_size(),
            block_count = geometry.block_count(),
        );

        let mut storage = Self {
            device,
            geometry,
            current: CurrentBlock {
                index: BlockIndex::ROOT,
                header: BlockHeader::HEAD,
                pos: 0,
            },
            region_pos: 0,
        };
        storage.jump_to_block(BlockIndex::ROOT)?;
        Ok(storage)
    }

    #[must_use]
    pub fn geometry(&self) -> StorageGeometry {
        self.geometry
    }

    /// Flush pending writes on the underlying device.
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    // ── Block headers ───────────────────────────────────────────────────────

    fn read_header(&self, index: BlockIndex) -> Result<BlockHeader> {
        if !self.geometry.contains(index) {
            return Err(PfsError::Corruption {
                block: index.0,
                detail: format!("block index out of range (count {})", self.geometry.block_count()),
            });
        }
        let mut bytes = [0_u8; pfs_types::BLOCK_HEADER_SIZE];
        self.device
            .read_exact_at(self.geometry.block_offset(index), &mut bytes)?;
        BlockHeader::parse(&bytes).map_err(PfsError::Format)
    }

    fn write_header(&self, index: BlockIndex, header: BlockHeader) -> Result<()> {
        self.device
            .write_all_at(self.geometry.block_offset(index), &header.encode())
    }

    /// Seat the cursor at the start of block `index`'s payload.
    fn jump_to_block(&mut self, index: BlockIndex) -> Result<()> {
        let header = self.read_header(index)?;
        self.current = CurrentBlock {
            index,
            header,
            pos: 0,
        };
        Ok(())
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// First-fit scan for a free block; claims it with `prev` linked and the
    /// payload zero-filled.
    ///
    /// Zeroing on allocation is what lets the directory layer rely on virgin
    /// bytes reading as the NULL terminator, even once blocks are recycled.
    /// Header scans use positioned reads and leave the region cursor alone.
    fn allocate_block(&mut self, prev: Option<BlockIndex>) -> Result<BlockIndex> {
        for raw in 0..self.geometry.block_count() {
            let index = BlockIndex(raw);
            if self.read_header(index)?.in_use {
                continue;
            }

            self.write_header(
                index,
                BlockHeader {
                    in_use: true,
                    prev,
                    next: None,
                },
            )?;
            let zeros = vec![0_u8; usize::from(self.geometry.block_size())];
            self.device
                .write_all_at(self.geometry.payload_offset(index), &zeros)?;

            trace!(
                target: "pfs::block",
                event = "block_alloc",
                block = index.0,
                prev = prev.map(|block| block.0),
            );
            return Ok(index);
        }

        debug!(target: "pfs::block", event = "alloc_exhausted");
        Err(PfsError::NoSpace)
    }

    /// Allocate a fresh single-block region.
    pub fn allocate_region(&mut self) -> Result<RegionId> {
        let head = self.allocate_block(None)?;
        debug!(target: "pfs::block", event = "region_alloc", region = head.0);
        Ok(RegionId::from(head))
    }

    /// Free every block of `region`'s chain.
    ///
    /// Headers are rewritten to the free state; payload bytes stay in place
    /// until the block is reallocated. The region cursor is not moved — a
    /// caller whose cursor sat inside the freed chain must re-seat it.
    pub fn free_region(&mut self, region: RegionId) -> Result<()> {
        let mut next = Some(region.head());
        let mut freed = 0_u32;

        while let Some(index) = next {
            if freed >= u32::from(self.geometry.block_count()) {
                return Err(PfsError::Corruption {
                    block: index.0,
                    detail: format!("cycle while freeing region {region}"),
                });
            }
            next = self.read_header(index)?.next;
            self.write_header(index, BlockHeader::FREE)?;
            freed += 1;
        }

        debug!(
            target: "pfs::block",
            event = "region_free",
            region = region.0,
            blocks = freed,
        );
        Ok(())
    }

    /// Whether `region` currently names a live chain head: an in-use block
    /// with no predecessor.
    pub fn region_is_live(&self, region: RegionId) -> Result<bool> {
        if !self.geometry.contains(region.head()) {
            return Ok(false);
        }
        let header = self.read_header(region.head())?;
        Ok(header.in_use && header.prev.is_none())
    }

    /// Number of in-use blocks in the whole backing file.
    pub fn in_use_blocks(&self) -> Result<u32> {
        let mut count = 0_u32;
        for raw in 0..self.geometry.block_count() {
            if self.read_header(BlockIndex(raw))?.in_use {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── Region cursor ───────────────────────────────────────────────────────

    /// Seat the cursor at offset 0 of `region`.
    pub fn jump_to_region(&mut self, region: RegionId) -> Result<()> {
        self.jump_to_block(region.head())?;
        self.region_pos = 0;
        Ok(())
    }

    /// Current offset within the active region.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.region_pos
    }

    /// Advance past an exhausted block, following `next`.
    ///
    /// Returns `false` at the chain tail.
    fn advance(&mut self) -> Result<bool> {
        match self.current.header.next {
            Some(next) => {
                self.jump_to_block(next)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read up to `buf.len()` bytes from the cursor, spanning blocks.
    ///
    /// Returns the count actually read; short when the chain ends
    /// mid-request.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let block_size = usize::from(self.geometry.block_size());
        let mut done = 0;

        while done < buf.len() {
            if self.current.pos == block_size && !self.advance()? {
                break;
            }
            let take = (block_size - self.current.pos).min(buf.len() - done);
            let offset = self.geometry.payload_at(self.current.index, self.current.pos);
            self.device.read_exact_at(offset, &mut buf[done..done + take])?;
            self.current.pos += take;
            self.region_pos += take as u64;
            done += take;
        }

        Ok(done)
    }

    /// Read exactly `buf.len()` bytes or fail.
    ///
    /// A short read here means a structure (directory entry, metadata
    /// record) ran off the end of its chain.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.read(buf)?;
        if got < buf.len() {
            return Err(PfsError::Corruption {
                block: self.current.index.0,
                detail: format!("record truncated: wanted {} bytes, got {got}", buf.len()),
            });
        }
        Ok(())
    }

    /// Write `buf` at the cursor, spanning blocks and extending the chain on
    /// overflow.
    ///
    /// Returns the count actually written; short when the backing file has
    /// no free block left. A write that exactly fills the tail block leaves
    /// the chain as-is — extension happens on the next write.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let block_size = usize::from(self.geometry.block_size());
        let mut done = 0;

        while done < buf.len() {
            if self.current.pos == block_size && !self.advance()? {
                let new = match self.allocate_block(Some(self.current.index)) {
                    Ok(block) => block,
                    Err(PfsError::NoSpace) => break,
                    Err(other) => return Err(other),
                };
                self.current.header.next = Some(new);
                self.write_header(self.current.index, self.current.header)?;
                self.jump_to_block(new)?;
            }
            let take = (block_size - self.current.pos).min(buf.len() - done);
            let offset = self.geometry.payload_at(self.current.index, self.current.pos);
            self.device.write_all_at(offset, &buf[done..done + take])?;
            self.current.pos += take;
            self.region_pos += take as u64;
            done += take;
        }

        Ok(done)
    }

    /// Write all of `buf` or fail with `NoSpace`.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let wrote = self.write(buf)?;
        if wrote < buf.len() {
            return Err(PfsError::NoSpace);
        }
        Ok(())
    }

    /// Move the cursor by `offset` bytes within the active region.
    ///
    /// Positive offsets walk `next` links; negative offsets walk `prev`.
    /// Motion clamps at the region's ends. Returns the new region position.
    pub fn seek(&mut self, offset: i64) -> Result<u64> {
        let block_size = usize::from(self.geometry.block_size());

        if offset > 0 {
            let mut remaining = offset.unsigned_abs();
            while remaining > 0 {
                let avail = block_size - self.current.pos;
                if remaining <= avail as u64 {
                    let step = pfs_types::u64_to_usize(remaining, "seek_offset")
                        .map_err(PfsError::Format)?;
                    self.current.pos += step;
                    self.region_pos += remaining;
                    break;
                }
                self.current.pos = block_size;
                self.region_pos += avail as u64;
                remaining -= avail as u64;
                if !self.advance()? {
                    // Tail reached: clamp at the end of the chain.
                    break;
                }
            }
        } else if offset < 0 {
            let mut remaining = offset.unsigned_abs();
            while remaining > 0 {
                let here = self.current.pos;
                if remaining <= here as u64 {
                    let step = pfs_types::u64_to_usize(remaining, "seek_offset")
                        .map_err(PfsError::Format)?;
                    self.current.pos -= step;
                    self.region_pos -= remaining;
                    break;
                }
                self.current.pos = 0;
                self.region_pos -= here as u64;
                remaining -= here as u64;
                match self.current.header.prev {
                    Some(prev) => {
                        self.jump_to_block(prev)?;
                        self.current.pos = block_size;
                    }
                    None => break, // head reached: clamp at region offset 0
                }
            }
        }

        Ok(self.region_pos)
    }
}

// ── Chain checker ───────────────────────────────────────────────────────────

/// Result of a structural walk over every block chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainCheckReport {
    pub block_count: u16,
    pub in_use: u32,
    pub free: u32,
    pub chains: u32,
    /// In-use blocks reachable from no chain head.
    pub orphaned: Vec<u16>,
    pub problems: Vec<String>,
}

impl ChainCheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.problems.is_empty()
    }
}

impl<D: ByteDevice> Storage<D> {
    /// Walk every block header and chain, verifying the link invariants.
    ///
    /// Checks: block 0 is in use; free blocks carry cleared links; every
    /// chain from an in-use head (`prev` absent) is acyclic, stays in
    /// bounds, and is consistently doubly linked; no in-use block is
    /// unreachable.
    pub fn check_chains(&self) -> Result<ChainCheckReport> {
        let count = self.geometry.block_count();
        let mut headers = Vec::with_capacity(usize::from(count));
        for raw in 0..count {
            headers.push(self.read_header(BlockIndex(raw))?);
        }

        let mut problems = Vec::new();
        let mut in_use = 0_u32;
        for (raw, header) in headers.iter().enumerate() {
            if header.in_use {
                in_use += 1;
            } else if header.prev.is_some() || header.next.is_some() {
                problems.push(format!("free block {raw} has dangling links"));
            }
        }
        if !headers[0].in_use {
            problems.push("reserved block 0 is not in use".to_owned());
        }

        let mut visited: HashSet<u16> = HashSet::new();
        let mut chains = 0_u32;
        for (raw, header) in headers.iter().enumerate() {
            if !header.in_use || header.prev.is_some() {
                continue;
            }
            chains += 1;
            let head = u16::try_from(raw).map_err(|_| {
                PfsError::Format(pfs_types::ParseError::IntegerConversion { field: "block" })
            })?;

            let mut at = head;
            loop {
                if !visited.insert(at) {
                    problems.push(format!("cycle in chain headed at block {head}"));
                    break;
                }
                let Some(next) = headers[usize::from(at)].next else {
                    break;
                };
                if !self.geometry.contains(next) {
                    problems.push(format!("block {at} links past the block array"));
                    break;
                }
                let next_header = &headers[usize::from(next.0)];
                if !next_header.in_use {
                    problems.push(format!("block {at} links to free block {next}"));
                    break;
                }
                if next_header.prev != Some(BlockIndex(at)) {
                    problems.push(format!("block {next} does not back-link to block {at}"));
                    break;
                }
                at = next.0;
            }
        }

        let orphaned: Vec<u16> = headers
            .iter()
            .enumerate()
            .filter(|(raw, header)| {
                header.in_use
                    && !visited.contains(&u16::try_from(*raw).unwrap_or(u16::MAX))
            })
            .map(|(raw, _)| u16::try_from(raw).unwrap_or(u16::MAX))
            .collect();

        Ok(ChainCheckReport {
            block_count: count,
            in_use,
            free: u32::from(count) - in_use,
            chains,
            orphaned,
            problems,
        })
    }
}

impl Storage<FileByteDevice> {
    /// Open an existing backing file.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(FileByteDevice::open(path)?)
    }

    /// Create and format a new backing file.
    pub fn create_file(path: impl AsRef<Path>, geometry: StorageGeometry) -> Result<Self> {
        let device = FileByteDevice::create(path, geometry.image_len())?;
        Self::format(device, geometry)
    }

    /// Open the backing file at `path`, formatting a fresh one with
    /// `geometry` if it does not exist yet.
    pub fn open_or_create_file(path: impl AsRef<Path>, geometry: StorageGeometry) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open_file(path)
        } else {
            Self::create_file(path, geometry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::{BLOCK_HEADER_SIZE, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE};

    fn small_storage(block_size: u16, block_count: u16) -> Storage<MemoryByteDevice> {
        let geometry = StorageGeometry::new(block_size, block_count).expect("geometry");
        let device = MemoryByteDevice::new(
            usize::try_from(geometry.image_len()).expect("image length"),
        );
        Storage::format(device, geometry).expect("format")
    }

    #[test]
    fn format_writes_header_and_reserved_root() {
        let geometry = StorageGeometry::new(10, 4).expect("geometry");
        let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
        let storage = Storage::format(device.clone(), geometry).expect("format");

        let image = device.snapshot();
        assert_eq!(&image[..4], &[10, 0, 4, 0]);
        // Block 0: in use, both links invalid.
        assert_eq!(&image[4..9], &[1, 0xFF, 0xFF, 0xFF, 0xFF]);
        // Block 1: free.
        assert_eq!(&image[19..24], &[0, 0xFF, 0xFF, 0xFF, 0xFF]);

        assert_eq!(storage.in_use_blocks().expect("count"), 1);
    }

    #[test]
    fn open_reads_stored_geometry() {
        let geometry = StorageGeometry::new(7, 5).expect("geometry");
        let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
        Storage::format(device.clone(), geometry).expect("format");

        let storage = Storage::open(device).expect("open");
        assert_eq!(storage.geometry(), geometry);
    }

    #[test]
    fn open_rejects_truncated_image() {
        let geometry = StorageGeometry::new(10, 4).expect("geometry");
        let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
        Storage::format(device, geometry).expect("format");

        let short = MemoryByteDevice::new(8);
        let header = StorageGeometry::new(10, 4).expect("geometry").encode();
        short.write_all_at(ByteOffset::ZERO, &header).expect("write");
        assert!(Storage::open(short).is_err());
    }

    #[test]
    fn allocate_is_first_fit() {
        let mut storage = small_storage(10, 8);
        let a = storage.allocate_region().expect("a");
        let b = storage.allocate_region().expect("b");
        assert_eq!(a, RegionId(1));
        assert_eq!(b, RegionId(2));

        storage.free_region(a).expect("free");
        let c = storage.allocate_region().expect("c");
        assert_eq!(c, RegionId(1));
    }

    #[test]
    fn allocate_zeroes_recycled_payload() {
        let mut storage = small_storage(10, 4);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(b"0123456789").expect("write");
        storage.free_region(region).expect("free");

        let again = storage.allocate_region().expect("region");
        assert_eq!(again, region);
        storage.jump_to_region(again).expect("jump");
        let mut buf = [0xAA_u8; 10];
        assert_eq!(storage.read(&mut buf).expect("read"), 10);
        assert_eq!(buf, [0_u8; 10]);
    }

    #[test]
    fn allocation_exhaustion_reports_no_space() {
        let mut storage = small_storage(10, 3);
        storage.allocate_region().expect("a");
        storage.allocate_region().expect("b");
        assert!(matches!(storage.allocate_region(), Err(PfsError::NoSpace)));
    }

    #[test]
    fn write_spans_blocks_and_reads_back() {
        let mut storage = small_storage(10, 8);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");

        let payload: Vec<u8> = (0..35).collect();
        storage.write_all(&payload).expect("write");
        assert_eq!(storage.position(), 35);

        storage.jump_to_region(region).expect("jump");
        let mut buf = vec![0_u8; 35];
        storage.read_exact(&mut buf).expect("read");
        assert_eq!(buf, payload);
        // 35 bytes over 10-byte blocks: 4 chain blocks plus the root.
        assert_eq!(storage.in_use_blocks().expect("count"), 5);
    }

    #[test]
    fn exact_fill_extends_on_next_write_only() {
        let mut storage = small_storage(10, 8);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");

        storage.write_all(&[7_u8; 10]).expect("write");
        assert_eq!(storage.in_use_blocks().expect("count"), 2);

        storage.write_all(&[8_u8; 1]).expect("write");
        assert_eq!(storage.in_use_blocks().expect("count"), 3);
        assert_eq!(storage.position(), 11);
    }

    #[test]
    fn write_returns_short_count_on_exhaustion() {
        let mut storage = small_storage(10, 3);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");

        // One spare block: 20 bytes fit, the 21st does not.
        let wrote = storage.write(&[1_u8; 30]).expect("write");
        assert_eq!(wrote, 20);
        assert_eq!(storage.position(), 20);
    }

    #[test]
    fn read_past_tail_is_short() {
        let mut storage = small_storage(10, 8);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(b"abcde").expect("write");

        storage.jump_to_region(region).expect("jump");
        let mut buf = [0_u8; 32];
        // The single allocated block holds 10 payload bytes.
        assert_eq!(storage.read(&mut buf).expect("read"), 10);
        assert_eq!(&buf[..5], b"abcde");
    }

    #[test]
    fn seek_forward_and_back_across_blocks() {
        let mut storage = small_storage(10, 8);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        let payload: Vec<u8> = (0..30).collect();
        storage.write_all(&payload).expect("write");

        storage.jump_to_region(region).expect("jump");
        assert_eq!(storage.seek(23).expect("seek"), 23);
        let mut buf = [0_u8; 2];
        storage.read_exact(&mut buf).expect("read");
        assert_eq!(buf, [23, 24]);

        assert_eq!(storage.seek(-21).expect("seek"), 4);
        storage.read_exact(&mut buf).expect("read");
        assert_eq!(buf, [4, 5]);
    }

    #[test]
    fn seek_clamps_at_region_ends() {
        let mut storage = small_storage(10, 8);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(&[1_u8; 15]).expect("write");

        storage.jump_to_region(region).expect("jump");
        assert_eq!(storage.seek(-5).expect("seek"), 0);
        // The chain holds two blocks: 20 payload bytes.
        assert_eq!(storage.seek(100).expect("seek"), 20);
    }

    #[test]
    fn free_region_clears_whole_chain() {
        let mut storage = small_storage(10, 8);
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(&[9_u8; 25]).expect("write");
        assert_eq!(storage.in_use_blocks().expect("count"), 4);

        storage.free_region(region).expect("free");
        assert_eq!(storage.in_use_blocks().expect("count"), 1);
    }

    #[test]
    fn check_reports_clean_after_traffic() {
        let mut storage = small_storage(10, 16);
        let a = storage.allocate_region().expect("a");
        let b = storage.allocate_region().expect("b");
        storage.jump_to_region(a).expect("jump");
        storage.write_all(&[1_u8; 35]).expect("write");
        storage.free_region(b).expect("free");

        let report = storage.check_chains().expect("check");
        assert!(report.is_clean(), "problems: {:?}", report.problems);
        assert_eq!(report.in_use, storage.in_use_blocks().expect("count"));
        assert_eq!(report.chains, 2); // root + region a
    }

    #[test]
    fn check_detects_broken_back_link() {
        let geometry = StorageGeometry::new(10, 8).expect("geometry");
        let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
        let mut storage = Storage::format(device.clone(), geometry).expect("format");
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(&[1_u8; 15]).expect("write");

        // Corrupt the second chain block's prev link behind the engine's back.
        let second = BlockIndex(2);
        let broken = BlockHeader {
            in_use: true,
            prev: Some(BlockIndex(5)),
            next: None,
        };
        device
            .write_all_at(geometry.block_offset(second), &broken.encode())
            .expect("write");

        let report = storage.check_chains().expect("check");
        assert!(!report.is_clean());
    }

    #[test]
    fn default_geometry_matches_documented_layout() {
        let geometry = StorageGeometry::default();
        assert_eq!(geometry.block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(geometry.block_count(), DEFAULT_BLOCK_COUNT);
        assert_eq!(
            geometry.image_len(),
            4 + (u64::from(DEFAULT_BLOCK_SIZE) + BLOCK_HEADER_SIZE as u64)
                * u64::from(DEFAULT_BLOCK_COUNT)
        );
    }
}
