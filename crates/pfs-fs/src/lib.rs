#![forbid(unsafe_code)]
//! File layer and public API.
//!
//! Maintains a 256-slot descriptor table over the directory layer and
//! multiplexes the storage engine's single region cursor across open files:
//! a cached last-used descriptor decides whether a read or write can reuse
//! the seated cursor or must re-seat it at the file's content region first.
//! Every namespace mutation invalidates the seat.
//!
//! [`Vfs`] is the public entry point. Each operation takes a coarse lock, so
//! a `Vfs` value can be shared across threads even though all region traffic
//! is fundamentally serialized by the shared cursor.

use bitflags::bitflags;
use parking_lot::Mutex;
use pfs_block::{ByteDevice, ChainCheckReport, FileByteDevice, Storage};
use pfs_error::{PfsError, Result};
use pfs_types::{EntryKind, RegionId, StorageGeometry, MAX_DESCRIPTORS};
use serde::Serialize;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use tracing::{debug, trace};

bitflags! {
    /// Open-time behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create the file if the path does not resolve.
        const CREATE = 1;
        /// Fail if the path already resolves.
        const EXCL = 1 << 1;
        /// Discard existing content at open; the file starts empty.
        const TRUNC = 1 << 2;
        /// Start the descriptor's cursor at the end of the file.
        const APPEND = 1 << 3;
    }
}

/// Handle for an open file; an index into the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fd(usize);

impl Fd {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor record: the file's regions plus this handle's private view.
#[derive(Debug, Clone, Copy)]
struct OpenFile {
    content: RegionId,
    metadata: RegionId,
    length: u64,
    cursor: u64,
}

/// A directory child as reported by [`Vfs::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub length: u64,
    pub metadata_region: RegionId,
    pub content_region: RegionId,
}

/// Combined structural report from the chain checker and a namespace walk.
#[derive(Debug, Clone, Serialize)]
pub struct FsCheckReport {
    pub chains: ChainCheckReport,
    pub directories: u32,
    pub files: u32,
    pub problems: Vec<String>,
}

impl FsCheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.chains.is_clean() && self.problems.is_empty()
    }
}

/// Directories nested deeper than this are reported as a cycle suspect
/// rather than walked further.
const MAX_WALK_DEPTH: u32 = 128;

struct VfsInner<D> {
    storage: Storage<D>,
    descriptors: [Option<OpenFile>; MAX_DESCRIPTORS],
    last_used: Option<Fd>,
}

/// A mounted pocketfs session.
pub struct Vfs<D> {
    inner: Mutex<VfsInner<D>>,
}

impl<D: ByteDevice> Vfs<D> {
    /// Mount an already-formatted backing device.
    pub fn mount(device: D) -> Result<Self> {
        Ok(Self::from_storage(Storage::open(device)?))
    }

    /// Format `device` and mount the fresh filesystem.
    pub fn format(device: D, geometry: StorageGeometry) -> Result<Self> {
        Ok(Self::from_storage(Storage::format(device, geometry)?))
    }

    fn from_storage(storage: Storage<D>) -> Self {
        Self {
            inner: Mutex::new(VfsInner {
                storage,
                descriptors: [None; MAX_DESCRIPTORS],
                last_used: None,
            }),
        }
    }

    /// Open a file by path, honoring `flags`.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        self.inner.lock().open(path, flags)
    }

    /// Release a descriptor. Unknown descriptors are ignored.
    pub fn close(&self, fd: Fd) {
        self.inner.lock().close(fd);
    }

    /// Read up to `buf.len()` bytes at the descriptor's cursor.
    ///
    /// The count is clamped to the bytes remaining before end-of-file.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().read(fd, buf)
    }

    /// Write `buf` at the descriptor's cursor, growing the file as needed.
    ///
    /// Returns the count actually written; short when the backing file runs
    /// out of blocks.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.inner.lock().write(fd, buf)
    }

    /// Reposition the descriptor's cursor. The result clamps to
    /// `[0, length]`. Returns the new cursor.
    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        self.inner.lock().seek(fd, pos)
    }

    /// Remove a file: tombstone its directory entry and free its regions.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.inner.lock().unlink(path)
    }

    /// Create a directory. A single trailing `/` on the path is accepted.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.inner.lock().mkdir(path)
    }

    /// Remove an empty directory. A single trailing `/` is accepted.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.inner.lock().rmdir(path)
    }

    /// List the live entries of a directory; `""` or `"/"` lists the root.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntryInfo>> {
        self.inner.lock().list_dir(path)
    }

    /// Verify chain and namespace invariants over the whole image.
    pub fn check(&self) -> Result<FsCheckReport> {
        self.inner.lock().check()
    }

    /// Number of in-use blocks in the backing file.
    pub fn in_use_blocks(&self) -> Result<u32> {
        self.inner.lock().storage.in_use_blocks()
    }

    /// Flush the backing device.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().storage.sync()
    }
}

impl Vfs<FileByteDevice> {
    /// Mount the backing file at `path`.
    pub fn mount_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_storage(Storage::open_file(path)?))
    }

    /// Create and format a new backing file at `path`.
    pub fn format_file(path: impl AsRef<Path>, geometry: StorageGeometry) -> Result<Self> {
        Ok(Self::from_storage(Storage::create_file(path, geometry)?))
    }

    /// Mount the backing file at `path`, formatting a fresh one if it does
    /// not exist yet.
    pub fn mount_or_format_file(
        path: impl AsRef<Path>,
        geometry: StorageGeometry,
    ) -> Result<Self> {
        Ok(Self::from_storage(Storage::open_or_create_file(
            path, geometry,
        )?))
    }
}

/// Directory-target paths may carry one trailing `/`.
fn dir_target(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}

impl<D: ByteDevice> VfsInner<D> {
    fn descriptor(&self, fd: Fd) -> Result<OpenFile> {
        self.descriptors
            .get(fd.0)
            .copied()
            .flatten()
            .ok_or(PfsError::BadDescriptor(fd.0))
    }

    /// Re-seat the shared region cursor for `fd` unless it is already
    /// seated there.
    ///
    /// Re-seating refreshes the descriptor's cached length from the metadata
    /// region, so bytes written through another descriptor since the last
    /// seat become readable through this one.
    fn seat(&mut self, fd: Fd) -> Result<()> {
        if self.last_used == Some(fd) {
            return Ok(());
        }
        let mut file = self.descriptor(fd)?;
        file.length = pfs_dir::read_file_length(&mut self.storage, file.metadata)?;
        self.storage.jump_to_region(file.content)?;
        if file.cursor > 0 {
            let signed = i64::try_from(file.cursor).map_err(|_| {
                PfsError::Format(pfs_types::ParseError::IntegerConversion { field: "cursor" })
            })?;
            self.storage.seek(signed)?;
        }
        self.descriptors[fd.0] = Some(file);
        self.last_used = Some(fd);
        trace!(target: "pfs::fs", event = "reseat", fd = fd.0);
        Ok(())
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd> {
        let slot = self
            .descriptors
            .iter()
            .position(Option::is_none)
            .ok_or(PfsError::DescriptorTableFull)?;
        self.last_used = None;

        let nav = pfs_dir::navigate(&mut self.storage, path)?;
        let existing = pfs_dir::lookup_entry(
            &mut self.storage,
            nav.parent,
            nav.residual.as_bytes(),
            EntryKind::File,
        )?;

        let mut file = match existing {
            Some(found) => {
                if flags.contains(OpenFlags::EXCL) {
                    return Err(PfsError::Exists);
                }
                if flags.contains(OpenFlags::TRUNC) {
                    self.truncate(nav.parent, &found)?
                } else {
                    OpenFile {
                        content: found.entry.content,
                        metadata: found.entry.metadata,
                        length: found.length,
                        cursor: 0,
                    }
                }
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(PfsError::NotFound(format!("no file at {path}")));
                }
                let created =
                    pfs_dir::create_file(&mut self.storage, nav.parent, nav.residual.as_bytes())?;
                OpenFile {
                    content: created.entry.content,
                    metadata: created.entry.metadata,
                    length: 0,
                    cursor: 0,
                }
            }
        };

        if flags.contains(OpenFlags::APPEND) {
            file.cursor = file.length;
        }

        self.descriptors[slot] = Some(file);
        debug!(
            target: "pfs::fs",
            event = "open",
            fd = slot,
            content = file.content.0,
            length = file.length,
        );
        Ok(Fd(slot))
    }

    /// Replace the file's content region with a fresh empty one.
    ///
    /// The fresh region is allocated and the directory entry rewritten
    /// before the old chain is freed, so a failed allocation leaves the file
    /// untouched and the entry never dangles.
    fn truncate(&mut self, parent: RegionId, found: &pfs_dir::LocatedEntry) -> Result<OpenFile> {
        let fresh = self.storage.allocate_region()?;
        let mut entry = found.entry;
        entry.content = fresh;
        if let Err(err) = pfs_dir::rewrite_entry(&mut self.storage, parent, found.offset, entry) {
            self.storage.free_region(fresh)?;
            return Err(err);
        }
        self.storage.free_region(found.entry.content)?;
        pfs_dir::update_file_length(&mut self.storage, found.entry.metadata, 0)?;
        debug!(
            target: "pfs::fs",
            event = "truncate",
            old_content = found.entry.content.0,
            new_content = fresh.0,
        );
        Ok(OpenFile {
            content: fresh,
            metadata: found.entry.metadata,
            length: 0,
            cursor: 0,
        })
    }

    fn close(&mut self, fd: Fd) {
        let Some(slot) = self.descriptors.get_mut(fd.0) else {
            return;
        };
        if slot.take().is_some() && self.last_used == Some(fd) {
            self.last_used = None;
        }
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.seat(fd)?;
        let mut file = self.descriptor(fd)?;

        let want = u64::try_from(buf.len())
            .unwrap_or(u64::MAX)
            .min(file.length.saturating_sub(file.cursor));
        let want = pfs_types::u64_to_usize(want, "read_len").map_err(PfsError::Format)?;

        let got = self.storage.read(&mut buf[..want])?;
        file.cursor += got as u64;
        self.descriptors[fd.0] = Some(file);
        Ok(got)
    }

    fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.seat(fd)?;
        let mut file = self.descriptor(fd)?;

        let wrote = self.storage.write(buf)?;
        file.cursor += wrote as u64;
        let grew = file.cursor > file.length;
        if grew {
            file.length = file.cursor;
        }
        self.descriptors[fd.0] = Some(file);

        if grew {
            // The metadata write moves the shared cursor off this file.
            self.last_used = None;
            pfs_dir::update_file_length(&mut self.storage, file.metadata, file.length)?;
        }
        Ok(wrote)
    }

    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        let mut file = self.descriptor(fd)?;

        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(file.cursor) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(file.length) + i128::from(delta),
        };
        let clamped = target.clamp(0, i128::from(file.length));
        let cursor = u64::try_from(clamped).map_err(|_| {
            PfsError::Format(pfs_types::ParseError::IntegerConversion { field: "cursor" })
        })?;

        if cursor != file.cursor && self.last_used == Some(fd) {
            // The seated storage cursor no longer matches this descriptor.
            self.last_used = None;
        }
        file.cursor = cursor;
        self.descriptors[fd.0] = Some(file);
        Ok(cursor)
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.last_used = None;
        let nav = pfs_dir::navigate(&mut self.storage, path)?;
        let found = pfs_dir::lookup_entry(
            &mut self.storage,
            nav.parent,
            nav.residual.as_bytes(),
            EntryKind::File,
        )?
        .ok_or_else(|| PfsError::NotFound(format!("no file at {path}")))?;
        pfs_dir::remove_entry(&mut self.storage, nav.parent, &found)?;
        debug!(target: "pfs::fs", event = "unlink", path = path);
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.last_used = None;
        let nav = pfs_dir::navigate(&mut self.storage, dir_target(path))?;
        pfs_dir::create_dir(&mut self.storage, nav.parent, nav.residual.as_bytes())?;
        debug!(target: "pfs::fs", event = "mkdir", path = path);
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        self.last_used = None;
        let nav = pfs_dir::navigate(&mut self.storage, dir_target(path))?;
        let found = pfs_dir::lookup_entry(
            &mut self.storage,
            nav.parent,
            nav.residual.as_bytes(),
            EntryKind::Dir,
        )?
        .ok_or_else(|| PfsError::NotFound(format!("no directory at {path}")))?;

        if pfs_dir::dir_has_live_entries(&mut self.storage, found.entry.content)? {
            return Err(PfsError::NotEmpty);
        }
        pfs_dir::remove_entry(&mut self.storage, nav.parent, &found)?;
        debug!(target: "pfs::fs", event = "rmdir", path = path);
        Ok(())
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>> {
        self.last_used = None;
        let target = dir_target(path);
        let region = if target.is_empty() {
            RegionId::ROOT
        } else {
            let nav = pfs_dir::navigate(&mut self.storage, target)?;
            pfs_dir::lookup_entry(
                &mut self.storage,
                nav.parent,
                nav.residual.as_bytes(),
                EntryKind::Dir,
            )?
            .ok_or_else(|| PfsError::NotFound(format!("no directory at {path}")))?
            .entry
            .content
        };

        let entries = pfs_dir::list_entries(&mut self.storage, region)?;
        Ok(entries
            .into_iter()
            .map(|info| DirEntryInfo {
                name: String::from_utf8_lossy(&info.name).into_owned(),
                kind: info.kind,
                length: info.length,
                metadata_region: info.metadata,
                content_region: info.content,
            })
            .collect())
    }

    fn check(&mut self) -> Result<FsCheckReport> {
        self.last_used = None;
        let chains = self.storage.check_chains()?;
        let mut report = FsCheckReport {
            chains,
            directories: 0,
            files: 0,
            problems: Vec::new(),
        };
        self.walk_dir(RegionId::ROOT, &mut report, 0)?;
        Ok(report)
    }

    fn walk_dir(&mut self, region: RegionId, report: &mut FsCheckReport, depth: u32) -> Result<()> {
        if depth > MAX_WALK_DEPTH {
            report
                .problems
                .push(format!("directory region {region} nested deeper than {MAX_WALK_DEPTH}"));
            return Ok(());
        }

        if !pfs_dir::entries_properly_terminated(&mut self.storage, region)? {
            report
                .problems
                .push(format!("directory region {region} has entries after its terminator"));
        }

        let entries = pfs_dir::list_entries(&mut self.storage, region)?;
        for info in entries {
            match info.kind {
                EntryKind::File => report.files += 1,
                EntryKind::Dir => report.directories += 1,
                EntryKind::Null | EntryKind::Unused => continue,
            }
            for (label, target) in [("metadata", info.metadata), ("content", info.content)] {
                if !self.storage.region_is_live(target)? {
                    report.problems.push(format!(
                        "{} {} of entry {:?} is not a live chain head",
                        label,
                        target,
                        String::from_utf8_lossy(&info.name),
                    ));
                }
            }
            if info.kind == EntryKind::Dir {
                self.walk_dir(info.content, report, depth + 1)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::MemoryByteDevice;

    fn vfs() -> Vfs<MemoryByteDevice> {
        vfs_with(StorageGeometry::default())
    }

    fn vfs_with(geometry: StorageGeometry) -> Vfs<MemoryByteDevice> {
        let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
        Vfs::format(device, geometry).expect("format")
    }

    #[test]
    fn open_assigns_lowest_free_descriptor() {
        let fs = vfs();
        let first = fs.open("a", OpenFlags::CREATE).expect("a");
        let second = fs.open("b", OpenFlags::CREATE).expect("b");
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);

        fs.close(first);
        let third = fs.open("c", OpenFlags::CREATE).expect("c");
        assert_eq!(third.index(), 0);
    }

    #[test]
    fn close_ignores_unknown_descriptors() {
        let fs = vfs();
        fs.close(Fd(17));
        fs.close(Fd(usize::MAX));
        assert!(matches!(
            fs.read(Fd(17), &mut [0_u8; 4]),
            Err(PfsError::BadDescriptor(17))
        ));
    }

    #[test]
    fn open_without_create_requires_existence() {
        let fs = vfs();
        assert!(matches!(
            fs.open("missing", OpenFlags::empty()),
            Err(PfsError::NotFound(_))
        ));
    }

    #[test]
    fn seek_clamps_to_file_bounds() {
        let fs = vfs();
        let fd = fs.open("f", OpenFlags::CREATE).expect("open");
        fs.write(fd, b"0123456789").expect("write");

        assert_eq!(fs.seek(fd, SeekFrom::Current(-100)).expect("seek"), 0);
        assert_eq!(fs.seek(fd, SeekFrom::End(25)).expect("seek"), 10);
        assert_eq!(fs.seek(fd, SeekFrom::End(-4)).expect("seek"), 6);
        assert_eq!(fs.seek(fd, SeekFrom::Start(3)).expect("seek"), 3);
        assert_eq!(fs.seek(fd, SeekFrom::Current(2)).expect("seek"), 5);
    }

    #[test]
    fn mkdir_accepts_trailing_slash() {
        let fs = vfs();
        fs.mkdir("WithSlash/").expect("mkdir");
        fs.mkdir("Bare").expect("mkdir");

        fs.open("WithSlash/a", OpenFlags::CREATE).expect("a");
        fs.open("Bare/b", OpenFlags::CREATE).expect("b");

        fs.rmdir("Bare/").expect_err("non-empty");
    }

    #[test]
    fn list_dir_reports_names_and_lengths() {
        let fs = vfs();
        fs.mkdir("docs/").expect("mkdir");
        let fd = fs.open("docs/a.txt", OpenFlags::CREATE).expect("open");
        fs.write(fd, b"hello").expect("write");
        fs.close(fd);

        let root = fs.list_dir("").expect("root");
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "docs");
        assert_eq!(root[0].kind, EntryKind::Dir);

        let docs = fs.list_dir("docs/").expect("docs");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name, "a.txt");
        assert_eq!(docs[0].kind, EntryKind::File);
        assert_eq!(docs[0].length, 5);
    }

    #[test]
    fn check_is_clean_after_mixed_traffic() {
        let fs = vfs();
        fs.mkdir("a/").expect("mkdir");
        fs.mkdir("a/b/").expect("mkdir");
        let fd = fs.open("a/b/f", OpenFlags::CREATE).expect("open");
        fs.write(fd, &[9_u8; 64]).expect("write");
        fs.close(fd);
        fs.unlink("a/b/f").expect("unlink");

        let report = fs.check().expect("check");
        assert!(report.is_clean(), "problems: {:?}", report.problems);
        assert_eq!(report.directories, 2);
        assert_eq!(report.files, 0);
    }

    #[test]
    fn descriptor_table_exhausts_at_capacity() {
        let fs = vfs();
        let mut fds = Vec::new();
        for _ in 0..MAX_DESCRIPTORS {
            fds.push(fs.open("f", OpenFlags::CREATE).expect("open"));
        }
        assert!(matches!(
            fs.open("f", OpenFlags::CREATE),
            Err(PfsError::DescriptorTableFull)
        ));
        for fd in fds {
            fs.close(fd);
        }
        fs.open("f", OpenFlags::CREATE).expect("reopen");
    }
}
