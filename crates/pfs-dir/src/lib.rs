#![forbid(unsafe_code)]
//! Directory and metadata layer.
//!
//! Encodes the namespace as byte records inside regions: each directory's
//! content region holds a run of 5-byte entries terminated by the first
//! `Null` entry; each entry points at a metadata region (name, and for files
//! the length) and a content region. Deletion tombstones the entry to
//! `Unused` and frees both regions; slots are reused, never compacted.
//!
//! All operations drive the shared region cursor of a
//! [`pfs_block::Storage`], so the caller owns cursor hygiene: after any
//! function here returns, the cursor is wherever the walk left it.

use pfs_block::{ByteDevice, Storage};
use pfs_error::{PfsError, Result};
use pfs_types::{
    read_le_u16, read_le_u64, DirRecord, EntryKind, FileRecord, RawEntry, RegionId,
    DIR_ENTRY_SIZE, FILE_RECORD_FIXED_SIZE, MAX_NAME_LEN,
};
use tracing::debug;

/// Result of walking a path's directory prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Content region of the directory that owns the residual name.
    pub parent: RegionId,
    /// Final path segment: the target of the operation within `parent`.
    pub residual: String,
}

/// A directory entry located by name, with its slot position retained so the
/// caller can tombstone or rewrite it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedEntry {
    /// Byte offset of the 5-byte slot within the directory's content region.
    pub offset: u64,
    pub entry: RawEntry,
    /// Stored file length; 0 for directories.
    pub length: u64,
}

/// A live directory entry decoded for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub kind: EntryKind,
    pub name: Vec<u8>,
    pub length: u64,
    pub metadata: RegionId,
    pub content: RegionId,
}

/// Check a name against the format's limits: non-empty, at most
/// [`MAX_NAME_LEN`] bytes, no `/`, no NUL.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(PfsError::InvalidPath("empty name".to_owned()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PfsError::NameTooLong);
    }
    if name.contains(&0) {
        return Err(PfsError::InvalidPath("name contains NUL".to_owned()));
    }
    if name.contains(&b'/') {
        return Err(PfsError::InvalidPath("name contains '/'".to_owned()));
    }
    Ok(())
}

/// Seat the cursor at `offset` within `region`.
///
/// The offset must be reachable; landing short means the caller's notion of
/// the region's layout is stale.
fn seek_to<D: ByteDevice>(storage: &mut Storage<D>, region: RegionId, offset: u64) -> Result<()> {
    storage.jump_to_region(region)?;
    let signed = i64::try_from(offset)
        .map_err(|_| PfsError::Format(pfs_types::ParseError::IntegerConversion {
            field: "region_offset",
        }))?;
    let landed = storage.seek(signed)?;
    if landed != offset {
        return Err(PfsError::Corruption {
            block: region.0,
            detail: format!("offset {offset} lies past the end of region {region}"),
        });
    }
    Ok(())
}

/// Read the next entry's kind byte at the cursor.
///
/// The chain ending mid-scan reads as `Null`: a directory's tail bytes that
/// were never written are the terminator.
fn read_kind<D: ByteDevice>(storage: &mut Storage<D>) -> Result<EntryKind> {
    let mut byte = [0_u8; 1];
    if storage.read(&mut byte)? == 0 {
        return Ok(EntryKind::Null);
    }
    EntryKind::from_byte(byte[0]).map_err(PfsError::Format)
}

// ── Metadata records ────────────────────────────────────────────────────────

/// Write a file's metadata record at the start of `region`.
pub fn write_file_record<D: ByteDevice>(
    storage: &mut Storage<D>,
    region: RegionId,
    record: &FileRecord,
) -> Result<()> {
    storage.jump_to_region(region)?;
    storage.write_all(&record.encode())
}

/// Read the file metadata record stored at the start of `region`.
pub fn read_file_record<D: ByteDevice>(
    storage: &mut Storage<D>,
    region: RegionId,
) -> Result<FileRecord> {
    storage.jump_to_region(region)?;
    let mut fixed = [0_u8; FILE_RECORD_FIXED_SIZE];
    storage.read_exact(&mut fixed)?;
    let length = read_le_u64(&fixed, 0).map_err(PfsError::Format)?;
    let mut name = vec![0_u8; usize::from(fixed[8])];
    storage.read_exact(&mut name)?;
    Ok(FileRecord { length, name })
}

/// Rewrite only the length field of a file metadata record.
pub fn update_file_length<D: ByteDevice>(
    storage: &mut Storage<D>,
    region: RegionId,
    length: u64,
) -> Result<()> {
    storage.jump_to_region(region)?;
    storage.write_all(&length.to_le_bytes())
}

/// Read only the length field of a file metadata record.
pub fn read_file_length<D: ByteDevice>(
    storage: &mut Storage<D>,
    region: RegionId,
) -> Result<u64> {
    storage.jump_to_region(region)?;
    let mut bytes = [0_u8; 8];
    storage.read_exact(&mut bytes)?;
    read_le_u64(&bytes, 0).map_err(PfsError::Format)
}

/// Write a directory's metadata record at the start of `region`.
pub fn write_dir_record<D: ByteDevice>(
    storage: &mut Storage<D>,
    region: RegionId,
    record: &DirRecord,
) -> Result<()> {
    storage.jump_to_region(region)?;
    storage.write_all(&record.encode())
}

/// Read the directory metadata record stored at the start of `region`.
pub fn read_dir_record<D: ByteDevice>(
    storage: &mut Storage<D>,
    region: RegionId,
) -> Result<DirRecord> {
    storage.jump_to_region(region)?;
    let mut len = [0_u8; 1];
    storage.read_exact(&mut len)?;
    let mut name = vec![0_u8; usize::from(len[0])];
    storage.read_exact(&mut name)?;
    Ok(DirRecord { name })
}

/// Name stored in an entry's metadata region, along with the file length
/// when the entry is a file.
fn read_entry_name<D: ByteDevice>(
    storage: &mut Storage<D>,
    kind: EntryKind,
    metadata: RegionId,
) -> Result<(Vec<u8>, u64)> {
    match kind {
        EntryKind::File => {
            let record = read_file_record(storage, metadata)?;
            Ok((record.name, record.length))
        }
        EntryKind::Dir => Ok((read_dir_record(storage, metadata)?.name, 0)),
        EntryKind::Null | EntryKind::Unused => Err(PfsError::Corruption {
            block: metadata.0,
            detail: "metadata lookup on a dead entry".to_owned(),
        }),
    }
}

// ── Entry scan ──────────────────────────────────────────────────────────────

/// Find the entry of `kind` named `name` in the directory at `dir`.
///
/// Scans entries from offset 0, skipping tombstones and entries of the other
/// kind, comparing candidate names byte-for-byte through their metadata
/// regions. Stops at the first `Null` entry.
pub fn lookup_entry<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
    name: &[u8],
    kind: EntryKind,
) -> Result<Option<LocatedEntry>> {
    storage.jump_to_region(dir)?;
    loop {
        let offset = storage.position();
        let found = read_kind(storage)?;
        if found == EntryKind::Null {
            return Ok(None);
        }
        if found != kind {
            storage.seek((DIR_ENTRY_SIZE - 1) as i64)?;
            continue;
        }

        let mut regions = [0_u8; DIR_ENTRY_SIZE - 1];
        storage.read_exact(&mut regions)?;
        let metadata = RegionId(read_le_u16(&regions, 0).map_err(PfsError::Format)?);
        let content = RegionId(read_le_u16(&regions, 2).map_err(PfsError::Format)?);
        let resume = storage.position();

        let (stored, length) = read_entry_name(storage, kind, metadata)?;
        if stored == name {
            return Ok(Some(LocatedEntry {
                offset,
                entry: RawEntry {
                    kind,
                    metadata,
                    content,
                },
                length,
            }));
        }

        seek_to(storage, dir, resume)?;
    }
}

/// Offset of the first `Null` or `Unused` slot in the directory at `dir`.
///
/// A scan that runs off the end of the chain yields the end offset: writing
/// the entry there extends the chain.
fn find_free_slot<D: ByteDevice>(storage: &mut Storage<D>, dir: RegionId) -> Result<u64> {
    storage.jump_to_region(dir)?;
    loop {
        let offset = storage.position();
        match read_kind(storage)? {
            EntryKind::Null | EntryKind::Unused => return Ok(offset),
            EntryKind::File | EntryKind::Dir => {
                storage.seek((DIR_ENTRY_SIZE - 1) as i64)?;
            }
        }
    }
}

/// Write `entry` into the first free slot of the directory at `dir`,
/// returning the slot offset.
///
/// A partially written slot (storage exhausted mid-entry) is tombstoned back
/// to `Unused` so later scans do not decode garbage region fields.
pub fn insert_entry<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
    entry: RawEntry,
) -> Result<u64> {
    let offset = find_free_slot(storage, dir)?;
    seek_to(storage, dir, offset)?;
    let wrote = storage.write(&entry.encode())?;
    if wrote == DIR_ENTRY_SIZE {
        return Ok(offset);
    }
    if wrote > 0 {
        seek_to(storage, dir, offset)?;
        storage.write_all(&[EntryKind::Unused.as_byte()])?;
    }
    Err(PfsError::NoSpace)
}

/// Rewrite an existing slot in place (the slot must already exist).
pub fn rewrite_entry<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
    offset: u64,
    entry: RawEntry,
) -> Result<()> {
    seek_to(storage, dir, offset)?;
    storage.write_all(&entry.encode())
}

/// Tombstone the slot at `offset` and free the entry's regions.
///
/// The slot is never reclaimed; it becomes insertable again. The content
/// region is freed before the metadata region, so a subsequent first-fit
/// allocation hands the lowest freed block to new content.
pub fn remove_entry<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
    located: &LocatedEntry,
) -> Result<()> {
    seek_to(storage, dir, located.offset)?;
    storage.write_all(&[EntryKind::Unused.as_byte()])?;
    storage.free_region(located.entry.content)?;
    storage.free_region(located.entry.metadata)?;
    debug!(
        target: "pfs::dir",
        event = "entry_removed",
        kind = %located.entry.kind,
        content = located.entry.content.0,
        metadata = located.entry.metadata.0,
    );
    Ok(())
}

/// Whether the directory at `dir` still holds any live (`File` or `Dir`)
/// entry.
pub fn dir_has_live_entries<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
) -> Result<bool> {
    storage.jump_to_region(dir)?;
    loop {
        match read_kind(storage)? {
            EntryKind::Null => return Ok(false),
            EntryKind::Unused => {
                storage.seek((DIR_ENTRY_SIZE - 1) as i64)?;
            }
            EntryKind::File | EntryKind::Dir => return Ok(true),
        }
    }
}

/// Verify the tombstone layout invariant of the directory at `dir`: once a
/// `Null` entry appears, no later slot in the chain holds anything else.
pub fn entries_properly_terminated<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
) -> Result<bool> {
    storage.jump_to_region(dir)?;
    let mut seen_null = false;
    loop {
        let mut slot = [0_u8; DIR_ENTRY_SIZE];
        let got = storage.read(&mut slot)?;
        if got == 0 {
            return Ok(true);
        }
        if got < DIR_ENTRY_SIZE {
            // A trailing fragment cannot hold an entry; it must be virgin.
            return Ok(slot[..got].iter().all(|byte| *byte == 0));
        }
        let Ok(kind) = EntryKind::from_byte(slot[0]) else {
            return Ok(false);
        };
        if seen_null && kind != EntryKind::Null {
            return Ok(false);
        }
        if kind == EntryKind::Null {
            seen_null = true;
        }
    }
}

/// Decode every live entry of the directory at `dir`.
pub fn list_entries<D: ByteDevice>(
    storage: &mut Storage<D>,
    dir: RegionId,
) -> Result<Vec<EntryInfo>> {
    let mut entries = Vec::new();
    storage.jump_to_region(dir)?;
    loop {
        let kind = read_kind(storage)?;
        match kind {
            EntryKind::Null => return Ok(entries),
            EntryKind::Unused => {
                storage.seek((DIR_ENTRY_SIZE - 1) as i64)?;
            }
            EntryKind::File | EntryKind::Dir => {
                let mut regions = [0_u8; DIR_ENTRY_SIZE - 1];
                storage.read_exact(&mut regions)?;
                let metadata = RegionId(read_le_u16(&regions, 0).map_err(PfsError::Format)?);
                let content = RegionId(read_le_u16(&regions, 2).map_err(PfsError::Format)?);
                let resume = storage.position();

                let (name, length) = read_entry_name(storage, kind, metadata)?;
                entries.push(EntryInfo {
                    kind,
                    name,
                    length,
                    metadata,
                    content,
                });
                seek_to(storage, dir, resume)?;
            }
        }
    }
}

// ── Navigation ──────────────────────────────────────────────────────────────

/// Walk the directory prefix of `path`, returning the parent region and the
/// residual name.
///
/// `"A/B/file"` descends from the root into `A`, then `B`, and yields
/// `"file"` as the residual. A path with no `/` names a child of the root.
pub fn navigate<D: ByteDevice>(storage: &mut Storage<D>, path: &str) -> Result<Navigation> {
    let (dir_part, residual) = match path.rsplit_once('/') {
        Some((dirs, residual)) => (Some(dirs), residual),
        None => (None, path),
    };
    if residual.is_empty() {
        return Err(PfsError::InvalidPath(format!("no target name in {path:?}")));
    }

    let mut parent = RegionId::ROOT;
    if let Some(dirs) = dir_part {
        for segment in dirs.split('/') {
            if segment.is_empty() {
                return Err(PfsError::InvalidPath(format!("empty segment in {path:?}")));
            }
            let Some(found) = lookup_entry(storage, parent, segment.as_bytes(), EntryKind::Dir)?
            else {
                return Err(PfsError::NotFound(format!(
                    "{path}: no directory named {segment}"
                )));
            };
            parent = found.entry.content;
        }
    }

    Ok(Navigation {
        parent,
        residual: residual.to_owned(),
    })
}

// ── Creation ────────────────────────────────────────────────────────────────

fn create_entry<D: ByteDevice>(
    storage: &mut Storage<D>,
    parent: RegionId,
    name: &[u8],
    kind: EntryKind,
) -> Result<LocatedEntry> {
    validate_name(name)?;

    let content = storage.allocate_region()?;
    let metadata = match storage.allocate_region() {
        Ok(region) => region,
        Err(err) => {
            storage.free_region(content)?;
            return Err(err);
        }
    };

    let entry = RawEntry {
        kind,
        metadata,
        content,
    };
    let offset = match insert_entry(storage, parent, entry) {
        Ok(offset) => offset,
        Err(err) => {
            storage.free_region(content)?;
            storage.free_region(metadata)?;
            return Err(err);
        }
    };

    let record_write = match kind {
        EntryKind::File => write_file_record(
            storage,
            metadata,
            &FileRecord {
                length: 0,
                name: name.to_vec(),
            },
        ),
        _ => write_dir_record(
            storage,
            metadata,
            &DirRecord {
                name: name.to_vec(),
            },
        ),
    };
    if let Err(err) = record_write {
        // Unwind so the namespace does not expose an entry with no name.
        seek_to(storage, parent, offset)?;
        storage.write_all(&[EntryKind::Unused.as_byte()])?;
        storage.free_region(content)?;
        storage.free_region(metadata)?;
        return Err(err);
    }

    debug!(
        target: "pfs::dir",
        event = "entry_created",
        kind = %kind,
        content = content.0,
        metadata = metadata.0,
    );

    Ok(LocatedEntry {
        offset,
        entry,
        length: 0,
    })
}

/// Create an empty file named `name` in the directory at `parent`.
///
/// Allocates the content region first, then the metadata region, inserts the
/// entry and writes the metadata record; each later step frees what the
/// earlier steps allocated on failure.
pub fn create_file<D: ByteDevice>(
    storage: &mut Storage<D>,
    parent: RegionId,
    name: &[u8],
) -> Result<LocatedEntry> {
    create_entry(storage, parent, name, EntryKind::File)
}

/// Create an empty directory named `name` in the directory at `parent`.
pub fn create_dir<D: ByteDevice>(
    storage: &mut Storage<D>,
    parent: RegionId,
    name: &[u8],
) -> Result<LocatedEntry> {
    create_entry(storage, parent, name, EntryKind::Dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::MemoryByteDevice;
    use pfs_types::StorageGeometry;

    fn storage(block_count: u16) -> Storage<MemoryByteDevice> {
        let geometry = StorageGeometry::new(10, block_count).expect("geometry");
        let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
        Storage::format(device, geometry).expect("format")
    }

    #[test]
    fn validate_name_limits() {
        assert!(validate_name(b"a.txt").is_ok());
        assert!(validate_name(&[b'x'; 255]).is_ok());
        assert!(matches!(validate_name(b""), Err(PfsError::InvalidPath(_))));
        assert!(matches!(
            validate_name(&[b'x'; 256]),
            Err(PfsError::NameTooLong)
        ));
        assert!(matches!(
            validate_name(b"a\0b"),
            Err(PfsError::InvalidPath(_))
        ));
        assert!(matches!(
            validate_name(b"a/b"),
            Err(PfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn navigate_without_slash_targets_root() {
        let mut storage = storage(32);
        let nav = navigate(&mut storage, "notes.txt").expect("navigate");
        assert_eq!(nav.parent, RegionId::ROOT);
        assert_eq!(nav.residual, "notes.txt");
    }

    #[test]
    fn navigate_rejects_empty_names() {
        let mut storage = storage(32);
        assert!(matches!(
            navigate(&mut storage, ""),
            Err(PfsError::InvalidPath(_))
        ));
        assert!(matches!(
            navigate(&mut storage, "A/"),
            Err(PfsError::InvalidPath(_))
        ));
        create_dir(&mut storage, RegionId::ROOT, b"A").expect("mkdir");
        assert!(matches!(
            navigate(&mut storage, "A//f"),
            Err(PfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn navigate_descends_created_directories() {
        let mut storage = storage(64);
        let outer = create_dir(&mut storage, RegionId::ROOT, b"A").expect("A");
        let inner = create_dir(&mut storage, outer.entry.content, b"B").expect("B");

        let nav = navigate(&mut storage, "A/B/file").expect("navigate");
        assert_eq!(nav.parent, inner.entry.content);
        assert_eq!(nav.residual, "file");

        assert!(matches!(
            navigate(&mut storage, "A/C/file"),
            Err(PfsError::NotFound(_))
        ));
    }

    #[test]
    fn create_and_lookup_file() {
        let mut storage = storage(32);
        let created = create_file(&mut storage, RegionId::ROOT, b"a.txt").expect("create");

        let found = lookup_entry(&mut storage, RegionId::ROOT, b"a.txt", EntryKind::File)
            .expect("lookup")
            .expect("present");
        assert_eq!(found, created);
        assert_eq!(found.length, 0);

        // Same name as a directory: not found.
        let as_dir = lookup_entry(&mut storage, RegionId::ROOT, b"a.txt", EntryKind::Dir)
            .expect("lookup");
        assert!(as_dir.is_none());
    }

    #[test]
    fn lookup_skips_other_kinds_and_tombstones() {
        let mut storage = storage(64);
        create_file(&mut storage, RegionId::ROOT, b"noise").expect("file");
        let dir = create_dir(&mut storage, RegionId::ROOT, b"target").expect("dir");
        let doomed = create_file(&mut storage, RegionId::ROOT, b"doomed").expect("file");
        remove_entry(&mut storage, RegionId::ROOT, &doomed).expect("remove");

        let found = lookup_entry(&mut storage, RegionId::ROOT, b"target", EntryKind::Dir)
            .expect("lookup")
            .expect("present");
        assert_eq!(found.entry.content, dir.entry.content);
    }

    #[test]
    fn metadata_records_round_trip() {
        let mut storage = storage(32);
        let region = storage.allocate_region().expect("region");
        let record = FileRecord {
            length: 123_456,
            name: b"metadata-spans-blocks.bin".to_vec(),
        };
        write_file_record(&mut storage, region, &record).expect("write");
        assert_eq!(read_file_record(&mut storage, region).expect("read"), record);
        assert_eq!(read_file_length(&mut storage, region).expect("length"), 123_456);

        update_file_length(&mut storage, region, 7).expect("update");
        let updated = read_file_record(&mut storage, region).expect("read");
        assert_eq!(updated.length, 7);
        assert_eq!(updated.name, record.name);
    }

    #[test]
    fn dir_record_round_trip() {
        let mut storage = storage(32);
        let region = storage.allocate_region().expect("region");
        let record = DirRecord {
            name: b"Documents".to_vec(),
        };
        write_dir_record(&mut storage, region, &record).expect("write");
        assert_eq!(read_dir_record(&mut storage, region).expect("read"), record);
    }

    #[test]
    fn insert_reuses_tombstoned_slot() {
        let mut storage = storage(64);
        let first = create_file(&mut storage, RegionId::ROOT, b"first").expect("first");
        let second = create_file(&mut storage, RegionId::ROOT, b"second").expect("second");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, DIR_ENTRY_SIZE as u64);

        remove_entry(&mut storage, RegionId::ROOT, &first).expect("remove");
        let third = create_file(&mut storage, RegionId::ROOT, b"third").expect("third");
        assert_eq!(third.offset, first.offset);

        // `second` still resolves after the slot churn.
        let found = lookup_entry(&mut storage, RegionId::ROOT, b"second", EntryKind::File)
            .expect("lookup")
            .expect("present");
        assert_eq!(found.entry.content, second.entry.content);
    }

    #[test]
    fn dir_emptiness_tracks_live_entries() {
        let mut storage = storage(64);
        let dir = create_dir(&mut storage, RegionId::ROOT, b"D").expect("dir");
        let inside = dir.entry.content;
        assert!(!dir_has_live_entries(&mut storage, inside).expect("empty"));

        let file = create_file(&mut storage, inside, b"f").expect("file");
        assert!(dir_has_live_entries(&mut storage, inside).expect("live"));

        remove_entry(&mut storage, inside, &file).expect("remove");
        assert!(!dir_has_live_entries(&mut storage, inside).expect("tombstoned"));
    }

    #[test]
    fn list_entries_decodes_live_children() {
        let mut storage = storage(64);
        create_file(&mut storage, RegionId::ROOT, b"a").expect("a");
        create_dir(&mut storage, RegionId::ROOT, b"B").expect("B");
        let doomed = create_file(&mut storage, RegionId::ROOT, b"c").expect("c");
        remove_entry(&mut storage, RegionId::ROOT, &doomed).expect("remove");

        let entries = list_entries(&mut storage, RegionId::ROOT).expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"a");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[1].name, b"B");
        assert_eq!(entries[1].kind, EntryKind::Dir);
    }

    #[test]
    fn rewrite_entry_updates_region_fields_in_place() {
        let mut storage = storage(64);
        let file = create_file(&mut storage, RegionId::ROOT, b"f").expect("file");

        let replacement = storage.allocate_region().expect("region");
        let mut entry = file.entry;
        entry.content = replacement;
        rewrite_entry(&mut storage, RegionId::ROOT, file.offset, entry).expect("rewrite");

        let found = lookup_entry(&mut storage, RegionId::ROOT, b"f", EntryKind::File)
            .expect("lookup")
            .expect("present");
        assert_eq!(found.entry.content, replacement);
        assert_eq!(found.entry.metadata, file.entry.metadata);
    }

    #[test]
    fn directory_grows_across_blocks() {
        // 10-byte blocks hold two 5-byte entries; the third insertion spans
        // into a second chain block.
        let mut storage = storage(64);
        for name in [b"f0".as_slice(), b"f1", b"f2", b"f3", b"f4"] {
            create_file(&mut storage, RegionId::ROOT, name).expect("create");
        }
        let entries = list_entries(&mut storage, RegionId::ROOT).expect("list");
        assert_eq!(entries.len(), 5);
        for (index, info) in entries.iter().enumerate() {
            assert_eq!(info.name, format!("f{index}").into_bytes());
        }
    }

    #[test]
    fn create_rolls_back_when_allocation_fails_midway() {
        // Four blocks: root plus three. The first file takes two regions
        // (its one-byte name keeps the metadata record inside one block);
        // the second finds a content block but no metadata block, and must
        // give the content block back.
        let mut storage = storage(4);
        create_file(&mut storage, RegionId::ROOT, b"o").expect("fits");
        let before = storage.in_use_blocks().expect("count");
        assert_eq!(before, 3);

        let err = create_file(&mut storage, RegionId::ROOT, b"x").expect_err("full");
        assert!(matches!(err, PfsError::NoSpace));
        assert_eq!(storage.in_use_blocks().expect("count"), before);

        // The survivor is still intact.
        assert!(
            lookup_entry(&mut storage, RegionId::ROOT, b"o", EntryKind::File)
                .expect("lookup")
                .is_some()
        );
    }
}
