use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};

use crate::checkpoint::CHECKPOINT_PREFIX;
use crate::file::JournalFile;
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::id::{LogId, LOG_ID_SIZE};
use crate::journal::Journal;
use crate::meta::{
    Metastore, Safety, DEFAULT_HDR_MAGIC, DEFAULT_UNIT_LIMIT, META_SIZE, METASTORE_FILE,
};
use crate::segment;
use crate::{Error, Result};

const COPY_CHUNK: usize = 4096;
const HSIZE: i64 = HEADER_SIZE as i64;

/// One valid record seen by [`Journal::inspect_datafile`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    pub offset: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub mlen: u32,
}

/// Result of walking a data segment record by record.
#[derive(Clone, Debug, Default)]
pub struct Inspection {
    pub records: Vec<RecordInfo>,
    /// Bytes after the last complete record (a torn tail).
    pub trailing_junk: u64,
}

impl Journal {
    /// Excise invalid byte ranges from segment `log` by sliding the
    /// valid spans together and truncating. A range is invalid until
    /// a header with matching magic is found whose record is followed
    /// by another valid header or ends exactly at end of file.
    /// Returns the number of ranges removed; 0 means the segment was
    /// already whole. Runs under the data file's lock.
    pub fn repair_datafile(&mut self, log: u32) -> Result<usize> {
        self.adopt_directory_magic();
        self.open_reader_file(log)?;
        let data = self.data.as_ref().ok_or_else(|| Error::FileOpen(slot_gone()))?;
        let _guard = data.lock().map_err(Error::Lock)?;

        let orig_len = data.size().map_err(Error::FileSeek)? as i64;
        if orig_len == 0 {
            return Ok(0);
        }
        let map = data.map_read().map_err(Error::FileRead)?;
        let invalid = find_invalid_ranges(&map, self.hdr_magic());
        drop(map);
        // Any cached reader mapping of this segment is stale now.
        self.map = None;

        if !invalid.is_empty() {
            debug!("segment {log:08x}: excising {} invalid ranges", invalid.len());
            let mut dst = invalid[0].0;
            for (i, range) in invalid.iter().enumerate() {
                let src = range.1;
                let end = invalid.get(i + 1).map(|next| next.0).unwrap_or(orig_len);
                let len = end - src;
                if len > 0 {
                    move_span(data, src, dst, len)?;
                    dst += len;
                }
            }
            data.truncate(dst as u64).map_err(Error::FileWrite)?;
        }
        Ok(invalid.len())
    }

    /// Walk segment `log` and report every complete record plus the
    /// size of any torn tail. A header with the wrong magic is
    /// corruption and fails the walk.
    pub fn inspect_datafile(&mut self, log: u32) -> Result<Inspection> {
        self.adopt_directory_magic();
        self.open_reader_file(log)?;
        let data = self.data.as_ref().ok_or_else(|| Error::FileOpen(slot_gone()))?;
        let data_len = data.size().map_err(Error::FileSeek)?;
        if data_len == 0 {
            return Ok(Inspection::default());
        }
        let map = data.map_read().map_err(Error::FileRead)?;
        let magic = self.hdr_magic();

        let mut records = Vec::new();
        let end = map.len() as u64;
        let mut offset = 0u64;
        while offset + HEADER_SIZE as u64 <= end {
            let mut buf = [0u8; HEADER_SIZE];
            buf.copy_from_slice(&map[offset as usize..offset as usize + HEADER_SIZE]);
            let hdr = RecordHeader::from_bytes(&buf);
            if hdr.magic != magic {
                return Err(Error::FileCorrupt);
            }
            let next = offset + HEADER_SIZE as u64 + hdr.mlen as u64;
            if next > end {
                break;
            }
            records.push(RecordInfo {
                offset,
                tv_sec: hdr.tv_sec,
                tv_usec: hdr.tv_usec,
                mlen: hdr.mlen,
            });
            offset = next;
        }
        Ok(Inspection {
            records,
            trailing_junk: end - offset,
        })
    }

    /// The magic to validate records against lives in the metastore,
    /// not in the context defaults. Best effort: a directory too
    /// damaged to map keeps the defaults.
    fn adopt_directory_magic(&mut self) {
        if self.meta.is_none() && self.open_metastore().is_ok() {
            let _ = self.restore_metastore(false);
        }
    }

    /// Rebuild damaged directory metadata: verify the metastore
    /// against the latest segment on disk and every checkpoint
    /// against the earliest, rewriting whatever does not match. A
    /// directory with no segments rebuilds against segment 0. When
    /// the rebuild is not possible and `aggressive` is set, remove
    /// the directory and everything in it instead.
    pub fn repair(&mut self, aggressive: bool) -> Result<()> {
        let path = self.path.clone();
        if fs::read_dir(&path).is_err() {
            if aggressive {
                return wipe_directory(&path);
            }
            return Err(Error::NotDirectory);
        }

        let (earliest, latest) = segment::segment_bounds(&path)?.unwrap_or((0, 0));
        let meta = repair_metastore(&path, latest, self.file_mode);
        let checkpoints = repair_checkpoints(&path, earliest, self.file_mode);
        match (meta, checkpoints) {
            (Ok(()), Ok(())) => return Ok(()),
            (meta, checkpoints) => {
                if let Err(err) = meta {
                    warn!("metastore repair failed: {err}");
                }
                if let Err(err) = checkpoints {
                    warn!("checkpoint repair failed: {err}");
                }
            }
        }

        if !aggressive {
            return Err(Error::CreateMeta(io::Error::new(
                io::ErrorKind::InvalidData,
                "directory cannot be repaired in place",
            )));
        }
        // The directory is going away; drop every handle into it.
        self.close_reader();
        self.close_indexer();
        self.checkpoint = None;
        self.meta = None;
        self.metastore = None;
        wipe_directory(&path)
    }
}

/// Tag the invalid byte ranges of a mapped segment. Walks from one
/// validated record to the next; on a mismatch it scans byte-wise
/// for the next offset holding a valid header whose record is
/// followed by another valid header (or ends the file), tagging the
/// gap. Offsets are signed so the scan can start from a virtual
/// record before the first byte.
fn find_invalid_ranges(map: &[u8], magic: u32) -> Vec<(i64, i64)> {
    let end = map.len() as i64;
    let mut invalid = Vec::new();
    let mut this: i64 = -HSIZE;
    let mut mlen: i64 = 0;

    while this + HSIZE <= end {
        let next = this + HSIZE + mlen;
        if next > 0 && next == end {
            this = next;
            break;
        }
        if next > 0 && next + HSIZE <= end {
            if let Some(next_mlen) = mlen_at(map, next, magic) {
                mlen = next_mlen;
                this = next;
                continue;
            }
        }

        // Lost the thread: scan for the next trustworthy header.
        let mut found = None;
        let mut probe = this + HSIZE;
        while probe + HSIZE <= end {
            if let Some(probe_mlen) = mlen_at(map, probe, magic) {
                let after = probe + HSIZE + probe_mlen;
                if after > 0
                    && (after == end
                        || (after + HSIZE <= end && mlen_at(map, after, magic).is_some()))
                {
                    found = Some((probe, after));
                    break;
                }
            }
            probe += 1;
        }
        if this < 0 {
            this = 0;
        }
        let Some((at, after)) = found else {
            break;
        };
        if at > this {
            invalid.push((this, at));
        }
        this = after;
        mlen = mlen_at(map, after, magic).unwrap_or(0);
    }
    if this != end {
        invalid.push((this, end));
    }
    invalid
}

fn mlen_at(map: &[u8], offset: i64, magic: u32) -> Option<i64> {
    if offset < 0 || offset + HSIZE > map.len() as i64 {
        return None;
    }
    let at = offset as usize;
    let mut buf = [0u8; HEADER_SIZE];
    buf.copy_from_slice(&map[at..at + HEADER_SIZE]);
    let hdr = RecordHeader::from_bytes(&buf);
    (hdr.magic == magic).then_some(hdr.mlen as i64)
}

fn move_span(data: &JournalFile, mut src: i64, mut dst: i64, mut len: i64) -> Result<()> {
    let mut buf = [0u8; COPY_CHUNK];
    while len > 0 {
        let chunk = len.min(COPY_CHUNK as i64) as usize;
        data.pread(&mut buf[..chunk], src as u64)
            .map_err(Error::FileRead)?;
        data.pwrite(&buf[..chunk], dst as u64)
            .map_err(Error::FileWrite)?;
        src += chunk as i64;
        dst += chunk as i64;
        len -= chunk as i64;
    }
    Ok(())
}

/// The metastore must read back as exactly
/// `(latest, DEFAULT_UNIT_LIMIT, Synced, DEFAULT_HDR_MAGIC)`;
/// anything else is replaced with that image.
fn repair_metastore(dir: &Path, latest: u32, file_mode: u32) -> Result<()> {
    let path = dir.join(METASTORE_FILE);
    if metastore_matches(&path, latest) {
        return Ok(());
    }
    warn!("rebuilding metastore in {}", dir.display());
    let _ = fs::remove_file(&path);
    let file = JournalFile::create_new(&path, file_mode).map_err(Error::CreateMeta)?;
    Metastore::write_initial(
        &file,
        latest,
        DEFAULT_UNIT_LIMIT,
        Safety::Synced,
        DEFAULT_HDR_MAGIC,
    )
    .map_err(Error::CreateMeta)?;
    file.sync().map_err(Error::CreateMeta)?;
    Ok(())
}

fn metastore_matches(path: &Path, latest: u32) -> bool {
    let Ok(file) = JournalFile::open(path) else {
        return false;
    };
    if file.size().ok() != Some(META_SIZE as u64) {
        return false;
    }
    let mut buf = [0u8; META_SIZE];
    if file.pread(&mut buf, 0).is_err() {
        return false;
    }
    let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().expect("slice length"));
    word(0) == latest
        && word(4) == DEFAULT_UNIT_LIMIT
        && word(8) == Safety::Synced as u32
        && word(12) == DEFAULT_HDR_MAGIC
}

/// Every checkpoint must hold `(earliest, 0)`; others are rewritten.
fn repair_checkpoints(dir: &Path, earliest: u32, file_mode: u32) -> Result<()> {
    let goal = LogId::new(earliest, 0);
    for entry in fs::read_dir(dir).map_err(Error::Open)? {
        let entry = entry.map_err(Error::Open)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(CHECKPOINT_PREFIX) {
            continue;
        }
        let path = entry.path();
        if checkpoint_matches(&path, goal) {
            continue;
        }
        warn!("rewriting checkpoint {} to {goal}", path.display());
        let file = match JournalFile::open(&path) {
            Ok(file) => file,
            Err(_) => JournalFile::create(&path, file_mode).map_err(Error::Open)?,
        };
        file.truncate(0).map_err(Error::FileWrite)?;
        file.pwrite(&goal.to_bytes(), 0).map_err(Error::FileWrite)?;
        file.sync().map_err(Error::FileWrite)?;
    }
    Ok(())
}

fn checkpoint_matches(path: &Path, goal: LogId) -> bool {
    let Ok(file) = JournalFile::open(path) else {
        return false;
    };
    if file.size().ok() != Some(LOG_ID_SIZE as u64) {
        return false;
    }
    let mut buf = [0u8; LOG_ID_SIZE];
    if file.pread(&mut buf, 0).is_err() {
        return false;
    }
    LogId::from_bytes(&buf) == goal
}

/// Remove everything in the directory, then the directory itself.
/// Per-entry failures are reported and skipped; only a surviving
/// directory makes the wipe fail.
fn wipe_directory(path: &Path) -> Result<()> {
    if let Ok(entries) = fs::read_dir(path) {
        let doomed: Vec<_> = entries.flatten().map(|entry| entry.path()).collect();
        for entry in doomed {
            let removed = if entry.is_dir() {
                fs::remove_dir_all(&entry)
            } else {
                fs::remove_file(&entry)
            };
            if let Err(err) = removed {
                warn!("cannot remove {}: {err}", entry.display());
            }
        }
    }
    fs::remove_dir(path).map_err(|_| Error::NotDirectory)
}

fn slot_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "segment slot is not open")
}
