use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::file::JournalFile;
use crate::{Error, Result};

pub const METASTORE_FILE: &str = "metastore";
pub const META_SIZE: usize = 16;
const LEGACY_META_SIZE: u64 = 12;

pub const DEFAULT_UNIT_LIMIT: u32 = 4 * 1024 * 1024;
pub const DEFAULT_HDR_MAGIC: u32 = 0x663a_7318;
pub const DEFAULT_FILE_MODE: u32 = 0o640;

/// Durability mode stored in the metastore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Safety {
    /// Rely on the OS to flush.
    Fast = 0,
    /// fsync the metastore and checkpoints on every mutation.
    Synced = 1,
}

impl Safety {
    pub(crate) fn from_u32(value: u32) -> Self {
        if value == Safety::Fast as u32 {
            Safety::Fast
        } else {
            Safety::Synced
        }
    }
}

/// Field layout of the mapped metastore. Every context in every
/// process maps the same 16 bytes read-write; fields are accessed
/// atomically and converted to little-endian at the boundary so the
/// bytes on disk are the same on any host.
#[repr(C)]
struct MetaBlock {
    storage_log: AtomicU32,
    unit_limit: AtomicU32,
    safety: AtomicU32,
    hdr_magic: AtomicU32,
}

/// The mapped directory-wide control record: which segment the writer
/// appends to, the per-segment size cap, the durability mode, and the
/// magic value stamped into every record header.
pub struct Metastore {
    map: MmapMut,
}

impl Metastore {
    /// Map the metastore read-write, upgrading a legacy 12-byte file
    /// (predating `hdr_magic`) by appending a zero word first. The
    /// caller holds the metastore lock.
    pub fn map(file: &JournalFile) -> Result<Self> {
        let len = file.size().map_err(Error::MetaOpen)?;
        if len == LEGACY_META_SIZE {
            file.pwrite(&0u32.to_le_bytes(), LEGACY_META_SIZE)
                .map_err(Error::MetaOpen)?;
        }
        let map = file.map_rdwr().map_err(Error::MetaOpen)?;
        if map.len() != META_SIZE {
            return Err(Error::Open(io::Error::new(
                io::ErrorKind::InvalidData,
                "metastore has the wrong size",
            )));
        }
        Ok(Self { map })
    }

    /// Write a fresh metastore image. Used by `init` before any
    /// mapping exists, and by repair.
    pub fn write_initial(
        file: &JournalFile,
        storage_log: u32,
        unit_limit: u32,
        safety: Safety,
        hdr_magic: u32,
    ) -> io::Result<()> {
        let mut buf = [0u8; META_SIZE];
        buf[0..4].copy_from_slice(&storage_log.to_le_bytes());
        buf[4..8].copy_from_slice(&unit_limit.to_le_bytes());
        buf[8..12].copy_from_slice(&(safety as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&hdr_magic.to_le_bytes());
        file.pwrite(&buf, 0)
    }

    fn block(&self) -> &MetaBlock {
        // The map is page-aligned and exactly META_SIZE bytes.
        unsafe { &*(self.map.as_ptr() as *const MetaBlock) }
    }

    pub fn storage_log(&self) -> u32 {
        u32::from_le(self.block().storage_log.load(Ordering::Acquire))
    }

    pub fn set_storage_log(&self, log: u32) {
        self.block().storage_log.store(log.to_le(), Ordering::Release);
    }

    pub fn unit_limit(&self) -> u32 {
        u32::from_le(self.block().unit_limit.load(Ordering::Acquire))
    }

    pub fn set_unit_limit(&self, limit: u32) {
        self.block().unit_limit.store(limit.to_le(), Ordering::Release);
    }

    pub fn safety(&self) -> Safety {
        Safety::from_u32(u32::from_le(self.block().safety.load(Ordering::Acquire)))
    }

    pub fn set_safety(&self, safety: Safety) {
        self.block()
            .safety
            .store((safety as u32).to_le(), Ordering::Release);
    }

    pub fn hdr_magic(&self) -> u32 {
        u32::from_le(self.block().hdr_magic.load(Ordering::Acquire))
    }

    /// Flush the mapping: synchronously when the durability mode says
    /// so, otherwise schedule the writeback and return.
    pub fn save(&self) -> Result<()> {
        let res = if self.safety() == Safety::Synced {
            self.map.flush()
        } else {
            self.map.flush_async()
        };
        res.map_err(Error::FileWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::{Metastore, Safety, DEFAULT_HDR_MAGIC, META_SIZE};
    use crate::file::JournalFile;
    use tempfile::tempdir;

    #[test]
    fn initial_image_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("metastore");
        let file = JournalFile::create(&path, 0o640).expect("create");
        Metastore::write_initial(&file, 3, 4096, Safety::Synced, DEFAULT_HDR_MAGIC)
            .expect("write");

        let meta = Metastore::map(&file).expect("map");
        assert_eq!(meta.storage_log(), 3);
        assert_eq!(meta.unit_limit(), 4096);
        assert_eq!(meta.safety(), Safety::Synced);
        assert_eq!(meta.hdr_magic(), DEFAULT_HDR_MAGIC);

        meta.set_storage_log(4);
        meta.save().expect("save");
        assert_eq!(meta.storage_log(), 4);
    }

    #[test]
    fn legacy_metastore_is_upgraded() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("metastore");
        let file = JournalFile::create(&path, 0o640).expect("create");

        // 12-byte image without the hdr_magic word.
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&7u32.to_le_bytes());
        buf[4..8].copy_from_slice(&1024u32.to_le_bytes());
        buf[8..12].copy_from_slice(&1u32.to_le_bytes());
        file.pwrite(&buf, 0).expect("pwrite");

        let meta = Metastore::map(&file).expect("map");
        assert_eq!(file.size().expect("size"), META_SIZE as u64);
        assert_eq!(meta.storage_log(), 7);
        assert_eq!(meta.unit_limit(), 1024);
        assert_eq!(meta.hdr_magic(), 0);
    }

    #[test]
    fn wrong_size_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("metastore");
        let file = JournalFile::create(&path, 0o640).expect("create");
        file.pwrite(&[0u8; 5], 0).expect("pwrite");
        assert!(Metastore::map(&file).is_err());
    }
}
