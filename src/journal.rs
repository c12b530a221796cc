use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::file::JournalFile;
use crate::meta::{
    Metastore, Safety, DEFAULT_FILE_MODE, DEFAULT_HDR_MAGIC, DEFAULT_UNIT_LIMIT, METASTORE_FILE,
};
use crate::segment;
use crate::{Error, Result};

// Room for the directory path plus the longest member filename.
const MAX_PATH: usize = 4096 - 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContextMode {
    New,
    Init,
    Append,
    Read,
    Invalid,
}

/// A handle on one journal directory.
///
/// A fresh context starts in the `New` state and is committed to one
/// role by exactly one of [`Journal::init`], [`Journal::open_writer`]
/// or [`Journal::open_reader`]; it never transitions afterwards. All
/// handles are released on drop.
///
/// A context is single-threaded; cross-process coordination happens
/// entirely through advisory file locks and the mapped metastore.
pub struct Journal {
    pub(crate) path: PathBuf,
    pub(crate) mode: ContextMode,
    pub(crate) file_mode: u32,
    // Settings used until the metastore is mapped. `hdr_magic` is
    // refreshed from the mapping on restore.
    pub(crate) unit_limit: u32,
    pub(crate) safety: Safety,
    pub(crate) hdr_magic: u32,
    pub(crate) metastore: Option<JournalFile>,
    pub(crate) meta: Option<Metastore>,
    // Single-slot handles: the open data segment, its index, and the
    // subscriber checkpoint. Touching another segment closes these.
    pub(crate) data: Option<JournalFile>,
    pub(crate) index: Option<JournalFile>,
    pub(crate) checkpoint: Option<JournalFile>,
    pub(crate) map: Option<Mmap>,
    pub(crate) current_log: u32,
    pub(crate) subscriber: Option<Vec<u8>>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: ContextMode::New,
            file_mode: DEFAULT_FILE_MODE,
            unit_limit: DEFAULT_UNIT_LIMIT,
            safety: Safety::Synced,
            hdr_magic: DEFAULT_HDR_MAGIC,
            metastore: None,
            meta: None,
            data: None,
            index: None,
            checkpoint: None,
            map: None,
            current_log: 0,
            subscriber: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// POSIX mode bits for files this context creates.
    pub fn set_file_mode(&mut self, mode: u32) {
        self.file_mode = mode;
    }

    /// Soft size cap per segment. Legal on a `New` context and on an
    /// open writer, where it persists through the metastore.
    pub fn set_unit_limit(&mut self, limit: u32) -> Result<()> {
        match self.mode {
            ContextMode::New => {
                self.unit_limit = limit;
                Ok(())
            }
            ContextMode::Append => {
                if let Some(meta) = &self.meta {
                    meta.set_unit_limit(limit);
                }
                self.unit_limit = limit;
                self.save_metastore(false)
            }
            _ => Err(Error::NotSupported),
        }
    }

    /// Durability mode. Legal on a `New` context and on an open
    /// writer, where it persists through the metastore.
    pub fn set_safety(&mut self, safety: Safety) -> Result<()> {
        match self.mode {
            ContextMode::New => {
                self.safety = safety;
                Ok(())
            }
            ContextMode::Append => {
                if let Some(meta) = &self.meta {
                    meta.set_safety(safety);
                }
                self.safety = safety;
                self.save_metastore(false)
            }
            _ => Err(Error::NotSupported),
        }
    }

    /// Magic value stamped into record headers. Only meaningful on a
    /// `New` context headed for `init`; an existing directory carries
    /// its magic in the metastore and that value always wins.
    pub fn set_hdr_magic(&mut self, magic: u32) -> Result<()> {
        if self.mode != ContextMode::New {
            return Err(Error::NotSupported);
        }
        self.hdr_magic = magic;
        Ok(())
    }

    /// Create the journal directory and its metastore.
    pub fn init(&mut self) -> Result<()> {
        if self.path.as_os_str().len() > MAX_PATH {
            return Err(Error::PathTooLong);
        }
        if self.mode != ContextMode::New {
            return Err(Error::IllegalInit);
        }
        self.mode = ContextMode::Init;

        match fs::metadata(&self.path) {
            Ok(_) => return Err(Error::Exists),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Open(err)),
        }

        let dir_mode = dir_mode(self.file_mode);
        DirBuilder::new()
            .mode(dir_mode)
            .create(&self.path)
            .map_err(Error::Mkdir)?;
        // The builder mode is filtered by the umask; force the bits.
        let _ = fs::set_permissions(&self.path, Permissions::from_mode(dir_mode));

        self.open_metastore()?;
        self.save_metastore(false)
    }

    /// Attach as the (single) writer for the directory.
    pub fn open_writer(&mut self) -> Result<()> {
        if self.mode != ContextMode::New {
            return Err(Error::IllegalOpen);
        }
        self.mode = ContextMode::Append;
        let res = self.attach();
        if res.is_err() {
            self.mode = ContextMode::Invalid;
        }
        res
    }

    /// Attach as a reader consuming on behalf of `subscriber`, which
    /// must have been registered with [`Journal::add_subscriber`].
    pub fn open_reader(&mut self, subscriber: &[u8]) -> Result<()> {
        if self.mode != ContextMode::New {
            return Err(Error::IllegalOpen);
        }
        self.mode = ContextMode::Read;
        self.subscriber = Some(subscriber.to_vec());
        let res = self.attach_reader(subscriber);
        if res.is_err() {
            self.mode = ContextMode::Invalid;
        }
        res
    }

    fn attach(&mut self) -> Result<()> {
        self.require_directory()?;
        self.open_metastore().map_err(remap_meta)?;
        self.restore_metastore(false).map_err(remap_meta)
    }

    fn attach_reader(&mut self, subscriber: &[u8]) -> Result<()> {
        self.require_directory()?;
        self.open_metastore().map_err(remap_meta)?;
        self.get_checkpoint(subscriber)
            .map_err(|_| Error::InvalidSubscriber)?;
        self.restore_metastore(false).map_err(remap_meta)
    }

    fn require_directory(&self) -> Result<()> {
        let md = fs::metadata(&self.path).map_err(Error::Open)?;
        if !md.is_dir() {
            return Err(Error::NotDirectory);
        }
        Ok(())
    }

    /// Total bytes of regular files in the directory; 0 when the
    /// directory cannot be scanned.
    pub fn raw_size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.path) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|entry| entry.metadata().ok())
            .filter(|md| md.is_file())
            .map(|md| md.len())
            .sum()
    }

    // --- metastore plumbing ---

    pub(crate) fn open_metastore(&mut self) -> Result<()> {
        if self.metastore.is_some() {
            return Ok(());
        }
        let path = self.path.join(METASTORE_FILE);
        let file = JournalFile::create(&path, self.file_mode).map_err(Error::CreateMeta)?;
        self.metastore = Some(file);
        Ok(())
    }

    /// Map the metastore if it is not mapped yet. `locked` tells us
    /// the caller already holds the metastore lock.
    pub(crate) fn restore_metastore(&mut self, locked: bool) -> Result<()> {
        if self.meta.is_some() {
            return Ok(());
        }
        let meta = {
            let store = self.metastore.as_ref().ok_or_else(metastore_not_open)?;
            let _guard = if locked {
                None
            } else {
                Some(store.lock().map_err(Error::Lock)?)
            };
            Metastore::map(store)?
        };
        self.hdr_magic = meta.hdr_magic();
        self.meta = Some(meta);
        Ok(())
    }

    /// Push the context's view of the metastore to disk. Before the
    /// mapping exists this writes the pre-init settings image (used
    /// by `init`); afterwards it flushes the mapping.
    pub(crate) fn save_metastore(&self, locked: bool) -> Result<()> {
        let store = self.metastore.as_ref().ok_or_else(metastore_not_open)?;
        let _guard = if locked {
            None
        } else {
            Some(store.lock().map_err(Error::Lock)?)
        };
        match &self.meta {
            Some(meta) => meta.save(),
            None => {
                Metastore::write_initial(store, 0, self.unit_limit, self.safety, self.hdr_magic)
                    .map_err(Error::CreateMeta)?;
                if self.safety == Safety::Synced {
                    store.sync().map_err(Error::CreateMeta)?;
                }
                Ok(())
            }
        }
    }

    // --- effective settings (mapped metastore wins) ---

    pub(crate) fn unit_limit(&self) -> u32 {
        self.meta
            .as_ref()
            .map(|meta| meta.unit_limit())
            .unwrap_or(self.unit_limit)
    }

    pub(crate) fn safety(&self) -> Safety {
        self.meta
            .as_ref()
            .map(|meta| meta.safety())
            .unwrap_or(self.safety)
    }

    pub(crate) fn hdr_magic(&self) -> u32 {
        self.meta
            .as_ref()
            .map(|meta| meta.hdr_magic())
            .unwrap_or(self.hdr_magic)
    }

    pub(crate) fn storage_log(&self) -> u32 {
        self.meta.as_ref().map(|meta| meta.storage_log()).unwrap_or(0)
    }

    // --- single-slot handle management ---

    /// Open segment `log` through the read slot. Does not create.
    pub(crate) fn open_reader_file(&mut self, log: u32) -> Result<()> {
        if self.current_log != log {
            self.close_reader();
            self.close_indexer();
        }
        self.current_log = log;
        if self.data.is_none() {
            let path = segment::segment_path(&self.path, log);
            self.data = Some(JournalFile::open(&path).map_err(Error::FileOpen)?);
        }
        Ok(())
    }

    /// Open (creating lazily) the index of segment `log`.
    pub(crate) fn open_indexer(&mut self, log: u32) -> Result<()> {
        if self.current_log != log {
            self.close_reader();
            self.close_indexer();
        }
        self.current_log = log;
        if self.index.is_none() {
            let path = segment::index_path(&self.path, log);
            self.index = Some(JournalFile::create(&path, self.file_mode).map_err(Error::IdxOpen)?);
        }
        Ok(())
    }

    /// Open the current writer segment, creating it if missing. The
    /// segment id is resolved from the metastore under its lock.
    pub(crate) fn open_writer_file(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Ok(());
        }
        self.restore_metastore(false).map_err(remap_meta)?;
        let (log, file) = {
            let store = self.metastore.as_ref().ok_or_else(metastore_not_open)?;
            let meta = self.meta.as_ref().ok_or_else(metastore_not_open)?;
            let _guard = store.lock().map_err(Error::Lock)?;
            let log = meta.storage_log();
            let path = segment::segment_path(&self.path, log);
            let file = JournalFile::create(&path, self.file_mode).map_err(Error::FileOpen)?;
            (log, file)
        };
        self.current_log = log;
        self.data = Some(file);
        Ok(())
    }

    pub(crate) fn mmap_reader(&mut self, log: u32) -> Result<()> {
        if self.current_log == log && self.map.is_some() {
            return Ok(());
        }
        self.open_reader_file(log)?;
        let data = self.data.as_ref().ok_or_else(|| Error::FileOpen(slot_gone()))?;
        self.map = Some(data.map_read().map_err(Error::FileRead)?);
        Ok(())
    }

    pub(crate) fn unmap_reader(&mut self) {
        self.map = None;
    }

    pub(crate) fn close_reader(&mut self) {
        self.map = None;
        self.data = None;
    }

    pub(crate) fn close_indexer(&mut self) {
        self.index = None;
    }

    pub(crate) fn close_writer(&mut self) {
        self.data = None;
    }
}

fn dir_mode(file_mode: u32) -> u32 {
    let mut mode = file_mode;
    if mode & 0o400 != 0 {
        mode |= 0o100;
    }
    if mode & 0o040 != 0 {
        mode |= 0o010;
    }
    if mode & 0o004 != 0 {
        mode |= 0o001;
    }
    mode
}

fn metastore_not_open() -> Error {
    Error::MetaOpen(io::Error::new(
        io::ErrorKind::NotConnected,
        "metastore is not open",
    ))
}

fn slot_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "segment slot is not open")
}

/// The open paths report every metastore problem as `MetaOpen`.
pub(crate) fn remap_meta(err: Error) -> Error {
    match err {
        Error::CreateMeta(e) | Error::Open(e) => Error::MetaOpen(e),
        other => other,
    }
}
