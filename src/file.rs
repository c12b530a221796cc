use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use memmap2::{Mmap, MmapMut};

/// The file primitive every other module builds on: positional reads
/// and writes, whole-file advisory locking, size/truncate/sync, and
/// memory mapping. Handles are always opened read-write; the reader
/// and repair paths share fds with the writer path.
#[derive(Debug)]
pub struct JournalFile {
    file: File,
}

/// Holds the advisory lock on a file until dropped.
///
/// The guard owns a clone of the handle. `flock` locks belong to the
/// open file description, which the clone shares, so releasing
/// through the clone drops the lock taken through the original and
/// the guard stays valid however the caller juggles its handles.
#[must_use = "the advisory lock is released when the guard drops"]
pub struct FileLock {
    file: File,
}

impl JournalFile {
    /// Open an existing file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Open, creating with `mode` if missing.
    pub fn create(path: &Path, mode: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)?;
        Ok(Self { file })
    }

    /// Create with exclusive semantics; fails if the file exists.
    pub fn create_new(path: &Path, mode: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;
        Ok(Self { file })
    }

    /// Take the exclusive advisory lock, blocking until available.
    pub fn lock(&self) -> io::Result<FileLock> {
        let clone = self.file.try_clone()?;
        flock(clone.as_raw_fd(), libc::LOCK_EX)?;
        Ok(FileLock { file: clone })
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Write all of `buf` at `offset`.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Read-only map of the whole file. Fails on an empty file;
    /// callers check the size first.
    pub fn map_read(&self) -> io::Result<Mmap> {
        unsafe { Mmap::map(&self.file) }
    }

    /// Read-write shared map of the whole file.
    pub fn map_rdwr(&self) -> io::Result<MmapMut> {
        unsafe { MmapMut::map_mut(&self.file) }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Nothing useful to do if the unlock fails; close will drop it.
        let _ = flock(self.file.as_raw_fd(), libc::LOCK_UN);
    }
}

fn flock(fd: libc::c_int, operation: libc::c_int) -> io::Result<()> {
    loop {
        if unsafe { libc::flock(fd, operation) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JournalFile;
    use tempfile::tempdir;

    #[test]
    fn pread_pwrite_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("scratch");
        let file = JournalFile::create(&path, 0o640).expect("create");

        file.pwrite(b"abcdef", 0).expect("pwrite");
        file.pwrite(b"XY", 2).expect("pwrite overlap");

        let mut buf = [0u8; 6];
        file.pread(&mut buf, 0).expect("pread");
        assert_eq!(&buf, b"abXYef");
        assert_eq!(file.size().expect("size"), 6);

        file.truncate(3).expect("truncate");
        assert_eq!(file.size().expect("size"), 3);
    }

    #[test]
    fn exclusive_create_detects_collision() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("once");
        JournalFile::create_new(&path, 0o640).expect("first create");
        let err = JournalFile::create_new(&path, 0o640).expect_err("second create");
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn lock_guard_releases() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("locked");
        let file = JournalFile::create(&path, 0o640).expect("create");
        drop(file.lock().expect("first lock"));
        // Same-process relock succeeds once the guard is gone.
        drop(file.lock().expect("second lock"));
    }

    #[test]
    fn map_read_sees_writes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mapped");
        let file = JournalFile::create(&path, 0o640).expect("create");
        file.pwrite(b"payload", 0).expect("pwrite");
        let map = file.map_read().expect("map");
        assert_eq!(&map[..], b"payload");
    }
}
