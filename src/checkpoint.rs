use std::fs;
use std::io;
use std::path::PathBuf;

use log::debug;

use crate::file::JournalFile;
use crate::id::{LogId, LOG_ID_SIZE};
use crate::journal::{remap_meta, ContextMode, Journal};
use crate::meta::Safety;
use crate::retention;
use crate::{Error, Result};

pub const CHECKPOINT_PREFIX: &str = "cp.";
const HEXCHARS: &[u8; 16] = b"0123456789abcdef";

/// Where a new subscriber starts consuming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    /// The oldest retained record.
    Begin,
    /// The current tail; only records written afterwards are seen.
    End,
}

/// Checkpoint filename for a subscriber: `cp.` plus each name byte
/// as two lowercase hex digits. Names are opaque bytes, not strings.
pub(crate) fn checkpoint_file_name(subscriber: &[u8]) -> String {
    let mut name = String::with_capacity(CHECKPOINT_PREFIX.len() + subscriber.len() * 2);
    name.push_str(CHECKPOINT_PREFIX);
    for &byte in subscriber {
        name.push(HEXCHARS[(byte >> 4) as usize] as char);
        name.push(HEXCHARS[(byte & 0x0f) as usize] as char);
    }
    name
}

/// Recover a subscriber name from a directory entry, or `None` when
/// the entry is not a well-formed checkpoint name.
pub(crate) fn decode_subscriber_name(entry: &str) -> Option<Vec<u8>> {
    let hex = entry.strip_prefix(CHECKPOINT_PREFIX)?.as_bytes();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut name = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks(2) {
        name.push(nibble(pair[0])? << 4 | nibble(pair[1])?);
    }
    Some(name)
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

impl Journal {
    fn checkpoint_path(&self, subscriber: &[u8]) -> PathBuf {
        self.path.join(checkpoint_file_name(subscriber))
    }

    fn own_subscriber(&self, subscriber: &[u8]) -> bool {
        self.subscriber.as_deref() == Some(subscriber)
    }

    /// Register a new subscriber. Fails with `SubscriberExists` when
    /// the checkpoint file already exists.
    pub fn add_subscriber(&mut self, subscriber: &[u8], whence: Position) -> Result<()> {
        let path = self.checkpoint_path(subscriber);
        match JournalFile::create_new(&path, self.file_mode) {
            Ok(_file) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::SubscriberExists)
            }
            Err(err) => return Err(Error::Open(err)),
        }
        match whence {
            Position::Begin => {
                let first = self.first_log_id()?;
                self.set_checkpoint(subscriber, first)
                    .map_err(|_| Error::Checkpoint)
            }
            Position::End => {
                self.open_metastore().map_err(remap_meta)?;
                self.restore_metastore(false).map_err(remap_meta)?;
                let tail_segment = LogId::new(self.storage_log(), 0);
                self.set_checkpoint(subscriber, tail_segment)
                    .map_err(|_| Error::Checkpoint)?;
                // Walk a throwaway reader forward to the actual tail.
                let mut probe = Journal::new(&self.path);
                probe.set_file_mode(self.file_mode);
                probe.open_reader(subscriber)?;
                let interval = probe.read_interval()?;
                drop(probe);
                self.set_checkpoint(subscriber, interval.finish)
                    .map_err(|_| Error::Checkpoint)
            }
        }
    }

    /// Register `new` positioned at `old`'s current checkpoint. An
    /// existing `new` subscriber is repositioned.
    pub fn add_subscriber_copy_checkpoint(&mut self, new: &[u8], old: &[u8]) -> Result<()> {
        let chkpt = self.get_checkpoint(old)?;
        match self.add_subscriber(new, Position::Begin) {
            Ok(()) | Err(Error::SubscriberExists) => {}
            Err(err) => return Err(err),
        }
        let mut probe = Journal::new(&self.path);
        probe.set_file_mode(self.file_mode);
        probe.open_reader(new)?;
        probe.read_checkpoint(chkpt)
    }

    /// Unlink the subscriber's checkpoint. `Ok(false)` when there was
    /// no such subscriber.
    pub fn remove_subscriber(&mut self, subscriber: &[u8]) -> Result<bool> {
        if self.own_subscriber(subscriber) {
            self.checkpoint = None;
        }
        match fs::remove_file(self.checkpoint_path(subscriber)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Open(err)),
        }
    }

    /// Names of every registered subscriber, decoded back to bytes.
    pub fn list_subscribers(&self) -> Result<Vec<Vec<u8>>> {
        let mut subscribers = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(Error::Open)? {
            let entry = entry.map_err(Error::Open)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(subscriber) = decode_subscriber_name(name) {
                subscribers.push(subscriber);
            }
        }
        Ok(subscribers)
    }

    /// Read any subscriber's stored checkpoint.
    pub fn get_checkpoint(&mut self, subscriber: &[u8]) -> Result<LogId> {
        let id = self.with_checkpoint_file(subscriber, |file| {
            let _guard = file.lock().map_err(Error::Lock)?;
            let mut buf = [0u8; LOG_ID_SIZE];
            file.pread(&mut buf, 0)
                .map_err(|_| Error::InvalidSubscriber)?;
            Ok(LogId::from_bytes(&buf))
        })?;
        Ok(id)
    }

    /// Commit `id` as this subscriber's consumed position. Read-mode
    /// contexts only; this is what drives retention.
    pub fn read_checkpoint(&mut self, id: LogId) -> Result<()> {
        if self.mode != ContextMode::Read {
            return Err(Error::IllegalCheckpoint);
        }
        let name = self.subscriber.clone().ok_or(Error::InvalidSubscriber)?;
        self.set_checkpoint(&name, id).map_err(|_| Error::Checkpoint)
    }

    /// Locked rewrite of the checkpoint, then reclamation of every
    /// segment in `[old.log, id.log)` that no subscriber still needs.
    pub(crate) fn set_checkpoint(&mut self, subscriber: &[u8], id: LogId) -> Result<()> {
        let safety = self.safety();
        let old = self.with_checkpoint_file(subscriber, |file| {
            let _guard = file.lock().map_err(Error::Lock)?;
            let old = if file.size().map_err(Error::FileSeek)? == 0 {
                // First write to a fresh checkpoint: no segment was
                // pending on it, so the incoming segment is "old".
                LogId::new(id.log, 0)
            } else {
                let mut buf = [0u8; LOG_ID_SIZE];
                file.pread(&mut buf, 0).map_err(Error::FileRead)?;
                LogId::from_bytes(&buf)
            };
            file.pwrite(&id.to_bytes(), 0).map_err(Error::FileWrite)?;
            if safety == Safety::Synced {
                file.sync().map_err(Error::FileWrite)?;
            }
            Ok(old)
        })?;

        for log in old.log..id.log {
            let pending = self.pending_readers(log).map(|(count, _)| count).unwrap_or(1);
            if pending == 0 {
                debug!("reclaiming segment {log:08x}");
                if self.current_log == log {
                    self.close_reader();
                    self.close_indexer();
                }
                retention::unlink_segment(&self.path, log);
            }
        }
        Ok(())
    }

    /// Count subscribers whose checkpoint still references segment
    /// `upto` or older, and the earliest segment any checkpoint
    /// names. Unreadable checkpoint files are skipped.
    pub fn pending_readers(&self, upto: u32) -> Result<(u32, u32)> {
        let mut readers = 0;
        let mut earliest = 0;
        let mut seen = false;
        for entry in fs::read_dir(&self.path).map_err(Error::Open)? {
            let entry = entry.map_err(Error::Open)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(CHECKPOINT_PREFIX) {
                continue;
            }
            let Ok(file) = JournalFile::open(&entry.path()) else {
                continue;
            };
            let Ok(_guard) = file.lock() else {
                continue;
            };
            let mut buf = [0u8; LOG_ID_SIZE];
            if file.pread(&mut buf, 0).is_err() {
                continue;
            }
            let id = LogId::from_bytes(&buf);
            if !seen || id.log < earliest {
                earliest = id.log;
                seen = true;
            }
            if id.log <= upto {
                readers += 1;
            }
        }
        Ok((readers, earliest))
    }

    /// Run `body` against the checkpoint file for `subscriber`,
    /// caching the handle when it is this context's own subscriber.
    fn with_checkpoint_file<T>(
        &mut self,
        subscriber: &[u8],
        body: impl FnOnce(&JournalFile) -> Result<T>,
    ) -> Result<T> {
        if self.own_subscriber(subscriber) {
            if self.checkpoint.is_none() {
                let file = JournalFile::open(&self.checkpoint_path(subscriber))
                    .map_err(|_| Error::InvalidSubscriber)?;
                self.checkpoint = Some(file);
            }
            let file = self
                .checkpoint
                .as_ref()
                .ok_or(Error::InvalidSubscriber)?;
            body(file)
        } else {
            let file = JournalFile::open(&self.checkpoint_path(subscriber))
                .map_err(|_| Error::InvalidSubscriber)?;
            body(&file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{checkpoint_file_name, decode_subscriber_name};

    #[test]
    fn names_encode_to_lowercase_hex() {
        assert_eq!(checkpoint_file_name(b"sub"), "cp.737562");
        assert_eq!(checkpoint_file_name(b""), "cp.");
    }

    #[test]
    fn arbitrary_bytes_round_trip() {
        let name = [0u8, 0xff, b'/', b'.', 0x7f];
        let encoded = checkpoint_file_name(&name);
        assert_eq!(
            decode_subscriber_name(&encoded).expect("decode"),
            name.to_vec()
        );
    }

    #[test]
    fn decode_rejects_foreign_entries() {
        assert_eq!(decode_subscriber_name("metastore"), None);
        assert_eq!(decode_subscriber_name("cp.7"), None);
        assert_eq!(decode_subscriber_name("cp.7G"), None);
        assert_eq!(decode_subscriber_name("00000001"), None);
    }
}
