use std::io;
use std::time::SystemTime;

use log::{debug, warn};

use crate::file::JournalFile;
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::journal::{ContextMode, Journal};
use crate::meta::Safety;
use crate::segment;
use crate::{Error, Result};

enum Appended {
    /// Segment was already full; rotate and try again.
    RotateRetry,
    /// Record written and the segment is now full; rotate eagerly.
    RotateDone,
    Done,
}

impl Journal {
    /// Append one record stamped with the current wall clock.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.write_message(payload, None)
    }

    /// Append one record, stamped with `when` if given.
    pub fn write_message(&mut self, payload: &[u8], when: Option<SystemTime>) -> Result<()> {
        if self.mode != ContextMode::Append {
            return Err(Error::IllegalWrite);
        }
        loop {
            self.open_writer_file()?;
            match self.append_record(payload, when)? {
                Appended::RotateRetry => {
                    self.close_writer();
                    self.metastore_atomic_increment()?;
                }
                Appended::RotateDone => {
                    self.close_writer();
                    // The record is already durable; a failed rotation
                    // here just means the next write rotates instead.
                    if let Err(err) = self.metastore_atomic_increment() {
                        warn!("post-write rotation failed: {err}");
                    }
                    return Ok(());
                }
                Appended::Done => return Ok(()),
            }
        }
    }

    /// One append attempt under the data lock.
    fn append_record(&self, payload: &[u8], when: Option<SystemTime>) -> Result<Appended> {
        let data = self.data.as_ref().ok_or_else(|| Error::FileOpen(slot_gone()))?;
        let _guard = data.lock().map_err(Error::Lock)?;

        let current_offset = data.size().map_err(Error::FileSeek)?;
        let unit_limit = self.unit_limit() as u64;
        if unit_limit <= current_offset {
            return Ok(Appended::RotateRetry);
        }

        let header = RecordHeader::new(self.hdr_magic(), payload.len() as u32, when);
        data.pwrite(&header.to_bytes(), current_offset)
            .map_err(Error::FileWrite)?;
        data.pwrite(payload, current_offset + HEADER_SIZE as u64)
            .map_err(Error::FileWrite)?;
        if self.safety() == Safety::Synced {
            data.sync().map_err(Error::FileWrite)?;
        }

        let end = current_offset + HEADER_SIZE as u64 + payload.len() as u64;
        if unit_limit <= end {
            return Ok(Appended::RotateDone);
        }
        Ok(Appended::Done)
    }

    /// Advance `storage_log` under the metastore lock. Whoever gets
    /// the lock first with a current view performs the increment and
    /// creates the new segment; everyone else adopts the advanced
    /// value without incrementing again.
    fn metastore_atomic_increment(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Err(Error::NotSupported);
        }
        self.restore_metastore(false)?;
        let won = {
            let store = self.metastore.as_ref().ok_or_else(|| Error::MetaOpen(slot_gone()))?;
            let meta = self.meta.as_ref().ok_or_else(|| Error::MetaOpen(slot_gone()))?;
            let _guard = store.lock().map_err(Error::Lock)?;
            if meta.storage_log() == self.current_log {
                let next = self.current_log + 1;
                debug!("rotating writer to segment {next:08x}");
                let path = segment::segment_path(&self.path, next);
                let file = JournalFile::create(&path, self.file_mode).map_err(Error::FileOpen)?;
                meta.set_storage_log(next);
                meta.save()?;
                Some((next, file))
            } else {
                None
            }
        };
        if let Some((next, file)) = won {
            self.current_log = next;
            self.data = Some(file);
        } else {
            // Someone else rotated; adopt however far they got.
            self.current_log = self.storage_log();
        }
        Ok(())
    }
}

fn slot_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "writer slot is not open")
}
