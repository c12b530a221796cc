use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};

use crate::header::{RecordHeader, HEADER_SIZE};
use crate::id::LogId;
use crate::index::read_entry;
use crate::journal::{ContextMode, Journal};
use crate::segment;
use crate::{Error, Result};

const ENTRY_SIZE: u64 = 8;

/// One delivered record: the header as stored and a copy of the
/// payload bytes.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

/// A window of readable records for a subscriber. When `count` is
/// positive, `start` addresses the first unread record and `finish`
/// the last readable one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: LogId,
    pub finish: LogId,
    pub count: u32,
}

impl Journal {
    /// Smallest segment id present in the directory (marker 0), or
    /// id 0 when there are no segments.
    pub fn first_log_id(&self) -> Result<LogId> {
        Ok(LogId::new(segment::first_log(&self.path)?, 0))
    }

    /// Resync the writer's current segment and return its tail.
    pub fn last_log_id(&mut self) -> Result<LogId> {
        if self.mode != ContextMode::Read {
            return Err(Error::IllegalWrite);
        }
        self.restore_metastore(false)?;
        let (last, _closed) = self.resync_index_once(self.storage_log())?;
        Ok(last)
    }

    /// Fetch the record at `id` through the mapped segment.
    ///
    /// `Err(CloseLogId)` is the terminal signal that `id` addresses
    /// the sealed-marker slot; the caller moves to the next segment.
    /// On suspected corruption the map is dropped, the index reset
    /// and resynced, and the read retried once under the index lock.
    pub fn read_message(&mut self, id: LogId) -> Result<Message> {
        if self.mode != ContextMode::Read {
            return Err(Error::IllegalWrite);
        }
        if id.marker < 1 {
            return Err(Error::IllegalLogId);
        }
        match self.read_message_pass(id, false) {
            Ok(message) => Ok(message),
            Err(Error::CloseLogId) => Err(Error::CloseLogId),
            Err(first) => {
                debug!("read {id} failed ({first}); resync and retry with the index lock");
                self.unmap_reader();
                if matches!(first, Error::IdxCorrupt) {
                    if let Some(index) = &self.index {
                        if let Ok(_guard) = index.lock() {
                            let _ = index.truncate(0);
                        }
                    }
                }
                let _ = self.resync_index_once(id.log);
                self.read_message_pass(id, true)
            }
        }
    }

    fn read_message_pass(&mut self, id: LogId, with_lock: bool) -> Result<Message> {
        self.open_reader_file(id.log)?;
        self.open_indexer(id.log)?;

        let index = self.index.as_ref().ok_or_else(|| Error::IdxOpen(slot_gone()))?;
        let _guard = if with_lock {
            Some(index.lock().map_err(Error::Lock)?)
        } else {
            None
        };

        let index_len = index.size().map_err(Error::IdxSeek)?;
        if index_len % ENTRY_SIZE != 0 {
            return Err(Error::IdxCorrupt);
        }
        if id.marker as u64 * ENTRY_SIZE > index_len {
            return Err(Error::IllegalLogId);
        }
        let data_off =
            read_entry(index, (id.marker as u64 - 1) * ENTRY_SIZE).map_err(Error::IdxRead)?;
        if data_off == 0 && id.marker != 1 {
            if id.marker as u64 * ENTRY_SIZE == index_len {
                // The sealed marker, not a real offset.
                return Err(Error::CloseLogId);
            }
            // A zero in the middle of an index is corruption.
            return Err(Error::IdxCorrupt);
        }

        self.mmap_reader(id.log)?;
        let map = self.map.as_ref().ok_or_else(|| Error::FileRead(slot_gone()))?;
        let map_len = map.len() as u64;

        // Every step through the map is bounds-checked: an index or
        // header pointing past the mapping is corruption, not a fault.
        if data_off + HEADER_SIZE as u64 > map_len {
            return Err(Error::IdxCorrupt);
        }
        let mut hdr_buf = [0u8; HEADER_SIZE];
        let at = data_off as usize;
        hdr_buf.copy_from_slice(&map[at..at + HEADER_SIZE]);
        let header = RecordHeader::from_bytes(&hdr_buf);
        let payload_end = data_off + HEADER_SIZE as u64 + header.mlen as u64;
        if payload_end > map_len {
            return Err(Error::IdxCorrupt);
        }
        let payload = map[at + HEADER_SIZE..payload_end as usize].to_vec();
        Ok(Message { header, payload })
    }

    /// Compute the next readable window for this context's
    /// subscriber, advancing (and persisting) the checkpoint across
    /// sealed segments.
    pub fn read_interval(&mut self) -> Result<Interval> {
        if self.mode != ContextMode::Read {
            return Err(Error::IllegalWrite);
        }
        self.restore_metastore(false)?;
        let name = self.subscriber.clone().ok_or(Error::InvalidSubscriber)?;
        let chkpt = self
            .get_checkpoint(&name)
            .map_err(|_| Error::InvalidSubscriber)?;

        let (mut start, finish) = self.find_first_log_after(chkpt)?;
        if start.log != chkpt.log {
            // The walk moved past the stored segment; persist so the
            // next interval starts here.
            start.marker = 0;
            self.set_checkpoint(&name, start)
                .map_err(|_| Error::Checkpoint)?;
        } else {
            start.marker = chkpt.marker;
        }

        let count = finish.marker as i64 - start.marker as i64;
        if finish.marker > start.marker {
            start.marker += 1;
        }
        if count < 0 {
            // Checkpoint is beyond the end of its segment; snap it to
            // the tail and report nothing readable.
            warn!("checkpoint {chkpt} is past the end {finish}; snapping to {finish}");
            self.set_checkpoint(&name, finish)
                .map_err(|_| Error::Checkpoint)?;
            self.unmap_reader();
            return Ok(Interval {
                start,
                finish,
                count: 0,
            });
        }

        // Unmap so the next read remaps and sees the grown segment.
        self.unmap_reader();
        Ok(Interval {
            start,
            finish,
            count: count as u32,
        })
    }

    /// Step `cur` one record forward within the window, or across a
    /// segment boundary once the window is exhausted. Never persists
    /// the checkpoint; that happens in `read_interval` and
    /// `read_checkpoint` only.
    pub fn advance_id(&mut self, cur: LogId, finish: &mut LogId) -> Result<LogId> {
        if cur != *finish {
            return Ok(LogId::new(cur.log, cur.marker + 1));
        }
        let (start, new_finish) = self.find_first_log_after(cur)?;
        *finish = new_finish;
        let marker = if cur.log != start.log { 1 } else { cur.marker };
        Ok(LogId::new(start.log, marker))
    }

    /// Walk from `chkpt` to the first segment with unread records,
    /// skipping sealed (and missing) segments, but never advancing to
    /// or past the writer's segment on anything but its own terms.
    /// Returns `(start, finish)`; equal ids mean nothing to read.
    fn find_first_log_after(&mut self, chkpt: LogId) -> Result<(LogId, LogId)> {
        let mut start = chkpt;
        loop {
            let (last, closed) = match self.resync_index(start.log) {
                Ok(res) => res,
                Err(Error::FileOpen(err)) if err.kind() == io::ErrorKind::NotFound => {
                    // The segment is gone (reclaimed early or never
                    // written). Recover by moving to the next one that
                    // exists, without leapfrogging the writer.
                    if start.log >= self.storage_log() {
                        return Ok((start, start));
                    }
                    let next = start.log + 1;
                    if self.resync_index(next).is_err() || !index_nonempty(&self.path, next) {
                        return Ok((start, start));
                    }
                    warn!("segment {:08x} is missing; skipping to {next:08x}", start.log);
                    start = LogId::new(next, 0);
                    continue;
                }
                Err(err) => return Err(err),
            };

            // A checkpoint past the end of its segment snaps back for
            // the sealed-segment comparison; read_interval repairs it.
            if last.log == start.log && last.marker < start.marker {
                start = last;
            }

            if start == last && closed {
                // Fully consumed and sealed: consider the next segment.
                let next = start.log + 1;
                let next_len = fs::metadata(segment::segment_path(&self.path, next))
                    .ok()
                    .map(|md| md.len());
                if next_len.is_none() {
                    warn!(
                        "segment {next:08x} is missing after sealed {:08x}",
                        start.log
                    );
                    if next < self.storage_log() {
                        // A hole in the numbering; jump over it.
                        start = LogId::new(start.log + 2, 0);
                        return Ok((start, start));
                    }
                }
                if start.log >= self.storage_log()
                    || next_len.is_none()
                    || next_len == Some(0)
                {
                    return Ok((start, start));
                }
                if self.resync_index(next).is_err() || !index_nonempty(&self.path, next) {
                    return Ok((start, start));
                }
                start = LogId::new(next, 0);
                continue;
            }

            return Ok((start, last));
        }
    }
}

fn index_nonempty(dir: &Path, log: u32) -> bool {
    fs::metadata(segment::index_path(dir, log))
        .map(|md| md.len() > 0)
        .unwrap_or(false)
}

fn slot_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "reader slot is not open")
}
