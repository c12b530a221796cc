use std::io;

use log::debug;

use crate::file::JournalFile;
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::id::LogId;
use crate::journal::Journal;
use crate::{Error, Result};

/// Offsets are flushed to the index in groups of up to this many.
const BUFFERED_INDICES: usize = 1024;
const ENTRY_SIZE: u64 = 8;

/// What an index file says about its segment without rescanning the
/// data: how many records are addressable and whether the segment is
/// sealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexDetails {
    pub marker: u32,
    pub closed: bool,
}

enum Pass {
    Done { last: LogId, closed: bool },
    Restart,
}

impl Journal {
    /// Bring the index of segment `log` up to the last committed
    /// record. Returns the last addressable id and whether the
    /// segment is sealed.
    ///
    /// A structural anomaly in the index is retried once after
    /// truncating back to the last known good boundary. If the
    /// segment is immutable (the writer has moved past it), the
    /// datafile itself is repaired and the index rebuilt from
    /// scratch, up to four attempts in all. Corruption in a segment
    /// the writer may still extend is surfaced, not repaired.
    pub(crate) fn resync_index(&mut self, log: u32) -> Result<(LogId, bool)> {
        let mut attempts = 0;
        loop {
            let err = match self.resync_index_once(log) {
                Ok(done) => return Ok(done),
                Err(err) => err,
            };
            attempts += 1;
            if matches!(err, Error::FileOpen(_) | Error::IdxOpen(_)) {
                return Err(err);
            }
            if log >= self.storage_log() || attempts >= 4 {
                return Err(err);
            }
            debug!("resync {log:08x} attempt {attempts} failed; repairing datafile");
            // Keep other resyncers out while the datafile is rewritten.
            let guard = self.index.as_ref().and_then(|index| index.lock().ok());
            let _ = self.repair_datafile(log);
            if let Some(index) = &self.index {
                let _ = index.truncate(0);
            }
            drop(guard);
        }
    }

    pub(crate) fn resync_index_once(&mut self, log: u32) -> Result<(LogId, bool)> {
        self.open_reader_file(log)?;
        let mut second_try = false;
        loop {
            self.open_indexer(log)?;
            match self.resync_pass(log)? {
                Pass::Done { last, closed } => return Ok((last, closed)),
                Pass::Restart => {
                    if second_try {
                        return Err(Error::IdxCorrupt);
                    }
                    second_try = true;
                }
            }
        }
    }

    /// One scan under the index lock. `Restart` means the index was
    /// trimmed to a trustworthy boundary and the caller should look
    /// again.
    fn resync_pass(&self, log: u32) -> Result<Pass> {
        let data = self.data.as_ref().ok_or_else(|| Error::FileOpen(slot_gone()))?;
        let index = self.index.as_ref().ok_or_else(|| Error::IdxOpen(slot_gone()))?;
        let _guard = index.lock().map_err(Error::Lock)?;

        let data_len = data.size().map_err(Error::FileSeek)?;
        let mut index_off = index.size().map_err(Error::IdxSeek)?;
        let mut data_off = 0u64;

        if index_off % ENTRY_SIZE != 0 {
            debug!("index {log:08x} has torn length {index_off}");
            index
                .truncate(index_off - index_off % ENTRY_SIZE)
                .map_err(Error::IdxWrite)?;
            return Ok(Pass::Restart);
        }

        if index_off > ENTRY_SIZE {
            let last_entry = read_entry(index, index_off - ENTRY_SIZE).map_err(Error::IdxRead)?;
            if last_entry == 0 {
                debug!("index {log:08x} is sealed");
                let last = LogId::new(log, (index_off / ENTRY_SIZE - 1) as u32);
                return Ok(Pass::Done { last, closed: true });
            }
            if last_entry > data_len {
                debug!("index {log:08x} points past the data ({last_entry} > {data_len})");
                index
                    .truncate(index_off - ENTRY_SIZE)
                    .map_err(Error::IdxWrite)?;
                return Ok(Pass::Restart);
            }
            data_off = last_entry;
        }

        if index_off > 0 {
            // Adding onto a partial index: step past the record the
            // last entry points at.
            let hdr = read_header(data, data_off).map_err(Error::FileRead)?;
            data_off += HEADER_SIZE as u64 + hdr.mlen as u64;
            if data_off > data_len {
                // The indexed tail record is torn; drop its entry.
                index
                    .truncate(index_off - ENTRY_SIZE)
                    .map_err(Error::IdxWrite)?;
                return Ok(Pass::Restart);
            }
        }

        let magic = self.hdr_magic();
        let mut buffer = Vec::with_capacity(BUFFERED_INDICES * ENTRY_SIZE as usize);
        while data_off + HEADER_SIZE as u64 <= data_len {
            let hdr = read_header(data, data_off).map_err(Error::FileRead)?;
            if hdr.magic != magic {
                debug!("record at {data_off} in {log:08x} has bad magic {:#x}", hdr.magic);
                return Err(Error::FileCorrupt);
            }
            let next_off = data_off + HEADER_SIZE as u64 + hdr.mlen as u64;
            if next_off > data_len {
                // Trailing record not fully written yet; stop short.
                break;
            }
            buffer.extend_from_slice(&data_off.to_le_bytes());
            if buffer.len() >= BUFFERED_INDICES * ENTRY_SIZE as usize {
                if index.pwrite(&buffer, index_off).is_err() {
                    let _ = index.truncate(index_off);
                    return Ok(Pass::Restart);
                }
                index_off += buffer.len() as u64;
                buffer.clear();
            }
            data_off = next_off;
        }
        if !buffer.is_empty() {
            if index.pwrite(&buffer, index_off).is_err() {
                let _ = index.truncate(index_off);
                return Ok(Pass::Restart);
            }
            index_off += buffer.len() as u64;
        }

        let last = LogId::new(log, (index_off / ENTRY_SIZE) as u32);
        let mut closed = false;
        if log < self.storage_log() {
            // The writer has moved on; this segment must be complete.
            if data_off != data_len {
                debug!("cannot seal {log:08x}: scan stopped at {data_off} of {data_len}");
                return Err(Error::FileCorrupt);
            }
            // Seal with a zero entry. An empty index is never sealed:
            // the zero would be indistinguishable from "record 1 at
            // offset 0" to the next reader.
            if index_off > 0 {
                if index.pwrite(&0u64.to_le_bytes(), index_off).is_err() {
                    let _ = index.truncate(index_off);
                    return Ok(Pass::Restart);
                }
            }
            closed = true;
        }
        Ok(Pass::Done { last, closed })
    }

    /// Report what the index claims about segment `log` without
    /// touching the data file.
    pub fn index_details(&mut self, log: u32) -> Result<IndexDetails> {
        self.open_indexer(log)?;
        let index = self.index.as_ref().ok_or_else(|| Error::IdxOpen(slot_gone()))?;
        let index_len = index.size().map_err(Error::IdxSeek)?;
        if index_len % ENTRY_SIZE != 0 {
            return Err(Error::IdxCorrupt);
        }
        if index_len > ENTRY_SIZE {
            let last_entry = read_entry(index, index_len - ENTRY_SIZE).map_err(Error::IdxRead)?;
            if last_entry == 0 {
                return Ok(IndexDetails {
                    marker: (index_len / ENTRY_SIZE - 1) as u32,
                    closed: true,
                });
            }
        }
        Ok(IndexDetails {
            marker: (index_len / ENTRY_SIZE) as u32,
            closed: false,
        })
    }
}

pub(crate) fn read_entry(index: &JournalFile, offset: u64) -> io::Result<u64> {
    let mut buf = [0u8; ENTRY_SIZE as usize];
    index.pread(&mut buf, offset)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_header(data: &JournalFile, offset: u64) -> io::Result<RecordHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    data.pread(&mut buf, offset)?;
    Ok(RecordHeader::from_bytes(&buf))
}

fn slot_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "segment slot is not open")
}
