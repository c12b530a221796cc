use std::fs;
use std::io;
use std::path::Path;

use log::debug;

use crate::journal::Journal;
use crate::segment;
use crate::{Error, Result};

/// Remove a segment's data and index files. Files already gone are
/// not an error; anything else is surfaced.
pub(crate) fn unlink_segment(dir: &Path, log: u32) {
    remove_quiet(&segment::segment_path(dir, log));
    remove_quiet(&segment::index_path(dir, log));
}

fn remove_quiet(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("unlinked {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!("cannot unlink {}: {err}", path.display()),
    }
}

/// Standalone retention sweep: remove every segment older than the
/// earliest live checkpoint. Returns how many segments went away.
/// With no subscribers registered, nothing is removed.
pub fn clean(path: &Path) -> Result<usize> {
    let mut journal = Journal::new(path);
    journal.open_writer()?;
    let (_readers, earliest) = journal.pending_readers(0)?;

    let mut stale = Vec::new();
    for entry in fs::read_dir(path).map_err(Error::Open)? {
        let entry = entry.map_err(Error::Open)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(log) = segment::parse_segment_name(name) else {
            continue;
        };
        if log < earliest {
            stale.push(log);
        }
    }
    for &log in &stale {
        unlink_segment(path, log);
    }
    Ok(stale.len())
}
