use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const INDEX_EXT: &str = ".idx";

/// Data segments are named by the 8-digit lowercase hex form of
/// their id; the index file adds the `.idx` suffix.
pub fn segment_name(log: u32) -> String {
    format!("{log:08x}")
}

pub fn segment_path(dir: &Path, log: u32) -> PathBuf {
    dir.join(segment_name(log))
}

pub fn index_path(dir: &Path, log: u32) -> PathBuf {
    dir.join(format!("{}{INDEX_EXT}", segment_name(log)))
}

/// Parse a directory entry as a segment id. Exactly eight hex
/// digits; either case is accepted, generation is always lowercase.
pub fn parse_segment_name(name: &str) -> Option<u32> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

/// Smallest segment id present in the directory, or 0 when the
/// directory holds no segments yet.
pub fn first_log(dir: &Path) -> Result<u32> {
    Ok(segment_bounds(dir)?.map(|(earliest, _)| earliest).unwrap_or(0))
}

/// Earliest and latest segment ids present, if any.
pub fn segment_bounds(dir: &Path) -> Result<Option<(u32, u32)>> {
    let mut bounds: Option<(u32, u32)> = None;
    for entry in fs::read_dir(dir).map_err(Error::Open)? {
        let entry = entry.map_err(Error::Open)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(log) = parse_segment_name(name) else {
            continue;
        };
        bounds = Some(match bounds {
            None => (log, log),
            Some((earliest, latest)) => (earliest.min(log), latest.max(log)),
        });
    }
    Ok(bounds)
}
