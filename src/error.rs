use std::io;

use thiserror::Error;

/// Everything that can go wrong inside a journal directory.
///
/// Variants that originate in a system call carry the underlying
/// [`io::Error`] so the OS errno stays observable through the source
/// chain (or via [`Error::os_error`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("journal already initialized")]
    IllegalInit,
    #[error("journal context already open")]
    IllegalOpen,
    #[error("cannot open journal directory")]
    Open(#[source] io::Error),
    #[error("journal path is not a directory")]
    NotDirectory,
    #[error("journal path too long")]
    PathTooLong,
    #[error("journal directory already exists")]
    Exists,
    #[error("cannot create journal directory")]
    Mkdir(#[source] io::Error),
    #[error("cannot create metastore")]
    CreateMeta(#[source] io::Error),
    #[error("cannot take file lock")]
    Lock(#[source] io::Error),
    #[error("cannot open index file")]
    IdxOpen(#[source] io::Error),
    #[error("cannot size index file")]
    IdxSeek(#[source] io::Error),
    #[error("index file is corrupt")]
    IdxCorrupt,
    #[error("cannot read index file")]
    IdxRead(#[source] io::Error),
    #[error("cannot write index file")]
    IdxWrite(#[source] io::Error),
    #[error("cannot open segment file")]
    FileOpen(#[source] io::Error),
    #[error("cannot size segment file")]
    FileSeek(#[source] io::Error),
    #[error("segment file is corrupt")]
    FileCorrupt,
    #[error("cannot read segment file")]
    FileRead(#[source] io::Error),
    #[error("cannot write segment file")]
    FileWrite(#[source] io::Error),
    #[error("cannot open metastore")]
    MetaOpen(#[source] io::Error),
    #[error("write requires an append-mode context")]
    IllegalWrite,
    #[error("checkpoint requires a read-mode context")]
    IllegalCheckpoint,
    #[error("no such subscriber")]
    InvalidSubscriber,
    #[error("log id is not addressable")]
    IllegalLogId,
    #[error("subscriber already exists")]
    SubscriberExists,
    #[error("cannot update checkpoint")]
    Checkpoint,
    #[error("operation not supported")]
    NotSupported,
    /// Terminal signal from `read_message`: the id addresses the
    /// sealed-marker slot of a closed segment. The caller must move
    /// on to the next segment. Not a failure.
    #[error("log id addresses the sealed marker of a closed segment")]
    CloseLogId,
}

impl Error {
    /// The raw OS errno behind this error, when one exists.
    pub fn os_error(&self) -> Option<i32> {
        use Error::*;
        match self {
            Open(e) | Mkdir(e) | CreateMeta(e) | Lock(e) | IdxOpen(e) | IdxSeek(e)
            | IdxRead(e) | IdxWrite(e) | FileOpen(e) | FileSeek(e) | FileRead(e)
            | FileWrite(e) | MetaOpen(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
