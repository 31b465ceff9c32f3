use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open the backing file
    #[error("opening the backing file failed")]
    Open(#[source] io::Error),
    /// Couldn't lock the backing file
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] io::Error),
    /// Read, write or sync on the backing file failed
    #[error("I/O on the backing file failed")]
    Io(#[from] io::Error),
    /// The host filesystem refused to grow the file
    #[error("can't grow the backing file to 0x{requested:x} bytes")]
    OutOfSpace {
        requested: u64,
        #[source]
        source: io::Error,
    },
    /// An on-disk structure failed validation
    #[error("corrupt store: {0}")]
    Corrupt(&'static str),
    /// Operation attempted outside the state it requires
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Deserialization hit a type name with no registered factory
    #[error("no registered type named {0:?}")]
    UnknownType(String),
    /// Lookup miss in a B-tree or the named registry
    #[error("not found")]
    NotFound,
}
