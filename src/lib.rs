//! Transactional single-file block store with a typed B-tree index.
//!
//! One file, three layers:
//!
//! - [`BufferedFile`] — page-cached, endian-aware I/O with a single-writer
//!   undo-log transaction. Nothing touches the disk until the outermost
//!   commit.
//! - [`FileAllocator`] — partitions the file into size-prefixed blocks
//!   behind a 24-byte header, recycling freed blocks through a sorted free
//!   chain and truncating free runs off the end of the file.
//! - [`BTree`] and [`Registry`] — persistent ordered maps of typed keys to
//!   typed values, plus a small well-known-name registry rooted in the
//!   file header, through which clients bootstrap their own trees.
//!
//! All on-disk structures are endianness-portable: the header magic is
//! written in the creator's byte order, and a reader that sees it swapped
//! swaps every primitive from then on. Serialized objects are tagged with
//! a type name resolved through a per-store [`TypeRegistry`].
//!
//! [`Database`] bundles the three layers; the [`hash`] and [`sync`]
//! modules carry the digest and thread-coordination building blocks
//! clients use around the store.

pub mod error;

mod allocator;
mod buffered_file;
pub mod btree;
mod db;
pub mod hash;
mod registry;
pub mod sync;
pub mod values;
pub mod wire;

pub use allocator::{FileAllocator, Ptr, Transaction};
pub use btree::{BTree, Cursor};
pub use buffered_file::BufferedFile;
pub use db::{Database, DatabaseOptions, DEFAULT_BLOCK_SIZE, DEFAULT_ORDER};
pub use error::{Error, Result};
pub use registry::Registry;
pub use wire::{Endian, Serializable, TypeRegistry};
