//! The store bundle: one open file, its allocator, and the named registry,
//! behind a builder-style options struct.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::allocator::{FileAllocator, Ptr, Transaction};
use crate::btree::BTree;
use crate::buffered_file::{BufferedFile, DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::values::PtrValue;
use crate::wire::{Endian, TypeRegistry};

/// Default allocator block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Default B-tree order for client trees and the registry.
pub const DEFAULT_ORDER: u32 = 32;

/// Builder for [`Database::open`].
#[derive(Clone, Debug)]
pub struct DatabaseOptions {
    block_size: u32,
    page_size: usize,
    cache_pages: usize,
    secure: bool,
    order: u32,
    registry_order: u32,
    endian: Endian,
}

impl Default for DatabaseOptions {
    fn default() -> DatabaseOptions {
        DatabaseOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            secure: false,
            order: DEFAULT_ORDER,
            registry_order: DEFAULT_ORDER,
            endian: Endian::NATIVE,
        }
    }
}

impl DatabaseOptions {
    pub fn new() -> DatabaseOptions {
        DatabaseOptions::default()
    }

    /// Allocator block size for a freshly created store. An existing store
    /// keeps the size it was created with.
    pub fn block_size(&mut self, block_size: u32) -> &mut Self {
        self.block_size = block_size;
        self
    }

    /// Page size of the buffered file's cache. Must be a power of two.
    pub fn page_size(&mut self, page_size: usize) -> &mut Self {
        self.page_size = page_size;
        self
    }

    /// Maximum resident pages in the cache.
    pub fn cache_pages(&mut self, cache_pages: usize) -> &mut Self {
        self.cache_pages = cache_pages;
        self
    }

    /// Zero freed block payloads before relinking them.
    pub fn secure(&mut self, secure: bool) -> &mut Self {
        self.secure = secure;
        self
    }

    /// B-tree order used by [`Database::open_tree`].
    pub fn order(&mut self, order: u32) -> &mut Self {
        self.order = order;
        self
    }

    /// B-tree order of the named registry, fixed when it is first created.
    pub fn registry_order(&mut self, registry_order: u32) -> &mut Self {
        self.registry_order = registry_order;
        self
    }

    /// Byte order for a freshly created store. An existing file dictates
    /// its own; this exists mostly to exercise the foreign-endian read
    /// path without a second machine.
    pub fn endian(&mut self, endian: Endian) -> &mut Self {
        self.endian = endian;
        self
    }

    /// Open with the built-in type registry.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Database> {
        self.open_with_types(path, TypeRegistry::new())
    }

    /// Open with a caller-extended type registry; it is frozen here.
    pub fn open_with_types<P: AsRef<Path>>(
        &self,
        path: P,
        types: TypeRegistry,
    ) -> Result<Database> {
        let mut file = BufferedFile::with_cache(&path, self.page_size, self.cache_pages)?;
        if file.size() == 0 {
            file.set_endian(self.endian);
        }
        let alloc = Arc::new(FileAllocator::open(file, self.block_size, self.secure)?);
        debug!(
            path = %path.as_ref().display(),
            block_size = alloc.block_size(),
            secure = self.secure,
            "database open"
        );
        Ok(Database {
            alloc,
            types: Arc::new(types),
            registry: None,
            order: self.order,
            registry_order: self.registry_order,
        })
    }
}

/// One open store: buffered file + allocator + named registry.
pub struct Database {
    alloc: Arc<FileAllocator>,
    types: Arc<TypeRegistry>,
    registry: Option<Registry>,
    order: u32,
    registry_order: u32,
}

impl Database {
    /// Open `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Database> {
        DatabaseOptions::default().open(path)
    }

    pub fn allocator(&self) -> &Arc<FileAllocator> {
        &self.alloc
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Begin a transaction on the store.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.alloc.transaction()
    }

    /// The named registry, created on first access.
    pub fn registry(&mut self) -> Result<&mut Registry> {
        if self.registry.is_none() {
            self.registry = Some(Registry::open(
                self.alloc.clone(),
                self.types.clone(),
                self.registry_order,
            )?);
        }
        Ok(self.registry.as_mut().unwrap())
    }

    /// Open the B-tree registered in the named registry under `name`,
    /// creating and registering a fresh one when the name is unknown.
    ///
    /// This is the bootstrap path clients use for their roots: the
    /// registry entry holds a pointer to the tree's header block.
    pub fn open_tree(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<BTree> {
        let order = self.order;
        let alloc = self.alloc.clone();
        let types = self.types.clone();
        let registry = self.registry()?;
        match registry.get_value(name) {
            Ok(value) => {
                let ptr = value
                    .as_any()
                    .downcast_ref::<PtrValue>()
                    .ok_or(Error::Corrupt("tree registry entry is not a pointer"))?
                    .value;
                BTree::open(alloc, types, ptr, key_type, value_type, order)
            }
            Err(Error::NotFound) => {
                let own_transaction = !alloc.in_transaction();
                let guard = if own_transaction {
                    Some(alloc.transaction()?)
                } else {
                    None
                };
                let tree = BTree::open(alloc.clone(), types, 0, key_type, value_type, order)?;
                registry.set_value(name, &PtrValue::new(tree.header_ptr()))?;
                if let Some(guard) = guard {
                    guard.commit()?;
                }
                debug!(name, header = tree.header_ptr(), "registered new tree");
                Ok(tree)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the tree registered under `name`, freeing all of its blocks.
    pub fn delete_tree(&mut self, name: &str) -> Result<bool> {
        let alloc = self.alloc.clone();
        let registry = self.registry()?;
        let ptr: Option<Ptr> = match registry.get_value(name) {
            Ok(value) => Some(
                value
                    .as_any()
                    .downcast_ref::<PtrValue>()
                    .ok_or(Error::Corrupt("tree registry entry is not a pointer"))?
                    .value,
            ),
            Err(Error::NotFound) => None,
            Err(err) => return Err(err),
        };
        let Some(ptr) = ptr else {
            return Ok(false);
        };
        let own_transaction = !alloc.in_transaction();
        let guard = if own_transaction {
            Some(alloc.transaction()?)
        } else {
            None
        };
        BTree::delete(&alloc, ptr)?;
        registry.delete_value(name)?;
        if let Some(guard) = guard {
            guard.commit()?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{StringKey, StringValue};
    use tempfile::tempdir;

    #[test]
    fn open_tree_registers_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trees.db");
        {
            let mut db = Database::open(&path).unwrap();
            let mut tree = db.open_tree("roots", "StringKey", "StringValue").unwrap();
            let txn = db.transaction().unwrap();
            tree.insert(&StringKey::new("home"), &StringValue::new("/home"))
                .unwrap();
            txn.commit().unwrap();
        }
        let mut db = Database::open(&path).unwrap();
        let tree = db.open_tree("roots", "StringKey", "StringValue").unwrap();
        let cursor = tree.find(&StringKey::new("home")).unwrap().unwrap();
        let value = tree.value(&cursor).unwrap();
        assert_eq!(
            value.as_any().downcast_ref::<StringValue>().unwrap().value,
            "/home"
        );
    }

    #[test]
    fn open_tree_rejects_mismatched_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mismatch.db");
        let mut db = Database::open(&path).unwrap();
        db.open_tree("roots", "StringKey", "StringValue").unwrap();
        assert!(matches!(
            db.open_tree("roots", "GuidKey", "StringValue"),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn delete_tree_reclaims_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delete.db");
        let mut db = Database::open(&path).unwrap();
        // Settle the registry first so the baseline is just "registry with
        // one dangling name slot".
        db.registry().unwrap();
        let before = db.allocator().file_size();

        let mut tree = db.open_tree("scratch", "StringKey", "StringValue").unwrap();
        let txn = db.transaction().unwrap();
        for i in 0..64 {
            let key = format!("key-{i:03}");
            tree.insert(&StringKey::new(&key), &StringValue::new(&key))
                .unwrap();
        }
        txn.commit().unwrap();
        assert!(db.allocator().file_size() > before);

        assert!(db.delete_tree("scratch").unwrap());
        assert!(!db.delete_tree("scratch").unwrap());
        // Everything the tree allocated sat at the end of the file, so the
        // teardown truncates all the way back.
        assert_eq!(db.allocator().file_size(), before);
    }
}
