//! The named-root registry: a small `StringKey -> PtrValue` B-tree rooted
//! at the allocator's `root_block`, mapping well-known names to serialized
//! objects so clients can bootstrap their own roots by name.

use std::sync::Arc;

use tracing::debug;

use crate::allocator::{FileAllocator, Ptr};
use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::values::{PtrValue, StringKey};
use crate::wire::{serialize, Serializable, TypeRegistry};

pub struct Registry {
    alloc: Arc<FileAllocator>,
    types: Arc<TypeRegistry>,
    tree: BTree,
}

impl Registry {
    /// Open the registry tree, creating it on first access. Creation joins
    /// the ambient transaction when one is open and otherwise commits on
    /// its own.
    pub fn open(
        alloc: Arc<FileAllocator>,
        types: Arc<TypeRegistry>,
        order: u32,
    ) -> Result<Registry> {
        let root = alloc.root_block();
        let tree = if root == 0 {
            let own_transaction = !alloc.in_transaction();
            let guard = if own_transaction {
                Some(alloc.transaction()?)
            } else {
                None
            };
            let tree = BTree::open(
                alloc.clone(),
                types.clone(),
                0,
                "StringKey",
                "PtrValue",
                order,
            )?;
            alloc.set_root_block(tree.header_ptr())?;
            if let Some(guard) = guard {
                guard.commit()?;
            }
            debug!(header = tree.header_ptr(), "created named registry");
            tree
        } else {
            BTree::open(alloc.clone(), types.clone(), root, "StringKey", "PtrValue", order)?
        };
        Ok(Registry { alloc, types, tree })
    }

    fn read_object(&self, ptr: Ptr) -> Result<Box<dyn Serializable>> {
        let stored = self.alloc.stored_size(ptr)? as usize;
        let mut buf = vec![0u8; stored];
        self.alloc.read(ptr, &mut buf)?;
        self.types.deserialize(&buf, self.alloc.endian())
    }

    fn write_object(&self, object: &dyn Serializable) -> Result<Ptr> {
        let bytes = serialize(object, self.alloc.endian());
        let ptr = self.alloc.alloc(bytes.len())?;
        self.alloc.write(ptr, &bytes)?;
        Ok(ptr)
    }

    fn free_object(&self, ptr: Ptr) -> Result<()> {
        let stored = self.alloc.stored_size(ptr)?;
        self.alloc.free(ptr, stored as usize)
    }

    fn entry_ptr(&self, cursor: &crate::btree::Cursor) -> Result<Ptr> {
        let value = self.tree.value(cursor)?;
        let value = value
            .as_any()
            .downcast_ref::<PtrValue>()
            .ok_or(Error::Corrupt("registry entry is not a pointer value"))?;
        Ok(value.value)
    }

    /// Fetch and deserialize the object registered under `name`.
    pub fn get_value(&self, name: &str) -> Result<Box<dyn Serializable>> {
        let key = StringKey::new(name);
        let cursor = self.tree.find(&key)?.ok_or(Error::NotFound)?;
        let ptr = self.entry_ptr(&cursor)?;
        if ptr == 0 {
            return Err(Error::NotFound);
        }
        self.read_object(ptr)
    }

    /// Serialize `object` into a fresh block and register it under `name`,
    /// freeing whatever the name pointed at before. Transactional.
    pub fn set_value(&mut self, name: &str, object: &dyn Serializable) -> Result<()> {
        if !self.alloc.in_transaction() {
            return Err(Error::InvalidState("mutation outside a transaction"));
        }
        let ptr = self.write_object(object)?;
        let key = StringKey::new(name);
        let (mut cursor, inserted) = self.tree.insert(&key, &PtrValue::new(ptr))?;
        if !inserted {
            let old = self.entry_ptr(&cursor)?;
            if old != 0 {
                self.free_object(old)?;
            }
            self.tree.set_value(&mut cursor, &PtrValue::new(ptr))?;
        }
        Ok(())
    }

    /// Drop `name` and free the object it pointed at. Returns whether the
    /// name existed.
    pub fn delete_value(&mut self, name: &str) -> Result<bool> {
        if !self.alloc.in_transaction() {
            return Err(Error::InvalidState("mutation outside a transaction"));
        }
        let key = StringKey::new(name);
        let Some(cursor) = self.tree.find(&key)? else {
            return Ok(false);
        };
        let ptr = self.entry_ptr(&cursor)?;
        if ptr != 0 {
            self.free_object(ptr)?;
        }
        self.tree.remove(&key)
    }

    /// The registry's own B-tree, for callers that want to walk the names.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }
}
