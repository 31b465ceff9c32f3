//! Persistent ordered map of typed keys to typed values.
//!
//! A tree is two kinds of block: a small header (`{magic}{order}{root}
//! {key_type}{value_type}`) and fixed-size nodes. Keys and values are
//! serialized into blocks of their own and nodes store only pointers, so
//! value-size changes never reshape a node. Values live in the leaves;
//! internal entries carry separator-key copies and child pointers.
//!
//! `entries_per_node` is the tree order `m`: a node holds at most `m - 1`
//! entries and every non-root node at least `ceil(m/2) - 1`. Inserting
//! into a full node splits it and pushes the separator up; removal borrows
//! from a sibling or merges, all the way to the root, which collapses when
//! an internal root is left with a single child.
//!
//! Every mutation must run inside a transaction on the underlying
//! allocator. Cursors are snapshots of a position, not of data: any
//! intervening mutation invalidates them. A tree handle caches its root
//! pointer, so after rolling a transaction back, drop the handle and
//! reopen it from its header pointer.

mod node;

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::allocator::{FileAllocator, Ptr};
use crate::error::{Error, Result};
use crate::values::Key;
use crate::wire::{serialize, serialized_len, Endian, Reader, Serializable, TypeRegistry, Writer};

use node::{Entry, Node};

const TREE_MAGIC: u32 = 0x4252_5445; // "BTRE"

/// Forward iterator position inside a [`BTree`].
#[derive(Debug, Clone)]
pub struct Cursor {
    node: Ptr,
    slot: usize,
    finished: bool,
    generation: u64,
}

impl Cursor {
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

pub struct BTree {
    alloc: Arc<FileAllocator>,
    types: Arc<TypeRegistry>,
    header_ptr: Ptr,
    root: Ptr,
    order: u32,
    key_type: String,
    value_type: String,
    generation: u64,
}

impl BTree {
    /// Open the tree whose header lives at `header_ptr`, or create a fresh
    /// one when `header_ptr` is 0 (inside the ambient transaction).
    ///
    /// An existing tree keeps the order it was created with and must have
    /// been created with the same key and value type names.
    pub fn open(
        alloc: Arc<FileAllocator>,
        types: Arc<TypeRegistry>,
        header_ptr: Ptr,
        key_type: &str,
        value_type: &str,
        order: u32,
    ) -> Result<BTree> {
        // Fail early on unregistered types, whichever path we take.
        types.resolve_key(key_type)?;
        types.resolve(value_type)?;
        if header_ptr == 0 {
            if !alloc.in_transaction() {
                return Err(Error::InvalidState(
                    "creating a b-tree requires a transaction",
                ));
            }
            if !(3..=u16::MAX as u32 + 1).contains(&order) {
                return Err(Error::InvalidState("b-tree order out of range"));
            }
            let mut tree = BTree {
                alloc,
                types,
                header_ptr: 0,
                root: 0,
                order,
                key_type: key_type.to_owned(),
                value_type: value_type.to_owned(),
                generation: 0,
            };
            let leaf = Node::new_leaf(tree.alloc_node()?, 0);
            tree.store_node(&leaf)?;
            tree.root = leaf.ptr;
            let header_len = 4 + 4 + 8 + 4 + key_type.len() + 4 + value_type.len();
            tree.header_ptr = tree.alloc.alloc(header_len)?;
            tree.write_header()?;
            debug!(header = tree.header_ptr, order, "created b-tree");
            Ok(tree)
        } else {
            let stored = alloc.stored_size(header_ptr)? as usize;
            let mut buf = vec![0u8; stored];
            alloc.read(header_ptr, &mut buf)?;
            let endian = alloc.endian();
            let mut r = Reader::new(endian, &buf);
            if r.get_u32()? != TREE_MAGIC {
                return Err(Error::Corrupt("bad b-tree magic"));
            }
            let order = r.get_u32()?;
            let root = r.get_u64()?;
            let stored_key_type = r.get_string()?;
            let stored_value_type = r.get_string()?;
            if !(3..=u16::MAX as u32 + 1).contains(&order) || root == 0 {
                return Err(Error::Corrupt("bad b-tree header"));
            }
            if stored_key_type != key_type || stored_value_type != value_type {
                return Err(Error::Corrupt("b-tree key or value type mismatch"));
            }
            Ok(BTree {
                alloc,
                types,
                header_ptr,
                root,
                order,
                key_type: stored_key_type,
                value_type: stored_value_type,
                generation: 0,
            })
        }
    }

    /// Offset of the tree's header block, the handle to reopen it later.
    pub fn header_ptr(&self) -> Ptr {
        self.header_ptr
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn value_type(&self) -> &str {
        &self.value_type
    }

    fn endian(&self) -> Endian {
        self.alloc.endian()
    }

    fn max_entries(&self) -> usize {
        self.order as usize - 1
    }

    fn min_entries(&self) -> usize {
        (self.order as usize - 1) / 2
    }

    fn require_transaction(&self) -> Result<()> {
        if !self.alloc.in_transaction() {
            return Err(Error::InvalidState("mutation outside a transaction"));
        }
        Ok(())
    }

    fn check_key_type(&self, key: &dyn Key) -> Result<()> {
        if key.type_name() != self.key_type {
            return Err(Error::InvalidState("key type does not match the tree"));
        }
        Ok(())
    }

    fn check_value_type(&self, value: &dyn Serializable) -> Result<()> {
        if value.type_name() != self.value_type {
            return Err(Error::InvalidState("value type does not match the tree"));
        }
        Ok(())
    }

    fn check_cursor(&self, cursor: &Cursor) -> Result<()> {
        if cursor.generation != self.generation {
            return Err(Error::InvalidState("cursor invalidated by a later write"));
        }
        Ok(())
    }

    fn cursor_at(&self, node: Ptr, slot: usize) -> Cursor {
        Cursor {
            node,
            slot,
            finished: false,
            generation: self.generation,
        }
    }

    fn load_node(&self, ptr: Ptr) -> Result<Node> {
        node::load(&self.alloc, ptr, self.order)
    }

    fn store_node(&self, n: &Node) -> Result<()> {
        node::store(&self.alloc, n, self.order)
    }

    fn alloc_node(&self) -> Result<Ptr> {
        self.alloc.alloc(node::disk_size(self.order))
    }

    fn free_node(&self, n: &Node) -> Result<()> {
        self.alloc.free(n.ptr, node::disk_size(self.order))
    }

    fn set_parent(&self, child: Ptr, parent: Ptr) -> Result<()> {
        let mut n = self.load_node(child)?;
        n.parent = parent;
        self.store_node(&n)
    }

    fn load_key(&self, ptr: Ptr) -> Result<Box<dyn Key>> {
        let stored = self.alloc.stored_size(ptr)? as usize;
        let mut buf = vec![0u8; stored];
        self.alloc.read(ptr, &mut buf)?;
        self.types.deserialize_key(&buf, self.endian())
    }

    fn load_value(&self, ptr: Ptr) -> Result<Box<dyn Serializable>> {
        let stored = self.alloc.stored_size(ptr)? as usize;
        let mut buf = vec![0u8; stored];
        self.alloc.read(ptr, &mut buf)?;
        self.types.deserialize(&buf, self.endian())
    }

    fn write_blob<T: Serializable + ?Sized>(&self, obj: &T) -> Result<Ptr> {
        let bytes = serialize(obj, self.endian());
        let ptr = self.alloc.alloc(bytes.len())?;
        self.alloc.write(ptr, &bytes)?;
        Ok(ptr)
    }

    fn free_blob(&self, ptr: Ptr) -> Result<()> {
        let stored = self.alloc.stored_size(ptr)?;
        self.alloc.free(ptr, stored as usize)
    }

    /// Duplicate a serialized blob into a fresh block, byte for byte.
    fn copy_blob(&self, ptr: Ptr) -> Result<Ptr> {
        let stored = self.alloc.stored_size(ptr)? as usize;
        let mut buf = vec![0u8; stored];
        self.alloc.read(ptr, &mut buf)?;
        let len = serialized_len(&buf, self.endian())?;
        let copy = self.alloc.alloc(len)?;
        self.alloc.write(copy, &buf[..len])?;
        Ok(copy)
    }

    fn write_header(&self) -> Result<()> {
        let mut w = Writer::new(self.endian());
        w.put_u32(TREE_MAGIC);
        w.put_u32(self.order);
        w.put_u64(self.root);
        w.put_string(&self.key_type);
        w.put_string(&self.value_type);
        self.alloc.write(self.header_ptr, &w.into_inner())
    }

    /// Binary search one node. `Ok(i)` is an exact hit, `Err(i)` the
    /// position of the first key greater than the probe.
    fn search_node(&self, n: &Node, key: &dyn Key) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = n.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = self.load_key(n.entries[mid].key)?;
            match mid_key.compare(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Equality lookup; the cursor is positioned at the matching entry.
    pub fn find(&self, key: &dyn Key) -> Result<Option<Cursor>> {
        self.check_key_type(key)?;
        let mut n = self.load_node(self.root)?;
        loop {
            match self.search_node(&n, key)? {
                Ok(i) if n.leaf => return Ok(Some(self.cursor_at(n.ptr, i))),
                // An equal separator means the entry lives in the subtree
                // to its right.
                Ok(i) => n = self.load_node(n.child_at(i + 1))?,
                Err(_) if n.leaf => return Ok(None),
                Err(i) => n = self.load_node(n.child_at(i))?,
            }
        }
    }

    /// Position at the least key greater than or equal to the probe. The
    /// cursor is finished when every key is smaller.
    pub fn find_first(&self, probe: &dyn Key) -> Result<Cursor> {
        self.check_key_type(probe)?;
        let mut n = self.load_node(self.root)?;
        loop {
            let slot = match self.search_node(&n, probe)? {
                Ok(i) => {
                    if n.leaf {
                        return Ok(self.cursor_at(n.ptr, i));
                    }
                    i + 1
                }
                Err(i) => i,
            };
            if n.leaf {
                let mut cursor = self.cursor_at(n.ptr, slot);
                if slot == n.entries.len() {
                    self.advance_from_end(&mut cursor, &n)?;
                }
                return Ok(cursor);
            }
            n = self.load_node(n.child_at(slot))?;
        }
    }

    /// Position at the smallest key in the tree; finished when empty.
    pub fn first(&self) -> Result<Cursor> {
        let mut n = self.load_node(self.root)?;
        while !n.leaf {
            n = self.load_node(n.child_at(0))?;
        }
        let mut cursor = self.cursor_at(n.ptr, 0);
        if n.entries.is_empty() {
            cursor.finished = true;
        }
        Ok(cursor)
    }

    /// Step the cursor to the next entry in key order.
    pub fn next(&self, cursor: &mut Cursor) -> Result<()> {
        self.check_cursor(cursor)?;
        if cursor.finished {
            return Ok(());
        }
        let n = self.load_node(cursor.node)?;
        cursor.slot += 1;
        if cursor.slot >= n.entries.len() {
            self.advance_from_end(cursor, &n)?;
        }
        Ok(())
    }

    /// Move a cursor parked one past a leaf's last entry to the first
    /// entry of the next leaf, climbing parent pointers as far as needed.
    fn advance_from_end(&self, cursor: &mut Cursor, leaf: &Node) -> Result<()> {
        let mut child = leaf.ptr;
        let mut parent_ptr = leaf.parent;
        loop {
            if parent_ptr == 0 {
                cursor.finished = true;
                return Ok(());
            }
            let parent = self.load_node(parent_ptr)?;
            let idx = parent.child_index(child)?;
            if idx < parent.entries.len() {
                let mut next = self.load_node(parent.child_at(idx + 1))?;
                while !next.leaf {
                    next = self.load_node(next.child_at(0))?;
                }
                if next.entries.is_empty() {
                    return Err(Error::Corrupt("empty non-root node"));
                }
                cursor.node = next.ptr;
                cursor.slot = 0;
                return Ok(());
            }
            child = parent_ptr;
            parent_ptr = parent.parent;
        }
    }

    pub fn key(&self, cursor: &Cursor) -> Result<Box<dyn Key>> {
        self.check_cursor(cursor)?;
        if cursor.finished {
            return Err(Error::InvalidState("cursor is at the end"));
        }
        let n = self.load_node(cursor.node)?;
        let entry = n
            .entries
            .get(cursor.slot)
            .ok_or(Error::Corrupt("cursor slot out of range"))?;
        self.load_key(entry.key)
    }

    pub fn value(&self, cursor: &Cursor) -> Result<Box<dyn Serializable>> {
        self.check_cursor(cursor)?;
        if cursor.finished {
            return Err(Error::InvalidState("cursor is at the end"));
        }
        let n = self.load_node(cursor.node)?;
        let entry = n
            .entries
            .get(cursor.slot)
            .ok_or(Error::Corrupt("cursor slot out of range"))?;
        self.load_value(entry.link)
    }

    /// Insert `key -> value`. Returns `(cursor, true)` on insertion or
    /// `(cursor, false)` with the cursor at the existing entry when the
    /// key is already present.
    pub fn insert(
        &mut self,
        key: &dyn Key,
        value: &dyn Serializable,
    ) -> Result<(Cursor, bool)> {
        self.require_transaction()?;
        self.check_key_type(key)?;
        self.check_value_type(value)?;

        let mut n = self.load_node(self.root)?;
        let slot = loop {
            match self.search_node(&n, key)? {
                Ok(i) if n.leaf => return Ok((self.cursor_at(n.ptr, i), false)),
                Ok(i) => n = self.load_node(n.child_at(i + 1))?,
                Err(i) if n.leaf => break i,
                Err(i) => n = self.load_node(n.child_at(i))?,
            }
        };

        let key_ptr = self.write_blob(key)?;
        let value_ptr = self.write_blob(value)?;
        self.generation += 1;
        n.entries.insert(
            slot,
            Entry {
                key: key_ptr,
                link: value_ptr,
            },
        );
        let (cursor_node, cursor_slot) = if n.entries.len() <= self.max_entries() {
            self.store_node(&n)?;
            (n.ptr, slot)
        } else {
            self.split(n, slot)?
        };
        Ok((self.cursor_at(cursor_node, cursor_slot), true))
    }

    /// Split an overflowed node and push the separator up, repeating as
    /// far as the overflow propagates. Returns the final position of the
    /// freshly inserted leaf entry at `track_slot`.
    fn split(&mut self, mut current: Node, track_slot: usize) -> Result<(Ptr, usize)> {
        let mut track = (current.ptr, track_slot);
        let mut at_leaf_level = true;
        loop {
            let mid = current.entries.len() / 2;
            let (sep_key, mut right) = if current.leaf {
                let right_entries = current.entries.split_off(mid);
                // The separator is a copy: the original blob stays owned
                // by the right leaf's first entry.
                let sep_key = self.copy_blob(right_entries[0].key)?;
                let right = Node {
                    ptr: 0,
                    parent: current.parent,
                    leaf: true,
                    entries: right_entries,
                    rightmost: 0,
                };
                (sep_key, right)
            } else {
                let right_entries = current.entries.split_off(mid + 1);
                let sep = current.entries.pop().unwrap();
                let right = Node {
                    ptr: 0,
                    parent: current.parent,
                    leaf: false,
                    entries: right_entries,
                    rightmost: current.rightmost,
                };
                current.rightmost = sep.link;
                (sep.key, right)
            };
            right.ptr = self.alloc_node()?;
            if !right.leaf {
                for entry in &right.entries {
                    self.set_parent(entry.link, right.ptr)?;
                }
                self.set_parent(right.rightmost, right.ptr)?;
            }
            if at_leaf_level {
                if track.1 >= mid {
                    track = (right.ptr, track.1 - mid);
                }
                at_leaf_level = false;
            }

            if current.parent == 0 {
                let root_ptr = self.alloc_node()?;
                let root = Node {
                    ptr: root_ptr,
                    parent: 0,
                    leaf: false,
                    entries: vec![Entry {
                        key: sep_key,
                        link: current.ptr,
                    }],
                    rightmost: right.ptr,
                };
                current.parent = root_ptr;
                right.parent = root_ptr;
                self.store_node(&current)?;
                self.store_node(&right)?;
                self.store_node(&root)?;
                self.root = root_ptr;
                self.write_header()?;
                debug!(root = root_ptr, "root split");
                return Ok(track);
            }

            let mut parent = self.load_node(current.parent)?;
            let idx = parent.child_index(current.ptr)?;
            if idx < parent.entries.len() {
                parent.entries[idx].link = right.ptr;
                parent.entries.insert(
                    idx,
                    Entry {
                        key: sep_key,
                        link: current.ptr,
                    },
                );
            } else {
                parent.rightmost = right.ptr;
                parent.entries.push(Entry {
                    key: sep_key,
                    link: current.ptr,
                });
            }
            self.store_node(&current)?;
            self.store_node(&right)?;
            if parent.entries.len() <= self.max_entries() {
                self.store_node(&parent)?;
                return Ok(track);
            }
            trace!(node = parent.ptr, "split propagates");
            current = parent;
        }
    }

    /// Rewrite the value under the cursor: in place when the new encoding
    /// fits the stored block, otherwise into a fresh block.
    pub fn set_value(&mut self, cursor: &mut Cursor, value: &dyn Serializable) -> Result<()> {
        self.require_transaction()?;
        self.check_cursor(cursor)?;
        if cursor.finished {
            return Err(Error::InvalidState("cursor is at the end"));
        }
        self.check_value_type(value)?;
        let mut n = self.load_node(cursor.node)?;
        let entry = *n
            .entries
            .get(cursor.slot)
            .ok_or(Error::Corrupt("cursor slot out of range"))?;
        let bytes = serialize(value, self.endian());
        let stored = self.alloc.stored_size(entry.link)? as usize;
        self.generation += 1;
        if bytes.len() <= stored {
            self.alloc.write(entry.link, &bytes)?;
        } else {
            self.free_blob(entry.link)?;
            let fresh = self.alloc.alloc(bytes.len())?;
            self.alloc.write(fresh, &bytes)?;
            n.entries[cursor.slot].link = fresh;
            self.store_node(&n)?;
        }
        cursor.generation = self.generation;
        Ok(())
    }

    /// Remove `key` and rebalance. Returns whether the key was present.
    pub fn remove(&mut self, key: &dyn Key) -> Result<bool> {
        self.require_transaction()?;
        self.check_key_type(key)?;
        let mut n = self.load_node(self.root)?;
        let slot = loop {
            match self.search_node(&n, key)? {
                Ok(i) if n.leaf => break i,
                Ok(i) => n = self.load_node(n.child_at(i + 1))?,
                Err(_) if n.leaf => return Ok(false),
                Err(i) => n = self.load_node(n.child_at(i))?,
            }
        };
        self.generation += 1;
        let entry = n.entries.remove(slot);
        self.free_blob(entry.key)?;
        self.free_blob(entry.link)?;
        self.rebalance(n)?;
        Ok(true)
    }

    fn rebalance(&mut self, mut n: Node) -> Result<()> {
        loop {
            if n.ptr == self.root {
                if !n.leaf && n.entries.is_empty() {
                    let child = n.rightmost;
                    self.free_node(&n)?;
                    self.set_parent(child, 0)?;
                    self.root = child;
                    self.write_header()?;
                    debug!(root = child, "root collapsed");
                } else {
                    self.store_node(&n)?;
                }
                return Ok(());
            }
            if n.entries.len() >= self.min_entries() {
                self.store_node(&n)?;
                return Ok(());
            }
            let parent = self.load_node(n.parent)?;
            let idx = parent.child_index(n.ptr)?;
            match self.fix_underflow(parent, n, idx)? {
                Some(next) => n = next,
                None => return Ok(()),
            }
        }
    }

    /// Resolve one underflowed node, preferring a borrow over a merge.
    /// Returns the parent when a merge shrank it and the walk must go on.
    fn fix_underflow(
        &mut self,
        mut parent: Node,
        mut n: Node,
        idx: usize,
    ) -> Result<Option<Node>> {
        let min = self.min_entries();
        if idx > 0 {
            let mut left = self.load_node(parent.child_at(idx - 1))?;
            if left.entries.len() > min {
                self.borrow_from_left(&mut parent, &mut n, &mut left, idx)?;
                self.store_node(&left)?;
                self.store_node(&n)?;
                self.store_node(&parent)?;
                return Ok(None);
            }
        }
        if idx < parent.entries.len() {
            let mut right = self.load_node(parent.child_at(idx + 1))?;
            if right.entries.len() > min {
                self.borrow_from_right(&mut parent, &mut n, &mut right, idx)?;
                self.store_node(&right)?;
                self.store_node(&n)?;
                self.store_node(&parent)?;
                return Ok(None);
            }
        }
        if idx > 0 {
            let left = self.load_node(parent.child_at(idx - 1))?;
            self.merge(&mut parent, left, n, idx - 1)?;
        } else {
            let right = self.load_node(parent.child_at(idx + 1))?;
            self.merge(&mut parent, n, right, idx)?;
        }
        Ok(Some(parent))
    }

    /// Rotate one entry through the parent from the left sibling.
    fn borrow_from_left(
        &mut self,
        parent: &mut Node,
        n: &mut Node,
        left: &mut Node,
        idx: usize,
    ) -> Result<()> {
        let sep_idx = idx - 1;
        let moved = left.entries.pop().unwrap();
        if n.leaf {
            n.entries.insert(0, moved);
            // The separator copy must track the leaf's new first key.
            self.free_blob(parent.entries[sep_idx].key)?;
            parent.entries[sep_idx].key = self.copy_blob(moved.key)?;
        } else {
            n.entries.insert(
                0,
                Entry {
                    key: parent.entries[sep_idx].key,
                    link: left.rightmost,
                },
            );
            self.set_parent(left.rightmost, n.ptr)?;
            parent.entries[sep_idx].key = moved.key;
            left.rightmost = moved.link;
        }
        trace!(from = left.ptr, to = n.ptr, "borrowed from left sibling");
        Ok(())
    }

    /// Rotate one entry through the parent from the right sibling.
    fn borrow_from_right(
        &mut self,
        parent: &mut Node,
        n: &mut Node,
        right: &mut Node,
        idx: usize,
    ) -> Result<()> {
        let moved = right.entries.remove(0);
        if n.leaf {
            n.entries.push(moved);
            self.free_blob(parent.entries[idx].key)?;
            parent.entries[idx].key = self.copy_blob(right.entries[0].key)?;
        } else {
            n.entries.push(Entry {
                key: parent.entries[idx].key,
                link: n.rightmost,
            });
            n.rightmost = moved.link;
            self.set_parent(moved.link, n.ptr)?;
            parent.entries[idx].key = moved.key;
        }
        trace!(from = right.ptr, to = n.ptr, "borrowed from right sibling");
        Ok(())
    }

    /// Fold `right` into `left`, dropping the separator at `sep_idx` from
    /// the parent (in memory; the caller keeps rebalancing the parent).
    fn merge(&mut self, parent: &mut Node, mut left: Node, right: Node, sep_idx: usize) -> Result<()> {
        let sep = parent.entries.remove(sep_idx);
        if sep_idx < parent.entries.len() {
            parent.entries[sep_idx].link = left.ptr;
        } else {
            parent.rightmost = left.ptr;
        }
        if left.leaf {
            // Leaf separators are copies; this one has nothing left to
            // separate.
            self.free_blob(sep.key)?;
            left.entries.extend(right.entries.iter().copied());
        } else {
            left.entries.push(Entry {
                key: sep.key,
                link: left.rightmost,
            });
            left.entries.extend(right.entries.iter().copied());
            left.rightmost = right.rightmost;
            for entry in &right.entries {
                self.set_parent(entry.link, left.ptr)?;
            }
            self.set_parent(right.rightmost, left.ptr)?;
        }
        self.store_node(&left)?;
        self.free_node(&right)?;
        trace!(left = left.ptr, right = right.ptr, "merged siblings");
        Ok(())
    }

    /// Free every block reachable from the tree header: nodes, key blobs,
    /// value blobs and the header itself.
    pub fn delete(alloc: &FileAllocator, header_ptr: Ptr) -> Result<()> {
        if !alloc.in_transaction() {
            return Err(Error::InvalidState("mutation outside a transaction"));
        }
        let stored = alloc.stored_size(header_ptr)? as usize;
        let mut buf = vec![0u8; stored];
        alloc.read(header_ptr, &mut buf)?;
        let mut r = Reader::new(alloc.endian(), &buf);
        if r.get_u32()? != TREE_MAGIC {
            return Err(Error::Corrupt("bad b-tree magic"));
        }
        let _order = r.get_u32()?;
        let root = r.get_u64()?;
        free_subtree(alloc, root)?;
        free_block(alloc, header_ptr)?;
        debug!(header = header_ptr, "deleted b-tree");
        Ok(())
    }

    /// Count of levels from the root down to the leaves; 1 when the root
    /// is itself a leaf.
    pub fn height(&self) -> Result<u32> {
        let mut height = 1;
        let mut n = self.load_node(self.root)?;
        while !n.leaf {
            height += 1;
            n = self.load_node(n.child_at(0))?;
        }
        Ok(height)
    }

    /// Full structural validation: fill bounds, key order, uniform leaf
    /// depth and parent links. Surfaces the first violation as
    /// [`Error::Corrupt`].
    pub fn check(&self) -> Result<()> {
        let root = self.load_node(self.root)?;
        if root.parent != 0 {
            return Err(Error::Corrupt("root node has a parent"));
        }
        let mut last: Option<Box<dyn Key>> = None;
        self.check_node(&root, true, &mut last)?;
        Ok(())
    }

    fn check_node(
        &self,
        n: &Node,
        is_root: bool,
        last: &mut Option<Box<dyn Key>>,
    ) -> Result<u32> {
        if n.entries.len() > self.max_entries() {
            return Err(Error::Corrupt("node holds more entries than the order allows"));
        }
        if !is_root && n.entries.len() < self.min_entries() {
            return Err(Error::Corrupt("node fill below the minimum"));
        }
        // Keys within the node must be strictly ascending.
        for pair in n.entries.windows(2) {
            let a = self.load_key(pair[0].key)?;
            let b = self.load_key(pair[1].key)?;
            if a.compare(&*b) != Ordering::Less {
                return Err(Error::Corrupt("keys out of order inside a node"));
            }
        }
        if n.leaf {
            for entry in &n.entries {
                let key = self.load_key(entry.key)?;
                if let Some(prev) = last {
                    if prev.compare(&*key) != Ordering::Less {
                        return Err(Error::Corrupt("leaf keys out of global order"));
                    }
                }
                *last = Some(key);
            }
            return Ok(1);
        }
        let mut leaf_depth = None;
        for i in 0..=n.entries.len() {
            let child = self.load_node(n.child_at(i))?;
            if child.parent != n.ptr {
                return Err(Error::Corrupt("child does not point back at its parent"));
            }
            let depth = self.check_node(&child, false, last)?;
            match leaf_depth {
                None => leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(Error::Corrupt("leaves at unequal depth"));
                }
                Some(_) => {}
            }
        }
        Ok(leaf_depth.unwrap() + 1)
    }
}

fn free_block(alloc: &FileAllocator, ptr: Ptr) -> Result<()> {
    let stored = alloc.stored_size(ptr)?;
    alloc.free(ptr, stored as usize)
}

fn free_subtree(alloc: &FileAllocator, ptr: Ptr) -> Result<()> {
    let n = node::load_raw(alloc, ptr)?;
    for entry in &n.entries {
        free_block(alloc, entry.key)?;
        if n.leaf {
            free_block(alloc, entry.link)?;
        } else {
            free_subtree(alloc, entry.link)?;
        }
    }
    if !n.leaf {
        free_subtree(alloc, n.rightmost)?;
    }
    free_block(alloc, n.ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered_file::BufferedFile;
    use crate::values::{StringKey, StringValue};
    use tempfile::tempdir;

    fn open_alloc(path: &std::path::Path) -> (Arc<FileAllocator>, Arc<TypeRegistry>) {
        let file = BufferedFile::open(path).unwrap();
        let alloc = Arc::new(FileAllocator::open(file, 64, false).unwrap());
        (alloc, Arc::new(TypeRegistry::new()))
    }

    fn new_tree(alloc: &Arc<FileAllocator>, types: &Arc<TypeRegistry>, order: u32) -> BTree {
        let txn = alloc.transaction().unwrap();
        let tree = BTree::open(
            alloc.clone(),
            types.clone(),
            0,
            "StringKey",
            "StringValue",
            order,
        )
        .unwrap();
        txn.commit().unwrap();
        tree
    }

    fn insert_all(alloc: &Arc<FileAllocator>, tree: &mut BTree, keys: &[&str]) {
        let txn = alloc.transaction().unwrap();
        for key in keys {
            let (_, inserted) = tree
                .insert(&StringKey::new(key), &StringValue::new(key))
                .unwrap();
            assert!(inserted, "duplicate insert of {key}");
        }
        txn.commit().unwrap();
    }

    fn collect_keys(tree: &BTree) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = tree.first().unwrap();
        while !cursor.is_finished() {
            let key = tree.key(&cursor).unwrap();
            out.push(
                key.as_any()
                    .downcast_ref::<StringKey>()
                    .unwrap()
                    .value()
                    .to_owned(),
            );
            tree.next(&mut cursor).unwrap();
        }
        out
    }

    #[test]
    fn insert_find_and_iterate() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("basic.db"));
        let mut tree = new_tree(&alloc, &types, 8);

        insert_all(&alloc, &mut tree, &["cherry", "apple", "date", "banana"]);
        tree.check().unwrap();
        assert_eq!(collect_keys(&tree), ["apple", "banana", "cherry", "date"]);

        let cursor = tree.find(&StringKey::new("banana")).unwrap().unwrap();
        let value = tree.value(&cursor).unwrap();
        assert_eq!(
            value.as_any().downcast_ref::<StringValue>().unwrap().value,
            "banana"
        );
        assert!(tree.find(&StringKey::new("blueberry")).unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_returns_existing_entry() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("dup.db"));
        let mut tree = new_tree(&alloc, &types, 8);
        insert_all(&alloc, &mut tree, &["only"]);

        let txn = alloc.transaction().unwrap();
        let size_before = alloc.file_size();
        let (cursor, inserted) = tree
            .insert(&StringKey::new("only"), &StringValue::new("other"))
            .unwrap();
        assert!(!inserted);
        // Nothing was allocated for the refused insert.
        assert_eq!(alloc.file_size(), size_before);
        let value = tree.value(&cursor).unwrap();
        assert_eq!(
            value.as_any().downcast_ref::<StringValue>().unwrap().value,
            "only"
        );
        txn.commit().unwrap();
    }

    #[test]
    fn sequential_fill_splits_the_root() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("split.db"));
        let mut tree = new_tree(&alloc, &types, 4);

        let keys: Vec<String> = (0..10).map(|i| format!("{i:02}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        insert_all(&alloc, &mut tree, &refs);

        tree.check().unwrap();
        // Ten sequential inserts at order 4 push one separator all the way
        // into a fresh root: root, one internal level, leaves.
        assert_eq!(tree.height().unwrap(), 3);
        let root = tree.load_node(tree.root).unwrap();
        assert_eq!(root.entries.len(), 1);
        assert_eq!(collect_keys(&tree), keys);
    }

    #[test]
    fn find_first_is_a_lower_bound() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("seek.db"));
        let mut tree = new_tree(&alloc, &types, 4);
        insert_all(&alloc, &mut tree, &["b", "d", "f", "h", "j", "l", "n"]);

        for (probe, expect) in [("a", Some("b")), ("d", Some("d")), ("e", Some("f")),
            ("n", Some("n")), ("o", None)]
        {
            let cursor = tree.find_first(&StringKey::new(probe)).unwrap();
            match expect {
                Some(expect) => {
                    let key = tree.key(&cursor).unwrap();
                    assert_eq!(
                        key.as_any().downcast_ref::<StringKey>().unwrap().value(),
                        expect,
                        "probe {probe}"
                    );
                }
                None => assert!(cursor.is_finished(), "probe {probe}"),
            }
        }
    }

    #[test]
    fn remove_rebalances_and_iterates_the_complement() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("remove.db"));
        let mut tree = new_tree(&alloc, &types, 4);

        let keys: Vec<String> = (0..50).map(|i| format!("k{i:03}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        insert_all(&alloc, &mut tree, &refs);

        // Remove every third key, validating the structure as we go.
        let txn = alloc.transaction().unwrap();
        for key in keys.iter().step_by(3) {
            assert!(tree.remove(&StringKey::new(key)).unwrap());
            tree.check().unwrap();
        }
        assert!(!tree.remove(&StringKey::new("k000")).unwrap());
        txn.commit().unwrap();

        let expect: Vec<String> = keys
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(_, k)| k.clone())
            .collect();
        assert_eq!(collect_keys(&tree), expect);
    }

    #[test]
    fn remove_everything_collapses_to_an_empty_leaf() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("drain.db"));
        let mut tree = new_tree(&alloc, &types, 4);
        let keys: Vec<String> = (0..30).map(|i| format!("{i:02}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        insert_all(&alloc, &mut tree, &refs);

        let txn = alloc.transaction().unwrap();
        // Alternate ends to force both borrow directions.
        let mut remaining: std::collections::VecDeque<&str> =
            refs.iter().copied().collect();
        while let Some(key) = if remaining.len() % 2 == 0 {
            remaining.pop_front()
        } else {
            remaining.pop_back()
        } {
            assert!(tree.remove(&StringKey::new(key)).unwrap());
            tree.check().unwrap();
        }
        txn.commit().unwrap();

        assert_eq!(tree.height().unwrap(), 1);
        assert!(tree.first().unwrap().is_finished());
        assert_eq!(collect_keys(&tree), Vec::<String>::new());

        // The drained tree is still usable.
        insert_all(&alloc, &mut tree, &["again"]);
        assert_eq!(collect_keys(&tree), ["again"]);
    }

    #[test]
    fn set_value_in_place_and_resized() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("setval.db"));
        let mut tree = new_tree(&alloc, &types, 8);
        insert_all(&alloc, &mut tree, &["key"]);

        let txn = alloc.transaction().unwrap();
        let mut cursor = tree.find(&StringKey::new("key")).unwrap().unwrap();
        tree.set_value(&mut cursor, &StringValue::new("short"))
            .unwrap();
        let value = tree.value(&cursor).unwrap();
        assert_eq!(
            value.as_any().downcast_ref::<StringValue>().unwrap().value,
            "short"
        );

        // Far larger than the 64-byte block: forces a reallocation.
        let long = "x".repeat(500);
        tree.set_value(&mut cursor, &StringValue::new(&long)).unwrap();
        let value = tree.value(&cursor).unwrap();
        assert_eq!(
            value.as_any().downcast_ref::<StringValue>().unwrap().value,
            long
        );
        txn.commit().unwrap();
        tree.check().unwrap();
    }

    #[test]
    fn cursors_invalidate_across_writes() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("stale.db"));
        let mut tree = new_tree(&alloc, &types, 8);
        insert_all(&alloc, &mut tree, &["a", "b"]);

        let mut cursor = tree.find(&StringKey::new("a")).unwrap().unwrap();
        insert_all(&alloc, &mut tree, &["c"]);
        assert!(matches!(
            tree.next(&mut cursor),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(tree.key(&cursor), Err(Error::InvalidState(_))));
    }

    #[test]
    fn mutations_require_a_transaction() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("notxn.db"));
        let mut tree = new_tree(&alloc, &types, 8);
        assert!(matches!(
            tree.insert(&StringKey::new("k"), &StringValue::new("v")),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            tree.remove(&StringKey::new("k")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn wrong_key_or_value_type_is_refused() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("types.db"));
        let mut tree = new_tree(&alloc, &types, 8);
        let txn = alloc.transaction().unwrap();
        let guid = crate::values::GuidKey::new([0u8; 16]);
        assert!(matches!(
            tree.insert(&guid, &StringValue::new("v")),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            tree.insert(&StringKey::new("k"), &crate::values::PtrValue::new(1)),
            Err(Error::InvalidState(_))
        ));
        txn.commit().unwrap();
    }

    #[test]
    fn tree_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let header_ptr;
        {
            let (alloc, types) = open_alloc(&path);
            let mut tree = new_tree(&alloc, &types, 4);
            header_ptr = tree.header_ptr();
            let keys: Vec<String> = (0..20).map(|i| format!("{i:02}")).collect();
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            insert_all(&alloc, &mut tree, &refs);
        }
        let (alloc, types) = open_alloc(&path);
        let tree = BTree::open(alloc, types, header_ptr, "StringKey", "StringValue", 99)
            .unwrap();
        // The stored order wins over the one passed in.
        assert_eq!(tree.order(), 4);
        tree.check().unwrap();
        assert_eq!(collect_keys(&tree).len(), 20);
    }

    #[test]
    fn delete_frees_every_block() {
        let dir = tempdir().unwrap();
        let (alloc, types) = open_alloc(&dir.path().join("teardown.db"));
        let baseline = alloc.file_size();
        let mut tree = new_tree(&alloc, &types, 4);
        let keys: Vec<String> = (0..40).map(|i| format!("{i:02}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        insert_all(&alloc, &mut tree, &refs);
        assert!(alloc.file_size() > baseline);

        let header_ptr = tree.header_ptr();
        drop(tree);
        let txn = alloc.transaction().unwrap();
        BTree::delete(&alloc, header_ptr).unwrap();
        txn.commit().unwrap();
        // Every tree block sat above the baseline, so the teardown
        // truncates all the way back down.
        assert_eq!(alloc.file_size(), baseline);
    }
}
