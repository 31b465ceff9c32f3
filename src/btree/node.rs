//! On-disk node layout and codec.
//!
//! A node is one allocated block: `{u16 entry_count}{u8 is_leaf}
//! {u64 parent}` followed by `entry_count` entries of `{u64 key_ptr}
//! {u64 value_or_child}` and a trailing `u64 rightmost_child` (0 in a
//! leaf). Key and value blobs live in blocks of their own; a node only
//! stores pointers, so its size is fixed by the tree order.

use bytemuck::{Pod, Zeroable};

use crate::allocator::{FileAllocator, Ptr};
use crate::error::{Error, Result};
use crate::wire::{Endian, Reader, Writer};

pub(crate) const NODE_FIXED: usize = 2 + 1 + 8;
pub(crate) const ENTRY_SIZE: usize = 16;

/// One `(key_ptr, value_or_child)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct Entry {
    pub key: Ptr,
    pub link: Ptr,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub ptr: Ptr,
    pub parent: Ptr,
    pub leaf: bool,
    pub entries: Vec<Entry>,
    pub rightmost: Ptr,
}

impl Node {
    pub fn new_leaf(ptr: Ptr, parent: Ptr) -> Node {
        Node {
            ptr,
            parent,
            leaf: true,
            entries: Vec::new(),
            rightmost: 0,
        }
    }

    /// Child pointer at position `i` of `0..=entry_count`.
    pub fn child_at(&self, i: usize) -> Ptr {
        debug_assert!(!self.leaf && i <= self.entries.len());
        if i < self.entries.len() {
            self.entries[i].link
        } else {
            self.rightmost
        }
    }

    /// Position of `child` in this node's child list.
    pub fn child_index(&self, child: Ptr) -> Result<usize> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.link == child {
                return Ok(i);
            }
        }
        if self.rightmost == child {
            return Ok(self.entries.len());
        }
        Err(Error::Corrupt("child not referenced by its parent"))
    }
}

/// Exact on-disk size of a node of the given order.
pub(crate) fn disk_size(order: u32) -> usize {
    NODE_FIXED + (order as usize - 1) * ENTRY_SIZE + 8
}

pub(crate) fn encode(node: &Node, order: u32, endian: Endian) -> Vec<u8> {
    debug_assert!(node.entries.len() < order as usize);
    let mut w = Writer::with_capacity(endian, disk_size(order));
    w.put_u16(node.entries.len() as u16);
    w.put_u8(node.leaf as u8);
    w.put_u64(node.parent);
    if endian == Endian::NATIVE {
        for entry in &node.entries {
            w.put_bytes(bytemuck::bytes_of(entry));
        }
    } else {
        for entry in &node.entries {
            w.put_u64(entry.key);
            w.put_u64(entry.link);
        }
    }
    w.put_u64(node.rightmost);
    w.into_inner()
}

pub(crate) fn decode(ptr: Ptr, buf: &[u8], endian: Endian, order: Option<u32>) -> Result<Node> {
    let mut r = Reader::new(endian, buf);
    let count = r.get_u16()? as usize;
    let leaf = match r.get_u8()? {
        0 => false,
        1 => true,
        _ => return Err(Error::Corrupt("bad leaf flag in node")),
    };
    let parent = r.get_u64()?;
    if let Some(order) = order {
        if count >= order as usize {
            return Err(Error::Corrupt("node entry count exceeds the tree order"));
        }
    }
    let mut entries = Vec::with_capacity(count);
    if endian == Endian::NATIVE {
        let bytes = r.get_bytes(count * ENTRY_SIZE)?;
        for chunk in bytes.chunks_exact(ENTRY_SIZE) {
            entries.push(bytemuck::pod_read_unaligned::<Entry>(chunk));
        }
    } else {
        for _ in 0..count {
            let key = r.get_u64()?;
            let link = r.get_u64()?;
            entries.push(Entry { key, link });
        }
    }
    let rightmost = r.get_u64()?;
    if entries.iter().any(|e| e.key == 0 || e.link == 0) {
        return Err(Error::Corrupt("null pointer in node entry"));
    }
    if leaf && rightmost != 0 {
        return Err(Error::Corrupt("leaf node with a rightmost child"));
    }
    if !leaf && (rightmost == 0 || count == 0) {
        return Err(Error::Corrupt("internal node missing children"));
    }
    Ok(Node {
        ptr,
        parent,
        leaf,
        entries,
        rightmost,
    })
}

/// Load a node when the tree order is known: reads exactly one node's
/// worth of bytes.
pub(crate) fn load(alloc: &FileAllocator, ptr: Ptr, order: u32) -> Result<Node> {
    let mut buf = vec![0u8; disk_size(order)];
    alloc.read(ptr, &mut buf)?;
    decode(ptr, &buf, alloc.endian(), Some(order))
}

/// Load a node from its block alone, for teardown paths that don't have an
/// open tree.
pub(crate) fn load_raw(alloc: &FileAllocator, ptr: Ptr) -> Result<Node> {
    let stored = alloc.stored_size(ptr)? as usize;
    let mut buf = vec![0u8; stored];
    alloc.read(ptr, &mut buf)?;
    decode(ptr, &buf, alloc.endian(), None)
}

pub(crate) fn store(alloc: &FileAllocator, node: &Node, order: u32) -> Result<()> {
    let buf = encode(node, order, alloc.endian());
    alloc.write(node.ptr, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trips_both_orders() {
        let node = Node {
            ptr: 4096,
            parent: 28,
            leaf: false,
            entries: vec![
                Entry { key: 100, link: 200 },
                Entry { key: 300, link: 400 },
            ],
            rightmost: 500,
        };
        for endian in [Endian::Little, Endian::Big] {
            let buf = encode(&node, 8, endian);
            assert_eq!(buf.len(), disk_size(8));
            let back = decode(node.ptr, &buf, endian, Some(8)).unwrap();
            assert_eq!(back.parent, node.parent);
            assert_eq!(back.leaf, node.leaf);
            assert_eq!(back.entries, node.entries);
            assert_eq!(back.rightmost, node.rightmost);
        }
    }

    #[test]
    fn decode_rejects_malformed_nodes() {
        let leaf = Node::new_leaf(4096, 0);
        let mut buf = encode(&leaf, 4, Endian::NATIVE);
        // Flip the leaf flag: an internal node with no children is corrupt.
        buf[2] = 0;
        assert!(matches!(
            decode(4096, &buf, Endian::NATIVE, Some(4)),
            Err(Error::Corrupt(_))
        ));

        let node = Node {
            ptr: 4096,
            parent: 0,
            leaf: true,
            entries: vec![Entry { key: 0, link: 64 }],
            rightmost: 0,
        };
        let buf = encode(&node, 4, Endian::NATIVE);
        assert!(matches!(
            decode(4096, &buf, Endian::NATIVE, Some(4)),
            Err(Error::Corrupt(_))
        ));
    }
}
