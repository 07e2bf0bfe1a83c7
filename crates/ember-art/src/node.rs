//! Persistent radix tree nodes.
//!
//! The four internal fan-outs form a closed set, so nodes are dispatched by
//! a tag byte rather than trait objects. Growth (4 → 16 → 48 → 256) is an
//! explicit re-encode into a freshly allocated block; the caller re-links
//! the new node and frees the old one.

use ember_common::{EmberError, Result};
use ember_pool::{Handle, MemoryPool};

/// Maximum compressed prefix carried by a single node. Longer byte runs are
/// encoded as chains of single-child prefix nodes.
pub(crate) const MAX_PREFIX: usize = 8;

/// Common node header layout (16 bytes):
/// +----------------------+ 0
/// | type: u8             | 1
/// | blank_index: u8      | 2
/// | child_count: u16     | 4
/// | prefix_len: u32      | 8
/// | prefix: [u8; 8]      | 16 (HEADER_SIZE)
/// +----------------------+
const TYPE_OFFSET: u64 = 0;
const BLANK_INDEX_OFFSET: u64 = 1;
const CHILD_COUNT_OFFSET: u64 = 2;
const PREFIX_LEN_OFFSET: u64 = 4;
const PREFIX_OFFSET: u64 = 8;
const HEADER_SIZE: u64 = 16;

/// Marker for "no blank child" in the header's blank_index byte.
const NO_BLANK: u8 = 0xff;

const TAG_ROOT: u8 = 1;
const TAG_NODE4: u8 = 2;
const TAG_NODE16: u8 = 3;
const TAG_NODE48: u8 = 4;
const TAG_NODE256: u8 = 5;
const TAG_LEAF: u8 = 6;

/// Slot reserved for the blank child in a Node256.
const NODE256_BLANK_SLOT: u16 = 256;

/// Node variants, tagged in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Up to 4 children: child handles at 16, radix bytes at 48.
    Node4,
    /// Up to 16 children: radix bytes at 16, child handles at 32.
    Node16,
    /// Up to 48 children: 256-byte radix table (1-based slot indexes) at 16,
    /// child handles at 272.
    Node48,
    /// One child handle per radix at 16, plus a 257th blank slot.
    Node256,
    /// Value-bearing leaf: u64 value at 16.
    Leaf,
}

impl NodeKind {
    fn from_tag(tag: u8) -> Option<NodeKind> {
        match tag {
            TAG_NODE4 => Some(NodeKind::Node4),
            TAG_NODE16 => Some(NodeKind::Node16),
            TAG_NODE48 => Some(NodeKind::Node48),
            TAG_NODE256 => Some(NodeKind::Node256),
            TAG_LEAF => Some(NodeKind::Leaf),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            NodeKind::Node4 => TAG_NODE4,
            NodeKind::Node16 => TAG_NODE16,
            NodeKind::Node48 => TAG_NODE48,
            NodeKind::Node256 => TAG_NODE256,
            NodeKind::Leaf => TAG_LEAF,
        }
    }

    /// Child slots available, counting the blank child.
    pub(crate) fn capacity(self) -> u16 {
        match self {
            NodeKind::Node4 => 4,
            NodeKind::Node16 => 16,
            NodeKind::Node48 => 48,
            NodeKind::Node256 => 257,
            NodeKind::Leaf => 0,
        }
    }

    fn block_size(self) -> u64 {
        match self {
            NodeKind::Node4 => HEADER_SIZE + 4 * 8 + 4,        // 52
            NodeKind::Node16 => HEADER_SIZE + 16 + 16 * 8,     // 160
            NodeKind::Node48 => HEADER_SIZE + 256 + 48 * 8,    // 656
            NodeKind::Node256 => HEADER_SIZE + 257 * 8,        // 2072
            NodeKind::Leaf => HEADER_SIZE + 8,                 // 24
        }
    }

    fn children_offset(self) -> u64 {
        match self {
            NodeKind::Node4 => HEADER_SIZE,
            NodeKind::Node16 => HEADER_SIZE + 16,
            NodeKind::Node48 => HEADER_SIZE + 256,
            NodeKind::Node256 => HEADER_SIZE,
            NodeKind::Leaf => unreachable!("leaves have no children"),
        }
    }

    fn radix_offset(self) -> u64 {
        match self {
            NodeKind::Node4 => HEADER_SIZE + 4 * 8,
            NodeKind::Node16 => HEADER_SIZE,
            NodeKind::Node48 => HEADER_SIZE,
            NodeKind::Node256 | NodeKind::Leaf => unreachable!("no radix array"),
        }
    }

    fn grown(self) -> NodeKind {
        match self {
            NodeKind::Node4 => NodeKind::Node16,
            NodeKind::Node16 => NodeKind::Node48,
            NodeKind::Node48 => NodeKind::Node256,
            NodeKind::Node256 | NodeKind::Leaf => unreachable!("cannot grow"),
        }
    }
}

/// A child slot of an internal node, ordered for iteration: the blank child
/// (radix `None`) sorts before every keyed child.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildEntry {
    pub(crate) radix: Option<u8>,
    pub(crate) handle: u64,
}

/// A decoded node reference: a handle plus its tag.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub(crate) handle: Handle,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn load(pool: &MemoryPool, handle: Handle) -> Result<Node> {
        let tag = pool.read_u8(handle, TYPE_OFFSET)?;
        match NodeKind::from_tag(tag) {
            Some(kind) => Ok(Node { handle, kind }),
            None => Err(EmberError::CorruptData {
                handle: handle.raw(),
                reason: format!("unknown node tag {tag}"),
            }),
        }
    }

    pub(crate) fn load_raw(pool: &MemoryPool, raw: u64) -> Result<Option<Node>> {
        if raw == 0 {
            Ok(None)
        } else {
            Node::load(pool, Handle::from_raw(raw)).map(Some)
        }
    }

    pub(crate) fn is_leaf(self) -> bool {
        self.kind == NodeKind::Leaf
    }

    // ---- header ----

    pub(crate) fn prefix(self, pool: &MemoryPool) -> Result<Vec<u8>> {
        let len = pool.read_u32(self.handle, PREFIX_LEN_OFFSET)? as usize;
        if len > MAX_PREFIX {
            return Err(EmberError::CorruptData {
                handle: self.handle.raw(),
                reason: format!("prefix length {len} exceeds maximum"),
            });
        }
        let mut prefix = vec![0u8; len];
        if len > 0 {
            pool.read_bytes(self.handle, PREFIX_OFFSET, &mut prefix)?;
        }
        Ok(prefix)
    }

    pub(crate) fn set_prefix(self, pool: &MemoryPool, prefix: &[u8]) -> Result<()> {
        debug_assert!(prefix.len() <= MAX_PREFIX);
        pool.write_u32(self.handle, PREFIX_LEN_OFFSET, prefix.len() as u32)?;
        if !prefix.is_empty() {
            pool.write_bytes(self.handle, PREFIX_OFFSET, prefix)?;
        }
        Ok(())
    }

    /// Drops the first `drop` bytes of the stored prefix (used when a split
    /// consumes the shared head plus one radix byte).
    pub(crate) fn trim_prefix(self, pool: &MemoryPool, drop: usize) -> Result<()> {
        let prefix = self.prefix(pool)?;
        let rest = if drop >= prefix.len() { &[][..] } else { &prefix[drop..] };
        self.set_prefix(pool, rest)
    }

    pub(crate) fn child_count(self, pool: &MemoryPool) -> Result<u16> {
        pool.read_u16(self.handle, CHILD_COUNT_OFFSET)
    }

    fn set_child_count(self, pool: &MemoryPool, count: u16) -> Result<()> {
        pool.write_u16(self.handle, CHILD_COUNT_OFFSET, count)
    }

    fn blank_index(self, pool: &MemoryPool) -> Result<Option<u8>> {
        let raw = pool.read_u8(self.handle, BLANK_INDEX_OFFSET)?;
        Ok(if raw == NO_BLANK { None } else { Some(raw) })
    }

    fn set_blank_index(self, pool: &MemoryPool, index: Option<u8>) -> Result<()> {
        pool.write_u8(self.handle, BLANK_INDEX_OFFSET, index.unwrap_or(NO_BLANK))
    }

    // ---- leaf value ----

    pub(crate) fn value(self, pool: &MemoryPool) -> Result<u64> {
        debug_assert!(self.is_leaf());
        pool.read_u64(self.handle, HEADER_SIZE)
    }

    pub(crate) fn set_value(self, pool: &MemoryPool, value: u64) -> Result<()> {
        debug_assert!(self.is_leaf());
        pool.write_u64(self.handle, HEADER_SIZE, value)
    }

    // ---- child slots ----

    fn radix_at(self, pool: &MemoryPool, index: u16) -> Result<u8> {
        pool.read_u8(self.handle, self.kind.radix_offset() + index as u64)
    }

    fn set_radix_at(self, pool: &MemoryPool, index: u16, radix: u8) -> Result<()> {
        pool.write_u8(self.handle, self.kind.radix_offset() + index as u64, radix)
    }

    pub(crate) fn child_handle_at(self, pool: &MemoryPool, index: u16) -> Result<u64> {
        pool.read_u64(self.handle, self.kind.children_offset() + index as u64 * 8)
    }

    pub(crate) fn put_child_at(self, pool: &MemoryPool, index: u16, child: Handle) -> Result<()> {
        pool.write_u64(
            self.handle,
            self.kind.children_offset() + index as u64 * 8,
            child.raw(),
        )
    }

    /// Finds the slot of a keyed child, ignoring the blank child.
    pub(crate) fn find_child_index(self, pool: &MemoryPool, radix: u8) -> Result<Option<u16>> {
        match self.kind {
            NodeKind::Node4 | NodeKind::Node16 => {
                let count = self.child_count(pool)?;
                let blank = self.blank_index(pool)?;
                for i in 0..count {
                    if blank == Some(i as u8) {
                        continue;
                    }
                    if self.radix_at(pool, i)? == radix {
                        return Ok(Some(i));
                    }
                }
                Ok(None)
            }
            NodeKind::Node48 => {
                let slot = self.radix_at(pool, radix as u16)?;
                Ok(if slot == 0 { None } else { Some(slot as u16 - 1) })
            }
            NodeKind::Node256 => {
                let raw = self.child_handle_at(pool, radix as u16)?;
                Ok(if raw == 0 { None } else { Some(radix as u16) })
            }
            NodeKind::Leaf => Ok(None),
        }
    }

    pub(crate) fn find_child(self, pool: &MemoryPool, radix: u8) -> Result<Option<(u16, Node)>> {
        match self.find_child_index(pool, radix)? {
            None => Ok(None),
            Some(index) => {
                let raw = self.child_handle_at(pool, index)?;
                match Node::load_raw(pool, raw)? {
                    Some(node) => Ok(Some((index, node))),
                    None => Err(EmberError::CorruptData {
                        handle: self.handle.raw(),
                        reason: format!("empty child slot for radix {radix}"),
                    }),
                }
            }
        }
    }

    /// Adds a keyed child; returns false when the node is out of capacity
    /// and must grow.
    pub(crate) fn add_child(self, pool: &MemoryPool, radix: u8, child: Handle) -> Result<bool> {
        if let Some(index) = self.find_child_index(pool, radix)? {
            self.put_child_at(pool, index, child)?;
            return Ok(true);
        }
        let count = self.child_count(pool)?;
        match self.kind {
            NodeKind::Node4 | NodeKind::Node16 => {
                if count >= self.kind.capacity() {
                    return Ok(false);
                }
                self.set_radix_at(pool, count, radix)?;
                self.put_child_at(pool, count, child)?;
                self.set_child_count(pool, count + 1)?;
                Ok(true)
            }
            NodeKind::Node48 => {
                if count >= self.kind.capacity() {
                    return Ok(false);
                }
                self.set_radix_at(pool, radix as u16, count as u8 + 1)?;
                self.put_child_at(pool, count, child)?;
                self.set_child_count(pool, count + 1)?;
                Ok(true)
            }
            NodeKind::Node256 => {
                self.put_child_at(pool, radix as u16, child)?;
                self.set_child_count(pool, count + 1)?;
                Ok(true)
            }
            NodeKind::Leaf => unreachable!("leaves have no children"),
        }
    }

    pub(crate) fn has_blank_child(self, pool: &MemoryPool) -> Result<bool> {
        match self.kind {
            NodeKind::Node256 => Ok(self.child_handle_at(pool, NODE256_BLANK_SLOT)? != 0),
            _ => Ok(self.blank_index(pool)?.is_some()),
        }
    }

    pub(crate) fn find_blank_child(self, pool: &MemoryPool) -> Result<Option<Node>> {
        let raw = match self.kind {
            NodeKind::Node256 => self.child_handle_at(pool, NODE256_BLANK_SLOT)?,
            _ => match self.blank_index(pool)? {
                None => return Ok(None),
                Some(index) => self.child_handle_at(pool, index as u16)?,
            },
        };
        Node::load_raw(pool, raw)
    }

    /// Adds the blank child; returns false when the node must grow first.
    pub(crate) fn add_blank_child(self, pool: &MemoryPool, leaf: Handle) -> Result<bool> {
        debug_assert!(!self.has_blank_child(pool)?);
        let count = self.child_count(pool)?;
        match self.kind {
            NodeKind::Node256 => {
                self.put_child_at(pool, NODE256_BLANK_SLOT, leaf)?;
                self.set_child_count(pool, count + 1)?;
                Ok(true)
            }
            _ => {
                if count >= self.kind.capacity() {
                    return Ok(false);
                }
                self.set_blank_index(pool, Some(count as u8))?;
                self.put_child_at(pool, count, leaf)?;
                self.set_child_count(pool, count + 1)?;
                Ok(true)
            }
        }
    }

    /// Removes a child slot; `None` removes the blank child. Returns false
    /// if no such child exists. Compacted arrays move their last slot into
    /// the hole.
    pub(crate) fn delete_child(self, pool: &MemoryPool, radix: Option<u8>) -> Result<bool> {
        match self.kind {
            NodeKind::Node256 => {
                let index = match radix {
                    None => NODE256_BLANK_SLOT,
                    Some(r) => match self.find_child_index(pool, r)? {
                        None => return Ok(false),
                        Some(i) => i,
                    },
                };
                if self.child_handle_at(pool, index)? == 0 {
                    return Ok(false);
                }
                self.put_child_at(pool, index, Handle::NULL)?;
                let count = self.child_count(pool)?;
                self.set_child_count(pool, count - 1)?;
                Ok(true)
            }
            NodeKind::Node4 | NodeKind::Node16 => {
                let index = match radix {
                    None => match self.blank_index(pool)? {
                        None => return Ok(false),
                        Some(i) => {
                            self.set_blank_index(pool, None)?;
                            i as u16
                        }
                    },
                    Some(r) => match self.find_child_index(pool, r)? {
                        None => return Ok(false),
                        Some(i) => i,
                    },
                };
                let count = self.child_count(pool)? - 1;
                self.set_child_count(pool, count)?;
                if index != count {
                    let moved = self.child_handle_at(pool, count)?;
                    self.put_child_at(pool, index, Handle::from_raw(moved))?;
                    let moved_radix = self.radix_at(pool, count)?;
                    self.set_radix_at(pool, index, moved_radix)?;
                    if self.blank_index(pool)? == Some(count as u8) {
                        self.set_blank_index(pool, Some(index as u8))?;
                    }
                }
                self.put_child_at(pool, count, Handle::NULL)?;
                self.set_radix_at(pool, count, 0)?;
                Ok(true)
            }
            NodeKind::Node48 => {
                let index = match radix {
                    None => match self.blank_index(pool)? {
                        None => return Ok(false),
                        Some(i) => {
                            self.set_blank_index(pool, None)?;
                            i as u16
                        }
                    },
                    Some(r) => {
                        let slot = self.radix_at(pool, r as u16)?;
                        if slot == 0 {
                            return Ok(false);
                        }
                        self.set_radix_at(pool, r as u16, 0)?;
                        slot as u16 - 1
                    }
                };
                let count = self.child_count(pool)? - 1;
                self.set_child_count(pool, count)?;
                if index != count {
                    let moved = self.child_handle_at(pool, count)?;
                    self.put_child_at(pool, index, Handle::from_raw(moved))?;
                    if self.blank_index(pool)? == Some(count as u8) {
                        self.set_blank_index(pool, Some(index as u8))?;
                    } else {
                        // fix the radix table entry pointing at the moved slot
                        for r in 0u16..256 {
                            if self.radix_at(pool, r)? == count as u8 + 1 {
                                self.set_radix_at(pool, r, index as u8 + 1)?;
                                break;
                            }
                        }
                    }
                }
                self.put_child_at(pool, count, Handle::NULL)?;
                Ok(true)
            }
            NodeKind::Leaf => Ok(false),
        }
    }

    /// Re-encodes this node at the next fan-out, adding the child that did
    /// not fit (`radix` of `None` adds it as the blank child). The caller
    /// re-links the returned node and frees this one.
    pub(crate) fn grow(self, pool: &MemoryPool, extra: Handle, radix: Option<u8>) -> Result<Node> {
        let target = self.kind.grown();
        let new = alloc_internal(pool, target)?;
        new.set_prefix(pool, &self.prefix(pool)?)?;
        let count = self.child_count(pool)?;
        new.set_child_count(pool, count)?;
        let blank = self.blank_index(pool)?;
        match self.kind {
            NodeKind::Node4 => {
                for i in 0..count {
                    new.set_radix_at(pool, i, self.radix_at(pool, i)?)?;
                    new.put_child_at(pool, i, Handle::from_raw(self.child_handle_at(pool, i)?))?;
                }
                new.set_blank_index(pool, blank)?;
            }
            NodeKind::Node16 => {
                for i in 0..count {
                    new.put_child_at(pool, i, Handle::from_raw(self.child_handle_at(pool, i)?))?;
                    if blank == Some(i as u8) {
                        continue;
                    }
                    let r = self.radix_at(pool, i)?;
                    new.set_radix_at(pool, r as u16, i as u8 + 1)?;
                }
                new.set_blank_index(pool, blank)?;
            }
            NodeKind::Node48 => {
                for r in 0u16..256 {
                    let slot = self.radix_at(pool, r)?;
                    if slot != 0 {
                        let child = self.child_handle_at(pool, slot as u16 - 1)?;
                        new.put_child_at(pool, r, Handle::from_raw(child))?;
                    }
                }
                if let Some(b) = blank {
                    let child = self.child_handle_at(pool, b as u16)?;
                    new.put_child_at(pool, NODE256_BLANK_SLOT, Handle::from_raw(child))?;
                }
            }
            NodeKind::Node256 | NodeKind::Leaf => unreachable!("cannot grow"),
        }
        let added = match radix {
            Some(r) => new.add_child(pool, r, extra)?,
            None => new.add_blank_child(pool, extra)?,
        };
        debug_assert!(added);
        Ok(new)
    }

    /// Every child slot in iteration order: the blank child first, then
    /// keyed children by ascending radix.
    pub(crate) fn entries(self, pool: &MemoryPool) -> Result<Vec<ChildEntry>> {
        let mut out = Vec::new();
        match self.kind {
            NodeKind::Leaf => {}
            NodeKind::Node4 | NodeKind::Node16 => {
                let count = self.child_count(pool)?;
                let blank = self.blank_index(pool)?;
                if let Some(b) = blank {
                    out.push(ChildEntry {
                        radix: None,
                        handle: self.child_handle_at(pool, b as u16)?,
                    });
                }
                let mut keyed = Vec::with_capacity(count as usize);
                for i in 0..count {
                    if blank == Some(i as u8) {
                        continue;
                    }
                    keyed.push((self.radix_at(pool, i)?, self.child_handle_at(pool, i)?));
                }
                keyed.sort_unstable_by_key(|(r, _)| *r);
                out.extend(keyed.into_iter().map(|(r, h)| ChildEntry {
                    radix: Some(r),
                    handle: h,
                }));
            }
            NodeKind::Node48 => {
                if let Some(b) = self.blank_index(pool)? {
                    out.push(ChildEntry {
                        radix: None,
                        handle: self.child_handle_at(pool, b as u16)?,
                    });
                }
                for r in 0u16..256 {
                    let slot = self.radix_at(pool, r)?;
                    if slot != 0 {
                        out.push(ChildEntry {
                            radix: Some(r as u8),
                            handle: self.child_handle_at(pool, slot as u16 - 1)?,
                        });
                    }
                }
            }
            NodeKind::Node256 => {
                let blank = self.child_handle_at(pool, NODE256_BLANK_SLOT)?;
                if blank != 0 {
                    out.push(ChildEntry {
                        radix: None,
                        handle: blank,
                    });
                }
                for r in 0u16..256 {
                    let raw = self.child_handle_at(pool, r)?;
                    if raw != 0 {
                        out.push(ChildEntry {
                            radix: Some(r as u8),
                            handle: raw,
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    /// Lowest keyed radix, ignoring the blank child.
    pub(crate) fn lowest_radix(self, pool: &MemoryPool) -> Result<Option<u8>> {
        let entries = self.entries(pool)?;
        Ok(entries.iter().find_map(|e| e.radix))
    }

    /// Highest keyed radix, ignoring the blank child.
    pub(crate) fn highest_radix(self, pool: &MemoryPool) -> Result<Option<u8>> {
        let entries = self.entries(pool)?;
        Ok(entries.iter().rev().find_map(|e| e.radix))
    }

    /// Recursively frees this subtree, feeding every stored value to the
    /// cleaner.
    pub(crate) fn destroy<F: FnMut(u64)>(self, pool: &MemoryPool, cleaner: &mut F) -> Result<()> {
        if self.is_leaf() {
            cleaner(self.value(pool)?);
        } else {
            for entry in self.entries(pool)? {
                if let Some(child) = Node::load_raw(pool, entry.handle)? {
                    child.destroy(pool, cleaner)?;
                }
            }
        }
        self.free(pool)
    }

    pub(crate) fn free(self, pool: &MemoryPool) -> Result<()> {
        pool.free(self.handle)
    }
}

// ---- construction ----

fn alloc_internal(pool: &MemoryPool, kind: NodeKind) -> Result<Node> {
    let handle = pool.allocate(kind.block_size())?;
    // blocks can be recycled, so the slot arrays must start clean
    let zeros = vec![0u8; kind.block_size() as usize];
    pool.write_bytes(handle, 0, &zeros)?;
    pool.write_u8(handle, TYPE_OFFSET, kind.tag())?;
    pool.write_u8(handle, BLANK_INDEX_OFFSET, NO_BLANK)?;
    Ok(Node { handle, kind })
}

pub(crate) fn alloc_leaf(pool: &MemoryPool, prefix: &[u8], value: u64) -> Result<Node> {
    debug_assert!(prefix.len() <= MAX_PREFIX);
    let node = alloc_internal(pool, NodeKind::Leaf)?;
    node.set_prefix(pool, prefix)?;
    node.set_value(pool, value)?;
    Ok(node)
}

pub(crate) fn alloc_node4_single(
    pool: &MemoryPool,
    prefix: &[u8],
    radix: u8,
    child: Handle,
) -> Result<Node> {
    let node = alloc_internal(pool, NodeKind::Node4)?;
    node.set_prefix(pool, prefix)?;
    node.add_child(pool, radix, child)?;
    Ok(node)
}

/// Builds the two-child Node4 synthesized by a split. When `blank_first` is
/// set, `c1` becomes the blank child and `r1` is ignored.
pub(crate) fn alloc_node4_pair(
    pool: &MemoryPool,
    prefix: &[u8],
    blank_first: bool,
    c1: Handle,
    r1: u8,
    c2: Handle,
    r2: u8,
) -> Result<Node> {
    let node = alloc_internal(pool, NodeKind::Node4)?;
    node.set_prefix(pool, prefix)?;
    if blank_first {
        node.add_blank_child(pool, c1)?;
    } else {
        node.add_child(pool, r1, c1)?;
    }
    node.add_child(pool, r2, c2)?;
    Ok(node)
}

/// Encodes `bytes` as a leaf, prepending single-child prefix nodes when the
/// run exceeds one node's prefix field.
pub(crate) fn create_leaf_chain(pool: &MemoryPool, bytes: &[u8], value: u64) -> Result<Handle> {
    if bytes.len() <= MAX_PREFIX {
        return Ok(alloc_leaf(pool, bytes, value)?.handle);
    }
    let child = create_leaf_chain(pool, &bytes[MAX_PREFIX + 1..], value)?;
    Ok(alloc_node4_single(pool, &bytes[..MAX_PREFIX], bytes[MAX_PREFIX], child)?.handle)
}

pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

// ---- root record ----

/// Root record layout (24 bytes):
/// +----------------------+ 0
/// | type: u8             | 1
/// | reserved             | 8
/// | count: u64           | 16
/// | child: u64           | 24
/// +----------------------+
const ROOT_SIZE: u64 = 24;
const ROOT_COUNT_OFFSET: u64 = 8;
const ROOT_CHILD_OFFSET: u64 = 16;

/// The persistent anchor of a tree: entry count plus the handle of the top
/// node. Its address is the tree's stable handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RootNode {
    pub(crate) handle: Handle,
}

impl RootNode {
    pub(crate) fn create(pool: &MemoryPool) -> Result<RootNode> {
        let handle = pool.allocate(ROOT_SIZE)?;
        pool.write_bytes(handle, 0, &[0u8; ROOT_SIZE as usize])?;
        pool.write_u8(handle, TYPE_OFFSET, TAG_ROOT)?;
        Ok(RootNode { handle })
    }

    /// Validates `handle` and binds to the root record it addresses.
    pub(crate) fn load(pool: &MemoryPool, handle: Handle) -> Result<RootNode> {
        let size = pool.block_size(handle)?;
        if size < ROOT_SIZE {
            return Err(EmberError::CorruptData {
                handle: handle.raw(),
                reason: "block too small for a tree root".to_string(),
            });
        }
        let tag = pool.read_u8(handle, TYPE_OFFSET)?;
        if tag != TAG_ROOT {
            return Err(EmberError::CorruptData {
                handle: handle.raw(),
                reason: "not a tree root".to_string(),
            });
        }
        Ok(RootNode { handle })
    }

    pub(crate) fn child_handle(&self, pool: &MemoryPool) -> Result<u64> {
        pool.read_u64(self.handle, ROOT_CHILD_OFFSET)
    }

    pub(crate) fn child(&self, pool: &MemoryPool) -> Result<Option<Node>> {
        Node::load_raw(pool, self.child_handle(pool)?)
    }

    pub(crate) fn set_child(&self, pool: &MemoryPool, child: Handle) -> Result<()> {
        pool.write_u64(self.handle, ROOT_CHILD_OFFSET, child.raw())
    }

    pub(crate) fn count(&self, pool: &MemoryPool) -> Result<u64> {
        pool.read_u64(self.handle, ROOT_COUNT_OFFSET)
    }

    pub(crate) fn set_count(&self, pool: &MemoryPool, count: u64) -> Result<()> {
        pool.write_u64(self.handle, ROOT_COUNT_OFFSET, count)
    }

    pub(crate) fn increment(&self, pool: &MemoryPool) -> Result<()> {
        let count = self.count(pool)?;
        self.set_count(pool, count + 1)
    }

    pub(crate) fn decrement(&self, pool: &MemoryPool) -> Result<()> {
        let count = self.count(pool)?;
        self.set_count(pool, count - 1)
    }

    /// Frees every node of the tree, feeding values to the cleaner. The
    /// root record itself stays allocated.
    pub(crate) fn destroy<F: FnMut(u64)>(&self, pool: &MemoryPool, cleaner: &mut F) -> Result<()> {
        if let Some(child) = self.child(pool)? {
            child.destroy(pool, cleaner)?;
        }
        self.set_child(pool, Handle::NULL)?;
        self.set_count(pool, 0)
    }

    pub(crate) fn free(&self, pool: &MemoryPool) -> Result<()> {
        pool.free(self.handle)
    }
}
