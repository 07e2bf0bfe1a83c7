//! Single-threaded adaptive radix tree engine.

use crate::iter::{EntryIter, ReverseEntryIter};
use crate::node::{
    alloc_leaf, alloc_node4_pair, common_prefix_len, create_leaf_chain, Node, RootNode, MAX_PREFIX,
};
use crate::transaction::Transaction;
use ember_common::{EmberError, Result};
use ember_pool::{Handle, MemoryPool};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Where a node hangs: directly off the root record, or in a child slot of
/// an internal node.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParentLink {
    Root,
    Slot {
        node: Node,
        index: u16,
        radix: Option<u8>,
    },
}

pub(crate) fn relink(
    pool: &MemoryPool,
    root: &RootNode,
    link: &ParentLink,
    new: Handle,
) -> Result<()> {
    match link {
        ParentLink::Root => root.set_child(pool, new),
        ParentLink::Slot { node, index, .. } => node.put_child_at(pool, *index, new),
    }
}

pub(crate) fn unlink(pool: &MemoryPool, root: &RootNode, link: &ParentLink) -> Result<()> {
    match link {
        ParentLink::Root => root.set_child(pool, Handle::NULL),
        ParentLink::Slot { node, radix, .. } => {
            node.delete_child(pool, *radix)?;
            Ok(())
        }
    }
}

pub(crate) fn apply_merge<F>(merge: &F, old: u64, new: u64) -> Result<u64>
where
    F: Fn(u64, u64) -> Option<u64>,
{
    merge(old, new).ok_or(EmberError::MergeFailed)
}

/// Splits `node` where the new key diverges from its prefix at `matched`
/// bytes, synthesizing a Node4 that carries the shared head. `stored` is the
/// value of the key being inserted.
pub(crate) fn split_node(
    pool: &MemoryPool,
    root: &RootNode,
    link: &ParentLink,
    node: Node,
    prefix: &[u8],
    matched: usize,
    key: &[u8],
    depth: usize,
    stored: u64,
) -> Result<()> {
    trace!(handle = %node.handle, matched, "splitting node");
    let new_parent = if depth + matched == key.len() {
        // the new key ends inside the old prefix: its value becomes the
        // blank child of the split point
        let old_radix = prefix[matched];
        node.trim_prefix(pool, matched + 1)?;
        let blank = alloc_leaf(pool, &[], stored)?;
        alloc_node4_pair(
            pool,
            &prefix[..matched],
            true,
            blank.handle,
            0,
            node.handle,
            old_radix,
        )?
    } else if matched == prefix.len() {
        // the old leaf's key is a strict prefix of the new key: the old
        // value becomes the blank child
        node.trim_prefix(pool, matched + 1)?;
        let child = create_leaf_chain(pool, &key[depth + matched + 1..], stored)?;
        alloc_node4_pair(
            pool,
            &prefix[..matched],
            true,
            node.handle,
            0,
            child,
            key[depth + matched],
        )?
    } else {
        let old_radix = prefix[matched];
        node.trim_prefix(pool, matched + 1)?;
        let child = create_leaf_chain(pool, &key[depth + matched + 1..], stored)?;
        alloc_node4_pair(
            pool,
            &prefix[..matched],
            false,
            child,
            key[depth + matched],
            node.handle,
            old_radix,
        )?
    };
    relink(pool, root, link, new_parent.handle)
}

/// Stores `stored` as the blank child of `n`, growing the node if full.
pub(crate) fn add_blank_value(
    pool: &MemoryPool,
    root: &RootNode,
    link: &ParentLink,
    n: Node,
    stored: u64,
) -> Result<()> {
    let leaf = alloc_leaf(pool, &[], stored)?;
    if !n.add_blank_child(pool, leaf.handle)? {
        let grown = n.grow(pool, leaf.handle, None)?;
        relink(pool, root, link, grown.handle)?;
        n.free(pool)?;
    }
    Ok(())
}

/// Hangs a new leaf (chain) for `suffix` under `n` at `radix`, growing the
/// node if full.
pub(crate) fn add_keyed_leaf(
    pool: &MemoryPool,
    root: &RootNode,
    link: &ParentLink,
    n: Node,
    radix: u8,
    suffix: &[u8],
    stored: u64,
) -> Result<()> {
    let child = create_leaf_chain(pool, suffix, stored)?;
    if !n.add_child(pool, radix, child)? {
        let grown = n.grow(pool, child, Some(radix))?;
        relink(pool, root, link, grown.handle)?;
        n.free(pool)?;
    }
    Ok(())
}

pub(crate) struct PutOutcome {
    pub(crate) prev: u64,
    pub(crate) inserted: bool,
}

pub(crate) fn insert_rec<F>(
    pool: &MemoryPool,
    root: &RootNode,
    link: ParentLink,
    node: Option<Node>,
    key: &[u8],
    depth: usize,
    value: u64,
    merge: &F,
) -> Result<PutOutcome>
where
    F: Fn(u64, u64) -> Option<u64>,
{
    let Some(n) = node else {
        let stored = apply_merge(merge, 0, value)?;
        let leaf = create_leaf_chain(pool, &key[depth..], stored)?;
        relink(pool, root, &link, leaf)?;
        return Ok(PutOutcome {
            prev: 0,
            inserted: true,
        });
    };
    let prefix = n.prefix(pool)?;
    let matched = common_prefix_len(&key[depth..], &prefix);

    if n.is_leaf() {
        if matched == prefix.len() && depth + matched == key.len() {
            let old = n.value(pool)?;
            let new = apply_merge(merge, old, value)?;
            if new != old {
                n.set_value(pool, new)?;
            }
            return Ok(PutOutcome {
                prev: old,
                inserted: false,
            });
        }
        let stored = apply_merge(merge, 0, value)?;
        split_node(pool, root, &link, n, &prefix, matched, key, depth, stored)?;
        return Ok(PutOutcome {
            prev: 0,
            inserted: true,
        });
    }

    if matched != prefix.len() {
        let stored = apply_merge(merge, 0, value)?;
        split_node(pool, root, &link, n, &prefix, matched, key, depth, stored)?;
        return Ok(PutOutcome {
            prev: 0,
            inserted: true,
        });
    }

    let depth = depth + prefix.len();
    if depth == key.len() {
        // the key terminates at this internal node
        if let Some(blank) = n.find_blank_child(pool)? {
            let old = blank.value(pool)?;
            let new = apply_merge(merge, old, value)?;
            if new != old {
                blank.set_value(pool, new)?;
            }
            return Ok(PutOutcome {
                prev: old,
                inserted: false,
            });
        }
        let stored = apply_merge(merge, 0, value)?;
        add_blank_value(pool, root, &link, n, stored)?;
        return Ok(PutOutcome {
            prev: 0,
            inserted: true,
        });
    }

    let radix = key[depth];
    if let Some((index, next)) = n.find_child(pool, radix)? {
        return insert_rec(
            pool,
            root,
            ParentLink::Slot {
                node: n,
                index,
                radix: Some(radix),
            },
            Some(next),
            key,
            depth + 1,
            value,
            merge,
        );
    }
    let stored = apply_merge(merge, 0, value)?;
    add_keyed_leaf(pool, root, &link, n, radix, &key[depth + 1..], stored)?;
    Ok(PutOutcome {
        prev: 0,
        inserted: true,
    })
}

pub(crate) fn search_value(pool: &MemoryPool, root: &RootNode, key: &[u8]) -> Result<u64> {
    let mut node = match root.child(pool)? {
        None => return Ok(0),
        Some(n) => n,
    };
    let mut depth = 0usize;
    loop {
        let prefix = node.prefix(pool)?;
        let matched = common_prefix_len(&key[depth..], &prefix);
        if matched != prefix.len() {
            return Ok(0);
        }
        if node.is_leaf() {
            return if depth + matched == key.len() {
                node.value(pool)
            } else {
                Ok(0)
            };
        }
        depth += prefix.len();
        if depth == key.len() {
            return match node.find_blank_child(pool)? {
                Some(blank) => blank.value(pool),
                None => Ok(0),
            };
        }
        match node.find_child(pool, key[depth])? {
            None => return Ok(0),
            Some((_, next)) => {
                node = next;
                depth += 1;
            }
        }
    }
}

pub(crate) enum Normalized {
    Unchanged,
    Replaced,
    Removed,
}

/// Collapses `node` after a removal beneath it: an empty internal node is
/// deleted, and a single-child node with no value of its own is spliced out
/// when the concatenated prefix still fits one node (longer runs are the
/// chain encoding of an oversized prefix and stay as they are).
pub(crate) fn normalize(
    pool: &MemoryPool,
    root: &RootNode,
    link: &ParentLink,
    node: Node,
) -> Result<Normalized> {
    if node.is_leaf() {
        return Ok(Normalized::Unchanged);
    }
    let count = node.child_count(pool)?;
    if count == 0 {
        node.free(pool)?;
        unlink(pool, root, link)?;
        trace!(handle = %node.handle, "removed empty node");
        return Ok(Normalized::Removed);
    }
    if count != 1 {
        return Ok(Normalized::Unchanged);
    }
    let entries = node.entries(pool)?;
    let entry = entries.first().copied().ok_or(EmberError::CorruptData {
        handle: node.handle.raw(),
        reason: "child count disagrees with slots".to_string(),
    })?;
    let child = Node::load_raw(pool, entry.handle)?.ok_or(EmberError::CorruptData {
        handle: node.handle.raw(),
        reason: "empty child slot in single-child node".to_string(),
    })?;
    let mut combined = node.prefix(pool)?;
    if let Some(radix) = entry.radix {
        combined.push(radix);
    }
    combined.extend(child.prefix(pool)?);
    if combined.len() > MAX_PREFIX {
        return Ok(Normalized::Unchanged);
    }
    child.set_prefix(pool, &combined)?;
    relink(pool, root, link, child.handle)?;
    node.free(pool)?;
    trace!(handle = %node.handle, into = %child.handle, "compacted single-child node");
    Ok(Normalized::Replaced)
}

pub(crate) fn remove_rec(
    pool: &MemoryPool,
    root: &RootNode,
    link: &ParentLink,
    node: Node,
    key: &[u8],
    depth: usize,
) -> Result<Option<u64>> {
    let prefix = node.prefix(pool)?;
    let matched = common_prefix_len(&key[depth..], &prefix);
    if matched != prefix.len() {
        return Ok(None);
    }
    if node.is_leaf() {
        if depth + matched != key.len() {
            return Ok(None);
        }
        let value = node.value(pool)?;
        node.free(pool)?;
        unlink(pool, root, link)?;
        return Ok(Some(value));
    }
    let depth = depth + prefix.len();
    let removed = if depth == key.len() {
        match node.find_blank_child(pool)? {
            None => return Ok(None),
            Some(blank) => {
                let value = blank.value(pool)?;
                blank.free(pool)?;
                node.delete_child(pool, None)?;
                Some(value)
            }
        }
    } else {
        let radix = key[depth];
        match node.find_child(pool, radix)? {
            None => return Ok(None),
            Some((index, child)) => {
                let sub = ParentLink::Slot {
                    node,
                    index,
                    radix: Some(radix),
                };
                match remove_rec(pool, root, &sub, child, key, depth + 1)? {
                    None => return Ok(None),
                    some => some,
                }
            }
        }
    };
    normalize(pool, root, link, node)?;
    Ok(removed)
}

pub(crate) fn first_key_impl(pool: &MemoryPool, root: &RootNode) -> Result<Vec<u8>> {
    let mut node = root.child(pool)?.ok_or(EmberError::NoSuchElement)?;
    let mut key = Vec::new();
    loop {
        key.extend(node.prefix(pool)?);
        if node.is_leaf() || node.has_blank_child(pool)? {
            return Ok(key);
        }
        let radix = node.lowest_radix(pool)?.ok_or(EmberError::CorruptData {
            handle: node.handle.raw(),
            reason: "internal node has no children".to_string(),
        })?;
        key.push(radix);
        let (_, next) = node.find_child(pool, radix)?.ok_or(EmberError::CorruptData {
            handle: node.handle.raw(),
            reason: "missing child for known radix".to_string(),
        })?;
        node = next;
    }
}

pub(crate) fn last_key_impl(pool: &MemoryPool, root: &RootNode) -> Result<Vec<u8>> {
    let mut node = root.child(pool)?.ok_or(EmberError::NoSuchElement)?;
    let mut key = Vec::new();
    loop {
        key.extend(node.prefix(pool)?);
        if node.is_leaf() {
            return Ok(key);
        }
        let radix = match node.highest_radix(pool)? {
            // only the blank child remains: the key ends here
            None => return Ok(key),
            Some(radix) => radix,
        };
        key.push(radix);
        let (_, next) = node.find_child(pool, radix)?.ok_or(EmberError::CorruptData {
            handle: node.handle.raw(),
            reason: "missing child for known radix".to_string(),
        })?;
        node = next;
    }
}

pub(crate) fn clear_impl<F: FnMut(u64)>(
    pool: &Arc<MemoryPool>,
    root: &RootNode,
    cleanup: &mut F,
) -> Result<()> {
    Transaction::run_once(pool, || root.destroy(pool, cleanup))
}

pub(crate) fn free_impl(pool: &Arc<MemoryPool>, root: &RootNode) -> Result<()> {
    Transaction::run_once(pool, || {
        root.destroy(pool, &mut |_| {})?;
        root.free(pool)
    })
}

/// An ordered index from non-empty byte keys to `u64` values, stored in a
/// persistent memory pool.
///
/// A value of 0 is reserved as "absent": [`RadixTree::get`] returns 0 for a
/// missing key, so a stored 0 is indistinguishable from absence.
///
/// The single-threaded variant performs no internal locking; mutators take
/// `&mut self`, so sharing across threads requires external coordination.
/// See [`crate::ConcurrentRadixTree`] for concurrent mutation.
pub struct RadixTree {
    pool: Arc<MemoryPool>,
    pub(crate) root: RootNode,
    freed: bool,
}

impl RadixTree {
    /// Creates a new, empty tree in the pool.
    pub fn new(pool: &Arc<MemoryPool>) -> Result<RadixTree> {
        let root = Transaction::run_once(pool, || RootNode::create(pool))?;
        debug!(handle = %root.handle, "created tree");
        Ok(RadixTree {
            pool: Arc::clone(pool),
            root,
            freed: false,
        })
    }

    /// Reconstructs a tree from the handle of a previously created one.
    ///
    /// Handle 0 and out-of-range handles fail as invalid arguments; an
    /// in-range handle that does not address a tree root fails as corrupt
    /// data.
    pub fn from_handle(pool: &Arc<MemoryPool>, handle: Handle) -> Result<RadixTree> {
        let root = RootNode::load(pool, handle)?;
        Ok(RadixTree {
            pool: Arc::clone(pool),
            root,
            freed: false,
        })
    }

    /// Returns the stable handle re-binding this tree after reopen.
    pub fn handle(&self) -> Handle {
        self.root.handle
    }

    /// Returns the pool this tree lives in.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.freed {
            Err(EmberError::TreeFreed)
        } else {
            Ok(())
        }
    }

    /// Returns the exact number of live entries.
    pub fn size(&self) -> Result<u64> {
        self.ensure_live()?;
        self.root.count(&self.pool)
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Maps `key` to `value`, replacing any existing mapping. Returns the
    /// previous value, or 0 for a fresh insert.
    pub fn put(&mut self, key: &[u8], value: u64) -> Result<u64> {
        self.put_with(key, value, |_old, new| Some(new))
    }

    /// Maps `key` to `merge(old, value)` (`old` is 0 when the key is new).
    /// A merge returning `None` fails the call without altering the tree.
    /// Returns the previous value, or 0 for a fresh insert.
    pub fn put_with<F>(&mut self, key: &[u8], value: u64, merge: F) -> Result<u64>
    where
        F: Fn(u64, u64) -> Option<u64>,
    {
        self.ensure_live()?;
        if key.is_empty() {
            return Err(EmberError::InvalidKey);
        }
        let pool = Arc::clone(&self.pool);
        let root = self.root;
        Transaction::run_once(&pool, || {
            let child = root.child(&pool)?;
            let outcome = insert_rec(&pool, &root, ParentLink::Root, child, key, 0, value, &merge)?;
            if outcome.inserted {
                root.increment(&pool)?;
            }
            Ok(outcome.prev)
        })
    }

    /// Returns the value mapped to `key`, or 0 when the key is absent or
    /// empty. Never mutates.
    pub fn get(&self, key: &[u8]) -> Result<u64> {
        self.ensure_live()?;
        if key.is_empty() {
            return Ok(0);
        }
        search_value(&self.pool, &self.root, key)
    }

    /// Removes the mapping for `key` if present, compacting the affected
    /// path. `cleanup` is invoked exactly once with the removed value (0
    /// when the key was absent); the same value is returned.
    pub fn remove<F: FnMut(u64)>(&mut self, key: &[u8], mut cleanup: F) -> Result<u64> {
        self.ensure_live()?;
        if key.is_empty() {
            return Err(EmberError::InvalidKey);
        }
        let pool = Arc::clone(&self.pool);
        let root = self.root;
        let removed = Transaction::run_once(&pool, || {
            let removed = match root.child(&pool)? {
                None => None,
                Some(child) => remove_rec(&pool, &root, &ParentLink::Root, child, key, 0)?,
            };
            if removed.is_some() {
                root.decrement(&pool)?;
            }
            Ok(removed)
        })?;
        let value = removed.unwrap_or(0);
        cleanup(value);
        Ok(value)
    }

    /// Removes every entry, invoking `cleanup` once per stored value. The
    /// root handle stays valid and the tree stays usable.
    pub fn clear<F: FnMut(u64)>(&mut self, mut cleanup: F) -> Result<()> {
        self.ensure_live()?;
        clear_impl(&self.pool, &self.root, &mut cleanup)
    }

    /// Releases every node including the root record. All further
    /// operations, including a second `free`, fail with a state error.
    pub fn free(&mut self) -> Result<()> {
        self.ensure_live()?;
        free_impl(&self.pool, &self.root)?;
        self.freed = true;
        debug!(handle = %self.root.handle, "freed tree");
        Ok(())
    }

    /// Returns the lowest key, failing with a not-found error when empty.
    pub fn first_key(&self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        first_key_impl(&self.pool, &self.root)
    }

    /// Returns the highest key, failing with a not-found error when empty.
    pub fn last_key(&self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        last_key_impl(&self.pool, &self.root)
    }

    /// Ascending iterator over all entries.
    pub fn iter(&self) -> Result<EntryIter<'_>> {
        self.ensure_live()?;
        EntryIter::new(self, None, None)
    }

    /// Descending iterator over all entries.
    pub fn iter_rev(&self) -> Result<ReverseEntryIter<'_>> {
        self.ensure_live()?;
        ReverseEntryIter::new(self, None, None)
    }

    /// Ascending iterator over keys in `[from, to]`, with per-bound
    /// inclusivity. Rejects empty bounds and `from > to`.
    pub fn range(
        &self,
        from: &[u8],
        from_inclusive: bool,
        to: &[u8],
        to_inclusive: bool,
    ) -> Result<EntryIter<'_>> {
        self.ensure_live()?;
        check_bounds(from, to)?;
        EntryIter::new(
            self,
            Some((from.to_vec(), from_inclusive)),
            Some((to.to_vec(), to_inclusive)),
        )
    }

    /// Descending iterator over keys in `[from, to]`, with per-bound
    /// inclusivity. Rejects empty bounds and `from > to`.
    pub fn range_rev(
        &self,
        from: &[u8],
        from_inclusive: bool,
        to: &[u8],
        to_inclusive: bool,
    ) -> Result<ReverseEntryIter<'_>> {
        self.ensure_live()?;
        check_bounds(from, to)?;
        ReverseEntryIter::new(
            self,
            Some((from.to_vec(), from_inclusive)),
            Some((to.to_vec(), to_inclusive)),
        )
    }

    /// Ascending iterator over keys at or below `to` (strictly below when
    /// not inclusive).
    pub fn head(&self, to: &[u8], inclusive: bool) -> Result<EntryIter<'_>> {
        self.ensure_live()?;
        if to.is_empty() {
            return Err(EmberError::InvalidKey);
        }
        EntryIter::new(self, None, Some((to.to_vec(), inclusive)))
    }

    /// Ascending iterator over keys at or above `from` (strictly above when
    /// not inclusive).
    pub fn tail(&self, from: &[u8], inclusive: bool) -> Result<EntryIter<'_>> {
        self.ensure_live()?;
        if from.is_empty() {
            return Err(EmberError::InvalidKey);
        }
        EntryIter::new(self, Some((from.to_vec(), inclusive)), None)
    }
}

fn check_bounds(from: &[u8], to: &[u8]) -> Result<()> {
    if from.is_empty() || to.is_empty() {
        return Err(EmberError::InvalidKey);
    }
    if from > to {
        return Err(EmberError::InvalidRange);
    }
    Ok(())
}

impl PartialEq for RadixTree {
    fn eq(&self, other: &Self) -> bool {
        self.pool.id() == other.pool.id() && self.root.handle == other.root.handle
    }
}

impl Eq for RadixTree {}

impl Hash for RadixTree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool.id().hash(state);
        self.root.handle.raw().hash(state);
    }
}

impl std::fmt::Debug for RadixTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadixTree")
            .field("handle", &self.root.handle)
            .field("freed", &self.freed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::PoolConfig;
    use tempfile::TempDir;

    fn test_tree(dir: &TempDir) -> (Arc<MemoryPool>, RadixTree) {
        let config = PoolConfig {
            path: dir.path().join("tree.pool"),
            size: 16 * 1024 * 1024,
            sync_writes: false,
        };
        let pool = MemoryPool::create(&config).unwrap();
        let tree = RadixTree::new(&pool).unwrap();
        (pool, tree)
    }

    #[test]
    fn test_put_get_basics() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);

        assert_eq!(tree.put(b"apple", 1).unwrap(), 0);
        assert_eq!(tree.put(b"apricot", 2).unwrap(), 0);
        assert_eq!(tree.put(b"banana", 3).unwrap(), 0);
        assert_eq!(tree.size().unwrap(), 3);

        assert_eq!(tree.get(b"apple").unwrap(), 1);
        assert_eq!(tree.get(b"apricot").unwrap(), 2);
        assert_eq!(tree.get(b"banana").unwrap(), 3);
        assert_eq!(tree.get(b"ap").unwrap(), 0);
        assert_eq!(tree.get(b"applee").unwrap(), 0);
        assert_eq!(tree.get(b"").unwrap(), 0);

        // overwrite returns the previous value and does not grow the tree
        assert_eq!(tree.put(b"apple", 10).unwrap(), 1);
        assert_eq!(tree.get(b"apple").unwrap(), 10);
        assert_eq!(tree.size().unwrap(), 3);
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);
        assert!(matches!(tree.put(b"", 1), Err(EmberError::InvalidKey)));
        assert!(matches!(
            tree.remove(b"", |_| {}),
            Err(EmberError::InvalidKey)
        ));
    }

    #[test]
    fn test_prefix_keys_coexist() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);

        tree.put(b"a", 1).unwrap();
        tree.put(b"ab", 2).unwrap();
        tree.put(b"abc", 3).unwrap();
        assert_eq!(tree.size().unwrap(), 3);
        assert_eq!(tree.get(b"a").unwrap(), 1);
        assert_eq!(tree.get(b"ab").unwrap(), 2);
        assert_eq!(tree.get(b"abc").unwrap(), 3);

        // and in the reverse insertion order
        tree.put(b"xyz", 30).unwrap();
        tree.put(b"xy", 20).unwrap();
        tree.put(b"x", 10).unwrap();
        assert_eq!(tree.get(b"x").unwrap(), 10);
        assert_eq!(tree.get(b"xy").unwrap(), 20);
        assert_eq!(tree.get(b"xyz").unwrap(), 30);
    }

    #[test]
    fn test_long_keys() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);

        let long_a: Vec<u8> = (0..100).map(|i| (i % 7) as u8).collect();
        let mut long_b = long_a.clone();
        long_b[63] ^= 0xff;
        tree.put(&long_a, 1).unwrap();
        tree.put(&long_b, 2).unwrap();
        assert_eq!(tree.get(&long_a).unwrap(), 1);
        assert_eq!(tree.get(&long_b).unwrap(), 2);
        assert_eq!(tree.get(&long_a[..99]).unwrap(), 0);
    }

    #[test]
    fn test_remove_and_compaction() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);

        tree.put(b"car", 1).unwrap();
        tree.put(b"cart", 2).unwrap();
        tree.put(b"cat", 3).unwrap();

        let mut seen = Vec::new();
        assert_eq!(tree.remove(b"cart", |v| seen.push(v)).unwrap(), 2);
        assert_eq!(seen, vec![2]);
        assert_eq!(tree.size().unwrap(), 2);
        assert_eq!(tree.get(b"car").unwrap(), 1);
        assert_eq!(tree.get(b"cart").unwrap(), 0);
        assert_eq!(tree.get(b"cat").unwrap(), 3);

        // removing an absent key still feeds 0 to the cleanup exactly once
        seen.clear();
        assert_eq!(tree.remove(b"dog", |v| seen.push(v)).unwrap(), 0);
        assert_eq!(seen, vec![0]);
        assert_eq!(tree.size().unwrap(), 2);

        assert_eq!(tree.remove(b"car", |_| {}).unwrap(), 1);
        assert_eq!(tree.remove(b"cat", |_| {}).unwrap(), 3);
        assert_eq!(tree.size().unwrap(), 0);
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn test_merge_semantics() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);

        tree.put(b"k", 7).unwrap();
        let prev = tree.put_with(b"k", 5, |old, new| Some(old + new)).unwrap();
        assert_eq!(prev, 7);
        assert_eq!(tree.get(b"k").unwrap(), 12);

        // a merge yielding nothing fails without altering the stored value
        let err = tree.put_with(b"k", 1, |_, _| None).unwrap_err();
        assert!(matches!(err, EmberError::MergeFailed));
        assert_eq!(tree.get(b"k").unwrap(), 12);
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn test_first_and_last_key() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);

        assert!(matches!(tree.first_key(), Err(EmberError::NoSuchElement)));
        assert!(matches!(tree.last_key(), Err(EmberError::NoSuchElement)));

        tree.put(b"mm", 1).unwrap();
        tree.put(b"a", 2).unwrap();
        tree.put(b"zz", 3).unwrap();
        tree.put(b"m", 4).unwrap();
        assert_eq!(tree.first_key().unwrap(), b"a");
        assert_eq!(tree.last_key().unwrap(), b"zz");

        tree.remove(b"a", |_| {}).unwrap();
        tree.remove(b"zz", |_| {}).unwrap();
        assert_eq!(tree.first_key().unwrap(), b"m");
        assert_eq!(tree.last_key().unwrap(), b"mm");
    }

    #[test]
    fn test_clear_preserves_handle() {
        let dir = TempDir::new().unwrap();
        let (pool, mut tree) = test_tree(&dir);
        let handle = tree.handle();

        tree.put(b"a", 1).unwrap();
        tree.put(b"b", 2).unwrap();

        let mut cleaned = Vec::new();
        tree.clear(|v| cleaned.push(v)).unwrap();
        cleaned.sort_unstable();
        assert_eq!(cleaned, vec![1, 2]);
        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.handle(), handle);

        // clearing an already empty tree is fine and calls nothing
        tree.clear(|_| panic!("no values left")).unwrap();
        assert_eq!(tree.size().unwrap(), 0);

        // the tree is still usable and reconstructible
        tree.put(b"c", 3).unwrap();
        let again = RadixTree::from_handle(&pool, handle).unwrap();
        assert_eq!(again.size().unwrap(), 1);
    }

    #[test]
    fn test_free_is_terminal() {
        let dir = TempDir::new().unwrap();
        let (_pool, mut tree) = test_tree(&dir);
        tree.put(b"a", 1).unwrap();

        tree.free().unwrap();
        assert!(matches!(tree.free(), Err(EmberError::TreeFreed)));
        assert!(matches!(tree.size(), Err(EmberError::TreeFreed)));
        assert!(matches!(tree.get(b"a"), Err(EmberError::TreeFreed)));
        assert!(matches!(tree.put(b"a", 1), Err(EmberError::TreeFreed)));
        assert!(matches!(tree.iter(), Err(EmberError::TreeFreed)));
    }

    #[test]
    fn test_from_handle_validation() {
        let dir = TempDir::new().unwrap();
        let (pool, mut tree) = test_tree(&dir);
        tree.put(b"a", 1).unwrap();

        assert!(matches!(
            RadixTree::from_handle(&pool, Handle::NULL),
            Err(EmberError::InvalidHandle { .. })
        ));
        assert!(matches!(
            RadixTree::from_handle(&pool, Handle::from_raw(pool.size() * 2)),
            Err(EmberError::InvalidHandle { .. })
        ));
        // an allocated block that is not a tree root is foreign data
        let block = pool.allocate(64).unwrap();
        pool.write_u64(block, 0, 0x1122_3344).unwrap();
        assert!(matches!(
            RadixTree::from_handle(&pool, block),
            Err(EmberError::CorruptData { .. })
        ));
    }

    #[test]
    fn test_equality_and_hash() {
        use std::collections::hash_map::DefaultHasher;

        let dir = TempDir::new().unwrap();
        let (pool, mut tree) = test_tree(&dir);
        tree.put(b"a", 1).unwrap();

        let other = RadixTree::from_handle(&pool, tree.handle()).unwrap();
        assert_eq!(tree, other);

        let hash = |t: &RadixTree| {
            let mut h = DefaultHasher::new();
            t.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&tree), hash(&other));

        let unrelated = RadixTree::new(&pool).unwrap();
        assert_ne!(tree, unrelated);
    }
}
