//! Concurrent adaptive radix tree with per-path lock coupling.
//!
//! Writers take per-node write locks hand-over-hand from the root toward
//! the mutation site, releasing ancestors as soon as the current node can
//! no longer be split, replaced, or compacted by the pending mutation, so
//! mutations in unrelated subtrees proceed concurrently. Readers descend
//! with paired read locks, so a structural change on the exact path being
//! read is observed either fully applied or not at all. Iterators take no
//! locks and are explicitly not linearized against concurrent writers;
//! rebuild the iterator to observe a newer state.

use crate::iter::{EntryIter, ReverseEntryIter};
use crate::node::{common_prefix_len, create_leaf_chain, Node};
use crate::transaction::Transaction;
use crate::tree::{
    add_blank_value, add_keyed_leaf, apply_merge, clear_impl, first_key_impl, free_impl,
    last_key_impl, normalize, relink, split_node, unlink, Normalized, ParentLink, PutOutcome,
    RadixTree,
};
use ember_common::{EmberError, Result};
use ember_pool::{Handle, MemoryPool};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type WriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;
type ReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Per-node lock registry keyed by handle. Nodes are locked top-down only,
/// which keeps lock coupling deadlock-free.
struct LockTable {
    nodes: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
}

impl LockTable {
    fn new() -> LockTable {
        LockTable {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, handle: u64) -> Arc<RwLock<()>> {
        self.nodes.lock().entry(handle).or_default().clone()
    }

    fn write(&self, handle: u64) -> WriteGuard {
        RwLock::write_arc(&self.slot(handle))
    }

    fn read(&self, handle: u64) -> ReadGuard {
        RwLock::read_arc(&self.slot(handle))
    }
}

/// An ordered byte-key index safe for mutation from multiple threads.
///
/// Shares its persistent layout, transaction behavior, and handle semantics
/// with [`RadixTree`]; a tree written by one variant can be reopened with
/// the other.
pub struct ConcurrentRadixTree {
    tree: RadixTree,
    locks: LockTable,
    /// Tree-wide guard: mutations hold it shared, `clear`/`free` exclusive.
    sweep: RwLock<()>,
    /// Serializes entry-count updates through commit so a rollback can
    /// never clobber a neighbor's increment.
    count_lock: Mutex<()>,
    freed: AtomicBool,
}

impl ConcurrentRadixTree {
    /// Creates a new, empty tree in the pool.
    pub fn new(pool: &Arc<MemoryPool>) -> Result<ConcurrentRadixTree> {
        Ok(ConcurrentRadixTree::wrap(RadixTree::new(pool)?))
    }

    /// Reconstructs a tree from the handle of a previously created one.
    pub fn from_handle(pool: &Arc<MemoryPool>, handle: Handle) -> Result<ConcurrentRadixTree> {
        Ok(ConcurrentRadixTree::wrap(RadixTree::from_handle(
            pool, handle,
        )?))
    }

    fn wrap(tree: RadixTree) -> ConcurrentRadixTree {
        ConcurrentRadixTree {
            tree,
            locks: LockTable::new(),
            sweep: RwLock::new(()),
            count_lock: Mutex::new(()),
            freed: AtomicBool::new(false),
        }
    }

    /// Returns the stable handle re-binding this tree after reopen.
    pub fn handle(&self) -> Handle {
        self.tree.handle()
    }

    /// Returns the pool this tree lives in.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        self.tree.pool()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.freed.load(Ordering::Acquire) {
            Err(EmberError::TreeFreed)
        } else {
            Ok(())
        }
    }

    /// Returns the exact number of live entries.
    pub fn size(&self) -> Result<u64> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        let _count = self.count_lock.lock();
        self.tree.root.count(self.tree.pool())
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Maps `key` to `value`, replacing any existing mapping. Returns the
    /// previous value, or 0 for a fresh insert.
    pub fn put(&self, key: &[u8], value: u64) -> Result<u64> {
        self.put_with(key, value, |_old, new| Some(new))
    }

    /// Maps `key` to `merge(old, value)`; see [`RadixTree::put_with`].
    pub fn put_with<F>(&self, key: &[u8], value: u64, merge: F) -> Result<u64>
    where
        F: Fn(u64, u64) -> Option<u64>,
    {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        if key.is_empty() {
            return Err(EmberError::InvalidKey);
        }
        let pool = Arc::clone(self.tree.pool());
        // path and count guards are held through commit (dropped only after
        // run_once returns), so no neighbor can overlap an uncommitted write
        let mut path_guards: Vec<WriteGuard> = Vec::new();
        let mut count_guard = None;
        let result = Transaction::run_once(&pool, || {
            let outcome = self.insert_locked(&mut path_guards, key, value, &merge)?;
            if outcome.inserted {
                count_guard = Some(self.count_lock.lock());
                self.tree.root.increment(&pool)?;
            }
            Ok(outcome.prev)
        });
        drop(count_guard);
        drop(path_guards);
        result
    }

    /// Returns the value mapped to `key`, or 0 when absent or empty.
    pub fn get(&self, key: &[u8]) -> Result<u64> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        if key.is_empty() {
            return Ok(0);
        }
        self.get_locked(key)
    }

    /// Removes the mapping for `key` if present; see [`RadixTree::remove`].
    pub fn remove<F: FnMut(u64)>(&self, key: &[u8], mut cleanup: F) -> Result<u64> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        if key.is_empty() {
            return Err(EmberError::InvalidKey);
        }
        let pool = Arc::clone(self.tree.pool());
        let mut path_guards: Vec<WriteGuard> = Vec::new();
        let mut count_guard = None;
        let result = Transaction::run_once(&pool, || {
            let removed = self.remove_locked(&mut path_guards, key)?;
            if removed.is_some() {
                count_guard = Some(self.count_lock.lock());
                self.tree.root.decrement(&pool)?;
            }
            Ok(removed)
        });
        drop(count_guard);
        drop(path_guards);
        let value = result?.unwrap_or(0);
        cleanup(value);
        Ok(value)
    }

    /// Returns the lowest key, failing with a not-found error when empty.
    pub fn first_key(&self) -> Result<Vec<u8>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        // the walk reads committed state; a concurrent writer may move the
        // boundary, like any other read
        first_key_impl(self.tree.pool(), &self.tree.root)
    }

    /// Returns the highest key, failing with a not-found error when empty.
    pub fn last_key(&self) -> Result<Vec<u8>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        last_key_impl(self.tree.pool(), &self.tree.root)
    }

    /// Ascending iterator over all entries (not linearized against
    /// concurrent writers).
    pub fn iter(&self) -> Result<EntryIter<'_>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        self.tree.iter()
    }

    /// Descending iterator over all entries (not linearized against
    /// concurrent writers).
    pub fn iter_rev(&self) -> Result<ReverseEntryIter<'_>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        self.tree.iter_rev()
    }

    /// Ascending iterator over keys in `[from, to]`.
    pub fn range(
        &self,
        from: &[u8],
        from_inclusive: bool,
        to: &[u8],
        to_inclusive: bool,
    ) -> Result<EntryIter<'_>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        self.tree.range(from, from_inclusive, to, to_inclusive)
    }

    /// Descending iterator over keys in `[from, to]`.
    pub fn range_rev(
        &self,
        from: &[u8],
        from_inclusive: bool,
        to: &[u8],
        to_inclusive: bool,
    ) -> Result<ReverseEntryIter<'_>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        self.tree.range_rev(from, from_inclusive, to, to_inclusive)
    }

    /// Ascending iterator over keys at or below `to`.
    pub fn head(&self, to: &[u8], inclusive: bool) -> Result<EntryIter<'_>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        self.tree.head(to, inclusive)
    }

    /// Ascending iterator over keys at or above `from`.
    pub fn tail(&self, from: &[u8], inclusive: bool) -> Result<EntryIter<'_>> {
        let _sweep = self.sweep.read();
        self.ensure_live()?;
        self.tree.tail(from, inclusive)
    }

    /// Removes every entry, invoking `cleanup` once per stored value.
    /// Exclusive: waits out every in-flight mutation.
    pub fn clear<F: FnMut(u64)>(&self, mut cleanup: F) -> Result<()> {
        let _sweep = self.sweep.write();
        self.ensure_live()?;
        clear_impl(self.tree.pool(), &self.tree.root, &mut cleanup)
    }

    /// Releases every node including the root record. All further
    /// operations, including a second `free`, fail with a state error.
    pub fn free(&self) -> Result<()> {
        let _sweep = self.sweep.write();
        self.ensure_live()?;
        free_impl(self.tree.pool(), &self.tree.root)?;
        self.freed.store(true, Ordering::Release);
        Ok(())
    }

    // ---- locked descent ----

    fn insert_locked<F>(
        &self,
        guards: &mut Vec<WriteGuard>,
        key: &[u8],
        value: u64,
        merge: &F,
    ) -> Result<PutOutcome>
    where
        F: Fn(u64, u64) -> Option<u64>,
    {
        let pool = self.tree.pool();
        let root = &self.tree.root;
        guards.push(self.locks.write(root.handle.raw()));
        let mut link = ParentLink::Root;
        let mut node_opt = root.child(pool)?;
        let mut depth = 0usize;
        loop {
            let Some(n) = node_opt else {
                let stored = apply_merge(merge, 0, value)?;
                let leaf = create_leaf_chain(pool, &key[depth..], stored)?;
                relink(pool, root, &link, leaf)?;
                return Ok(PutOutcome {
                    prev: 0,
                    inserted: true,
                });
            };
            guards.push(self.locks.write(n.handle.raw()));
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

            let next_depth = depth + prefix.len();
            if next_depth == key.len() {
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

            // once this node has spare capacity it can no longer be split,
            // grown, or replaced by the pending insert, so everything above
            // its parent can make progress again
            if n.child_count(pool)? < n.kind.capacity() && guards.len() > 2 {
                guards.drain(..guards.len() - 2);
            }

            let radix = key[next_depth];
            match n.find_child(pool, radix)? {
                Some((index, next)) => {
                    link = ParentLink::Slot {
                        node: n,
                        index,
                        radix: Some(radix),
                    };
                    node_opt = Some(next);
                    depth = next_depth + 1;
                }
                None => {
                    let stored = apply_merge(merge, 0, value)?;
                    add_keyed_leaf(pool, root, &link, n, radix, &key[next_depth + 1..], stored)?;
                    return Ok(PutOutcome {
                        prev: 0,
                        inserted: true,
                    });
                }
            }
        }
    }

    fn get_locked(&self, key: &[u8]) -> Result<u64> {
        let pool = self.tree.pool();
        let root = &self.tree.root;
        let mut _guard: ReadGuard = self.locks.read(root.handle.raw());
        let mut node = match root.child(pool)? {
            None => return Ok(0),
            Some(n) => n,
        };
        let mut depth = 0usize;
        loop {
            // acquire the child before releasing the parent
            _guard = self.locks.read(node.handle.raw());
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

    fn remove_locked(&self, guards: &mut Vec<WriteGuard>, key: &[u8]) -> Result<Option<u64>> {
        let pool = self.tree.pool();
        let root = &self.tree.root;
        guards.push(self.locks.write(root.handle.raw()));
        match root.child(pool)? {
            None => Ok(None),
            Some(child) => Ok(self
                .remove_locked_rec(guards, &ParentLink::Root, child, key, 0)?
                .map(|(value, _)| value)),
        }
    }

    /// Locked mirror of the plain remove recursion. The second element of
    /// the result reports whether this frame removed itself from its
    /// parent, which is the only change that forces the parent to
    /// re-normalize; everything else leaves ancestors untouched, so frames
    /// whose guards were already released stay hands-off.
    fn remove_locked_rec(
        &self,
        guards: &mut Vec<WriteGuard>,
        link: &ParentLink,
        node: Node,
        key: &[u8],
        depth: usize,
    ) -> Result<Option<(u64, bool)>> {
        let pool = self.tree.pool();
        let root = &self.tree.root;
        guards.push(self.locks.write(node.handle.raw()));
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
            return Ok(Some((value, true)));
        }
        let depth = depth + prefix.len();

        // a node keeping at least one child after the removal can only be
        // compacted in place, which never cascades past its parent
        if node.child_count(pool)? >= 2 && guards.len() > 2 {
            guards.drain(..guards.len() - 2);
        }

        let (value, child_lost) = if depth == key.len() {
            match node.find_blank_child(pool)? {
                None => return Ok(None),
                Some(blank) => {
                    let value = blank.value(pool)?;
                    blank.free(pool)?;
                    node.delete_child(pool, None)?;
                    (value, true)
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
                    match self.remove_locked_rec(guards, &sub, child, key, depth + 1)? {
                        None => return Ok(None),
                        Some((value, child_lost)) => (value, child_lost),
                    }
                }
            }
        };
        let mut removed_from_parent = false;
        if child_lost {
            removed_from_parent =
                matches!(normalize(pool, root, link, node)?, Normalized::Removed);
        }
        Ok(Some((value, removed_from_parent)))
    }
}

impl PartialEq for ConcurrentRadixTree {
    fn eq(&self, other: &Self) -> bool {
        self.tree == other.tree
    }
}

impl Eq for ConcurrentRadixTree {}

impl Hash for ConcurrentRadixTree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tree.hash(state);
    }
}

impl std::fmt::Debug for ConcurrentRadixTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRadixTree")
            .field("handle", &self.tree.handle())
            .field("freed", &self.freed.load(Ordering::Relaxed))
            .finish()
    }
}
