//! Ordered traversal over committed tree state.
//!
//! Iterators are single-pass cursors over an explicit stack of node frames.
//! They observe the tree as of their creation and are not linearized
//! against concurrent writers; rebuilding the iterator is the only way to
//! observe a newer state.

use crate::node::{common_prefix_len, ChildEntry, Node};
use crate::tree::RadixTree;
use ember_common::{EmberError, Result};
use ember_pool::Handle;
use std::cmp::Ordering;

/// One key/value pair yielded by an iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: u64,
}

struct Frame {
    entries: Vec<ChildEntry>,
    idx: usize,
    /// Key-buffer length to restore when this frame pops.
    restore: usize,
}

/// Ascending iterator with optional bounds.
///
/// [`EntryIter::next_entry`] fails with a not-found error once the iterator
/// is exhausted; the [`Iterator`] implementation yields `Result<Entry>` and
/// `None` after exhaustion.
pub struct EntryIter<'a> {
    tree: &'a RadixTree,
    stack: Vec<Frame>,
    key: Vec<u8>,
    lower: Option<(Vec<u8>, bool)>,
    upper: Option<(Vec<u8>, bool)>,
    done: bool,
}

impl<'a> EntryIter<'a> {
    pub(crate) fn new(
        tree: &'a RadixTree,
        lower: Option<(Vec<u8>, bool)>,
        upper: Option<(Vec<u8>, bool)>,
    ) -> Result<EntryIter<'a>> {
        let mut it = EntryIter {
            tree,
            stack: Vec::new(),
            key: Vec::new(),
            lower,
            upper,
            done: false,
        };
        if let Some(child) = tree.root.child(tree.pool())? {
            match it.lower.clone() {
                Some((target, _)) => it.seek(child, &target)?,
                None => {
                    if child.is_leaf() {
                        it.push_leaf_frame(child, None);
                    } else {
                        it.push_frame(child, None, 0)?;
                    }
                }
            }
        }
        Ok(it)
    }

    fn push_frame(&mut self, node: Node, radix: Option<u8>, idx: usize) -> Result<()> {
        let entries = node.entries(self.tree.pool())?;
        self.push_frame_entries(node, radix, idx, entries)
    }

    fn push_frame_entries(
        &mut self,
        node: Node,
        radix: Option<u8>,
        idx: usize,
        entries: Vec<ChildEntry>,
    ) -> Result<()> {
        let restore = self.key.len();
        if let Some(r) = radix {
            self.key.push(r);
        }
        let prefix = node.prefix(self.tree.pool())?;
        self.key.extend_from_slice(&prefix);
        self.stack.push(Frame {
            entries,
            idx,
            restore,
        });
        Ok(())
    }

    fn push_leaf_frame(&mut self, leaf: Node, radix: Option<u8>) {
        let restore = self.key.len();
        self.stack.push(Frame {
            entries: vec![ChildEntry {
                radix,
                handle: leaf.handle.raw(),
            }],
            idx: 0,
            restore,
        });
    }

    /// Positions the stack at the first candidate entry for `target`. The
    /// seek is conservative: it may land slightly early, and the bound
    /// filter in `next_entry` makes the final call. It never lands late.
    fn seek(&mut self, mut node: Node, target: &[u8]) -> Result<()> {
        let pool = self.tree.pool();
        let mut radix: Option<u8> = None;
        let mut depth = 0usize;
        loop {
            if node.is_leaf() {
                self.push_leaf_frame(node, radix);
                return Ok(());
            }
            let prefix = node.prefix(pool)?;
            let rem = &target[depth..];
            let m = common_prefix_len(rem, &prefix);
            if m < prefix.len() {
                if m == rem.len() || rem[m] < prefix[m] {
                    // the whole subtree sorts at or after the target
                    self.push_frame(node, radix, 0)?;
                }
                // otherwise the whole subtree sorts before the target and
                // the ancestor frames are already positioned past it
                return Ok(());
            }
            depth += prefix.len();
            if depth >= target.len() {
                // every key below starts with the target
                self.push_frame(node, radix, 0)?;
                return Ok(());
            }
            let t = target[depth];
            let entries = node.entries(pool)?;
            let pos = entries
                .iter()
                .position(|e| matches!(e.radix, Some(r) if r >= t))
                .unwrap_or(entries.len());
            let descend = pos < entries.len() && entries[pos].radix == Some(t);
            let next = if descend {
                Some(Node::load(pool, Handle::from_raw(entries[pos].handle))?)
            } else {
                None
            };
            let idx = if descend { pos + 1 } else { pos };
            self.push_frame_entries(node, radix, idx, entries)?;
            match next {
                None => return Ok(()),
                Some(child) => {
                    node = child;
                    radix = Some(t);
                    depth += 1;
                }
            }
        }
    }

    /// Returns the next entry, failing with a not-found error once the
    /// iterator is exhausted.
    pub fn next_entry(&mut self) -> Result<Entry> {
        let pool = self.tree.pool();
        loop {
            if self.done {
                return Err(EmberError::NoSuchElement);
            }
            let Some(frame) = self.stack.last_mut() else {
                self.done = true;
                return Err(EmberError::NoSuchElement);
            };
            if frame.idx >= frame.entries.len() {
                let frame = self.stack.pop().unwrap();
                self.key.truncate(frame.restore);
                continue;
            }
            let entry = frame.entries[frame.idx];
            frame.idx += 1;
            let node = Node::load(pool, Handle::from_raw(entry.handle))?;
            if node.is_leaf() {
                let mut key = self.key.clone();
                if let Some(r) = entry.radix {
                    key.push(r);
                }
                key.extend(node.prefix(pool)?);
                if let Some((lo, inclusive)) = &self.lower {
                    match key.as_slice().cmp(lo.as_slice()) {
                        Ordering::Less => continue,
                        Ordering::Equal if !*inclusive => continue,
                        _ => {}
                    }
                }
                if let Some((hi, inclusive)) = &self.upper {
                    match key.as_slice().cmp(hi.as_slice()) {
                        Ordering::Greater => {
                            self.done = true;
                            return Err(EmberError::NoSuchElement);
                        }
                        Ordering::Equal if !*inclusive => {
                            self.done = true;
                            return Err(EmberError::NoSuchElement);
                        }
                        _ => {}
                    }
                }
                let value = node.value(pool)?;
                return Ok(Entry { key, value });
            }
            self.push_frame(node, entry.radix, 0)?;
        }
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(EmberError::NoSuchElement) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Descending iterator with optional bounds; the mirror of [`EntryIter`].
pub struct ReverseEntryIter<'a> {
    tree: &'a RadixTree,
    stack: Vec<Frame>,
    key: Vec<u8>,
    lower: Option<(Vec<u8>, bool)>,
    upper: Option<(Vec<u8>, bool)>,
    done: bool,
}

impl<'a> ReverseEntryIter<'a> {
    pub(crate) fn new(
        tree: &'a RadixTree,
        lower: Option<(Vec<u8>, bool)>,
        upper: Option<(Vec<u8>, bool)>,
    ) -> Result<ReverseEntryIter<'a>> {
        let mut it = ReverseEntryIter {
            tree,
            stack: Vec::new(),
            key: Vec::new(),
            lower,
            upper,
            done: false,
        };
        if let Some(child) = tree.root.child(tree.pool())? {
            match it.upper.clone() {
                Some((target, _)) => it.seek(child, &target)?,
                None => {
                    if child.is_leaf() {
                        it.push_leaf_frame(child, None);
                    } else {
                        it.push_frame(child, None, 0)?;
                    }
                }
            }
        }
        Ok(it)
    }

    /// Child entries in descending order: keyed children by falling radix,
    /// the blank child last.
    fn rev_entries(&self, node: Node) -> Result<Vec<ChildEntry>> {
        let mut entries = node.entries(self.tree.pool())?;
        entries.reverse();
        Ok(entries)
    }

    fn push_frame(&mut self, node: Node, radix: Option<u8>, idx: usize) -> Result<()> {
        let entries = self.rev_entries(node)?;
        self.push_frame_entries(node, radix, idx, entries)
    }

    fn push_frame_entries(
        &mut self,
        node: Node,
        radix: Option<u8>,
        idx: usize,
        entries: Vec<ChildEntry>,
    ) -> Result<()> {
        let restore = self.key.len();
        if let Some(r) = radix {
            self.key.push(r);
        }
        let prefix = node.prefix(self.tree.pool())?;
        self.key.extend_from_slice(&prefix);
        self.stack.push(Frame {
            entries,
            idx,
            restore,
        });
        Ok(())
    }

    fn push_leaf_frame(&mut self, leaf: Node, radix: Option<u8>) {
        let restore = self.key.len();
        self.stack.push(Frame {
            entries: vec![ChildEntry {
                radix,
                handle: leaf.handle.raw(),
            }],
            idx: 0,
            restore,
        });
    }

    /// Positions the stack at the highest candidate at or below `target`,
    /// conservatively; the bound filter in `next_entry` decides exactly.
    fn seek(&mut self, mut node: Node, target: &[u8]) -> Result<()> {
        let pool = self.tree.pool();
        let mut radix: Option<u8> = None;
        let mut depth = 0usize;
        loop {
            if node.is_leaf() {
                self.push_leaf_frame(node, radix);
                return Ok(());
            }
            let prefix = node.prefix(pool)?;
            let rem = &target[depth..];
            let m = common_prefix_len(rem, &prefix);
            if m < prefix.len() {
                if m < rem.len() && rem[m] > prefix[m] {
                    // the whole subtree sorts below the bound
                    self.push_frame(node, radix, 0)?;
                }
                // a target exhausted inside the prefix, or diverging lower,
                // puts the whole subtree above the bound
                return Ok(());
            }
            depth += prefix.len();
            if depth >= target.len() {
                // keys below start with the target; only the blank child
                // (the key equal to the target) can qualify
                let entries = self.rev_entries(node)?;
                let idx = entries
                    .iter()
                    .position(|e| e.radix.is_none())
                    .unwrap_or(entries.len());
                self.push_frame_entries(node, radix, idx, entries)?;
                return Ok(());
            }
            let t = target[depth];
            let entries = self.rev_entries(node)?;
            let pos = entries
                .iter()
                .position(|e| match e.radix {
                    None => true,
                    Some(r) => r <= t,
                })
                .unwrap_or(entries.len());
            let descend = pos < entries.len() && entries[pos].radix == Some(t);
            let next = if descend {
                Some(Node::load(pool, Handle::from_raw(entries[pos].handle))?)
            } else {
                None
            };
            let idx = if descend { pos + 1 } else { pos };
            self.push_frame_entries(node, radix, idx, entries)?;
            match next {
                None => return Ok(()),
                Some(child) => {
                    node = child;
                    radix = Some(t);
                    depth += 1;
                }
            }
        }
    }

    /// Returns the next entry in descending order, failing with a
    /// not-found error once exhausted.
    pub fn next_entry(&mut self) -> Result<Entry> {
        let pool = self.tree.pool();
        loop {
            if self.done {
                return Err(EmberError::NoSuchElement);
            }
            let Some(frame) = self.stack.last_mut() else {
                self.done = true;
                return Err(EmberError::NoSuchElement);
            };
            if frame.idx >= frame.entries.len() {
                let frame = self.stack.pop().unwrap();
                self.key.truncate(frame.restore);
                continue;
            }
            let entry = frame.entries[frame.idx];
            frame.idx += 1;
            let node = Node::load(pool, Handle::from_raw(entry.handle))?;
            if node.is_leaf() {
                let mut key = self.key.clone();
                if let Some(r) = entry.radix {
                    key.push(r);
                }
                key.extend(node.prefix(pool)?);
                if let Some((hi, inclusive)) = &self.upper {
                    match key.as_slice().cmp(hi.as_slice()) {
                        Ordering::Greater => continue,
                        Ordering::Equal if !*inclusive => continue,
                        _ => {}
                    }
                }
                if let Some((lo, inclusive)) = &self.lower {
                    match key.as_slice().cmp(lo.as_slice()) {
                        Ordering::Less => {
                            self.done = true;
                            return Err(EmberError::NoSuchElement);
                        }
                        Ordering::Equal if !*inclusive => {
                            self.done = true;
                            return Err(EmberError::NoSuchElement);
                        }
                        _ => {}
                    }
                }
                let value = node.value(pool)?;
                return Ok(Entry { key, value });
            }
            self.push_frame(node, entry.radix, 0)?;
        }
    }
}

impl Iterator for ReverseEntryIter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(EmberError::NoSuchElement) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::PoolConfig;
    use ember_pool::MemoryPool;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tree_with(dir: &TempDir, keys: &[&[u8]]) -> (Arc<MemoryPool>, RadixTree) {
        let config = PoolConfig {
            path: dir.path().join("iter.pool"),
            size: 16 * 1024 * 1024,
            sync_writes: false,
        };
        let pool = MemoryPool::create(&config).unwrap();
        let mut tree = RadixTree::new(&pool).unwrap();
        for (i, key) in keys.iter().enumerate() {
            tree.put(key, i as u64 + 1).unwrap();
        }
        (pool, tree)
    }

    fn collect_keys(iter: impl Iterator<Item = Result<Entry>>) -> Vec<Vec<u8>> {
        iter.map(|e| e.unwrap().key).collect()
    }

    #[test]
    fn test_forward_order() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"cc", b"a", b"b", b"ab", b"aa", b"abc"]);
        let keys = collect_keys(tree.iter().unwrap());
        assert_eq!(
            keys,
            vec![
                b"a".to_vec(),
                b"aa".to_vec(),
                b"ab".to_vec(),
                b"abc".to_vec(),
                b"b".to_vec(),
                b"cc".to_vec()
            ]
        );
    }

    #[test]
    fn test_reverse_order() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"cc", b"a", b"b", b"ab", b"aa", b"abc"]);
        let mut keys = collect_keys(tree.iter_rev().unwrap());
        keys.reverse();
        assert_eq!(keys, collect_keys(tree.iter().unwrap()));
    }

    #[test]
    fn test_empty_tree_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[]);
        assert_eq!(tree.iter().unwrap().count(), 0);
        assert_eq!(tree.iter_rev().unwrap().count(), 0);

        let mut iter = tree.iter().unwrap();
        assert!(matches!(
            iter.next_entry(),
            Err(EmberError::NoSuchElement)
        ));
    }

    #[test]
    fn test_exhaustion_is_an_error_then_none() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"only"]);
        let mut iter = tree.iter().unwrap();
        assert_eq!(iter.next_entry().unwrap().key, b"only");
        assert!(matches!(iter.next_entry(), Err(EmberError::NoSuchElement)));
        assert!(matches!(iter.next_entry(), Err(EmberError::NoSuchElement)));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_single_leaf_root() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"solo"]);
        assert_eq!(collect_keys(tree.iter().unwrap()), vec![b"solo".to_vec()]);
        assert_eq!(
            collect_keys(tree.iter_rev().unwrap()),
            vec![b"solo".to_vec()]
        );
    }

    #[test]
    fn test_range_bounds_between_keys() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"ant", b"bee", b"cow", b"dog", b"eel"]);

        // bounds that are not stored keys act as insertion points
        let keys = collect_keys(tree.range(b"b", true, b"d", true).unwrap());
        assert_eq!(keys, vec![b"bee".to_vec(), b"cow".to_vec()]);

        let keys = collect_keys(tree.range(b"bee", false, b"dog", true).unwrap());
        assert_eq!(keys, vec![b"cow".to_vec(), b"dog".to_vec()]);

        let keys = collect_keys(tree.range(b"bee", true, b"dog", false).unwrap());
        assert_eq!(keys, vec![b"bee".to_vec(), b"cow".to_vec()]);
    }

    #[test]
    fn test_range_includes_blank_nodes() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"a", b"ab", b"abc", b"abd", b"b"]);

        let keys = collect_keys(tree.range(b"ab", true, b"abd", false).unwrap());
        assert_eq!(keys, vec![b"ab".to_vec(), b"abc".to_vec()]);

        let keys = collect_keys(tree.range(b"ab", false, b"b", true).unwrap());
        assert_eq!(
            keys,
            vec![b"abc".to_vec(), b"abd".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn test_head_and_tail() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"ant", b"bee", b"cow", b"dog"]);

        assert_eq!(
            collect_keys(tree.head(b"cow", true).unwrap()),
            vec![b"ant".to_vec(), b"bee".to_vec(), b"cow".to_vec()]
        );
        assert_eq!(
            collect_keys(tree.head(b"cow", false).unwrap()),
            vec![b"ant".to_vec(), b"bee".to_vec()]
        );
        assert_eq!(
            collect_keys(tree.tail(b"bee", true).unwrap()),
            vec![b"bee".to_vec(), b"cow".to_vec(), b"dog".to_vec()]
        );
        assert_eq!(
            collect_keys(tree.tail(b"bee", false).unwrap()),
            vec![b"cow".to_vec(), b"dog".to_vec()]
        );
    }

    #[test]
    fn test_reverse_range() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"a", b"ab", b"b", b"bb", b"c"]);

        let keys = collect_keys(tree.range_rev(b"ab", true, b"bb", true).unwrap());
        assert_eq!(
            keys,
            vec![b"bb".to_vec(), b"b".to_vec(), b"ab".to_vec()]
        );

        let keys = collect_keys(tree.range_rev(b"ab", false, b"bb", false).unwrap());
        assert_eq!(keys, vec![b"b".to_vec()]);
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"a"]);

        assert!(matches!(
            tree.range(b"b", true, b"a", true),
            Err(EmberError::InvalidRange)
        ));
        assert!(matches!(
            tree.range_rev(b"b", true, b"a", true),
            Err(EmberError::InvalidRange)
        ));
        assert!(matches!(
            tree.range(b"", true, b"a", true),
            Err(EmberError::InvalidKey)
        ));
        assert!(matches!(
            tree.head(b"", true),
            Err(EmberError::InvalidKey)
        ));
        assert!(matches!(
            tree.tail(b"", false),
            Err(EmberError::InvalidKey)
        ));
        // an equal-bound range is a point query, not an error
        let keys = collect_keys(tree.range(b"a", true, b"a", true).unwrap());
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_bounds_deeper_than_tree() {
        let dir = TempDir::new().unwrap();
        let (_pool, tree) = tree_with(&dir, &[b"box", b"boxer", b"boxes"]);

        let keys = collect_keys(tree.tail(b"boxcar", true).unwrap());
        assert_eq!(keys, vec![b"boxer".to_vec(), b"boxes".to_vec()]);

        let keys = collect_keys(tree.head(b"boxerific", true).unwrap());
        assert_eq!(keys, vec![b"box".to_vec(), b"boxer".to_vec()]);
    }
}
