//! Adaptive radix tree indexes on persistent memory.
//!
//! A [`RadixTree`] maps variable-length byte keys to `u64` values inside an
//! [`ember_pool::MemoryPool`], surviving process restarts: the tree's root
//! handle is the only state needed to reconstruct it. Every mutation runs in
//! a [`Transaction`] scope (implicitly created if the caller has not opened
//! one), so a crash or abort always leaves the persisted tree in either its
//! pre-mutation or fully applied post-mutation shape.
//!
//! [`ConcurrentRadixTree`] layers per-path lock coupling over the same
//! persistent layout for multi-threaded mutation.

pub mod concurrent;
pub mod iter;
mod node;
pub mod transaction;
pub mod tree;

pub use concurrent::ConcurrentRadixTree;
pub use iter::{Entry, EntryIter, ReverseEntryIter};
pub use transaction::{Transaction, TxState};
pub use tree::RadixTree;
