//! Error types for EmberDB.

use thiserror::Error;

/// Result type alias using EmberError.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Errors that can occur in EmberDB operations.
///
/// Variants fall into five classes: invalid argument (`InvalidKey`,
/// `InvalidHandle`, `InvalidRange`, `MergeFailed`, `Config`), bounds
/// (`OutOfBounds`), not-found (`NoSuchElement`), state (`TreeFreed`,
/// `TransactionTerminated`, `TransactionAborted`), and pool-level failures
/// (`CorruptData`, `PoolExhausted`, `Io`). An error returned from any
/// operation means no partial structural change was persisted.
#[derive(Debug, Error)]
pub enum EmberError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Invalid arguments
    #[error("invalid key: key must be non-empty")]
    InvalidKey,

    #[error("invalid handle: {handle}")]
    InvalidHandle { handle: u64 },

    #[error("invalid range: start bound sorts after end bound")]
    InvalidRange,

    #[error("merge function produced no value")]
    MergeFailed,

    #[error("configuration error: {0}")]
    Config(String),

    // Bounds errors
    #[error("out of bounds: offset {offset} length {len} exceeds extent of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    // Not-found errors
    #[error("no such element")]
    NoSuchElement,

    // State errors
    #[error("tree has been freed")]
    TreeFreed,

    #[error("transaction is not reusable: already {state}")]
    TransactionTerminated { state: &'static str },

    #[error("transaction scope was aborted")]
    TransactionAborted,

    // Pool errors
    #[error("corrupt data at handle {handle}: {reason}")]
    CorruptData { handle: u64, reason: String },

    #[error("pool exhausted: unable to allocate {requested} bytes")]
    PoolExhausted { requested: u64 },
}
