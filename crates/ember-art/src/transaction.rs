//! Typed transaction state machine over the pool's undo-log primitive.

use ember_common::{EmberError, Result};
use ember_pool::MemoryPool;
use std::sync::Arc;

/// The states a transaction moves through. Successful transactions traverse
/// New → Active → Committed; an error escaping the body moves Active →
/// Aborted. Both end states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    New,
    Active,
    Committed,
    Aborted,
}

impl TxState {
    fn name(self) -> &'static str {
        match self {
            TxState::New => "new",
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        }
    }
}

/// A scope grouping writes, allocations, and deallocations on one pool into
/// a single atomic, durable operation.
///
/// Entering a body while another transaction is already active on the same
/// pool (and thread) joins the enclosing scope: the inner writes become
/// durable only when the outermost transaction commits, and an error
/// anywhere in the nest rolls back the entire scope. A transaction object
/// that joined a scope stays [`TxState::Active`] after its body completes
/// and may be reused as a join target until the scope terminates; once the
/// scope is gone — committed or aborted — any further `run` fails with a
/// state error.
pub struct Transaction {
    pool: Arc<MemoryPool>,
    state: TxState,
    nested: bool,
    txid: Option<u64>,
}

impl Transaction {
    /// Creates a detached transaction bound to `pool`.
    pub fn new(pool: &Arc<MemoryPool>) -> Transaction {
        Transaction {
            pool: Arc::clone(pool),
            state: TxState::New,
            nested: false,
            txid: None,
        }
    }

    /// Returns the current state of this transaction.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Returns true while this transaction can still run a body.
    pub fn is_valid(&self) -> bool {
        matches!(self.state, TxState::New | TxState::Active)
    }

    /// Creates a transaction and runs `body` inside it, committing on
    /// success and rolling back on error.
    pub fn run_once<T, F>(pool: &Arc<MemoryPool>, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        Transaction::new(pool).run(body)
    }

    /// Runs `body` inside this transaction's scope.
    ///
    /// On the first call the transaction either begins a fresh scope or
    /// joins the one already active on this thread. A body returning `Err`
    /// aborts the whole scope, rolls back every staged write, and
    /// re-surfaces the error. A body returning `Ok` commits if this
    /// transaction owns the outermost scope; joined transactions leave the
    /// commit to their outermost enclosing transaction.
    pub fn run<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.state {
            TxState::Committed | TxState::Aborted => {
                return Err(EmberError::TransactionTerminated {
                    state: self.state.name(),
                });
            }
            TxState::New => {
                if self.pool.tx_active() {
                    self.nested = true;
                    self.txid = self.pool.current_transaction();
                } else {
                    self.txid = Some(self.pool.tx_begin()?);
                }
                self.state = TxState::Active;
            }
            TxState::Active => {
                // reused join target: its scope must still be the live one
                if self.pool.current_transaction() != self.txid {
                    self.state = TxState::Aborted;
                    return Err(EmberError::TransactionAborted);
                }
            }
        }

        match body() {
            Ok(value) => {
                if self.pool.current_transaction() != self.txid {
                    // a nested body aborted the scope out from under us;
                    // catching its error does not rescue this transaction
                    self.state = TxState::Aborted;
                    return Err(EmberError::TransactionAborted);
                }
                if !self.nested {
                    self.pool.tx_commit()?;
                    self.state = TxState::Committed;
                }
                Ok(value)
            }
            Err(err) => {
                if self.txid.is_some() && self.pool.current_transaction() == self.txid {
                    // first aborter rolls back the whole scope
                    self.pool.tx_abort()?;
                }
                self.state = TxState::Aborted;
                Err(err)
            }
        }
    }
}
