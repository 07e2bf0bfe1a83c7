//! Thread-local transaction scopes over the pool's undo log.
//!
//! One scope may be active per pool per thread. Nested transaction objects
//! join the active scope instead of opening their own; the scope's writes
//! become durable only when it commits, and an abort anywhere in the nest
//! rolls the whole scope back.

use crate::alloc;
use crate::pool::{Handle, MemoryPool};
use ember_common::{EmberError, Result};
use std::cell::RefCell;
use std::collections::HashMap;

struct Scope {
    txid: u64,
    /// Overwritten bytes in record order, replayed in reverse on abort.
    undo: Vec<(u64, Vec<u8>)>,
    /// Blocks allocated in this scope, released on abort.
    allocs: Vec<Handle>,
    /// Frees requested in this scope, applied at commit.
    frees: Vec<Handle>,
    /// Written ranges, flushed at commit.
    dirty: Vec<(u64, u64)>,
}

thread_local! {
    static SCOPES: RefCell<HashMap<u64, Scope>> = RefCell::new(HashMap::new());
}

pub(crate) fn current(pool: &MemoryPool) -> Option<u64> {
    SCOPES.with(|s| s.borrow().get(&pool.id()).map(|scope| scope.txid))
}

pub(crate) fn begin(pool: &MemoryPool) -> Result<u64> {
    SCOPES.with(|s| {
        let mut scopes = s.borrow_mut();
        if scopes.contains_key(&pool.id()) {
            return Err(EmberError::TransactionTerminated { state: "active" });
        }
        let txid = pool.next_txid();
        pool.log.lock().begin(txid);
        scopes.insert(
            pool.id(),
            Scope {
                txid,
                undo: Vec::new(),
                allocs: Vec::new(),
                frees: Vec::new(),
                dirty: Vec::new(),
            },
        );
        Ok(txid)
    })
}

pub(crate) fn commit(pool: &MemoryPool) -> Result<()> {
    let scope = take_scope(pool)?;
    // Data must be durable before the commit marker: a marker with
    // unflushed data would stop recovery from rolling the scope back.
    flush_dirty(pool, &scope.dirty)?;
    {
        let mut log = pool.log.lock();
        log.record_commit(scope.txid)?;
        log.finish(scope.txid)?;
    }
    // Deferred frees land after the marker; a crash here leaks the blocks
    // but never resurrects them.
    for handle in &scope.frees {
        alloc::do_free(pool, *handle)?;
    }
    Ok(())
}

pub(crate) fn abort(pool: &MemoryPool) -> Result<()> {
    let scope = take_scope(pool)?;
    for (offset, old) in scope.undo.iter().rev() {
        pool.write_abs_raw(*offset, old);
    }
    flush_dirty(pool, &scope.dirty)?;
    for handle in scope.allocs.iter().rev() {
        alloc::do_free(pool, *handle)?;
    }
    pool.log.lock().finish(scope.txid)?;
    Ok(())
}

fn take_scope(pool: &MemoryPool) -> Result<Scope> {
    SCOPES.with(|s| {
        s.borrow_mut()
            .remove(&pool.id())
            .ok_or(EmberError::TransactionTerminated { state: "inactive" })
    })
}

/// Called by the pool for every write performed while this scope is active.
pub(crate) fn on_write(pool: &MemoryPool, txid: u64, offset: u64, old: Vec<u8>) -> Result<()> {
    pool.log.lock().record_undo(txid, offset, &old)?;
    SCOPES.with(|s| {
        let mut scopes = s.borrow_mut();
        if let Some(scope) = scopes.get_mut(&pool.id()) {
            scope.dirty.push((offset, old.len() as u64));
            scope.undo.push((offset, old));
        }
    });
    Ok(())
}

pub(crate) fn note_alloc(pool: &MemoryPool, handle: Handle) -> Result<()> {
    let Some(txid) = current(pool) else {
        return Ok(());
    };
    pool.log.lock().record_alloc(txid, handle.raw())?;
    SCOPES.with(|s| {
        if let Some(scope) = s.borrow_mut().get_mut(&pool.id()) {
            scope.allocs.push(handle);
        }
    });
    Ok(())
}

/// Returns true if the free was deferred to an active scope.
pub(crate) fn note_free(pool: &MemoryPool, handle: Handle) -> bool {
    SCOPES.with(|s| match s.borrow_mut().get_mut(&pool.id()) {
        Some(scope) => {
            scope.frees.push(handle);
            true
        }
        None => false,
    })
}

fn flush_dirty(pool: &MemoryPool, dirty: &[(u64, u64)]) -> Result<()> {
    if dirty.is_empty() {
        return Ok(());
    }
    let mut ranges = dirty.to_vec();
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (offset, len) in ranges {
        match merged.last_mut() {
            Some((m_off, m_len)) if offset <= *m_off + *m_len => {
                let end = (offset + len).max(*m_off + *m_len);
                *m_len = end - *m_off;
            }
            _ => merged.push((offset, len)),
        }
    }
    for (offset, len) in merged {
        pool.flush_abs(offset, len)?;
    }
    Ok(())
}

/// Test hook: drops the active scope without commit or abort, leaving the
/// undo log as a crash would.
#[cfg(test)]
pub(crate) fn abandon(pool: &MemoryPool) {
    SCOPES.with(|s| {
        s.borrow_mut().remove(&pool.id());
    });
}
