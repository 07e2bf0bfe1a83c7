//! Free-list block allocation over the pool's data area.
//!
//! Every block carries an 8-byte header word holding its payload size; the
//! top bit marks a freed block. Freed blocks form a singly linked list
//! threaded through their first payload word. Allocator metadata is written
//! through directly (never undo-logged); transactional behavior comes from
//! compensation: blocks allocated inside a scope are released if it aborts,
//! and frees requested inside a scope are deferred until it commits.

use crate::pool::{Handle, MemoryPool, BUMP_OFFSET, DATA_START, FREE_HEAD_OFFSET};
use crate::tx;
use ember_common::{EmberError, Result};

/// Size of the per-block header word.
pub(crate) const BLOCK_HEADER_SIZE: u64 = 8;

/// Header bit marking a freed block.
pub(crate) const FREE_BIT: u64 = 1 << 63;

/// Smallest payload, sized to hold the free-list link.
const MIN_PAYLOAD: u64 = 8;

/// Volatile mirror of the persistent allocator fields in the pool header.
pub(crate) struct AllocState {
    pub(crate) bump: u64,
    pub(crate) free_head: u64,
}

pub(crate) fn allocate(pool: &MemoryPool, size: u64) -> Result<Handle> {
    let need = size.max(MIN_PAYLOAD).div_ceil(8) * 8;
    let handle = {
        let mut state = pool.alloc.lock();

        // First fit over the free list; reused blocks keep their original size.
        let mut prev: u64 = 0;
        let mut cur = state.free_head;
        let mut found: Option<u64> = None;
        while cur != 0 {
            let word = pool.read_u64_abs(cur - BLOCK_HEADER_SIZE);
            let next = pool.read_u64_abs(cur);
            if word & FREE_BIT != 0 && (word & !FREE_BIT) >= need {
                if prev == 0 {
                    state.free_head = next;
                    pool.write_u64_abs_raw(FREE_HEAD_OFFSET, next);
                    pool.flush_abs(FREE_HEAD_OFFSET, 8)?;
                } else {
                    pool.write_u64_abs_raw(prev, next);
                    pool.flush_abs(prev, 8)?;
                }
                pool.write_u64_abs_raw(cur - BLOCK_HEADER_SIZE, word & !FREE_BIT);
                pool.flush_abs(cur - BLOCK_HEADER_SIZE, BLOCK_HEADER_SIZE)?;
                found = Some(cur);
                break;
            }
            prev = cur;
            cur = next;
        }

        match found {
            Some(h) => h,
            None => {
                let start = state.bump;
                let handle = start + BLOCK_HEADER_SIZE;
                let end = handle + need;
                if end > pool.size() {
                    return Err(EmberError::PoolExhausted { requested: size });
                }
                pool.write_u64_abs_raw(start, need);
                state.bump = end;
                pool.write_u64_abs_raw(BUMP_OFFSET, end);
                pool.flush_abs(start, BLOCK_HEADER_SIZE)?;
                pool.flush_abs(BUMP_OFFSET, 8)?;
                handle
            }
        }
    };
    let handle = Handle::from_raw(handle);
    tx::note_alloc(pool, handle)?;
    Ok(handle)
}

pub(crate) fn free(pool: &MemoryPool, handle: Handle) -> Result<()> {
    pool.block_size(handle)?;
    if tx::note_free(pool, handle) {
        return Ok(());
    }
    do_free(pool, handle)
}

/// Unconditionally returns a live block to the free list.
pub(crate) fn do_free(pool: &MemoryPool, handle: Handle) -> Result<()> {
    let mut state = pool.alloc.lock();
    let h = handle.raw();
    let word = pool.read_u64_abs(h - BLOCK_HEADER_SIZE);
    if word & FREE_BIT != 0 {
        return Err(EmberError::CorruptData {
            handle: h,
            reason: "block already freed".to_string(),
        });
    }
    pool.write_u64_abs_raw(h - BLOCK_HEADER_SIZE, word | FREE_BIT);
    pool.write_u64_abs_raw(h, state.free_head);
    state.free_head = h;
    pool.write_u64_abs_raw(FREE_HEAD_OFFSET, h);
    pool.flush_abs(h - BLOCK_HEADER_SIZE, BLOCK_HEADER_SIZE + 8)?;
    pool.flush_abs(FREE_HEAD_OFFSET, 8)?;
    Ok(())
}

/// Recovery helper: frees a block if it is still live, ignoring handles that
/// do not address one (the log tail may be torn).
pub(crate) fn free_if_live(pool: &MemoryPool, handle: Handle) -> Result<()> {
    let h = handle.raw();
    if h < DATA_START + BLOCK_HEADER_SIZE || h >= pool.size() || h % 8 != 0 {
        return Ok(());
    }
    let word = pool.read_u64_abs(h - BLOCK_HEADER_SIZE);
    if word == 0 || word & FREE_BIT != 0 {
        return Ok(());
    }
    do_free(pool, handle)
}
