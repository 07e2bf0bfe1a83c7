//! File-backed persistent memory pool with handle-addressed blocks.

use crate::alloc::{self, AllocState, BLOCK_HEADER_SIZE, FREE_BIT};
use crate::tx;
use crate::undo::{self, RecordType, UndoLog};
use ember_common::{EmberError, PoolConfig, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Stable address of an allocated block within a pool.
///
/// Handles remain valid across process restarts and can be stored inside
/// other persistent structures. Handle 0 is the null handle and never
/// addresses a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    /// The null handle.
    pub const NULL: Handle = Handle(0);

    /// Creates a handle from its raw integer form.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Returns the raw integer form of this handle.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true if this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const MAGIC: u64 = u64::from_le_bytes(*b"EMBRPOOL");
const VERSION: u32 = 1;
const FLAG_SYNC_WRITES: u32 = 1;

/// Pool header layout (64 bytes):
/// +--------------------+ 0
/// | magic: u64         | 8
/// | version: u32       | 12
/// | flags: u32         | 16
/// | pool_size: u64     | 24
/// | bump: u64          | 32
/// | free_head: u64     | 40
/// | root: u64          | 48
/// | reserved           | 64 (DATA_START)
/// +--------------------+
const MAGIC_OFFSET: u64 = 0;
const VERSION_OFFSET: u64 = 8;
const FLAGS_OFFSET: u64 = 12;
const SIZE_OFFSET: u64 = 16;
pub(crate) const BUMP_OFFSET: u64 = 24;
pub(crate) const FREE_HEAD_OFFSET: u64 = 32;
const ROOT_OFFSET: u64 = 40;
const HEADER_SIZE: u64 = 64;
pub(crate) const DATA_START: u64 = HEADER_SIZE;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A fixed-size persistent memory pool backed by a memory-mapped file.
///
/// The pool hands out [`Handle`]s to fixed-size blocks and exposes typed,
/// bounds-checked accessors on them. Writes made while a transaction scope
/// is active on the calling thread are undo-logged and become durable only
/// when the scope commits; writes made outside a scope are flushed
/// immediately.
pub struct MemoryPool {
    map: MmapMut,
    base: *mut u8,
    len: u64,
    path: PathBuf,
    pool_id: u64,
    next_txid: AtomicU64,
    sync_writes: bool,
    pub(crate) alloc: Mutex<AllocState>,
    pub(crate) log: Mutex<UndoLog>,
}

// The raw base pointer targets the owned mapping; concurrent access to
// disjoint ranges is coordinated by callers (the index layer's locks and the
// allocator/log mutexes).
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Creates a new pool file. Fails if the file already exists.
    pub fn create(config: &PoolConfig) -> Result<Arc<MemoryPool>> {
        config.validate()?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&config.path)?;
        file.set_len(config.size)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        let log = UndoLog::create(&undo::log_path(&config.path), config.sync_writes)?;
        let pool = MemoryPool {
            map,
            base,
            len: config.size,
            path: config.path.clone(),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            next_txid: AtomicU64::new(1),
            sync_writes: config.sync_writes,
            alloc: Mutex::new(AllocState {
                bump: DATA_START,
                free_head: 0,
            }),
            log: Mutex::new(log),
        };

        pool.write_u64_abs_raw(MAGIC_OFFSET, MAGIC);
        pool.write_abs_raw(VERSION_OFFSET, &VERSION.to_le_bytes());
        let flags = if config.sync_writes { FLAG_SYNC_WRITES } else { 0 };
        pool.write_abs_raw(FLAGS_OFFSET, &flags.to_le_bytes());
        pool.write_u64_abs_raw(SIZE_OFFSET, config.size);
        pool.write_u64_abs_raw(BUMP_OFFSET, DATA_START);
        pool.write_u64_abs_raw(FREE_HEAD_OFFSET, 0);
        pool.write_u64_abs_raw(ROOT_OFFSET, 0);
        pool.map.flush_range(0, HEADER_SIZE as usize)?;

        debug!(path = %config.path.display(), size = config.size, "created pool");
        Ok(Arc::new(pool))
    }

    /// Opens an existing pool file, rolling back any transaction that was
    /// left unfinished by a crash.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<MemoryPool>> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(EmberError::CorruptData {
                handle: 0,
                reason: "file too small for a pool header".to_string(),
            });
        }
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        let header_u64 = |off: u64| u64::from_le_bytes(map[off as usize..off as usize + 8].try_into().unwrap());
        let header_u32 = |off: u64| u32::from_le_bytes(map[off as usize..off as usize + 4].try_into().unwrap());
        if header_u64(MAGIC_OFFSET) != MAGIC {
            return Err(EmberError::CorruptData {
                handle: 0,
                reason: "bad pool magic".to_string(),
            });
        }
        let version = header_u32(VERSION_OFFSET);
        if version != VERSION {
            return Err(EmberError::CorruptData {
                handle: 0,
                reason: format!("unsupported pool version {version}"),
            });
        }
        if header_u64(SIZE_OFFSET) != len {
            return Err(EmberError::CorruptData {
                handle: 0,
                reason: "pool size does not match file size".to_string(),
            });
        }
        let sync_writes = (header_u32(FLAGS_OFFSET) & FLAG_SYNC_WRITES) != 0;
        let bump = header_u64(BUMP_OFFSET);
        let free_head = header_u64(FREE_HEAD_OFFSET);

        // Scan the undo log before truncating it.
        let log_path = undo::log_path(path);
        let records = undo::read_records(&log_path)?;
        let log = UndoLog::create(&log_path, sync_writes)?;

        let pool = MemoryPool {
            map,
            base,
            len,
            path: path.to_path_buf(),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            next_txid: AtomicU64::new(1),
            sync_writes,
            alloc: Mutex::new(AllocState { bump, free_head }),
            log: Mutex::new(log),
        };

        if !records.is_empty() {
            pool.recover(&records)?;
        }
        debug!(path = %path.display(), size = len, records = records.len(), "opened pool");
        Ok(Arc::new(pool))
    }

    /// Rolls back every logged transaction that has no commit marker.
    fn recover(&self, records: &[undo::LogRecord]) -> Result<()> {
        let committed: HashSet<u64> = records
            .iter()
            .filter(|r| r.rtype == RecordType::Commit)
            .map(|r| r.txid)
            .collect();
        let mut rolled = 0usize;
        let mut orphaned: Vec<u64> = Vec::new();
        for rec in records.iter().rev() {
            if committed.contains(&rec.txid) {
                continue;
            }
            match rec.rtype {
                RecordType::Undo => {
                    let end = rec.offset.saturating_add(rec.payload.len() as u64);
                    if end <= self.len {
                        self.write_abs_raw(rec.offset, &rec.payload);
                        rolled += 1;
                    }
                }
                RecordType::Alloc => orphaned.push(rec.offset),
                RecordType::Commit => {}
            }
        }
        for raw in &orphaned {
            alloc::free_if_live(self, Handle::from_raw(*raw))?;
        }
        self.map.flush()?;
        debug!(rolled, orphaned = orphaned.len(), "rolled back unfinished transactions");
        Ok(())
    }

    /// Returns the process-unique identifier of this open pool.
    pub fn id(&self) -> u64 {
        self.pool_id
    }

    /// Returns the total pool size in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn next_txid(&self) -> u64 {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    // ---- block lifecycle ----

    /// Allocates a block of at least `size` bytes and returns its handle.
    ///
    /// Inside a transaction scope the allocation is rolled back if the scope
    /// aborts.
    pub fn allocate(&self, size: u64) -> Result<Handle> {
        alloc::allocate(self, size)
    }

    /// Frees a block. Inside a transaction scope the deallocation is
    /// deferred until the scope commits, so an abort keeps the block live.
    pub fn free(&self, handle: Handle) -> Result<()> {
        alloc::free(self, handle)
    }

    /// Validates a handle and returns the usable size of its block.
    ///
    /// Handle 0, out-of-range, and misaligned handles fail with
    /// [`EmberError::InvalidHandle`]; a handle addressing a freed block or a
    /// malformed block header fails with [`EmberError::CorruptData`].
    pub fn block_size(&self, handle: Handle) -> Result<u64> {
        let h = handle.raw();
        if h < DATA_START + BLOCK_HEADER_SIZE || h >= self.len || h % 8 != 0 {
            return Err(EmberError::InvalidHandle { handle: h });
        }
        let word = self.read_u64_abs(h - BLOCK_HEADER_SIZE);
        if word & FREE_BIT != 0 {
            return Err(EmberError::CorruptData {
                handle: h,
                reason: "block has been freed".to_string(),
            });
        }
        if word == 0 || h + word > self.len {
            return Err(EmberError::CorruptData {
                handle: h,
                reason: "invalid block header".to_string(),
            });
        }
        Ok(word)
    }

    // ---- typed accessors ----

    /// Reads bytes from a block into `buf`.
    pub fn read_bytes(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.block_size(handle)?;
        self.check_extent(offset, buf.len() as u64, size)?;
        self.read_abs(handle.raw() + offset, buf);
        Ok(())
    }

    /// Writes bytes into a block.
    pub fn write_bytes(&self, handle: Handle, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.block_size(handle)?;
        self.check_extent(offset, data.len() as u64, size)?;
        self.write_abs(handle.raw() + offset, data)
    }

    /// Reads a u8 from a block.
    pub fn read_u8(&self, handle: Handle, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(handle, offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Writes a u8 into a block.
    pub fn write_u8(&self, handle: Handle, offset: u64, value: u8) -> Result<()> {
        self.write_bytes(handle, offset, &[value])
    }

    /// Reads a little-endian u16 from a block.
    pub fn read_u16(&self, handle: Handle, offset: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(handle, offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Writes a little-endian u16 into a block.
    pub fn write_u16(&self, handle: Handle, offset: u64, value: u16) -> Result<()> {
        self.write_bytes(handle, offset, &value.to_le_bytes())
    }

    /// Reads a little-endian u32 from a block.
    pub fn read_u32(&self, handle: Handle, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(handle, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes a little-endian u32 into a block.
    pub fn write_u32(&self, handle: Handle, offset: u64, value: u32) -> Result<()> {
        self.write_bytes(handle, offset, &value.to_le_bytes())
    }

    /// Reads a little-endian u64 from a block.
    pub fn read_u64(&self, handle: Handle, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(handle, offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a little-endian u64 into a block.
    pub fn write_u64(&self, handle: Handle, offset: u64, value: u64) -> Result<()> {
        self.write_bytes(handle, offset, &value.to_le_bytes())
    }

    /// Forces a byte range of a block to durable media.
    pub fn flush(&self, handle: Handle, offset: u64, len: u64) -> Result<()> {
        let size = self.block_size(handle)?;
        self.check_extent(offset, len, size)?;
        self.flush_abs(handle.raw() + offset, len)
    }

    // ---- root slot ----

    /// Returns the pool's root handle, or the null handle if unset.
    pub fn root(&self) -> Handle {
        Handle::from_raw(self.read_u64_abs(ROOT_OFFSET))
    }

    /// Stores a handle in the pool's well-known root slot.
    pub fn set_root(&self, handle: Handle) -> Result<()> {
        if !handle.is_null() {
            self.block_size(handle)?;
        }
        self.write_abs(ROOT_OFFSET, &handle.raw().to_le_bytes())
    }

    // ---- transactions ----

    /// Returns true if a transaction scope is active on this thread.
    pub fn tx_active(&self) -> bool {
        tx::current(self).is_some()
    }

    /// Returns the identifier of this thread's active scope, if any.
    pub fn current_transaction(&self) -> Option<u64> {
        tx::current(self)
    }

    /// Begins a transaction scope on this thread. Fails if one is already
    /// active; callers that want to participate in an enclosing scope join
    /// it instead of beginning a new one.
    pub fn tx_begin(&self) -> Result<u64> {
        tx::begin(self)
    }

    /// Commits this thread's active scope, making its writes durable and
    /// applying its deferred frees.
    pub fn tx_commit(&self) -> Result<()> {
        tx::commit(self)
    }

    /// Aborts this thread's active scope, rolling back its writes and
    /// releasing its allocations.
    pub fn tx_abort(&self) -> Result<()> {
        tx::abort(self)
    }

    // ---- raw access (crate-internal) ----

    #[inline]
    fn check_extent(&self, offset: u64, len: u64, size: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(EmberError::OutOfBounds {
                offset,
                len,
                size,
            }),
        }
    }

    #[inline]
    pub(crate) fn read_abs(&self, offset: u64, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() as u64 <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    #[inline]
    pub(crate) fn write_abs_raw(&self, offset: u64, data: &[u8]) {
        debug_assert!(offset + data.len() as u64 <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add(offset as usize),
                data.len(),
            );
        }
    }

    #[inline]
    pub(crate) fn read_u64_abs(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_abs(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    #[inline]
    pub(crate) fn write_u64_abs_raw(&self, offset: u64, value: u64) {
        self.write_abs_raw(offset, &value.to_le_bytes());
    }

    /// Undo-logging write: records the overwritten bytes when a transaction
    /// scope is active, otherwise writes through and flushes immediately.
    pub(crate) fn write_abs(&self, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(txid) = tx::current(self) {
            let mut old = vec![0u8; data.len()];
            self.read_abs(offset, &mut old);
            tx::on_write(self, txid, offset, old)?;
            self.write_abs_raw(offset, data);
            Ok(())
        } else {
            self.write_abs_raw(offset, data);
            self.flush_abs(offset, data.len() as u64)
        }
    }

    pub(crate) fn flush_abs(&self, offset: u64, len: u64) -> Result<()> {
        if self.sync_writes {
            self.map.flush_range(offset as usize, len as usize)?;
        } else {
            self.map.flush_async_range(offset as usize, len as usize)?;
        }
        Ok(())
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let _ = self.map.flush();
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("path", &self.path)
            .field("size", &self.len)
            .field("id", &self.pool_id)
            .finish()
    }
}
