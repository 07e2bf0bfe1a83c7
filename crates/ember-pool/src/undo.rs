//! Undo-log record framing and recovery scan.

use bytes::{BufMut, BytesMut};
use ember_common::Result;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Types of undo-log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    /// Overwritten bytes to restore on rollback.
    Undo = 1,
    /// Block allocated by the transaction (offset field holds the handle).
    Alloc = 2,
    /// Transaction commit marker.
    Commit = 3,
}

/// Record format on disk:
/// - record_type: 1 byte
/// - txid: 8 bytes
/// - offset: 8 bytes
/// - payload_len: 4 bytes
/// - payload: variable
/// - checksum: 4 bytes (CRC32 of header + payload)
const HEADER_SIZE: usize = 21;
const CHECKSUM_SIZE: usize = 4;
/// Upper bound on a single undo payload; anything larger is a torn record.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct LogRecord {
    pub(crate) rtype: RecordType,
    pub(crate) txid: u64,
    pub(crate) offset: u64,
    pub(crate) payload: Vec<u8>,
}

/// Returns the undo-log path for a pool file.
pub(crate) fn log_path(pool_path: &Path) -> PathBuf {
    let mut os = pool_path.as_os_str().to_owned();
    os.push(".undo");
    PathBuf::from(os)
}

fn encode(rtype: RecordType, txid: u64, offset: u64, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    buf.put_u8(rtype as u8);
    buf.put_u64_le(txid);
    buf.put_u64_le(offset);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf
}

/// Parses records until the end of the buffer or the first torn/corrupt
/// record; the valid prefix is everything recovery can rely on.
fn parse_records(mut data: &[u8]) -> Vec<LogRecord> {
    let mut records = Vec::new();
    while data.len() >= HEADER_SIZE + CHECKSUM_SIZE {
        let rtype = match data[0] {
            1 => RecordType::Undo,
            2 => RecordType::Alloc,
            3 => RecordType::Commit,
            _ => break,
        };
        let txid = u64::from_le_bytes(data[1..9].try_into().unwrap());
        let offset = u64::from_le_bytes(data[9..17].try_into().unwrap());
        let payload_len = u32::from_le_bytes(data[17..21].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD {
            break;
        }
        let total = HEADER_SIZE + payload_len + CHECKSUM_SIZE;
        if data.len() < total {
            break;
        }
        let stored = u32::from_le_bytes(data[total - CHECKSUM_SIZE..total].try_into().unwrap());
        if stored != crc32fast::hash(&data[..HEADER_SIZE + payload_len]) {
            break;
        }
        records.push(LogRecord {
            rtype,
            txid,
            offset,
            payload: data[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
        });
        data = &data[total..];
    }
    records
}

/// Reads and parses the undo log at `path`; a missing file means no log.
pub(crate) fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    match std::fs::read(path) {
        Ok(data) => Ok(parse_records(&data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Append-only undo log shared by every transaction scope of a pool.
///
/// The log is truncated whenever no scope is active, so steady state keeps
/// it empty; its contents only matter to crash recovery.
pub(crate) struct UndoLog {
    file: File,
    active: HashSet<u64>,
    sync_writes: bool,
}

impl UndoLog {
    pub(crate) fn create(path: &Path, sync_writes: bool) -> Result<UndoLog> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(UndoLog {
            file,
            active: HashSet::new(),
            sync_writes,
        })
    }

    pub(crate) fn begin(&mut self, txid: u64) {
        self.active.insert(txid);
    }

    fn append(&mut self, rtype: RecordType, txid: u64, offset: u64, payload: &[u8]) -> Result<()> {
        let buf = encode(rtype, txid, offset, payload);
        self.file.write_all(&buf)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub(crate) fn record_undo(&mut self, txid: u64, offset: u64, old: &[u8]) -> Result<()> {
        self.append(RecordType::Undo, txid, offset, old)
    }

    pub(crate) fn record_alloc(&mut self, txid: u64, handle: u64) -> Result<()> {
        self.append(RecordType::Alloc, txid, handle, &[])
    }

    pub(crate) fn record_commit(&mut self, txid: u64) -> Result<()> {
        self.append(RecordType::Commit, txid, 0, &[])
    }

    /// Retires a transaction; truncates the log once no scope is active.
    pub(crate) fn finish(&mut self, txid: u64) -> Result<()> {
        self.active.remove(&txid);
        if self.active.is_empty() {
            self.file.set_len(0)?;
            self.file.seek(SeekFrom::Start(0))?;
            if self.sync_writes {
                self.file.sync_data()?;
            }
        }
        Ok(())
    }
}
