// Append-only value log. Records are framed as `[len][crc32][payload]`
// inside fixed-size chunks; a record never straddles a chunk boundary
// (the writer skips the remainder and starts at the next chunk instead).
// Addresses handed out by `append` are byte offsets in the logical log
// and stay valid for the lifetime of the log.

use std::cell::UnsafeCell;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub type LogAddress = u64;

/// `len: u32` followed by `crc: u32`.
pub const RECORD_HEADER_SIZE: u64 = 8;

#[derive(Debug, Clone)]
pub struct ValueLogOptions {
    /// Size of one chunk; also the upper bound on a single record.
    pub chunk_size: u64,
    /// Total logical capacity across all chunks.
    pub capacity: u64,
    /// When set, chunks are persisted here on flush/drop and reloaded on
    /// open.
    pub dir: Option<PathBuf>,
}

impl Default for ValueLogOptions {
    fn default() -> Self {
        Self {
            chunk_size: 16 << 20,
            capacity: 1 << 30,
            dir: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogMeta {
    chunk_size: u64,
    capacity: u64,
    tail: u64,
}

struct Chunk {
    data: UnsafeCell<Box<[u8]>>,
}

// Writers touch disjoint claimed regions, readers only touch regions
// published through an index entry; see `append` for the claim protocol.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn zeroed(size: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: UnsafeCell::new(bytes.into_boxed_slice()),
        }
    }

    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    fn len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }
}

pub struct ValueLog {
    opts: ValueLogOptions,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    tail: AtomicU64,
    grow_lock: Mutex<()>,
    // Serializes in-place field updates so the record checksum stays
    // coherent with the payload.
    update_lock: Mutex<()>,
    appended: AtomicU64,
}

impl ValueLog {
    pub fn open(opts: ValueLogOptions) -> Result<Self> {
        assert!(opts.chunk_size > RECORD_HEADER_SIZE, "chunk size too small");

        if let Some(dir) = &opts.dir {
            fs::create_dir_all(dir)?;
            let meta_path = dir.join("log.meta.json");
            if meta_path.exists() {
                return Self::reopen(opts.clone(), &meta_path);
            }
        }

        Ok(Self {
            opts,
            chunks: RwLock::new(Vec::new()),
            tail: AtomicU64::new(0),
            grow_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
            appended: AtomicU64::new(0),
        })
    }

    fn reopen(opts: ValueLogOptions, meta_path: &std::path::Path) -> Result<Self> {
        let raw = fs::read_to_string(meta_path)?;
        let meta: LogMeta = serde_json::from_str(&raw).map_err(|e| Error::Corruption {
            addr: 0,
            detail: format!("unreadable log metadata: {e}"),
        })?;

        let dir = opts.dir.as_ref().expect("reopen requires a directory");
        let mut chunks = Vec::new();
        loop {
            let path = dir.join(format!("chunk_{}.vlog", chunks.len()));
            if !path.exists() {
                break;
            }
            let mut bytes = Vec::with_capacity(meta.chunk_size as usize);
            fs::File::open(&path)?.read_to_end(&mut bytes)?;
            if bytes.len() as u64 != meta.chunk_size {
                return Err(Error::Corruption {
                    addr: 0,
                    detail: format!("chunk file {} has wrong size", path.display()),
                });
            }
            chunks.push(Arc::new(Chunk::from_bytes(bytes)));
        }
        debug!(
            "reopened value log: {} chunks, tail at {}",
            chunks.len(),
            meta.tail
        );

        Ok(Self {
            opts: ValueLogOptions {
                chunk_size: meta.chunk_size,
                capacity: meta.capacity,
                dir: opts.dir,
            },
            chunks: RwLock::new(chunks),
            tail: AtomicU64::new(meta.tail),
            grow_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
            appended: AtomicU64::new(0),
        })
    }

    /// Append a record and return its address. The claim is a CAS on the
    /// tail; when the record would straddle a chunk boundary the claim
    /// skips to the next chunk start.
    pub fn append(&self, payload: &[u8]) -> Result<LogAddress> {
        let chunk_size = self.opts.chunk_size;
        let need = RECORD_HEADER_SIZE + payload.len() as u64;
        if need > chunk_size {
            return Err(Error::RecordTooLarge {
                size: payload.len(),
                max: (chunk_size - RECORD_HEADER_SIZE) as usize,
            });
        }

        let mut cur = self.tail.load(Ordering::Relaxed);
        let start = loop {
            let in_chunk = cur % chunk_size;
            let start = if in_chunk + need > chunk_size {
                cur - in_chunk + chunk_size
            } else {
                cur
            };
            if start + need > self.opts.capacity {
                return Err(Error::LogFull);
            }
            match self.tail.compare_exchange_weak(
                cur,
                start + need,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break start,
                Err(actual) => cur = actual,
            }
        };

        let chunk = self.chunk_for(start / chunk_size)?;
        let offset = (start % chunk_size) as usize;
        let crc = crc32fast::hash(payload);
        unsafe {
            let base = chunk.ptr().add(offset);
            ptr::write_unaligned(base as *mut u32, payload.len() as u32);
            ptr::write_unaligned(base.add(4) as *mut u32, crc);
            ptr::copy_nonoverlapping(payload.as_ptr(), base.add(8), payload.len());
        }
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(start)
    }

    /// Read the record at `addr`, verifying its checksum.
    pub fn read(&self, addr: LogAddress) -> Result<Vec<u8>> {
        let chunk_size = self.opts.chunk_size;
        let in_chunk = addr % chunk_size;
        if addr + RECORD_HEADER_SIZE > self.tail.load(Ordering::Acquire)
            || in_chunk + RECORD_HEADER_SIZE > chunk_size
        {
            return Err(Error::Corruption {
                addr,
                detail: "address beyond log tail".into(),
            });
        }

        let chunk = self.chunk_for(addr / chunk_size)?;
        let offset = in_chunk as usize;
        unsafe {
            let base = chunk.ptr().add(offset);
            let len = ptr::read_unaligned(base as *const u32) as u64;
            if in_chunk + RECORD_HEADER_SIZE + len > chunk_size {
                return Err(Error::Corruption {
                    addr,
                    detail: format!("record length {len} overruns chunk"),
                });
            }
            let stored_crc = ptr::read_unaligned(base.add(4) as *const u32);
            let mut payload = vec![0u8; len as usize];
            ptr::copy_nonoverlapping(base.add(8), payload.as_mut_ptr(), len as usize);
            let crc = crc32fast::hash(&payload);
            if crc != stored_crc {
                return Err(Error::Corruption {
                    addr,
                    detail: format!("checksum mismatch: stored {stored_crc:#x}, computed {crc:#x}"),
                });
            }
            Ok(payload)
        }
    }

    /// Update `bytes` at `field_offset` within the payload of the record
    /// at `addr`, restamping the checksum.
    pub fn write_at(&self, addr: LogAddress, field_offset: usize, bytes: &[u8]) -> Result<()> {
        let _guard = self.update_lock.lock();
        let chunk_size = self.opts.chunk_size;
        let in_chunk = (addr % chunk_size) as usize;
        let chunk = self.chunk_for(addr / chunk_size)?;
        unsafe {
            let base = chunk.ptr().add(in_chunk);
            let len = ptr::read_unaligned(base as *const u32) as usize;
            if field_offset + bytes.len() > len {
                return Err(Error::SizeMismatch {
                    got: field_offset + bytes.len(),
                    want: len,
                });
            }
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(8 + field_offset), bytes.len());
            let payload = std::slice::from_raw_parts(base.add(8), len);
            let crc = crc32fast::hash(payload);
            ptr::write_unaligned(base.add(4) as *mut u32, crc);
        }
        Ok(())
    }

    fn chunk_for(&self, idx: u64) -> Result<Arc<Chunk>> {
        let idx = idx as usize;
        {
            let chunks = self.chunks.read();
            if let Some(chunk) = chunks.get(idx) {
                return Ok(chunk.clone());
            }
        }
        let _guard = self.grow_lock.lock();
        let mut chunks = self.chunks.write();
        while chunks.len() <= idx {
            chunks.push(Arc::new(Chunk::zeroed(self.opts.chunk_size as usize)));
        }
        Ok(chunks[idx].clone())
    }

    /// Persist chunks and metadata. A no-op without a configured
    /// directory.
    pub fn flush(&self) -> Result<()> {
        let Some(dir) = &self.opts.dir else {
            return Ok(());
        };
        let chunks = self.chunks.read();
        for (idx, chunk) in chunks.iter().enumerate() {
            let path = dir.join(format!("chunk_{idx}.vlog"));
            let mut file = fs::File::create(&path)?;
            let bytes = unsafe { std::slice::from_raw_parts(chunk.ptr(), chunk.len()) };
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        let meta = LogMeta {
            chunk_size: self.opts.chunk_size,
            capacity: self.opts.capacity,
            tail: self.tail.load(Ordering::Acquire),
        };
        let raw = serde_json::to_string(&meta).expect("log metadata serializes");
        let meta_path = dir.join("log.meta.json");
        let mut file = fs::File::create(&meta_path)?;
        file.write_all(raw.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn append_count(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }
}

impl Drop for ValueLog {
    fn drop(&mut self) {
        if self.opts.dir.is_some() {
            if let Err(e) = self.flush() {
                warn!("value log flush on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_opts() -> ValueLogOptions {
        ValueLogOptions {
            chunk_size: 64,
            capacity: 1024,
            dir: None,
        }
    }

    #[test]
    fn test_append_read_roundtrip() {
        let log = ValueLog::open(small_opts()).unwrap();
        let a = log.append(b"abc123xyz789").unwrap();
        let b = log.append(b"hello").unwrap();
        assert_eq!(log.read(a).unwrap(), b"abc123xyz789");
        assert_eq!(log.read(b).unwrap(), b"hello");
        assert_eq!(log.append_count(), 2);
    }

    #[test]
    fn test_records_never_straddle_chunks() {
        let log = ValueLog::open(small_opts()).unwrap();
        // Each record occupies 8 + 20 = 28 bytes; the third claim would
        // straddle the 64-byte boundary and must skip to chunk 1.
        let payload = [7u8; 20];
        let a0 = log.append(&payload).unwrap();
        let a1 = log.append(&payload).unwrap();
        let a2 = log.append(&payload).unwrap();
        assert_eq!(a0, 0);
        assert_eq!(a1, 28);
        assert_eq!(a2, 64);
        for addr in [a0, a1, a2] {
            assert_eq!(log.read(addr).unwrap(), payload);
        }
    }

    #[test]
    fn test_size_limits() {
        let log = ValueLog::open(small_opts()).unwrap();
        assert!(matches!(
            log.append(&[0u8; 100]),
            Err(Error::RecordTooLarge { .. })
        ));

        let tiny = ValueLog::open(ValueLogOptions {
            chunk_size: 64,
            capacity: 64,
            dir: None,
        })
        .unwrap();
        tiny.append(&[1u8; 40]).unwrap();
        assert!(matches!(tiny.append(&[1u8; 40]), Err(Error::LogFull)));
    }

    #[test]
    fn test_corruption_detected() {
        let log = ValueLog::open(small_opts()).unwrap();
        let addr = log.append(b"payload-bytes").unwrap();
        // Flip one payload byte behind the log's back.
        {
            let chunk = log.chunk_for(0).unwrap();
            unsafe {
                *chunk.ptr().add((addr + RECORD_HEADER_SIZE) as usize) ^= 0xff;
            }
        }
        assert!(matches!(log.read(addr), Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_write_at_restamps_checksum() {
        let log = ValueLog::open(small_opts()).unwrap();
        let addr = log.append(b"aaaabbbbcccc").unwrap();
        log.write_at(addr, 4, b"XXXX").unwrap();
        assert_eq!(log.read(addr).unwrap(), b"aaaaXXXXcccc");

        assert!(matches!(
            log.write_at(addr, 10, b"toolong"),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_reopen_from_directory() {
        let dir = TempDir::new().unwrap();
        let opts = ValueLogOptions {
            chunk_size: 64,
            capacity: 1024,
            dir: Some(dir.path().to_path_buf()),
        };
        let (a, b, tail) = {
            let log = ValueLog::open(opts.clone()).unwrap();
            let a = log.append(b"first-record").unwrap();
            let b = log.append(b"second-record").unwrap();
            log.flush().unwrap();
            (a, b, log.tail())
        };

        let log = ValueLog::open(opts).unwrap();
        assert_eq!(log.tail(), tail);
        assert_eq!(log.read(a).unwrap(), b"first-record");
        assert_eq!(log.read(b).unwrap(), b"second-record");
    }
}
