//! `MemStore` - in-memory `BlockStore`.
//!
//! Sparse: the image is a map of fixed-size chunks allocated on first
//! write. Holes read as zeros and write-zeroes drops whole chunks.
//! Faults can be injected per operation kind for error-path tests.

use std::collections::HashMap;
use std::sync::Mutex;

use rbdshim_core::{BlockStore, OpKind, RbdError, Result};

const CHUNK: u64 = 64 * 1024;

type Chunk = Box<[u8]>;

struct Fault {
    kind: OpKind,
    errno: i32,
    remaining: u32,
}

#[derive(Default)]
pub struct MemStore {
    chunks: Mutex<HashMap<u64, Chunk>>,
    faults: Mutex<Vec<Fault>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations of `kind` with `errno`.
    ///
    /// Write-zeroes faults also catch discards, which lower to it.
    pub fn inject_fault(&self, kind: OpKind, errno: i32, count: u32) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.push(Fault { kind, errno, remaining: count });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Chunks currently allocated.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn check_fault(&self, kind: OpKind) -> Result<()> {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        let Some(pos) = faults.iter().position(|f| f.kind == kind) else {
            return Ok(());
        };
        let errno = faults[pos].errno;
        faults[pos].remaining = faults[pos].remaining.saturating_sub(1);
        if faults[pos].remaining == 0 {
            faults.remove(pos);
        }
        Err(RbdError::Backing(errno))
    }
}

/// Split `[offset, offset+len)` into (chunk index, offset in chunk, length).
fn chunk_spans(offset: u64, len: u64) -> impl Iterator<Item = (u64, usize, usize)> {
    let end = offset + len;
    let mut pos = offset;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let idx = pos / CHUNK;
        let within = pos % CHUNK;
        let n = (CHUNK - within).min(end - pos);
        pos += n;
        Some((idx, within as usize, n as usize))
    })
}

impl BlockStore for MemStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_fault(OpKind::Read)?;
        let chunks = self.chunks.lock().unwrap_or_else(|p| p.into_inner());
        let mut done = 0usize;
        for (idx, within, n) in chunk_spans(offset, buf.len() as u64) {
            let dst = &mut buf[done..done + n];
            match chunks.get(&idx) {
                Some(chunk) => dst.copy_from_slice(&chunk[within..within + n]),
                None => dst.fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_fault(OpKind::Write)?;
        let mut chunks = self.chunks.lock().unwrap_or_else(|p| p.into_inner());
        let mut done = 0usize;
        for (idx, within, n) in chunk_spans(offset, data.len() as u64) {
            let chunk = chunks
                .entry(idx)
                .or_insert_with(|| vec![0u8; CHUNK as usize].into_boxed_slice());
            chunk[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn write_zeroes(&self, offset: u64, len: u64) -> Result<()> {
        self.check_fault(OpKind::WriteZeroes)?;
        let mut chunks = self.chunks.lock().unwrap_or_else(|p| p.into_inner());
        for (idx, within, n) in chunk_spans(offset, len) {
            if n as u64 == CHUNK {
                chunks.remove(&idx);
            } else if let Some(chunk) = chunks.get_mut(&idx) {
                chunk[within..within + n].fill(0);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_fault(OpKind::Flush)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
