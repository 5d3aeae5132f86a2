//! Backing store abstraction.
//!
//! Two layers:
//!
//! - [`BlockStore`]: a synchronous positional store (`pread`/`pwrite`
//!   shaped). Simple to implement, may block.
//! - [`BackingStore`]: the asynchronous adapter the completion engine
//!   talks to. `submit()` queues an operation and returns; the store calls
//!   the supplied callback exactly once, from whatever thread resolves it.
//!
//! # Implementors
//!
//! - `WorkerStore<S: BlockStore>` (default): runs a `BlockStore` on a fixed
//!   pool of worker threads.
//! - `UringStore` (feature = "io-uring", Linux): file-backed, one io_uring
//!   driven by a ring thread.
//! - `ManualStore` (feature = "test-utils"): parks operations until a test
//!   resolves them.

use std::sync::Arc;

use crate::error::{RbdError, Result};
use crate::request::{IoSegment, OpKind};

/// Callback receiving the store result: bytes transferred, or negative errno.
pub type StoreCallback = Box<dyn FnOnce(i64) + Send + 'static>;

/// An operation as seen by a backing store.
///
/// Write-same and discard never reach a store: the dispatch layer lowers
/// them to `Write` and `WriteZeroes`.
#[derive(Debug)]
pub enum StoreOp {
    Read { offset: u64, segments: Vec<IoSegment> },
    Write { offset: u64, segments: Vec<IoSegment> },
    WriteZeroes { offset: u64, len: u64 },
    Flush,
}

impl StoreOp {
    pub fn kind(&self) -> OpKind {
        match self {
            StoreOp::Read { .. } => OpKind::Read,
            StoreOp::Write { .. } => OpKind::Write,
            StoreOp::WriteZeroes { .. } => OpKind::WriteZeroes,
            StoreOp::Flush => OpKind::Flush,
        }
    }

    /// Bytes the operation covers (0 for flush).
    pub fn len(&self) -> u64 {
        match self {
            StoreOp::Read { segments, .. } | StoreOp::Write { segments, .. } => {
                crate::request::total_len(segments).unwrap_or(u64::MAX)
            }
            StoreOp::WriteZeroes { len, .. } => *len,
            StoreOp::Flush => 0,
        }
    }
}

/// Synchronous positional storage.
///
/// **Contract:** offsets and lengths have already been validated against
/// the image size by the dispatch layer.
pub trait BlockStore: Send + Sync {
    /// Fill `buf` from `offset`. Unwritten ranges read as zeros.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Zero `len` bytes at `offset`. Default: writes a zero buffer in chunks.
    fn write_zeroes(&self, offset: u64, len: u64) -> Result<()> {
        const CHUNK: u64 = 64 * 1024;
        let zeros = vec![0u8; CHUNK.min(len) as usize];
        let mut done = 0u64;
        while done < len {
            let n = CHUNK.min(len - done) as usize;
            self.write_at(offset + done, &zeros[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// Make every completed write durable.
    fn flush(&self) -> Result<()>;

    /// Store name for diagnostics.
    fn name(&self) -> &'static str;
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }
    fn write_zeroes(&self, offset: u64, len: u64) -> Result<()> {
        (**self).write_zeroes(offset, len)
    }
    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Execute one operation against a synchronous store.
///
/// Returns the byte count on success or a negative errno, the value a
/// [`StoreCallback`] expects.
///
/// # Safety
/// Segment pointers in `op` must be valid for the duration of the call
/// (reads: writable and unaliased).
pub unsafe fn run_block_op<S: BlockStore + ?Sized>(store: &S, op: &StoreOp) -> i64 {
    let outcome: Result<u64> = match op {
        StoreOp::Read { offset, segments } => {
            let mut pos = *offset;
            segments
                .iter()
                .try_for_each(|seg| {
                    store.read_at(pos, seg.as_mut_slice())?;
                    pos += seg.len as u64;
                    Ok::<(), RbdError>(())
                })
                .map(|_| pos - *offset)
        }
        StoreOp::Write { offset, segments } => {
            let mut pos = *offset;
            segments
                .iter()
                .try_for_each(|seg| {
                    store.write_at(pos, seg.as_slice())?;
                    pos += seg.len as u64;
                    Ok::<(), RbdError>(())
                })
                .map(|_| pos - *offset)
        }
        StoreOp::WriteZeroes { offset, len } => store.write_zeroes(*offset, *len).map(|_| *len),
        StoreOp::Flush => store.flush().map(|_| 0),
    };
    match outcome {
        Ok(n) => n as i64,
        Err(e) => -(e.errno() as i64),
    }
}

/// Asynchronous backing store adapter.
///
/// **Contract:**
/// - `submit()` must NEVER block on I/O. It queues the operation.
/// - `done` is called exactly once, with bytes transferred or negative
///   errno. It may run on any thread, including (for trivial stores)
///   the submitting one.
/// - Stores do not retry; the result is reported verbatim.
/// - Ordering between operations is not guaranteed. The engine holds a
///   flush back until every earlier write has resolved.
pub trait BackingStore: Send + Sync {
    /// Queue an operation.
    fn submit(&self, op: StoreOp, done: StoreCallback);

    /// Operations submitted but not yet resolved.
    fn inflight(&self) -> usize;

    /// Store name for diagnostics.
    fn name(&self) -> &'static str;

    /// Stop accepting work and resolve what is queued.
    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecStore(Mutex<Vec<u8>>);

    impl BlockStore for VecStore {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let v = self.0.lock().unwrap();
            let o = offset as usize;
            buf.copy_from_slice(&v[o..o + buf.len()]);
            Ok(())
        }
        fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
            let mut v = self.0.lock().unwrap();
            let o = offset as usize;
            v[o..o + data.len()].copy_from_slice(data);
            Ok(())
        }
        fn flush(&self) -> Result<()> {
            Err(RbdError::Backing(libc::EIO))
        }
        fn name(&self) -> &'static str {
            "vec"
        }
    }

    #[test]
    fn test_run_block_op_scatter_gather() {
        let store = VecStore(Mutex::new(vec![0u8; 32]));
        let a = [1u8; 4];
        let b = [2u8; 4];
        let op = StoreOp::Write {
            offset: 8,
            segments: vec![IoSegment::from_slice(&a), IoSegment::from_slice(&b)],
        };
        assert_eq!(unsafe { run_block_op(&store, &op) }, 8);

        let mut out = [0u8; 8];
        let op = StoreOp::Read { offset: 8, segments: vec![IoSegment::from_mut_slice(&mut out)] };
        assert_eq!(unsafe { run_block_op(&store, &op) }, 8);
        assert_eq!(out, [1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_default_write_zeroes() {
        let store = VecStore(Mutex::new(vec![9u8; 16]));
        let op = StoreOp::WriteZeroes { offset: 4, len: 8 };
        assert_eq!(unsafe { run_block_op(&store, &op) }, 8);
        let v = store.0.lock().unwrap();
        assert_eq!(&v[..4], &[9; 4]);
        assert_eq!(&v[4..12], &[0; 8]);
        assert_eq!(&v[12..], &[9; 4]);
    }

    #[test]
    fn test_failure_is_negative_errno() {
        let store = VecStore(Mutex::new(vec![]));
        assert_eq!(unsafe { run_block_op(&store, &StoreOp::Flush) }, -(libc::EIO as i64));
    }
}
