//! `UringStore` - file-backed `BackingStore` driven by io_uring.
//!
//! One ring per image, owned by a dedicated ring thread. Submitters push
//! jobs onto a lock-free queue; the ring thread turns them into SQEs,
//! calls `io_uring_enter()` and resolves callbacks from the CQ.
//! No SQPOLL, no fixed files, no fixed buffers.
//!
//! Mapping:
//!   Read        → READV  (split at IOV_MAX)
//!   Write       → WRITEV (split at IOV_MAX)
//!   WriteZeroes → FALLOCATE(PUNCH_HOLE | KEEP_SIZE), pwrite of zeros if
//!                 the filesystem cannot punch holes
//!   Flush       → FSYNC(DATASYNC)

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use io_uring::{opcode, types, IoUring};
use rbdshim_core::{kerror, ktrace, kwarn, BackingStore, BlockStore, RbdError, Result, StoreCallback, StoreOp};

use crate::file_store::FileStore;

const IOV_MAX: usize = 1024;

/// How long the ring thread waits in the kernel for a completion.
const WAIT_NS: u32 = 2_000_000;

struct Job {
    op: StoreOp,
    done: StoreCallback,
}

/// Backing storage for READV/WRITEV SQEs.
struct IoVecs(Vec<libc::iovec>);

// Safety: the iovecs point at caller segments, which are Send.
unsafe impl Send for IoVecs {}

/// A job whose SQEs are in the ring.
struct InFlight {
    op: StoreOp,
    done: StoreCallback,
    _iovecs: IoVecs,
    parts: usize,
    expected: u64,
    transferred: u64,
    error: Option<i32>,
}

struct Shared {
    jobs: SegQueue<Job>,
    inflight: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct UringStore {
    shared: Arc<Shared>,
    ring_thread: thread::Thread,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UringStore {
    /// Create a sparse image file and start its ring.
    pub fn create(path: &Path, size: u64, sq_entries: u32) -> Result<Self> {
        let file = FileStore::create(path, size)?;
        Self::start(file, sq_entries)
    }

    /// Adopt an existing image file.
    pub fn open(path: &Path, sq_entries: u32) -> Result<Self> {
        Self::start(FileStore::open(path)?, sq_entries)
    }

    fn start(file: FileStore, sq_entries: u32) -> Result<Self> {
        let ring = IoUring::builder()
            .build(sq_entries.max(1).next_power_of_two())
            .map_err(|e| RbdError::Os(e.raw_os_error().unwrap_or(libc::EIO)))?;
        let shared = Arc::new(Shared {
            jobs: SegQueue::new(),
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let worker = RingWorker {
            ring,
            file,
            shared: Arc::clone(&shared),
            slots: HashMap::new(),
            next_key: 1,
            backlog: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name("rbdshim-uring".into())
            .spawn(move || worker.run())?;
        Ok(Self { shared, ring_thread: handle.thread().clone(), handle: Mutex::new(Some(handle)) })
    }
}

impl BackingStore for UringStore {
    fn submit(&self, op: StoreOp, done: StoreCallback) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            done(-(libc::ESHUTDOWN as i64));
            return;
        }
        self.shared.inflight.fetch_add(1, Ordering::AcqRel);
        self.shared.jobs.push(Job { op, done });
        self.ring_thread.unpark();
    }

    fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "uring"
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ring_thread.unpark();
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(h) = handle {
            if h.thread().id() != thread::current().id() && h.join().is_err() {
                kerror!("uring ring thread panicked");
            }
        }
    }
}

impl Drop for UringStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RingWorker {
    ring: IoUring,
    file: FileStore,
    shared: Arc<Shared>,
    slots: HashMap<u64, InFlight>,
    next_key: u64,
    /// Jobs that did not fit in the SQ.
    backlog: VecDeque<Job>,
}

impl RingWorker {
    fn run(mut self) {
        loop {
            while let Some(job) = self.shared.jobs.pop() {
                self.backlog.push_back(job);
            }
            self.push_backlog();

            if self.slots.is_empty() && self.backlog.is_empty() {
                if self.shared.shutdown.load(Ordering::Acquire) && self.shared.jobs.is_empty() {
                    break;
                }
                thread::park_timeout(Duration::from_millis(5));
                continue;
            }

            let ts = types::Timespec::new().nsec(WAIT_NS);
            let args = types::SubmitArgs::new().timespec(&ts);
            match self.ring.submitter().submit_with_args(1, &args) {
                Ok(_) => {}
                Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)) => {}
                Err(e) => {
                    kerror!("io_uring_enter failed: {}", e);
                    self.fail_all(-(e.raw_os_error().unwrap_or(libc::EIO) as i64));
                    continue;
                }
            }
            self.reap();
        }
    }

    fn push_backlog(&mut self) {
        while let Some(job) = self.backlog.pop_front() {
            match self.prepare(job) {
                Ok(()) => {}
                Err(job) => {
                    self.backlog.push_front(job);
                    break;
                }
            }
        }
    }

    /// Push the SQEs for one job, or hand it back when the SQ lacks room.
    fn prepare(&mut self, job: Job) -> std::result::Result<(), Job> {
        let fd = types::Fd(self.file_fd());
        let key = self.next_key;

        let mut iovecs = Vec::new();
        let sqes: Vec<io_uring::squeue::Entry> = match &job.op {
            StoreOp::Read { offset, segments } | StoreOp::Write { offset, segments } => {
                iovecs = segments
                    .iter()
                    .map(|s| libc::iovec { iov_base: s.ptr as *mut libc::c_void, iov_len: s.len })
                    .collect();
                let is_read = matches!(job.op, StoreOp::Read { .. });
                let mut pos = *offset;
                iovecs
                    .chunks(IOV_MAX)
                    .map(|part| {
                        let n = part.len() as u32;
                        let sqe = if is_read {
                            opcode::Readv::new(fd, part.as_ptr(), n).offset(pos).build()
                        } else {
                            opcode::Writev::new(fd, part.as_ptr(), n).offset(pos).build()
                        };
                        pos += part.iter().map(|v| v.iov_len as u64).sum::<u64>();
                        sqe.user_data(key)
                    })
                    .collect()
            }
            StoreOp::WriteZeroes { offset, len } => {
                if *len == 0 {
                    Vec::new()
                } else {
                    vec![opcode::Fallocate::new(fd, *len)
                        .offset(*offset)
                        .mode(libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE)
                        .build()
                        .user_data(key)]
                }
            }
            StoreOp::Flush => {
                vec![opcode::Fsync::new(fd).flags(types::FsyncFlags::DATASYNC).build().user_data(key)]
            }
        };

        if sqes.is_empty() {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            (job.done)(0);
            return Ok(());
        }

        {
            let mut sq = self.ring.submission();
            if sq.capacity() - sq.len() < sqes.len() {
                drop(sq);
                // A job wider than the whole ring can never fit; run it inline.
                if sqes.len() > self.ring.params().sq_entries() as usize {
                    self.run_inline(job);
                    return Ok(());
                }
                return Err(job);
            }
            for sqe in &sqes {
                // Safety: iovecs and segment buffers stay alive in `slots`
                // until the matching CQEs are reaped.
                if unsafe { sq.push(sqe) }.is_err() {
                    kerror!("SQ push failed after capacity check");
                }
            }
        }

        self.next_key = self.next_key.wrapping_add(1).max(1);
        let expected = job.op.len();
        ktrace!("uring submit {} key={} parts={}", job.op.kind().name(), key, sqes.len());
        self.slots.insert(
            key,
            InFlight {
                op: job.op,
                done: job.done,
                _iovecs: IoVecs(iovecs),
                parts: sqes.len(),
                expected,
                transferred: 0,
                error: None,
            },
        );
        Ok(())
    }

    fn file_fd(&self) -> i32 {
        self.file.file().as_raw_fd()
    }

    fn reap(&mut self) {
        let done: Vec<(u64, i32)> = self.ring.completion().map(|c| (c.user_data(), c.result())).collect();
        for (key, res) in done {
            let Some(slot) = self.slots.get_mut(&key) else {
                kwarn!("uring: completion for unknown key {}", key);
                continue;
            };
            if res < 0 {
                slot.error.get_or_insert(-res);
            } else {
                slot.transferred += res as u64;
            }
            slot.parts -= 1;
            if slot.parts == 0 {
                if let Some(slot) = self.slots.remove(&key) {
                    self.finish(slot);
                }
            }
        }
    }

    fn finish(&self, slot: InFlight) {
        let result = match (&slot.op, slot.error) {
            (StoreOp::WriteZeroes { offset, len }, Some(e)) if e == libc::EOPNOTSUPP => {
                match self.file.write_zeroes(*offset, *len) {
                    Ok(()) => *len as i64,
                    Err(err) => err.to_neg() as i64,
                }
            }
            (_, Some(e)) => -(e as i64),
            (StoreOp::WriteZeroes { len, .. }, None) => *len as i64,
            (StoreOp::Flush, None) => 0,
            (_, None) if slot.transferred != slot.expected => -(libc::EIO as i64),
            (_, None) => slot.transferred as i64,
        };
        self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
        (slot.done)(result);
    }

    fn run_inline(&self, job: Job) {
        // Safety: segment memory is live until `done` runs.
        let result = unsafe { rbdshim_core::store::run_block_op(&self.file, &job.op) };
        self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
        (job.done)(result);
    }

    fn fail_all(&mut self, err: i64) {
        for (_, slot) in self.slots.drain() {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            (slot.done)(err);
        }
        while let Some(job) = self.backlog.pop_front() {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            (job.done)(err);
        }
    }
}
