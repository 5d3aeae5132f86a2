//! `WorkerStore` - default `BackingStore` implementation.
//!
//! Runs a synchronous [`BlockStore`] on N named OS threads. `submit()`
//! pushes onto a lock-free MPMC queue and unparks one worker; the worker
//! executes the operation (it MAY block; that is the point) and calls the
//! completion callback on its own thread.
//!
//! No dynamic scaling. Shutdown drains the queue before joining.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use rbdshim_core::store::run_block_op;
use rbdshim_core::{kerror, ktrace, BackingStore, BlockStore, StoreCallback, StoreOp};

const MAX_WORKERS: usize = 32;

/// A queued operation plus the callback that resolves it.
struct Job {
    op: StoreOp,
    done: StoreCallback,
}

/// Shared state between submitters and workers.
struct PoolInner<S> {
    store: S,
    jobs: SegQueue<Job>,
    /// Submitted and not yet resolved.
    inflight: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct WorkerStore<S: BlockStore + 'static> {
    inner: Arc<PoolInner<S>>,
    threads: Vec<thread::Thread>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next_wake: AtomicUsize,
}

impl<S: BlockStore + 'static> WorkerStore<S> {
    /// Start `n` workers over `store`; `0` picks a size from the CPU count.
    pub fn new(store: S, n: usize) -> std::io::Result<Self> {
        let n = if n == 0 { Self::auto_size() } else { n.min(MAX_WORKERS) };
        let inner = Arc::new(PoolInner {
            store,
            jobs: SegQueue::new(),
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("rbdshim-{}-{}", inner.store.name(), worker_id))
                .spawn(move || worker_loop(inner))?;
            handles.push(handle);
        }
        let threads = handles.iter().map(|h| h.thread().clone()).collect();

        Ok(WorkerStore { inner, threads, handles: Mutex::new(handles), next_wake: AtomicUsize::new(0) })
    }

    /// min(8, nproc/2), at least 2.
    pub fn auto_size() -> usize {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        (cpus / 2).clamp(2, 8)
    }

    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// The wrapped synchronous store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }
}

impl<S: BlockStore + 'static> BackingStore for WorkerStore<S> {
    fn submit(&self, op: StoreOp, done: StoreCallback) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            done(-(libc::ESHUTDOWN as i64));
            return;
        }
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        self.inner.jobs.push(Job { op, done });
        let i = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].unpark();
    }

    fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        self.inner.store.name()
    }

    fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for t in &self.threads {
            t.unpark();
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        let me = thread::current().id();
        for h in handles {
            // A callback running on a worker may drop the last image reference.
            if h.thread().id() == me {
                continue;
            }
            if h.join().is_err() {
                kerror!("{} worker panicked", self.inner.store.name());
            }
        }
        // Lost the race with a submit that saw the flag clear.
        while let Some(job) = self.inner.jobs.pop() {
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
            (job.done)(-(libc::ESHUTDOWN as i64));
        }
    }
}

impl<S: BlockStore + 'static> Drop for WorkerStore<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread main loop. Exits once shut down and the queue is empty.
fn worker_loop<S: BlockStore>(inner: Arc<PoolInner<S>>) {
    loop {
        match inner.jobs.pop() {
            Some(job) => {
                ktrace!("{} {} len={}", inner.store.name(), job.op.kind().name(), job.op.len());
                // Safety: the engine keeps segment memory alive until `done`.
                let result = unsafe { run_block_op(&inner.store, &job.op) };
                drop(job.op);
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
                (job.done)(result);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                // Woken by unpark on submit; the timeout covers a missed wake.
                thread::park_timeout(Duration::from_millis(5));
            }
        }
    }
}
