//! Image sessions.
//!
//! An `Image` is one open handle: fixed size and object order, a shared
//! backing store, the flush barrier for this handle, the ready queue
//! feeding `poll_io_events`, and at most one notification target.
//! Different images share nothing mutable, so they never serialize one
//! another.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};

use crossbeam_queue::SegQueue;
use rbdshim_core::{
    kdebug, ktrace, kwarn, BackingStore, ImageId, Notifier, OpKind, PoolId, RbdError, Request, Result,
};

use crate::completion::Completion;
use crate::dispatch::{self, Lowered};
use crate::flush::FlushBarrier;

/// Resolves an issued request with bytes transferred or negative errno.
pub type DoneFn = Box<dyn FnOnce(i64) + Send + 'static>;

thread_local! {
    /// Images whose results this thread is delivering, innermost last.
    static DELIVERING: RefCell<Vec<ImageId>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as delivering a result for one image.
struct DeliveryScope(ImageId);

impl DeliveryScope {
    fn enter(image: ImageId) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(image));
        Self(image)
    }

    /// Requests of `image` this thread is in the middle of delivering.
    fn depth(image: ImageId) -> usize {
        DELIVERING.with(|d| d.borrow().iter().filter(|&&i| i == image).count())
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|&i| i == self.0) {
                d.remove(pos);
            }
        });
    }
}

/// Geometry reported by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub size: u64,
    pub obj_size: u64,
    pub num_objs: u64,
    pub order: u8,
}

impl ImageInfo {
    pub fn new(size: u64, order: u8) -> Self {
        let obj_size = 1u64 << order;
        Self { size, obj_size, num_objs: size.div_ceil(obj_size), order }
    }
}

pub struct Image {
    id: ImageId,
    pool: PoolId,
    name: String,
    snapshot: Option<String>,
    info: ImageInfo,
    store: Arc<dyn BackingStore>,
    barrier: FlushBarrier,
    ready: SegQueue<Arc<Completion>>,
    notifier: RwLock<Option<Box<dyn Notifier>>>,
    /// Requests issued and not yet resolved.
    inflight: Mutex<usize>,
    drained: Condvar,
    closing: AtomicBool,
}

impl Image {
    pub(crate) fn new(
        id: ImageId,
        pool: PoolId,
        name: &str,
        snapshot: Option<&str>,
        info: ImageInfo,
        store: Arc<dyn BackingStore>,
    ) -> Self {
        Self {
            id,
            pool,
            name: name.to_owned(),
            snapshot: snapshot.map(str::to_owned),
            info,
            store,
            barrier: FlushBarrier::new(),
            ready: SegQueue::new(),
            notifier: RwLock::new(None),
            inflight: Mutex::new(0),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// Snapshot-bound handles never accept mutations.
    pub fn is_read_only(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn info(&self) -> ImageInfo {
        self.info
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn inflight(&self) -> usize {
        *self.inflight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Validate `req` without issuing it.
    pub fn check(&self, req: &Request) -> Result<()> {
        if self.is_closing() {
            return Err(RbdError::Shutdown);
        }
        dispatch::validate(req, self.info.size, self.is_read_only())
    }

    /// Validate and forward a request; `on_done` receives the result.
    ///
    /// Errors are returned synchronously and `on_done` is then dropped
    /// without being called. Otherwise `on_done` runs exactly once, on
    /// whichever thread resolves the request.
    ///
    /// # Safety
    /// Segment memory in `req` must stay valid (and, for reads, unaliased)
    /// until `on_done` runs.
    pub unsafe fn issue(self: &Arc<Self>, req: Request, on_done: DoneFn) -> Result<()> {
        dispatch::validate(&req, self.info.size, self.is_read_only())?;
        self.inflight_begin()?;

        let kind = req.kind;
        ktrace!("{} issue {} off={} len={}", self.id, kind.name(), req.offset, req.len);
        let Lowered { op, reported, pattern } = dispatch::lower(req);

        let id = self.id;
        let deliver = move |result: i64| {
            drop(pattern);
            let _scope = DeliveryScope::enter(id);
            on_done(if result < 0 { result } else { reported });
        };
        let image = Arc::clone(self);

        match kind {
            OpKind::Flush => {
                let store = Arc::clone(&self.store);
                self.barrier.flush(Box::new(move |earlier| match earlier {
                    Some(err) => {
                        deliver(err);
                        image.inflight_end();
                    }
                    None => store.submit(
                        op,
                        Box::new(move |result| {
                            deliver(result);
                            image.inflight_end();
                        }),
                    ),
                }));
            }
            k if k.is_ordered_by_flush() => {
                let seq = self.barrier.write_begin();
                self.store.submit(
                    op,
                    Box::new(move |result| {
                        deliver(result);
                        image.barrier.write_end(seq, result);
                        image.inflight_end();
                    }),
                );
            }
            _ => self.store.submit(
                op,
                Box::new(move |result| {
                    deliver(result);
                    image.inflight_end();
                }),
            ),
        }
        Ok(())
    }

    /// Issue and block for the result: bytes (or 0 for flush).
    ///
    /// # Safety
    /// As [`issue`](Self::issue); the memory only has to outlive this call.
    pub unsafe fn issue_sync(self: &Arc<Self>, req: Request) -> Result<i64> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.issue(
            req,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )?;
        match rx.recv() {
            Ok(r) if r < 0 => Err(RbdError::from_errno(r)),
            Ok(r) => Ok(r),
            // The store dropped the callback without calling it.
            Err(_) => Err(RbdError::Backing(libc::EIO)),
        }
    }

    fn inflight_begin(&self) -> Result<()> {
        let mut n = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_closing() {
            return Err(RbdError::Shutdown);
        }
        *n += 1;
        Ok(())
    }

    fn inflight_end(&self) {
        let mut n = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        *n = n.saturating_sub(1);
        self.drained.notify_all();
    }

    /// Reject new requests and block until every issued one has resolved.
    ///
    /// Called from a completion callback of this image, the requests the
    /// calling thread is delivering are not waited for.
    /// Only the first close proceeds; later ones fail with `BadHandle`.
    pub(crate) fn close(&self) -> Result<()> {
        let own = DeliveryScope::depth(self.id);
        let mut n = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(RbdError::BadHandle);
        }
        if *n > own {
            kdebug!("{} close: draining {} requests", self.id, *n - own);
        }
        while *n > own {
            n = self.drained.wait(n).unwrap_or_else(|p| p.into_inner());
        }
        drop(n);
        self.set_notifier(None);
        Ok(())
    }

    /// Register (or with `None`, clear) the notification target.
    pub fn set_notifier(&self, notifier: Option<Box<dyn Notifier>>) -> Option<Box<dyn Notifier>> {
        let mut slot = self.notifier.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *slot, notifier)
    }

    /// Queue a ready completion for polling and signal the target.
    ///
    /// Nothing is queued while no target is registered: without an event
    /// loop nobody drains the queue.
    pub(crate) fn push_ready(&self, comp: Arc<Completion>) {
        let slot = self.notifier.read().unwrap_or_else(|p| p.into_inner());
        let Some(notifier) = slot.as_ref() else {
            return;
        };
        self.ready.push(comp);
        if let Err(e) = notifier.notify() {
            kwarn!("{} notify fd {} failed: {}", self.id, notifier.fd(), e);
        }
    }

    /// Take up to `max` ready completions not yet delivered.
    pub(crate) fn poll_ready(&self, max: usize) -> Vec<Arc<Completion>> {
        let mut out = Vec::with_capacity(max.min(64));
        while out.len() < max {
            let Some(comp) = self.ready.pop() else { break };
            // Skip objects the caller released before polling.
            if comp.mark_delivered() {
                out.push(comp);
            }
        }
        out
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("snapshot", &self.snapshot)
            .field("info", &self.info)
            .field("store", &self.store.name())
            .finish()
    }
}
