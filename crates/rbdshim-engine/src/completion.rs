//! Completion objects.
//!
//! One `Completion` tracks one asynchronous operation from creation to
//! release. All state lives behind a single mutex so that attach, resolve
//! and release of the *same* object serialize, while different objects never
//! contend. Waiters block on a per-object condvar.
//!
//! Two references keep an object alive: the caller's, from create to
//! release, and the engine's, from attach until the resolution path is
//! done with it. Whichever drops last reclaims the registry slot.
//!
//! ```text
//! create ──> Pending ──attach──> Pending(attached) ──resolve──> callback ──complete──> Ready ──release──> Released
//!                                      │                                                               ▲
//!                                      └──release (engine ref held)──resolve──callback──complete───────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rbdshim_core::{CompletionId, CompletionState, ImageId, RbdError, Result};

/// User callback: receives the completion's identity and its opaque argument.
///
/// Invoked at most once, on the thread that resolved the operation, with no
/// engine lock held and before any waiter or poller sees the object. It may
/// read the result and release the completion it was handed; waiting on it
/// from inside the callback never returns.
pub type CompletionCallback = Box<dyn FnOnce(CompletionId, usize) + Send + 'static>;

struct Inner {
    state: CompletionState,
    result: i64,
    /// Result recorded; the callback may be running.
    resolved: bool,
    image: Option<ImageId>,
    attached: bool,
    /// The caller gave up its reference.
    caller_released: bool,
    /// Handed out by a poll.
    delivered: bool,
    callback: Option<CompletionCallback>,
}

/// What the resolving thread does once the object is ready.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Completed {
    /// Queue for polling; false when the caller already released.
    pub queue: bool,
    /// The engine held the last reference; drop the registry slot.
    pub reclaim: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    /// The engine still holds the object; it reclaims when done.
    Retained,
    /// Drop the registry slot now.
    Reclaim,
}

pub struct Completion {
    id: CompletionId,
    /// Opaque caller argument (`void *` at the C boundary).
    arg: usize,
    /// Caller reference plus the engine's while attached. Changed under `inner`.
    refs: AtomicU32,
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl Completion {
    pub(crate) fn new(id: CompletionId, arg: usize, callback: Option<CompletionCallback>) -> Self {
        Self {
            id,
            arg,
            refs: AtomicU32::new(1),
            inner: Mutex::new(Inner {
                state: CompletionState::Pending,
                result: 0,
                resolved: false,
                image: None,
                attached: false,
                caller_released: false,
                delivered: false,
                callback,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking user callback never runs under this lock, so poisoning
        // can only come from an engine bug; keep serving the state.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[inline]
    pub fn id(&self) -> CompletionId {
        self.id
    }

    /// The argument regardless of state, for the resolving thread.
    #[inline]
    pub(crate) fn raw_arg(&self) -> usize {
        self.arg
    }

    pub fn state(&self) -> CompletionState {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Image the completion was issued against (weak: just the id).
    pub fn image(&self) -> Option<ImageId> {
        self.lock().image
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    fn check_readable(inner: &Inner) -> Result<()> {
        if inner.caller_released || inner.state.is_released() {
            return Err(RbdError::BadHandle);
        }
        if !inner.resolved {
            return Err(RbdError::NotReady);
        }
        Ok(())
    }

    /// Opaque argument; once the result is recorded.
    pub fn arg(&self) -> Result<usize> {
        Self::check_readable(&self.lock())?;
        Ok(self.arg)
    }

    /// Bytes transferred or negative errno; once the result is recorded,
    /// which includes the callback's own run.
    pub fn result(&self) -> Result<i64> {
        let inner = self.lock();
        Self::check_readable(&inner)?;
        Ok(inner.result)
    }

    /// Bind to the request about to be issued on `image`; takes the
    /// engine's reference.
    pub(crate) fn attach(&self, image: ImageId) -> Result<()> {
        let mut inner = self.lock();
        if inner.state.is_released() || inner.caller_released {
            return Err(RbdError::BadHandle);
        }
        if inner.attached || !inner.state.is_pending() {
            return Err(RbdError::InvalidState("completion already attached"));
        }
        inner.attached = true;
        inner.image = Some(image);
        self.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Undo an attach whose request never reached the store, dropping the
    /// engine's reference.
    ///
    /// Returns true when the caller released in the meantime; the object is
    /// then released here and the registry slot must be reclaimed.
    pub(crate) fn detach(&self) -> bool {
        let mut inner = self.lock();
        if !inner.attached || inner.resolved {
            return false;
        }
        inner.attached = false;
        inner.image = None;
        if self.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            return false;
        }
        inner.state = CompletionState::Released;
        inner.callback = None;
        drop(inner);
        self.ready.notify_all();
        true
    }

    /// Record the result and hand out the callback.
    ///
    /// The object stays pending for waiters and pollers until
    /// [`complete`](Self::complete). A second call for the same object fails
    /// with `InvalidState` and leaves the first result untouched.
    pub(crate) fn resolve(&self, result: i64) -> Result<Option<CompletionCallback>> {
        let mut inner = self.lock();
        if inner.resolved || !inner.state.is_pending() || !inner.attached {
            return Err(RbdError::InvalidState("completion resolved twice"));
        }
        inner.result = result;
        inner.resolved = true;
        Ok(inner.callback.take())
    }

    /// The pending → ready transition, after the callback has returned.
    ///
    /// Drops the engine's reference in the same step, so a waiter that wakes
    /// here and releases reclaims the slot itself.
    pub(crate) fn complete(&self) -> Completed {
        let mut inner = self.lock();
        if !inner.resolved || !inner.state.is_pending() {
            return Completed { queue: false, reclaim: false };
        }
        let queue = !inner.caller_released;
        inner.state = if queue { CompletionState::Ready } else { CompletionState::Released };
        let reclaim = self.refs.fetch_sub(1, Ordering::AcqRel) == 1;
        if reclaim {
            inner.state = CompletionState::Released;
            inner.callback = None;
        }
        drop(inner);
        self.ready.notify_all();
        Completed { queue, reclaim }
    }

    /// Block until ready; returns the result.
    pub fn wait(&self) -> Result<i64> {
        let mut inner = self.lock();
        while inner.state.is_pending() && !inner.caller_released {
            inner = self.ready.wait(inner).unwrap_or_else(|p| p.into_inner());
        }
        match inner.state {
            CompletionState::Ready if !inner.caller_released => Ok(inner.result),
            _ => Err(RbdError::BadHandle),
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound; `Ok(None)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<i64>> {
        let inner = self.lock();
        let (inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |i| i.state.is_pending() && !i.caller_released)
            .unwrap_or_else(|p| p.into_inner());
        if inner.caller_released {
            return Err(RbdError::BadHandle);
        }
        match inner.state {
            CompletionState::Ready => Ok(Some(inner.result)),
            CompletionState::Pending => Ok(None),
            CompletionState::Released => Err(RbdError::BadHandle),
        }
    }

    /// Claim the object for a poll batch. False if already delivered or gone.
    pub(crate) fn mark_delivered(&self) -> bool {
        let mut inner = self.lock();
        if inner.delivered || inner.caller_released || !inner.state.is_ready() {
            return false;
        }
        inner.delivered = true;
        true
    }

    /// Drop the caller's reference.
    pub(crate) fn release(&self) -> Result<ReleaseOutcome> {
        let mut inner = self.lock();
        if inner.state.is_released() || inner.caller_released {
            return Err(RbdError::BadHandle);
        }
        inner.caller_released = true;
        if self.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            drop(inner);
            // Waiters on this handle see it as gone.
            self.ready.notify_all();
            return Ok(ReleaseOutcome::Retained);
        }
        inner.state = CompletionState::Released;
        inner.callback = None;
        drop(inner);
        // Wake anyone still parked in wait() on a never-issued object.
        self.ready.notify_all();
        Ok(ReleaseOutcome::Reclaim)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("result", &inner.result)
            .field("attached", &inner.attached)
            .field("refs", &self.refs())
            .finish()
    }
}
