//! Completion notification abstraction.
//!
//! A `Notifier` wakes an external event loop when completions on an image
//! become ready for `rbd_poll_io_events`.
//!
//! # Implementors
//!
//! - `EventFdNotifier`: adds 1 to an eventfd counter (`EVENT_TYPE_EVENTFD`).
//! - `PipeNotifier`: writes one byte to a pipe (`EVENT_TYPE_PIPE`).

use std::os::unix::io::RawFd;

use crate::error::{RbdError, Result};

/// Kind tag registered with `rbd_set_image_notification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyKind {
    /// Write a byte to the write end of a pipe.
    Pipe = 1,
    /// Increment an eventfd counter.
    EventFd = 2,
}

impl TryFrom<i32> for NotifyKind {
    type Error = RbdError;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            1 => Ok(NotifyKind::Pipe),
            2 => Ok(NotifyKind::EventFd),
            _ => Err(RbdError::InvalidArgument("unknown notification type")),
        }
    }
}

/// Wakes the consumer when completions are ready.
///
/// **Contract:**
/// - `notify()` must NEVER block. Descriptors are expected non-blocking;
///   a full pipe or saturated counter already implies a pending wakeup.
/// - Multiple calls before the consumer wakes may be coalesced.
/// - The descriptor is borrowed: the notifier never closes it.
pub trait Notifier: Send + Sync {
    /// Signal that completions are available.
    fn notify(&self) -> Result<()>;

    /// The registered descriptor.
    fn fd(&self) -> RawFd;

    /// The registered kind.
    fn kind(&self) -> NotifyKind;
}
