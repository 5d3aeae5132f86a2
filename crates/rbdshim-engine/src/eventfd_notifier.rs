//! `EventFdNotifier` - `EVENT_TYPE_EVENTFD` notification target.
//!
//! Adds 1 to an eventfd counter. Several notifications before the consumer
//! reads the eventfd coalesce into one wakeup (eventfd counter semantics).

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use rbdshim_core::{Notifier, NotifyKind, RbdError, Result};

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Wrap a caller-owned eventfd.
    ///
    /// The eventfd should be created with `EFD_NONBLOCK`. Ownership stays
    /// with the caller: the notifier never closes it.
    pub fn new(eventfd: RawFd) -> Result<Self> {
        if eventfd < 0 {
            return Err(RbdError::InvalidArgument("negative eventfd"));
        }
        Ok(Self { fd: eventfd })
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        // Safety: the registration contract keeps the descriptor open until
        // it is replaced or the image is closed.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        match nix::unistd::write(fd, &val.to_ne_bytes()) {
            Ok(_) => Ok(()),
            // Counter would overflow: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(RbdError::Os(e as i32)),
        }
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn kind(&self) -> NotifyKind {
        NotifyKind::EventFd
    }
}
