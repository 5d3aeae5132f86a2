//! `PipeNotifier` - `EVENT_TYPE_PIPE` notification target.
//!
//! Writes one byte to the write end of a caller-owned pipe per batch of
//! ready completions. A full pipe already guarantees a wakeup, so `EAGAIN`
//! is not an error.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use rbdshim_core::{Notifier, NotifyKind, RbdError, Result};

pub struct PipeNotifier {
    fd: RawFd,
}

impl PipeNotifier {
    /// Wrap the write end of a pipe. Never closed by the notifier.
    pub fn new(write_fd: RawFd) -> Result<Self> {
        if write_fd < 0 {
            return Err(RbdError::InvalidArgument("negative pipe descriptor"));
        }
        Ok(Self { fd: write_fd })
    }
}

impl Notifier for PipeNotifier {
    fn notify(&self) -> Result<()> {
        // Safety: see EventFdNotifier::notify.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        loop {
            match nix::unistd::write(fd, b"i") {
                Ok(_) | Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(RbdError::Os(e as i32)),
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn kind(&self) -> NotifyKind {
        NotifyKind::Pipe
    }
}
