//! Notifier construction from the C registration arguments.

use std::os::unix::io::RawFd;

use rbdshim_core::{Notifier, NotifyKind, RbdError, Result};

use crate::pipe_notifier::PipeNotifier;

/// Build the notifier for `rbd_set_image_notification(image, fd, type)`.
pub fn notifier_for(fd: RawFd, kind: NotifyKind) -> Result<Box<dyn Notifier>> {
    match kind {
        NotifyKind::Pipe => Ok(Box::new(PipeNotifier::new(fd)?)),
        NotifyKind::EventFd => eventfd_notifier(fd),
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn eventfd_notifier(fd: RawFd) -> Result<Box<dyn Notifier>> {
            Ok(Box::new(crate::eventfd_notifier::EventFdNotifier::new(fd)?))
        }
    } else {
        fn eventfd_notifier(_fd: RawFd) -> Result<Box<dyn Notifier>> {
            Err(RbdError::NotSupported("eventfd notification"))
        }
    }
}

/// Same as [`notifier_for`] with the raw C type tag.
pub fn notifier_from_raw(fd: RawFd, kind: i32) -> Result<Box<dyn Notifier>> {
    if fd < 0 {
        return Err(RbdError::InvalidArgument("negative notification descriptor"));
    }
    notifier_for(fd, NotifyKind::try_from(kind)?)
}
