//! rbdshim error types.
//!
//! Every error maps onto a POSIX errno, because the C surface reports
//! failures as negative integers. [`RbdError::errno`] gives the positive
//! value; [`RbdError::to_neg`] the value a C caller sees.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RbdError {
    /// Out-of-range offset/length, null buffer, misaligned write-same stamp.
    InvalidArgument(&'static str),
    /// Completion already attached, or some other object in the wrong state.
    InvalidState(&'static str),
    /// Result or argument requested before the completion is ready.
    NotReady,
    /// Handle is unknown, stale (slot reused) or already released.
    BadHandle,
    /// Declared in the interface but not implemented (snapshots, resize).
    NotSupported(&'static str),
    /// No such image or pool.
    NotFound,
    /// Image already exists.
    Exists,
    /// Image is open and cannot be removed.
    Busy,
    /// Mutation attempted through a snapshot-bound (read-only) handle.
    ReadOnly,
    /// Image is closing; no new requests accepted.
    Shutdown,
    /// Caller-supplied output structure is too small.
    Range,
    /// Registry capacity exhausted.
    Exhausted,
    /// Failure reported by the backing store (positive errno).
    Backing(i32),
    /// OS error with errno.
    Os(i32),
}

impl RbdError {
    /// Positive errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::InvalidState(_) => libc::EBUSY,
            Self::NotReady => libc::EINPROGRESS,
            Self::BadHandle => libc::EBADF,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::Busy => libc::EBUSY,
            Self::ReadOnly => libc::EROFS,
            Self::Shutdown => libc::ESHUTDOWN,
            Self::Range => libc::ERANGE,
            Self::Exhausted => libc::ENOMEM,
            Self::Backing(e) | Self::Os(e) => *e,
        }
    }

    /// Negative errno, the C return convention.
    #[inline]
    pub fn to_neg(&self) -> i32 {
        -self.errno()
    }

    /// Build a backing error from a store result code.
    ///
    /// Accepts either sign; `0` is not an error and maps to `EIO`.
    pub fn from_errno(code: i64) -> Self {
        let e = code.unsigned_abs().min(i32::MAX as u64) as i32;
        if e == 0 {
            Self::Backing(libc::EIO)
        } else {
            Self::Backing(e)
        }
    }

    /// Capture the calling thread's errno.
    pub fn last_os_error() -> Self {
        Self::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Display for RbdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(why) => write!(f, "invalid argument: {}", why),
            Self::InvalidState(why) => write!(f, "invalid state: {}", why),
            Self::NotReady => write!(f, "completion not ready"),
            Self::BadHandle => write!(f, "bad or stale handle"),
            Self::NotSupported(op) => write!(f, "{} not supported", op),
            Self::NotFound => write!(f, "no such image"),
            Self::Exists => write!(f, "image exists"),
            Self::Busy => write!(f, "image busy"),
            Self::ReadOnly => write!(f, "read-only snapshot handle"),
            Self::Shutdown => write!(f, "image closing"),
            Self::Range => write!(f, "output buffer too small"),
            Self::Exhausted => write!(f, "handle registry exhausted"),
            Self::Backing(e) => write!(f, "backing store: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for RbdError {}

impl From<std::io::Error> for RbdError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, RbdError>;
