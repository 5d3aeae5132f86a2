//! # rbdshim-capi: librbd-compatible C ABI
//!
//! Builds `librbd.so` / `librbd.a` exporting the subset of the librbd
//! interface that block benchmarks and hypervisors use:
//!
//! - `pool` - `rbdshim_pool_open` / `rbdshim_pool_close`, `rbd_create`,
//!   `rbd_remove`, `rbd_remove_with_progress`
//! - `image` - open/close/stat, synchronous I/O, notification, and the
//!   snapshot/resize calls (which return `-EOPNOTSUPP`)
//! - `aio` - completions, asynchronous I/O and `rbd_poll_io_events`
//!
//! Every call goes to the process-wide [`Engine`], configured from
//! `RBDSHIM_*` on first use. Failures are negative errno values; see
//! `rbdshim_core::RbdError::errno`.

use std::ffi::CStr;

use libc::{c_char, c_int};

use rbdshim_core::{RbdError, Result};
use rbdshim_engine::Engine;

pub mod aio;
pub mod handles;
pub mod image;
pub mod pool;
pub mod types;

pub use types::*;

#[inline]
fn engine() -> &'static Engine {
    Engine::global()
}

/// 0 on success, negative errno otherwise.
#[inline]
fn rc(r: Result<()>) -> c_int {
    match r {
        Ok(()) => 0,
        Err(e) => e.to_neg(),
    }
}

/// Byte counts are reported as `int`; clamp what does not fit.
#[inline]
fn rc_len(r: Result<usize>) -> c_int {
    match r {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(e) => e.to_neg(),
    }
}

/// Borrow a caller string.
///
/// # Safety
/// `p` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn c_str<'a>(p: *const c_char) -> Result<&'a str> {
    if p.is_null() {
        return Err(RbdError::InvalidArgument("null string"));
    }
    CStr::from_ptr(p)
        .to_str()
        .map_err(|_| RbdError::InvalidArgument("string is not UTF-8"))
}

/// Like [`c_str`] but null means "absent".
unsafe fn c_str_opt<'a>(p: *const c_char) -> Result<Option<&'a str>> {
    if p.is_null() {
        Ok(None)
    } else {
        c_str(p).map(Some)
    }
}
