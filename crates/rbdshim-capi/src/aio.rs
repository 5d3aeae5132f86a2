//! Completions, asynchronous I/O and batch polling.
//!
//! A completion is created by the caller, bound to exactly one request,
//! and released by the caller once it has consumed the result. Callbacks
//! run on the thread that resolved the request, with no engine lock held;
//! they may call `rbd_aio_get_return_value` and `rbd_aio_release`.

use libc::{c_char, c_int, c_void, iovec};

use rbdshim_core::{CompletionId, ImageId, IoSegment, RbdError, Result};
use rbdshim_engine::CompletionCallback;

use crate::handles::{completion_id, completion_ptr, image_id};
use crate::types::{rbd_callback_t, rbd_completion_t, rbd_image_t};
use crate::{engine, rc};

// ── Completion objects ──

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_create_completion(
    cb_arg: *mut c_void,
    complete_cb: rbd_callback_t,
    c: *mut rbd_completion_t,
) -> c_int {
    if c.is_null() {
        return -libc::EINVAL;
    }
    let callback = complete_cb.map(|cb| {
        Box::new(move |id: CompletionId, arg: usize| cb(completion_ptr(id), arg as *mut c_void)) as CompletionCallback
    });
    match engine().create_completion(cb_arg as usize, callback) {
        Ok(id) => {
            *c = completion_ptr(id);
            0
        }
        Err(e) => e.to_neg(),
    }
}

/// Drop the caller's reference; an in-flight completion is reclaimed when
/// its request resolves.
#[no_mangle]
pub unsafe extern "C" fn rbd_aio_release(c: rbd_completion_t) {
    if let Ok(id) = completion_id(c) {
        let _ = engine().release(id);
    }
}

/// The `cb_arg` given at creation; null until the completion is ready.
#[no_mangle]
pub unsafe extern "C" fn rbd_aio_get_arg(c: rbd_completion_t) -> *mut c_void {
    match completion_id(c).and_then(|id| engine().get_arg(id)) {
        Ok(arg) => arg as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Bytes transferred (0 for flush) or a negative errno.
#[no_mangle]
pub unsafe extern "C" fn rbd_aio_get_return_value(c: rbd_completion_t) -> isize {
    match completion_id(c).and_then(|id| engine().get_result(id)) {
        Ok(r) => r as isize,
        Err(e) => e.to_neg() as isize,
    }
}

/// Block until the completion is ready. Returns 0; the result is read with
/// `rbd_aio_get_return_value`.
#[no_mangle]
pub unsafe extern "C" fn rbd_aio_wait_for_complete(c: rbd_completion_t) -> c_int {
    rc(completion_id(c).and_then(|id| engine().wait_for_complete(id)).map(|_| ()))
}

// ── Asynchronous I/O ──

fn submit<F>(image: rbd_image_t, c: rbd_completion_t, issue: F) -> c_int
where
    F: FnOnce(ImageId, CompletionId) -> Result<()>,
{
    rc(image_id(image).and_then(|i| issue(i, completion_id(c)?)))
}

unsafe fn iov_segments(iov: *const iovec, iovcnt: c_int) -> Result<Vec<IoSegment>> {
    let n = usize::try_from(iovcnt).map_err(|_| RbdError::InvalidArgument("negative iovcnt"))?;
    if n == 0 {
        return Ok(Vec::new());
    }
    if iov.is_null() {
        return Err(RbdError::InvalidArgument("null iovec array"));
    }
    Ok(std::slice::from_raw_parts(iov, n)
        .iter()
        .map(|v| IoSegment::new(v.iov_base as *mut u8, v.iov_len))
        .collect())
}

/// Read `len` bytes at `offset` into `buf`, which must stay valid until
/// `c` is ready.
#[no_mangle]
pub unsafe extern "C" fn rbd_aio_read(
    image: rbd_image_t,
    offset: u64,
    len: usize,
    buf: *mut c_char,
    c: rbd_completion_t,
) -> c_int {
    submit(image, c, |i, comp| engine().aio_read(i, offset, IoSegment::new(buf as *mut u8, len), comp))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_readv(
    image: rbd_image_t,
    iov: *const iovec,
    iovcnt: c_int,
    off: u64,
    c: rbd_completion_t,
) -> c_int {
    submit(image, c, |i, comp| engine().aio_readv(i, off, iov_segments(iov, iovcnt)?, comp))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_write(
    image: rbd_image_t,
    off: u64,
    len: usize,
    buf: *const c_char,
    c: rbd_completion_t,
) -> c_int {
    submit(image, c, |i, comp| engine().aio_write(i, off, IoSegment::new(buf as *mut u8, len), comp))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_writev(
    image: rbd_image_t,
    iov: *const iovec,
    iovcnt: c_int,
    off: u64,
    c: rbd_completion_t,
) -> c_int {
    submit(image, c, |i, comp| engine().aio_writev(i, off, iov_segments(iov, iovcnt)?, comp))
}

/// Fill `[off, off + len)` with copies of the `data_len`-byte stamp at
/// `buf`. `data_len` must divide `len`. The stamp is copied before return.
#[no_mangle]
pub unsafe extern "C" fn rbd_aio_writesame(
    image: rbd_image_t,
    off: u64,
    len: usize,
    buf: *const c_char,
    data_len: usize,
    c: rbd_completion_t,
    _op_flags: c_int,
) -> c_int {
    submit(image, c, |i, comp| {
        let stamp = IoSegment::new(buf as *mut u8, data_len);
        engine().aio_write_same(i, off, len as u64, stamp, comp)
    })
}

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_write_zeroes(
    image: rbd_image_t,
    off: u64,
    len: usize,
    c: rbd_completion_t,
    _zero_flags: c_int,
    _op_flags: c_int,
) -> c_int {
    submit(image, c, |i, comp| engine().aio_write_zeroes(i, off, len as u64, comp))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_discard(image: rbd_image_t, off: u64, len: u64, c: rbd_completion_t) -> c_int {
    submit(image, c, |i, comp| engine().aio_discard(i, off, len, comp))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_aio_flush(image: rbd_image_t, c: rbd_completion_t) -> c_int {
    submit(image, c, |i, comp| engine().aio_flush(i, comp))
}

// ── Polling ──

/// Move up to `numcomp` ready completions of `image` into `comps`.
/// Returns how many were stored; the caller releases each one.
#[no_mangle]
pub unsafe extern "C" fn rbd_poll_io_events(image: rbd_image_t, comps: *mut rbd_completion_t, numcomp: c_int) -> c_int {
    let max = match usize::try_from(numcomp) {
        Ok(0) | Err(_) => return 0,
        Ok(n) => n,
    };
    if comps.is_null() {
        return -libc::EINVAL;
    }
    match image_id(image).and_then(|i| engine().poll_io_events(i, max)) {
        Ok(ready) => {
            let out = std::slice::from_raw_parts_mut(comps, max);
            for (slot, id) in out.iter_mut().zip(&ready) {
                *slot = completion_ptr(*id);
            }
            ready.len() as c_int
        }
        Err(e) => e.to_neg(),
    }
}
