//! Connection contexts and the image catalog.

use libc::{c_char, c_int, c_void};

use crate::handles::{pool_id, pool_ptr};
use crate::types::{librbd_progress_fn_t, rados_ioctx_t};
use crate::{c_str, engine, rc};

/// Open the pool `name` and store its context in `*ioctx`.
///
/// Stands in for `rados_ioctx_create`; there is no cluster handle.
#[no_mangle]
pub unsafe extern "C" fn rbdshim_pool_open(name: *const c_char, ioctx: *mut rados_ioctx_t) -> c_int {
    if ioctx.is_null() {
        return -libc::EINVAL;
    }
    let name = match c_str(name) {
        Ok(n) => n,
        Err(e) => return e.to_neg(),
    };
    match engine().pool_open(name) {
        Ok(id) => {
            *ioctx = pool_ptr(id);
            0
        }
        Err(e) => e.to_neg(),
    }
}

/// Release a context. Fails with `-EBUSY` while images are open on it.
#[no_mangle]
pub unsafe extern "C" fn rbdshim_pool_close(ioctx: rados_ioctx_t) -> c_int {
    rc(pool_id(ioctx).and_then(|p| engine().pool_close(p)))
}

/// Create an image. `*order` (if given) selects the object size; 0 picks
/// the default and the order used is written back.
#[no_mangle]
pub unsafe extern "C" fn rbd_create(io: rados_ioctx_t, name: *const c_char, size: u64, order: *mut c_int) -> c_int {
    let requested = if order.is_null() { 0 } else { *order };
    let requested = match u8::try_from(requested) {
        Ok(o) => o,
        Err(_) => return -libc::EINVAL,
    };
    let result = pool_id(io).and_then(|p| {
        let name = c_str(name)?;
        engine().create(p, name, size, requested)
    });
    match result {
        Ok(used) => {
            if !order.is_null() {
                *order = used as c_int;
            }
            0
        }
        Err(e) => e.to_neg(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn rbd_remove(io: rados_ioctx_t, name: *const c_char) -> c_int {
    rc(pool_id(io).and_then(|p| engine().remove(p, c_str(name)?)))
}

/// Remove an image, reporting progress once when it is gone.
#[no_mangle]
pub unsafe extern "C" fn rbd_remove_with_progress(
    io: rados_ioctx_t,
    name: *const c_char,
    cb: librbd_progress_fn_t,
    cbdata: *mut c_void,
) -> c_int {
    rc(pool_id(io).and_then(|p| {
        let name = c_str(name)?;
        engine().remove_with_progress(p, name, |done, total| match cb {
            Some(f) => f(done, total, cbdata),
            None => 0,
        })
    }))
}
