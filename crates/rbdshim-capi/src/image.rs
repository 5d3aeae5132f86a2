//! Image sessions: open/close, metadata, synchronous I/O and notification.

use std::mem::size_of;

use libc::{c_char, c_int};

use rbdshim_core::NotifyKind;

use crate::handles::{image_id, image_ptr, pool_id};
use crate::types::{rados_ioctx_t, rbd_image_info_t, rbd_image_t, rbd_snap_info_t};
use crate::{c_str, c_str_opt, engine, rc, rc_len};

/// Open `name`. A non-null `snap_name` yields a read-only handle.
#[no_mangle]
pub unsafe extern "C" fn rbd_open(
    io: rados_ioctx_t,
    name: *const c_char,
    image: *mut rbd_image_t,
    snap_name: *const c_char,
) -> c_int {
    if image.is_null() {
        return -libc::EINVAL;
    }
    let opened = pool_id(io).and_then(|p| engine().open(p, c_str(name)?, c_str_opt(snap_name)?));
    match opened {
        Ok(id) => {
            *image = image_ptr(id);
            0
        }
        Err(e) => e.to_neg(),
    }
}

/// Close an image after its outstanding requests resolve.
#[no_mangle]
pub unsafe extern "C" fn rbd_close(image: rbd_image_t) -> c_int {
    rc(image_id(image).and_then(|i| engine().close(i)))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_stat(image: rbd_image_t, info: *mut rbd_image_info_t, infosize: usize) -> c_int {
    if infosize < size_of::<rbd_image_info_t>() {
        return -libc::ERANGE;
    }
    if info.is_null() {
        return -libc::EINVAL;
    }
    match image_id(image).and_then(|i| engine().stat(i)) {
        Ok(st) => {
            *info = rbd_image_info_t {
                size: st.size,
                obj_size: st.obj_size,
                num_objs: st.num_objs,
                order: st.order as c_int,
                ..Default::default()
            };
            0
        }
        Err(e) => e.to_neg(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn rbd_get_size(image: rbd_image_t, size: *mut u64) -> c_int {
    if size.is_null() {
        return -libc::EINVAL;
    }
    match image_id(image).and_then(|i| engine().get_size(i)) {
        Ok(s) => {
            *size = s;
            0
        }
        Err(e) => e.to_neg(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn rbd_invalidate_cache(image: rbd_image_t) -> c_int {
    rc(image_id(image).and_then(|i| engine().invalidate_cache(i)))
}

/// Blocking read; returns bytes read.
#[no_mangle]
pub unsafe extern "C" fn rbd_read(image: rbd_image_t, off: u64, len: usize, buf: *mut c_char) -> c_int {
    let buf: &mut [u8] = match (buf.is_null(), len) {
        (_, 0) => &mut [],
        (true, _) => return -libc::EINVAL,
        (false, _) => std::slice::from_raw_parts_mut(buf as *mut u8, len),
    };
    rc_len(image_id(image).and_then(|i| engine().read(i, off, buf)))
}

/// Blocking write; returns bytes written.
#[no_mangle]
pub unsafe extern "C" fn rbd_write(image: rbd_image_t, off: u64, len: usize, buf: *const c_char) -> c_int {
    let data: &[u8] = match (buf.is_null(), len) {
        (_, 0) => &[],
        (true, _) => return -libc::EINVAL,
        (false, _) => std::slice::from_raw_parts(buf as *const u8, len),
    };
    rc_len(image_id(image).and_then(|i| engine().write(i, off, data)))
}

/// Blocking flush, ordered after every write issued before it.
#[no_mangle]
pub unsafe extern "C" fn rbd_flush(image: rbd_image_t) -> c_int {
    rc(image_id(image).and_then(|i| engine().flush(i)))
}

/// Register `fd` to be signalled as completions become pollable.
#[no_mangle]
pub unsafe extern "C" fn rbd_set_image_notification(image: rbd_image_t, fd: c_int, type_: c_int) -> c_int {
    rc(image_id(image).and_then(|i| {
        let kind = NotifyKind::try_from(type_)?;
        engine().set_image_notification(i, fd, kind)
    }))
}

// ── Not supported ──
//
// These fail with -EOPNOTSUPP for any handle and argument.

#[no_mangle]
pub unsafe extern "C" fn rbd_resize(_image: rbd_image_t, size: u64) -> c_int {
    rc(engine().resize(size))
}

#[no_mangle]
pub unsafe extern "C" fn rbd_snap_create(_image: rbd_image_t, _snapname: *const c_char) -> c_int {
    rc(engine().snap_create())
}

/// Leaves `snaps` and `max_snaps` untouched.
#[no_mangle]
pub unsafe extern "C" fn rbd_snap_list(
    _image: rbd_image_t,
    _snaps: *mut rbd_snap_info_t,
    _max_snaps: *mut c_int,
) -> c_int {
    rc(engine().snap_list())
}

/// Nothing is allocated by `rbd_snap_list`.
#[no_mangle]
pub unsafe extern "C" fn rbd_snap_list_end(_snaps: *mut rbd_snap_info_t) {}

#[no_mangle]
pub unsafe extern "C" fn rbd_snap_remove(_image: rbd_image_t, _snapname: *const c_char) -> c_int {
    rc(engine().snap_remove())
}

#[no_mangle]
pub unsafe extern "C" fn rbd_snap_rollback(_image: rbd_image_t, _snapname: *const c_char) -> c_int {
    rc(engine().snap_rollback())
}
