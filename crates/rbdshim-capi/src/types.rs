//! C types of the librbd interface.
//!
//! Layouts match `<rbd/librbd.h>` so existing consumers (fio's rbd engine,
//! qemu) can link against this library unchanged.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_void};

use rbdshim_core::constants::{MAX_BLOCK_NAME_SIZE, MAX_IMAGE_NAME_SIZE};

pub const EVENT_TYPE_PIPE: c_int = 1;
pub const EVENT_TYPE_EVENTFD: c_int = 2;

pub const RBD_MAX_BLOCK_NAME_SIZE: usize = MAX_BLOCK_NAME_SIZE;
pub const RBD_MAX_IMAGE_NAME_SIZE: usize = MAX_IMAGE_NAME_SIZE;

pub type rbd_image_t = *mut c_void;
pub type rbd_completion_t = *mut c_void;
pub type rados_ioctx_t = *mut c_void;

pub type rbd_callback_t = Option<unsafe extern "C" fn(cb: rbd_completion_t, arg: *mut c_void)>;

pub type librbd_progress_fn_t =
    Option<unsafe extern "C" fn(offset: u64, total: u64, ptr: *mut c_void) -> c_int>;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct rbd_image_info_t {
    pub size: u64,
    pub obj_size: u64,
    pub num_objs: u64,
    pub order: c_int,
    /// Deprecated; always empty.
    pub block_name_prefix: [c_char; RBD_MAX_BLOCK_NAME_SIZE],
    /// Deprecated; always 0.
    pub parent_pool: i64,
    /// Deprecated; always empty.
    pub parent_name: [c_char; RBD_MAX_IMAGE_NAME_SIZE],
}

impl Default for rbd_image_info_t {
    fn default() -> Self {
        Self {
            size: 0,
            obj_size: 0,
            num_objs: 0,
            order: 0,
            block_name_prefix: [0; RBD_MAX_BLOCK_NAME_SIZE],
            parent_pool: 0,
            parent_name: [0; RBD_MAX_IMAGE_NAME_SIZE],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct rbd_snap_info_t {
    pub id: u64,
    pub size: u64,
    pub name: *const c_char,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_image_info_layout() {
        assert_eq!(offset_of!(rbd_image_info_t, size), 0);
        assert_eq!(offset_of!(rbd_image_info_t, order), 24);
        assert_eq!(offset_of!(rbd_image_info_t, block_name_prefix), 28);
        assert_eq!(offset_of!(rbd_image_info_t, parent_pool), 56);
        assert_eq!(offset_of!(rbd_image_info_t, parent_name), 64);
        assert_eq!(size_of::<rbd_image_info_t>(), 160);
        assert_eq!(align_of::<rbd_image_info_t>(), 8);
    }

    #[test]
    fn test_snap_info_layout() {
        assert_eq!(size_of::<rbd_snap_info_t>(), 8 + 8 + size_of::<*const c_char>());
    }
}
