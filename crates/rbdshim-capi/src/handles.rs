//! Opaque handle conversion.
//!
//! Every `void *` handed to C is a packed generation-checked id, never a
//! Rust pointer. Stale or forged values fail the registry lookup instead of
//! dereferencing freed memory.

use libc::c_void;

use rbdshim_core::{CompletionId, ImageId, PoolId, RbdError, Result};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("rbdshim-capi packs 64-bit handles into pointers");

macro_rules! handle_conv {
    ($to_ptr:ident, $from_ptr:ident, $id:ty) => {
        #[inline]
        pub(crate) fn $to_ptr(id: $id) -> *mut c_void {
            id.to_raw() as usize as *mut c_void
        }

        #[inline]
        pub(crate) fn $from_ptr(ptr: *mut c_void) -> Result<$id> {
            <$id>::from_raw(ptr as usize as u64).ok_or(RbdError::BadHandle)
        }
    };
}

handle_conv!(image_ptr, image_id, ImageId);
handle_conv!(completion_ptr, completion_id, CompletionId);
handle_conv!(pool_ptr, pool_id, PoolId);

#[cfg(test)]
mod tests {
    use super::*;
    use rbdshim_core::HandleId;

    #[test]
    fn test_null_is_bad_handle() {
        assert_eq!(image_id(std::ptr::null_mut()), Err(RbdError::BadHandle));
        assert_eq!(completion_id(std::ptr::null_mut()), Err(RbdError::BadHandle));
    }

    #[test]
    fn test_pointer_carries_generation() {
        let id = CompletionId(HandleId::new(9, 4));
        let p = completion_ptr(id);
        assert!(!p.is_null());
        assert_eq!(completion_id(p), Ok(id));
    }
}
