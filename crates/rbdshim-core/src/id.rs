//! Generation-checked handle identifiers
//!
//! A handle is a registry slot index plus the generation the slot had when
//! the object was inserted. Reusing a slot bumps its generation, so a stale
//! handle never aliases the new occupant.
//!
//! Generations start at 1, which keeps the packed `u64` (and the `void *`
//! built from it at the C boundary) non-zero.

use core::fmt;

/// Raw slot index + generation pair.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    /// Create from parts. `generation` must be non-zero for a live handle.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        HandleId { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack as `generation << 32 | index`.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack a value produced by [`to_raw`](Self::to_raw).
    ///
    /// Returns `None` for zero generations, which no live handle carries.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(HandleId { index: raw as u32, generation })
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(pub HandleId);

        impl $name {
            #[inline]
            pub const fn to_raw(self) -> u64 {
                self.0.to_raw()
            }

            #[inline]
            pub const fn from_raw(raw: u64) -> Option<Self> {
                match HandleId::from_raw(raw) {
                    Some(h) => Some($name(h)),
                    None => None,
                }
            }
        }

        impl From<HandleId> for $name {
            #[inline]
            fn from(h: HandleId) -> Self {
                $name(h)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:?})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "#{:?}"), self.0)
            }
        }
    };
}

typed_handle!(
    /// Identity of a completion object.
    CompletionId, "completion"
);
typed_handle!(
    /// Identity of an open image session.
    ImageId, "image"
);
typed_handle!(
    /// Identity of an open pool (the C API's `rados_ioctx_t`).
    PoolId, "pool"
);
