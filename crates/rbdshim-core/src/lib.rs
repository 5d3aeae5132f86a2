//! # rbdshim-core: Trait and type definitions for rbdshim
//!
//! rbdshim presents the librbd C interface (`rbd_open`, `rbd_aio_write`,
//! `rbd_poll_io_events`, ...) over an alternative storage backend. This
//! crate holds the boundaries every other crate programs against:
//!
//! - `id` - generation-checked handle identifiers
//! - `state` - completion object state machine
//! - `request` - request descriptors and caller buffer segments
//! - `store` - synchronous `BlockStore` and asynchronous `BackingStore`
//! - `notifier` - completion notification (pipe / eventfd)
//! - `error` - `RbdError` and its errno mapping
//! - `spinlock` - short-section lock for the registries
//! - `kprint` - leveled stderr logging macros
//! - `env` - `RBDSHIM_*` environment helpers
//!
//! Default implementations live in `rbdshim-engine`; the C ABI in
//! `rbdshim-capi`.

pub mod id;
pub mod state;
pub mod request;
pub mod store;
pub mod notifier;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;

pub use error::{RbdError, Result};
pub use id::{CompletionId, HandleId, ImageId, PoolId};
pub use notifier::{Notifier, NotifyKind};
pub use request::{IoSegment, OpKind, Request};
pub use state::CompletionState;
pub use store::{BackingStore, BlockStore, StoreCallback, StoreOp};

/// Constants shared by the engine and the C surface
pub mod constants {
    /// Default object order (4 MiB objects), as librbd.
    pub const DEFAULT_ORDER: u8 = 22;

    /// Smallest accepted object order (4 KiB).
    pub const MIN_ORDER: u8 = 12;

    /// Largest accepted object order (64 MiB).
    pub const MAX_ORDER: u8 = 26;

    /// `RBD_MAX_BLOCK_NAME_SIZE` from librbd.h.
    pub const MAX_BLOCK_NAME_SIZE: usize = 24;

    /// `RBD_MAX_IMAGE_NAME_SIZE` from librbd.h.
    pub const MAX_IMAGE_NAME_SIZE: usize = 96;

    /// Default registry capacity for completion objects.
    pub const DEFAULT_MAX_COMPLETIONS: u32 = 1 << 20;
}
