//! # rbdshim-engine: Default implementations for rbdshim
//!
//! Provides the completion engine behind the librbd-compatible surface:
//!
//! - `Engine` - compositor owning the completion, image and pool registries
//! - `Completion` - one asynchronous operation, pending → ready → released
//! - `Image` - open session: validation, flush ordering, poll queue
//! - `FlushBarrier` - holds a flush until earlier writes resolve
//! - `Pool` - image catalog for one connection context
//! - `WorkerStore` - runs a `BlockStore` on a fixed thread pool
//! - `UringStore` - file-backed io_uring store (feature `io-uring`, Linux)
//! - `MemStore` / `FileStore` - synchronous block stores
//! - `EventFdNotifier` / `PipeNotifier` - completion notification targets
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::default())?;
//! let pool = engine.pool_open("rbd")?;
//! engine.create(pool, "disk", 1 << 30, 0)?;
//! let image = engine.open(pool, "disk", None)?;
//! let comp = engine.create_completion(0, None)?;
//! engine.aio_flush(image, comp)?;
//! assert_eq!(engine.wait_for_complete(comp)?, 0);
//! engine.release(comp)?;
//! ```

pub mod completion;
pub mod config;
pub mod dispatch;
pub mod file_store;
pub mod flush;
pub mod image;
pub mod instance;
pub mod mem_store;
pub mod notifier;
pub mod pipe_notifier;
pub mod pool;
pub mod registry;
pub mod worker_store;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod eventfd_notifier;

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub mod uring_store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use completion::{Completion, CompletionCallback};
pub use config::{EngineConfig, StoreKind};
pub use flush::FlushBarrier;
pub use image::{Image, ImageInfo};
pub use instance::Engine;
pub use mem_store::MemStore;
pub use file_store::FileStore;
pub use pipe_notifier::PipeNotifier;
pub use pool::Pool;
pub use registry::Registry;
pub use worker_store::WorkerStore;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use eventfd_notifier::EventFdNotifier;

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub use uring_store::UringStore;
