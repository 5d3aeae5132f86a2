//! `Engine` - the compositor that wires registries, pools and images.
//!
//! Every C entry point resolves to one method here. The engine owns three
//! generation-checked registries (completions, images, pools); handles are
//! their ids. A process-wide instance built from the environment backs the
//! C surface; tests build private instances from an [`EngineConfig`].
//!
//! ```text
//! aio_*(image, req, comp)
//!   ├─ image.check(req)          synchronous validation
//!   ├─ comp.attach(image)        exactly one request per completion
//!   └─ image.issue(req, done)    store resolves on its own thread
//!         done(result)
//!           ├─ comp.resolve()    record result, take callback
//!           ├─ callback          no lock held
//!           ├─ comp.complete()   pending → ready, drop the engine reference, wake waiters
//!           ├─ image.push_ready  poll queue + notifier
//!           └─ reclaim           if the caller released first
//! ```

use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rbdshim_core::{
    kdebug, kerror, kinfo, ktrace, kwarn, BackingStore, CompletionId, ImageId, IoSegment, NotifyKind, PoolId,
    RbdError, Request, Result,
};

use crate::completion::{Completion, CompletionCallback, ReleaseOutcome};
use crate::config::EngineConfig;
use crate::image::{Image, ImageInfo};
use crate::notifier::notifier_for;
use crate::pool::Pool;
use crate::registry::Registry;

/// Pools and images are few; completions are many.
const MAX_POOLS: u32 = 1024;
const MAX_IMAGES: u32 = 65536;

static GLOBAL: OnceLock<Engine> = OnceLock::new();

pub struct Engine {
    config: EngineConfig,
    completions: Arc<Registry<Completion>>,
    images: Registry<Image>,
    pools: Registry<Pool>,
}

impl Engine {
    /// Build an engine; fails if the configuration is invalid.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate().map_err(RbdError::InvalidArgument)?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Self {
            completions: Arc::new(Registry::new(config.max_completions)),
            images: Registry::new(MAX_IMAGES),
            pools: Registry::new(MAX_POOLS),
            config,
        }
    }

    /// The process-wide engine, built from `RBDSHIM_*` on first use.
    pub fn global() -> &'static Engine {
        GLOBAL.get_or_init(|| {
            rbdshim_core::kprint::init();
            let config = EngineConfig::from_env();
            let config = match config.validate() {
                Ok(()) => config,
                Err(why) => {
                    kwarn!("ignoring RBDSHIM_* configuration: {}", why);
                    EngineConfig::default()
                }
            };
            kinfo!("engine: {:?}", config);
            Self::build(config)
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Pools ──

    pub fn pool_open(&self, name: &str) -> Result<PoolId> {
        let dir = Pool::prepare(name, &self.config)?;
        let (id, pool) = self.pools.insert_with(|hid| Pool::new(PoolId(hid), name, &self.config, dir))?;
        kinfo!("{} '{}' opened ({} store)", pool.id(), name, pool.store_kind().name());
        Ok(PoolId(id))
    }

    /// Close a pool; fails with `Busy` while any of its images is open.
    pub fn pool_close(&self, pool: PoolId) -> Result<()> {
        let p = self.pools.lookup(pool.0)?;
        p.shutdown()?;
        self.pools.remove(pool.0);
        Ok(())
    }

    fn pool(&self, pool: PoolId) -> Result<Arc<Pool>> {
        self.pools.lookup(pool.0)
    }

    /// Create an image; `order` 0 selects the default. Returns the order used.
    pub fn create(&self, pool: PoolId, name: &str, size: u64, order: u8) -> Result<u8> {
        self.pool(pool)?.create(name, size, order)
    }

    /// Create an image over a caller-supplied store.
    pub fn create_with_store(
        &self,
        pool: PoolId,
        name: &str,
        size: u64,
        order: u8,
        store: Arc<dyn BackingStore>,
    ) -> Result<u8> {
        self.pool(pool)?.create_with_store(name, size, order, store)
    }

    pub fn remove(&self, pool: PoolId, name: &str) -> Result<()> {
        self.pool(pool)?.remove(name)
    }

    /// Remove with a progress callback `(done, total)`. Removal is a single
    /// catalog step, so progress is reported once, on success.
    pub fn remove_with_progress<F>(&self, pool: PoolId, name: &str, mut progress: F) -> Result<()>
    where
        F: FnMut(u64, u64) -> i32,
    {
        self.remove(pool, name)?;
        let ret = progress(1, 1);
        if ret < 0 {
            kdebug!("remove '{}': progress callback returned {}", name, ret);
        }
        Ok(())
    }

    pub fn list(&self, pool: PoolId) -> Result<Vec<String>> {
        self.pool(pool)?.list()
    }

    // ── Images ──

    /// Open `name`; a snapshot name yields a read-only handle.
    pub fn open(&self, pool: PoolId, name: &str, snapshot: Option<&str>) -> Result<ImageId> {
        let p = self.pool(pool)?;
        let opened = p.open(name)?;
        let info = ImageInfo::new(opened.size, opened.order);
        match self.images.insert_with(|hid| Image::new(ImageId(hid), pool, name, snapshot, info, opened.store)) {
            Ok((id, image)) => {
                let mode = if image.is_read_only() { "ro" } else { "rw" };
                kinfo!("{} '{}' opened {} ({} bytes, {})", image.id(), name, mode, info.size, image.store_name());
                Ok(ImageId(id))
            }
            Err(e) => {
                p.close(name);
                Err(e)
            }
        }
    }

    /// Close an image, blocking until every in-flight request resolves.
    pub fn close(&self, image: ImageId) -> Result<()> {
        let img = self.images.lookup(image.0)?;
        img.close()?;
        self.images.remove(image.0);
        if let Ok(p) = self.pool(img.pool()) {
            p.close(img.name());
        }
        kinfo!("{} '{}' closed", image, img.name());
        Ok(())
    }

    fn image(&self, image: ImageId) -> Result<Arc<Image>> {
        self.images.lookup(image.0)
    }

    pub fn stat(&self, image: ImageId) -> Result<ImageInfo> {
        Ok(self.image(image)?.info())
    }

    pub fn get_size(&self, image: ImageId) -> Result<u64> {
        Ok(self.image(image)?.size())
    }

    /// Nothing is cached above the store.
    pub fn invalidate_cache(&self, image: ImageId) -> Result<()> {
        self.image(image).map(|_| ())
    }

    // ── Completions ──

    pub fn create_completion(&self, arg: usize, callback: Option<CompletionCallback>) -> Result<CompletionId> {
        let (id, _) = self.completions.insert_with(|hid| Completion::new(CompletionId(hid), arg, callback))?;
        Ok(CompletionId(id))
    }

    fn completion(&self, comp: CompletionId) -> Result<Arc<Completion>> {
        self.completions.lookup(comp.0)
    }

    /// Drop the caller's reference. Objects still on their resolution path
    /// are reclaimed once the engine is done with them.
    pub fn release(&self, comp: CompletionId) -> Result<()> {
        let c = self.completion(comp)?;
        match c.release() {
            Ok(ReleaseOutcome::Reclaim) => {
                self.completions.remove(comp.0);
                Ok(())
            }
            Ok(ReleaseOutcome::Retained) => {
                ktrace!("{} released while in flight", comp);
                Ok(())
            }
            Err(e) => {
                kerror!("{} released twice", comp);
                Err(e)
            }
        }
    }

    pub fn get_result(&self, comp: CompletionId) -> Result<i64> {
        self.completion(comp)?.result()
    }

    pub fn get_arg(&self, comp: CompletionId) -> Result<usize> {
        self.completion(comp)?.arg()
    }

    pub fn is_complete(&self, comp: CompletionId) -> Result<bool> {
        Ok(self.completion(comp)?.is_ready())
    }

    /// Block until `comp` is ready; returns its result.
    pub fn wait_for_complete(&self, comp: CompletionId) -> Result<i64> {
        self.completion(comp)?.wait()
    }

    /// As [`wait_for_complete`](Self::wait_for_complete); `None` on timeout.
    pub fn wait_timeout(&self, comp: CompletionId, timeout: Duration) -> Result<Option<i64>> {
        self.completion(comp)?.wait_timeout(timeout)
    }

    /// Live completion objects (for leak checks).
    pub fn live_completions(&self) -> usize {
        self.completions.len()
    }

    // ── Asynchronous I/O ──

    /// Validate `req`, bind `comp` to it and forward it to the store.
    ///
    /// # Safety
    /// Segment memory in `req` must stay valid (reads: writable and
    /// unaliased) until `comp` is ready.
    pub unsafe fn aio_submit(&self, image: ImageId, req: Request, comp: CompletionId) -> Result<()> {
        let img = self.image(image)?;
        let c = self.completion(comp)?;
        img.check(&req)?;
        c.attach(image)?;

        let completions = Arc::clone(&self.completions);
        let resolver_img = Arc::clone(&img);
        let resolver_comp = Arc::clone(&c);
        let issued = img.issue(
            req,
            Box::new(move |result| finish(&completions, &resolver_img, resolver_comp, result)),
        );
        if let Err(e) = issued {
            if c.detach() {
                self.completions.remove(comp.0);
            }
            return Err(e);
        }
        Ok(())
    }

    /// # Safety
    /// See [`aio_submit`](Self::aio_submit).
    pub unsafe fn aio_read(&self, image: ImageId, offset: u64, buf: IoSegment, comp: CompletionId) -> Result<()> {
        self.aio_submit(image, Request::read(offset, single(buf)), comp)
    }

    /// # Safety
    /// See [`aio_submit`](Self::aio_submit).
    pub unsafe fn aio_readv(&self, image: ImageId, offset: u64, iov: Vec<IoSegment>, comp: CompletionId) -> Result<()> {
        self.aio_submit(image, Request::read(offset, iov), comp)
    }

    /// # Safety
    /// See [`aio_submit`](Self::aio_submit).
    pub unsafe fn aio_write(&self, image: ImageId, offset: u64, buf: IoSegment, comp: CompletionId) -> Result<()> {
        self.aio_submit(image, Request::write(offset, single(buf)), comp)
    }

    /// # Safety
    /// See [`aio_submit`](Self::aio_submit).
    pub unsafe fn aio_writev(&self, image: ImageId, offset: u64, iov: Vec<IoSegment>, comp: CompletionId) -> Result<()> {
        self.aio_submit(image, Request::write(offset, iov), comp)
    }

    /// Fill `[offset, offset + len)` with repeats of `stamp`.
    ///
    /// # Safety
    /// `stamp` must be readable until this call returns (it is copied).
    pub unsafe fn aio_write_same(
        &self,
        image: ImageId,
        offset: u64,
        len: u64,
        stamp: IoSegment,
        comp: CompletionId,
    ) -> Result<()> {
        self.aio_submit(image, Request::write_same(offset, len, stamp), comp)
    }

    pub fn aio_write_zeroes(&self, image: ImageId, offset: u64, len: u64, comp: CompletionId) -> Result<()> {
        // Safety: carries no caller memory.
        unsafe { self.aio_submit(image, Request::write_zeroes(offset, len), comp) }
    }

    pub fn aio_discard(&self, image: ImageId, offset: u64, len: u64, comp: CompletionId) -> Result<()> {
        // Safety: carries no caller memory.
        unsafe { self.aio_submit(image, Request::discard(offset, len), comp) }
    }

    pub fn aio_flush(&self, image: ImageId, comp: CompletionId) -> Result<()> {
        // Safety: carries no caller memory.
        unsafe { self.aio_submit(image, Request::flush(), comp) }
    }

    /// Take up to `max` ready completions queued on `image`.
    pub fn poll_io_events(&self, image: ImageId, max: usize) -> Result<Vec<CompletionId>> {
        let img = self.image(image)?;
        Ok(img.poll_ready(max).into_iter().map(|c| c.id()).collect())
    }

    /// Register the notification target; replaces any earlier one.
    pub fn set_image_notification(&self, image: ImageId, fd: RawFd, kind: NotifyKind) -> Result<()> {
        let img = self.image(image)?;
        if img.is_closing() {
            return Err(RbdError::Shutdown);
        }
        if fd < 0 {
            return Err(RbdError::InvalidArgument("negative notification descriptor"));
        }
        let notifier = notifier_for(fd, kind)?;
        if let Some(old) = img.set_notifier(Some(notifier)) {
            kdebug!("{} notification fd {} replaced by {}", image, old.fd(), fd);
        }
        Ok(())
    }

    /// Stop notifying; completions are no longer queued for polling.
    pub fn clear_image_notification(&self, image: ImageId) -> Result<()> {
        self.image(image)?.set_notifier(None);
        Ok(())
    }

    // ── Synchronous I/O ──

    pub fn read(&self, image: ImageId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let img = self.image(image)?;
        // Safety: `buf` is borrowed for the whole blocking call.
        let n = unsafe { img.issue_sync(Request::read(offset, vec![IoSegment::from_mut_slice(buf)]))? };
        Ok(n as usize)
    }

    pub fn write(&self, image: ImageId, offset: u64, data: &[u8]) -> Result<usize> {
        let img = self.image(image)?;
        // Safety: `data` is borrowed for the whole blocking call.
        let n = unsafe { img.issue_sync(Request::write(offset, vec![IoSegment::from_slice(data)]))? };
        Ok(n as usize)
    }

    pub fn flush(&self, image: ImageId) -> Result<()> {
        let img = self.image(image)?;
        // Safety: no caller memory.
        unsafe { img.issue_sync(Request::flush()) }.map(|_| ())
    }

    // ── Not supported ──
    //
    // Each fails with `NotSupported` whatever handle or arguments the caller
    // passed, and touches nothing.

    pub fn resize(&self, _size: u64) -> Result<()> {
        Err(RbdError::NotSupported("resize"))
    }

    pub fn snap_create(&self) -> Result<()> {
        Err(RbdError::NotSupported("snap_create"))
    }

    pub fn snap_list(&self) -> Result<()> {
        Err(RbdError::NotSupported("snap_list"))
    }

    pub fn snap_remove(&self) -> Result<()> {
        Err(RbdError::NotSupported("snap_remove"))
    }

    pub fn snap_rollback(&self) -> Result<()> {
        Err(RbdError::NotSupported("snap_rollback"))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("completions", &self.completions.len())
            .field("images", &self.images.len())
            .field("pools", &self.pools.len())
            .finish()
    }
}

fn single(buf: IoSegment) -> Vec<IoSegment> {
    if buf.len == 0 && buf.ptr.is_null() {
        Vec::new()
    } else {
        vec![buf]
    }
}

/// Resolution path, run on whichever thread the store resolved on.
fn finish(completions: &Registry<Completion>, image: &Image, comp: Arc<Completion>, result: i64) {
    let id = comp.id();
    let callback = match comp.resolve(result) {
        Ok(cb) => cb,
        Err(e) => {
            kerror!("{}: {} (result {} dropped)", id, e, result);
            return;
        }
    };
    if let Some(cb) = callback {
        cb(id, comp.raw_arg());
    }
    let completed = comp.complete();
    ktrace!("{} ready result={}", id, result);
    if completed.queue {
        image.push_ready(Arc::clone(&comp));
    }
    if completed.reclaim {
        completions.remove(id.0);
    }
}
