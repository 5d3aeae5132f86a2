//! Pools: the connection context (`rados_ioctx_t`) images live in.
//!
//! A pool is a catalog of images by name. Each entry owns the image's
//! backing store, shared by every open handle of that image. File-backed
//! pools map to `<dir>/<pool>/` and adopt image files left by an earlier
//! process when they are opened by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rbdshim_core::constants::{MAX_IMAGE_NAME_SIZE, MAX_ORDER, MIN_ORDER};
use rbdshim_core::{kinfo, kwarn, BackingStore, PoolId, RbdError, Result};

use crate::config::{EngineConfig, StoreKind};
use crate::file_store::FileStore;
use crate::mem_store::MemStore;
use crate::worker_store::WorkerStore;

const IMAGE_SUFFIX: &str = "img";

struct CatalogEntry {
    size: u64,
    order: u8,
    store: Arc<dyn BackingStore>,
    open: usize,
}

/// What an image open needs from the catalog.
pub(crate) struct OpenedImage {
    pub size: u64,
    pub order: u8,
    pub store: Arc<dyn BackingStore>,
}

pub struct Pool {
    id: PoolId,
    name: String,
    kind: StoreKind,
    dir: Option<PathBuf>,
    workers: usize,
    uring_entries: u32,
    default_order: u8,
    catalog: Mutex<HashMap<String, CatalogEntry>>,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= MAX_IMAGE_NAME_SIZE {
        return Err(RbdError::InvalidArgument("image name length"));
    }
    if name.contains('/') || name.contains('\0') || name.starts_with('.') {
        return Err(RbdError::InvalidArgument("image name characters"));
    }
    Ok(())
}

impl Pool {
    /// Validate the pool name and create its directory for file-backed
    /// stores. Runs before the pool gets an id.
    pub(crate) fn prepare(name: &str, config: &EngineConfig) -> Result<Option<PathBuf>> {
        check_name(name)?;
        if !config.store.is_persistent() {
            return Ok(None);
        }
        let dir = config.dir.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(Some(dir))
    }

    pub(crate) fn new(id: PoolId, name: &str, config: &EngineConfig, dir: Option<PathBuf>) -> Self {
        Self {
            id,
            name: name.to_owned(),
            kind: config.store,
            dir,
            workers: config.workers,
            uring_entries: config.uring_entries,
            default_order: config.default_order,
            catalog: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_kind(&self) -> StoreKind {
        self.kind
    }

    fn catalog(&self) -> MutexGuard<'_, HashMap<String, CatalogEntry>> {
        self.catalog.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn image_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.{}", name, IMAGE_SUFFIX)))
    }

    /// Resolve a requested order: 0 means the configured default.
    pub fn effective_order(&self, order: u8) -> Result<u8> {
        let order = if order == 0 { self.default_order } else { order };
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(RbdError::InvalidArgument("object order out of range"));
        }
        Ok(order)
    }

    fn build_store(&self, name: &str, size: u64, adopt: bool) -> Result<Arc<dyn BackingStore>> {
        let store: Arc<dyn BackingStore> = match (self.kind, self.image_path(name)) {
            (StoreKind::Memory, _) | (_, None) => Arc::new(WorkerStore::new(MemStore::new(), self.workers)?),
            (StoreKind::File, Some(path)) => {
                let file = if adopt { FileStore::open(&path)? } else { FileStore::create(&path, size)? };
                Arc::new(WorkerStore::new(file, self.workers)?)
            }
            (StoreKind::Uring, Some(path)) => self.uring_store(&path, size, adopt)?,
        };
        Ok(store)
    }

    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    fn uring_store(&self, path: &std::path::Path, size: u64, adopt: bool) -> Result<Arc<dyn BackingStore>> {
        use crate::uring_store::UringStore;
        let store = if adopt {
            UringStore::open(path, self.uring_entries)?
        } else {
            UringStore::create(path, size, self.uring_entries)?
        };
        Ok(Arc::new(store))
    }

    #[cfg(not(all(target_os = "linux", feature = "io-uring")))]
    fn uring_store(&self, _path: &std::path::Path, _size: u64, _adopt: bool) -> Result<Arc<dyn BackingStore>> {
        let _ = self.uring_entries;
        Err(RbdError::NotSupported("io_uring store"))
    }

    /// Create an image. Returns the effective object order.
    pub fn create(&self, name: &str, size: u64, order: u8) -> Result<u8> {
        check_name(name)?;
        let order = self.effective_order(order)?;
        let mut catalog = self.catalog();
        if catalog.contains_key(name) || self.image_path(name).is_some_and(|p| p.exists()) {
            return Err(RbdError::Exists);
        }
        let store = self.build_store(name, size, false)?;
        catalog.insert(name.to_owned(), CatalogEntry { size, order, store, open: 0 });
        kinfo!("{}: created image '{}' ({} bytes, order {})", self.id, name, size, order);
        Ok(order)
    }

    /// Register an image over a caller-supplied store.
    pub fn create_with_store(&self, name: &str, size: u64, order: u8, store: Arc<dyn BackingStore>) -> Result<u8> {
        check_name(name)?;
        let order = self.effective_order(order)?;
        let mut catalog = self.catalog();
        if catalog.contains_key(name) {
            return Err(RbdError::Exists);
        }
        catalog.insert(name.to_owned(), CatalogEntry { size, order, store, open: 0 });
        Ok(order)
    }

    /// Take an open reference on an image.
    pub(crate) fn open(&self, name: &str) -> Result<OpenedImage> {
        check_name(name).map_err(|_| RbdError::NotFound)?;
        let mut catalog = self.catalog();
        if !catalog.contains_key(name) {
            let adopted = self.adopt(name)?;
            catalog.insert(name.to_owned(), adopted);
        }
        let entry = catalog.get_mut(name).ok_or(RbdError::NotFound)?;
        entry.open += 1;
        Ok(OpenedImage { size: entry.size, order: entry.order, store: Arc::clone(&entry.store) })
    }

    /// Catalog entry for an image file left by an earlier process.
    fn adopt(&self, name: &str) -> Result<CatalogEntry> {
        let path = self.image_path(name).ok_or(RbdError::NotFound)?;
        let size = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m.len(),
            _ => return Err(RbdError::NotFound),
        };
        let store = self.build_store(name, size, true)?;
        kinfo!("{}: adopted image '{}' ({} bytes)", self.id, name, size);
        Ok(CatalogEntry { size, order: self.default_order, store, open: 0 })
    }

    /// Drop an open reference.
    pub(crate) fn close(&self, name: &str) {
        let mut catalog = self.catalog();
        match catalog.get_mut(name) {
            Some(entry) if entry.open > 0 => entry.open -= 1,
            _ => kwarn!("{}: close of '{}' without matching open", self.id, name),
        }
    }

    /// Remove an image that nobody has open.
    pub fn remove(&self, name: &str) -> Result<()> {
        let entry = {
            let mut catalog = self.catalog();
            if !catalog.contains_key(name) {
                let adopted = self.adopt(name)?;
                catalog.insert(name.to_owned(), adopted);
            }
            match catalog.get(name) {
                Some(e) if e.open > 0 => return Err(RbdError::Busy),
                Some(_) => {}
                None => return Err(RbdError::NotFound),
            }
            catalog.remove(name).ok_or(RbdError::NotFound)?
        };
        entry.store.shutdown();
        if let Some(path) = self.image_path(name) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        kinfo!("{}: removed image '{}'", self.id, name);
        Ok(())
    }

    /// Image names, sorted. Includes files not yet adopted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.catalog().keys().cloned().collect();
        if let Some(dir) = &self.dir {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(IMAGE_SUFFIX) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_owned());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Open handles on `name`, 0 if unknown.
    pub fn open_count(&self, name: &str) -> usize {
        self.catalog().get(name).map_or(0, |e| e.open)
    }

    /// Shut down every image store. Fails with `Busy` while any is open.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let entries: Vec<CatalogEntry> = {
            let mut catalog = self.catalog();
            if catalog.values().any(|e| e.open > 0) {
                return Err(RbdError::Busy);
            }
            catalog.drain().map(|(_, e)| e).collect()
        };
        for e in entries {
            e.store.shutdown();
        }
        kinfo!("{} '{}' closed", self.id, self.name);
        Ok(())
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dir", &self.dir)
            .finish()
    }
}
