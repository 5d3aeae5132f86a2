//! Engine configuration

use std::path::PathBuf;

use rbdshim_core::constants::{DEFAULT_MAX_COMPLETIONS, DEFAULT_ORDER, MAX_ORDER, MIN_ORDER};
use rbdshim_core::env::{env_get, env_get_str, env_get_with};
use rbdshim_core::kwarn;

const MAX_WORKERS: usize = 32;

/// Which backing store new images get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Sparse in-memory image on worker threads. Lost on exit.
    Memory,
    /// Sparse file under `dir` on worker threads.
    File,
    /// Sparse file under `dir` driven by io_uring.
    Uring,
}

impl StoreKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Some(StoreKind::Memory),
            "file" => Some(StoreKind::File),
            "uring" | "io_uring" | "io-uring" => Some(StoreKind::Uring),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::File => "file",
            StoreKind::Uring => "uring",
        }
    }

    /// Whether images survive the process (and can be adopted on open).
    pub fn is_persistent(&self) -> bool {
        !matches!(self, StoreKind::Memory)
    }
}

/// Configuration for an [`Engine`](crate::Engine)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backing store for new images
    pub store: StoreKind,

    /// Root directory for file-backed pools (`<dir>/<pool>/<image>.img`)
    pub dir: PathBuf,

    /// Worker threads per image store (0 = auto)
    pub workers: usize,

    /// io_uring SQ entries per image (uring store only)
    pub uring_entries: u32,

    /// Object order used when `create` is given 0
    pub default_order: u8,

    /// Completion registry capacity
    pub max_completions: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            dir: PathBuf::from("/tmp/rbdshim"),
            workers: 0,
            uring_entries: 128,
            default_order: DEFAULT_ORDER,
            max_completions: DEFAULT_MAX_COMPLETIONS,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `RBDSHIM_*` variables; unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let store = env_get_with("RBDSHIM_STORE", d.store, |s| {
            let kind = StoreKind::parse(s);
            if kind.is_none() {
                kwarn!("RBDSHIM_STORE={:?} not recognized, using {}", s, d.store.name());
            }
            kind
        });
        Self {
            store,
            dir: PathBuf::from(env_get_str("RBDSHIM_DIR", &d.dir.to_string_lossy())),
            workers: env_get("RBDSHIM_WORKERS", d.workers),
            uring_entries: env_get("RBDSHIM_URING_ENTRIES", d.uring_entries),
            default_order: env_get("RBDSHIM_ORDER", d.default_order),
            max_completions: env_get("RBDSHIM_MAX_COMPLETIONS", d.max_completions),
        }
    }

    pub fn store(mut self, kind: StoreKind) -> Self {
        self.store = kind;
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Set worker threads per image (0 = auto)
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn uring_entries(mut self, n: u32) -> Self {
        self.uring_entries = n;
        self
    }

    pub fn default_order(mut self, order: u8) -> Self {
        self.default_order = order;
        self
    }

    pub fn max_completions(mut self, n: u32) -> Self {
        self.max_completions = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&self.default_order) {
            return Err("default_order must be within 12..=26");
        }
        if self.workers > MAX_WORKERS {
            return Err("workers exceeds maximum");
        }
        if self.max_completions == 0 {
            return Err("max_completions must be at least 1");
        }
        if self.store == StoreKind::Uring && !(1..=32768).contains(&self.uring_entries) {
            return Err("uring_entries must be within 1..=32768");
        }
        if self.store.is_persistent() && self.dir.as_os_str().is_empty() {
            return Err("file-backed stores need a directory");
        }
        Ok(())
    }
}
