//! Generation-checked handle registry
//!
//! An arena of `Arc<T>` addressed by [`HandleId`]. Freed slots go on a LIFO
//! free stack for cache-friendly reuse; each reuse bumps the slot's
//! generation so stale handles miss instead of aliasing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rbdshim_core::spinlock::SpinLock;
use rbdshim_core::{HandleId, RbdError, Result};

struct Entry<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Entry<T>>,
    /// LIFO stack of free slot indices
    free: Vec<u32>,
}

pub struct Registry<T> {
    slots: SpinLock<Slots<T>>,
    live: AtomicU32,
    capacity: u32,
}

impl<T> Registry<T> {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: SpinLock::new(Slots { entries: Vec::new(), free: Vec::new() }),
            live: AtomicU32::new(0),
            capacity,
        }
    }

    /// Insert a value built from its own handle.
    ///
    /// `make` runs under the registry lock; keep it trivial.
    pub fn insert_with<F>(&self, make: F) -> Result<(HandleId, Arc<T>)>
    where
        F: FnOnce(HandleId) -> T,
    {
        let mut slots = self.slots.lock();
        let index = match slots.free.pop() {
            Some(i) => i,
            None => {
                let next = slots.entries.len() as u32;
                if next >= self.capacity {
                    return Err(RbdError::Exhausted);
                }
                slots.entries.push(Entry { generation: 0, value: None });
                next
            }
        };
        let entry = &mut slots.entries[index as usize];
        entry.generation = match entry.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        let id = HandleId::new(index, entry.generation);
        let value = Arc::new(make(id));
        entry.value = Some(Arc::clone(&value));
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok((id, value))
    }

    pub fn insert(&self, value: T) -> Result<HandleId> {
        self.insert_with(|_| value).map(|(id, _)| id)
    }

    /// Look up a live handle.
    pub fn get(&self, id: HandleId) -> Option<Arc<T>> {
        let slots = self.slots.lock();
        slots
            .entries
            .get(id.index() as usize)
            .filter(|e| e.generation == id.generation())
            .and_then(|e| e.value.clone())
    }

    /// Look up a live handle or fail with `BadHandle`.
    #[inline]
    pub fn lookup(&self, id: HandleId) -> Result<Arc<T>> {
        self.get(id).ok_or(RbdError::BadHandle)
    }

    /// Remove a handle, returning the registry's reference.
    ///
    /// Outstanding `Arc` clones stay valid; the slot is reusable at once
    /// under a new generation.
    pub fn remove(&self, id: HandleId) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();
        let entry = slots
            .entries
            .get_mut(id.index() as usize)
            .filter(|e| e.generation == id.generation())?;
        let value = entry.value.take()?;
        slots.free.push(id.index());
        self.live.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// Number of live handles.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
