//! Test utilities (feature = "test-utils").
//!
//! [`ManualStore`] parks every submitted operation until the test decides
//! how it resolves: run it against an in-memory image, fail it, or resolve
//! it with an arbitrary result. That gives tests exact control over which
//! completions are pending and which are ready.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rbdshim_core::store::run_block_op;
use rbdshim_core::{BackingStore, OpKind, StoreCallback, StoreOp};

use crate::mem_store::MemStore;

struct Parked {
    op: StoreOp,
    done: StoreCallback,
}

#[derive(Default)]
pub struct ManualStore {
    mem: MemStore,
    parked: Mutex<VecDeque<Parked>>,
    arrived: Condvar,
}

impl ManualStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The in-memory image operations run against.
    pub fn mem(&self) -> &MemStore {
        &self.mem
    }

    /// Operations parked, oldest first.
    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    pub fn parked_kinds(&self) -> Vec<OpKind> {
        self.parked.lock().unwrap().iter().map(|p| p.op.kind()).collect()
    }

    /// Block until at least `n` operations are parked.
    pub fn wait_parked(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut q = self.parked.lock().unwrap();
        while q.len() < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            q = self.arrived.wait_timeout(q, deadline - now).unwrap().0;
        }
        true
    }

    fn take(&self, index: usize) -> Option<Parked> {
        self.parked.lock().unwrap().remove(index)
    }

    /// Execute the parked operation at `index` against the memory image.
    pub fn run_at(&self, index: usize) -> Option<i64> {
        let p = self.take(index)?;
        // Safety: the engine keeps segment memory alive until `done`.
        let result = unsafe { run_block_op(&self.mem, &p.op) };
        (p.done)(result);
        Some(result)
    }

    /// Execute the oldest parked operation.
    pub fn run_next(&self) -> Option<i64> {
        self.run_at(0)
    }

    /// Execute everything parked, oldest first. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut n = 0;
        while self.run_next().is_some() {
            n += 1;
        }
        n
    }

    /// Resolve the parked operation at `index` with `result` without
    /// touching the memory image.
    pub fn resolve_at(&self, index: usize, result: i64) -> bool {
        match self.take(index) {
            Some(p) => {
                (p.done)(result);
                true
            }
            None => false,
        }
    }

    /// Fail the parked operation at `index` with `-errno`.
    pub fn fail_at(&self, index: usize, errno: i32) -> bool {
        self.resolve_at(index, -(errno as i64))
    }
}

impl BackingStore for ManualStore {
    fn submit(&self, op: StoreOp, done: StoreCallback) {
        self.parked.lock().unwrap().push_back(Parked { op, done });
        self.arrived.notify_all();
    }

    fn inflight(&self) -> usize {
        self.parked()
    }

    fn name(&self) -> &'static str {
        "manual"
    }

    fn shutdown(&self) {
        let drained: Vec<Parked> = self.parked.lock().unwrap().drain(..).collect();
        for p in drained {
            (p.done)(-(libc::ESHUTDOWN as i64));
        }
    }
}
