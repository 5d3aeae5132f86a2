//! Flush barrier.
//!
//! Every mutation gets a sequence number when it is issued. A flush records
//! the next unassigned number as its watermark and is held back until no
//! mutation below the watermark is outstanding. When it is released it
//! inherits the first failure recorded below its watermark; only a clean
//! flush reaches the backing store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

/// Starts a released flush. `Some(err)` carries the negative errno of an
/// earlier failed mutation; `None` means the store flush may proceed.
pub type FlushStart = Box<dyn FnOnce(Option<i64>) + Send + 'static>;

struct PendingFlush {
    watermark: u64,
    start: FlushStart,
}

#[derive(Default)]
struct BarrierState {
    next_seq: u64,
    outstanding: BTreeSet<u64>,
    /// Watermark order, since watermarks only grow.
    waiting: VecDeque<PendingFlush>,
    /// Failed mutations not yet reported by a flush.
    errors: BTreeMap<u64, i64>,
}

impl BarrierState {
    fn is_clear(&self, watermark: u64) -> bool {
        self.outstanding.first().map_or(true, |&low| low >= watermark)
    }

    fn error_below(&self, watermark: u64) -> Option<i64> {
        self.errors.range(..watermark).next().map(|(_, &e)| e)
    }

    /// Report the first failure below `watermark` and forget all of them.
    fn take_error_below(&mut self, watermark: u64) -> Option<i64> {
        let err = self.error_below(watermark);
        self.errors = self.errors.split_off(&watermark);
        err
    }

    /// Pop every flush that may run now, paired with its inherited error.
    /// Each failure goes to the first released flush whose watermark covers it.
    fn take_released(&mut self) -> Vec<(FlushStart, Option<i64>)> {
        let mut released = Vec::new();
        while self.waiting.front().is_some_and(|f| self.is_clear(f.watermark)) {
            let Some(f) = self.waiting.pop_front() else { break };
            let err = self.take_error_below(f.watermark);
            released.push((f.start, err));
        }
        released
    }
}

#[derive(Default)]
pub struct FlushBarrier {
    state: Mutex<BarrierState>,
}

impl FlushBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutation about to be submitted.
    pub fn write_begin(&self) -> u64 {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let seq = st.next_seq;
        st.next_seq += 1;
        st.outstanding.insert(seq);
        seq
    }

    /// Record the outcome of mutation `seq` and start any flush it held back.
    pub fn write_end(&self, seq: u64, result: i64) {
        let released = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.outstanding.remove(&seq);
            if result < 0 {
                st.errors.insert(seq, result);
            }
            st.take_released()
        };
        for (start, err) in released {
            start(err);
        }
    }

    /// Queue a flush behind every mutation registered so far.
    ///
    /// `start` runs inline when nothing is outstanding, otherwise on the
    /// thread that resolves the last earlier mutation.
    pub fn flush(&self, start: FlushStart) {
        let now = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let watermark = st.next_seq;
            if st.waiting.is_empty() && st.is_clear(watermark) {
                Some(st.take_error_below(watermark))
            } else {
                st.waiting.push_back(PendingFlush { watermark, start });
                return;
            }
        };
        if let Some(err) = now {
            start(err);
        }
    }

    /// Mutations issued but not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).outstanding.len()
    }

    /// Flushes held back.
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<Option<i64>>>>, impl Fn() -> FlushStart) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let make = move || {
            let l = Arc::clone(&l);
            Box::new(move |err| l.lock().unwrap().push(err)) as FlushStart
        };
        (log, make)
    }

    #[test]
    fn test_flush_with_nothing_outstanding_runs_inline() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        b.flush(start());
        assert_eq!(*log.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_flush_waits_for_earlier_writes() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        let w1 = b.write_begin();
        let w2 = b.write_begin();
        b.flush(start());
        assert_eq!(b.waiting(), 1);

        b.write_end(w2, 4096);
        assert!(log.lock().unwrap().is_empty());
        b.write_end(w1, 4096);
        assert_eq!(*log.lock().unwrap(), vec![None]);
        assert_eq!(b.waiting(), 0);
    }

    #[test]
    fn test_later_writes_do_not_hold_flush() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        let w1 = b.write_begin();
        b.flush(start());
        let _w2 = b.write_begin();
        b.write_end(w1, 512);
        assert_eq!(*log.lock().unwrap(), vec![None]);
        assert_eq!(b.outstanding(), 1);
    }

    #[test]
    fn test_flush_inherits_earlier_failure() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        let w1 = b.write_begin();
        let w2 = b.write_begin();
        b.flush(start());
        b.write_end(w1, -(libc::EIO as i64));
        b.write_end(w2, 4096);
        assert_eq!(*log.lock().unwrap(), vec![Some(-(libc::EIO as i64))]);

        // Reported once.
        b.flush(start());
        assert_eq!(log.lock().unwrap()[1], None);
    }

    #[test]
    fn test_failure_reported_by_one_of_a_released_batch() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        let w1 = b.write_begin();
        b.flush(start());
        let w2 = b.write_begin();
        b.flush(start());
        b.write_end(w2, 4096);
        assert!(log.lock().unwrap().is_empty());

        b.write_end(w1, -(libc::EIO as i64));
        assert_eq!(*log.lock().unwrap(), vec![Some(-(libc::EIO as i64)), None]);
    }

    #[test]
    fn test_failure_between_batched_watermarks_goes_to_later_flush() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        let w1 = b.write_begin();
        b.flush(start());
        let w2 = b.write_begin();
        b.flush(start());
        b.write_end(w2, -(libc::ENOSPC as i64));
        b.write_end(w1, 512);
        assert_eq!(*log.lock().unwrap(), vec![None, Some(-(libc::ENOSPC as i64))]);
    }

    #[test]
    fn test_failure_after_watermark_is_not_inherited() {
        let b = FlushBarrier::new();
        let (log, start) = recorder();
        b.flush(start());
        let w = b.write_begin();
        b.write_end(w, -(libc::ENOSPC as i64));
        assert_eq!(*log.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_flushes_release_in_order() {
        let b = FlushBarrier::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let w1 = b.write_begin();
        let o = Arc::clone(&order);
        b.flush(Box::new(move |_| o.lock().unwrap().push(1)));
        let w2 = b.write_begin();
        let o = Arc::clone(&order);
        b.flush(Box::new(move |_| o.lock().unwrap().push(2)));

        b.write_end(w2, 0);
        assert!(order.lock().unwrap().is_empty());
        b.write_end(w1, 0);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
