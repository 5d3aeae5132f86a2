//! rbdshim End-to-End Smoke Test
//!
//! Exercises the librbd C surface the way fio's rbd engine does:
//!   Part A - Pool and image lifecycle: create, open, stat, remove
//!   Part B - Data path: sync/async read, write, writev, write-same, discard
//!   Part C - Completion delivery: wait, callback, pipe poll, eventfd poll
//!   Part D - Flush barrier: a flush fails after an earlier write failed
//!   Part E - Unsupported calls: resize and snapshots
//!
//! Run: ./target/release/rbdshim-smoke
//! (RBDSHIM_STORE=file or uring selects a file-backed pool)

use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::{c_int, c_void};

use rbd::aio::*;
use rbd::image::*;
use rbd::pool::*;
use rbd::{rados_ioctx_t, rbd_completion_t, rbd_image_info_t, rbd_image_t, EVENT_TYPE_EVENTFD, EVENT_TYPE_PIPE};
use rbdshim_core::{IoSegment, OpKind};
use rbdshim_engine::{Engine, EngineConfig, MemStore, WorkerStore};

const MIB: u64 = 1 << 20;
const IMAGE_SIZE: u64 = 64 * MIB;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn check_rc(&mut self, name: &str, got: c_int, want: c_int) {
        self.check(name, got == want, &format!("expected {} got {}", want, got));
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn completion() -> rbd_completion_t {
    let mut c = ptr::null_mut();
    unsafe { rbd_aio_create_completion(ptr::null_mut(), None, &mut c) };
    c
}

/// Wait, read the result, release.
fn finish(c: rbd_completion_t) -> isize {
    unsafe {
        rbd_aio_wait_for_complete(c);
        let r = rbd_aio_get_return_value(c);
        rbd_aio_release(c);
        r
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Pool and image lifecycle
// ════════════════════════════════════════════════════════════

fn test_lifecycle(t: &mut TestRunner) -> Option<(rados_ioctx_t, rbd_image_t)> {
    t.section("Part A: Pool and Image Lifecycle");

    let pool = CString::new("smoke").unwrap_or_default();
    let name = CString::new("disk0").unwrap_or_default();
    let mut io = ptr::null_mut();
    let rc = unsafe { rbdshim_pool_open(pool.as_ptr(), &mut io) };
    t.check_rc("rbdshim_pool_open(smoke)", rc, 0);
    if rc != 0 {
        return None;
    }

    // Leftovers from an earlier file-backed run.
    unsafe { rbd_remove(io, name.as_ptr()) };

    let mut order: c_int = 0;
    let rc = unsafe { rbd_create(io, name.as_ptr(), IMAGE_SIZE, &mut order) };
    t.check_rc("rbd_create(64 MiB, order 0)", rc, 0);
    t.check(&format!("default order written back ({})", order), order == 22, "expected 22");
    t.check_rc(
        "rbd_create again -> -EEXIST",
        unsafe { rbd_create(io, name.as_ptr(), IMAGE_SIZE, ptr::null_mut()) },
        -libc::EEXIST,
    );

    let mut image = ptr::null_mut();
    let rc = unsafe { rbd_open(io, name.as_ptr(), &mut image, ptr::null()) };
    t.check_rc("rbd_open(disk0)", rc, 0);
    if rc != 0 {
        return None;
    }

    let mut info = rbd_image_info_t::default();
    let rc = unsafe { rbd_stat(image, &mut info, std::mem::size_of::<rbd_image_info_t>()) };
    t.check(
        &format!("rbd_stat: size={} objs={}", info.size, info.num_objs),
        rc == 0 && info.size == IMAGE_SIZE && info.obj_size == 4 * MIB && info.num_objs == 16,
        &format!("rc={} info={:?}", rc, (info.size, info.obj_size, info.num_objs)),
    );
    t.check_rc("rbd_stat short buffer -> -ERANGE", unsafe { rbd_stat(image, &mut info, 4) }, -libc::ERANGE);
    t.check_rc("rbd_remove while open -> -EBUSY", unsafe { rbd_remove(io, name.as_ptr()) }, -libc::EBUSY);

    let missing = CString::new("missing").unwrap_or_default();
    let mut other = ptr::null_mut();
    t.check_rc(
        "rbd_open(missing) -> -ENOENT",
        unsafe { rbd_open(io, missing.as_ptr(), &mut other, ptr::null()) },
        -libc::ENOENT,
    );

    Some((io, image))
}

// ════════════════════════════════════════════════════════════
// Part B: Data path
// ════════════════════════════════════════════════════════════

fn test_data_path(t: &mut TestRunner, image: rbd_image_t) {
    t.section("Part B: Data Path");

    let pattern: Vec<u8> = (0..65536u32).map(|i| (i * 7 % 251) as u8).collect();
    let rc = unsafe { rbd_write(image, MIB, pattern.len(), pattern.as_ptr() as *const _) };
    t.check_rc("rbd_write 64 KiB", rc, pattern.len() as c_int);
    t.check_rc("rbd_flush", unsafe { rbd_flush(image) }, 0);

    let mut out = vec![0u8; pattern.len()];
    let c = completion();
    unsafe { rbd_aio_read(image, MIB, out.len(), out.as_mut_ptr() as *mut _, c) };
    let r = finish(c);
    t.check("rbd_aio_read returns written data", r == out.len() as isize && out == pattern, &format!("r={}", r));

    let mut a = vec![0xa1u8; 4096];
    let mut b = vec![0xb2u8; 8192];
    let iov = [
        libc::iovec { iov_base: a.as_mut_ptr() as *mut c_void, iov_len: a.len() },
        libc::iovec { iov_base: b.as_mut_ptr() as *mut c_void, iov_len: b.len() },
    ];
    let c = completion();
    unsafe { rbd_aio_writev(image, iov.as_ptr(), 2, 2 * MIB, c) };
    let r = finish(c);
    t.check("rbd_aio_writev 2 segments -> 12288", r == 12288, &format!("r={}", r));

    let mut back = vec![0u8; 12288];
    unsafe { rbd_read(image, 2 * MIB, back.len(), back.as_mut_ptr() as *mut _) };
    t.check(
        "rbd_read after writev",
        back[..4096].iter().all(|&x| x == 0xa1) && back[4096..].iter().all(|&x| x == 0xb2),
        "segment contents differ",
    );

    let c = completion();
    let rc = unsafe { rbd_aio_writesame(image, 0, 10, b"ABCD".as_ptr() as *const _, 4, c, 0) };
    t.check_rc("rbd_aio_writesame 4/10 -> -EINVAL", rc, -libc::EINVAL);
    let rc = unsafe { rbd_aio_writesame(image, 0, 10, b"ABCDE".as_ptr() as *const _, 5, c, 0) };
    let r = finish(c);
    let mut ten = [0u8; 10];
    unsafe { rbd_read(image, 0, 10, ten.as_mut_ptr() as *mut _) };
    t.check("rbd_aio_writesame 5/10 -> two stamps", rc == 0 && r == 10 && &ten == b"ABCDEABCDE", &format!("{:?}", ten));

    let c = completion();
    unsafe { rbd_aio_discard(image, MIB, 32768, c) };
    let r1 = finish(c);
    let c = completion();
    unsafe { rbd_aio_write_zeroes(image, MIB + 32768, 32768, c, 0, 0) };
    let r2 = finish(c);
    unsafe { rbd_read(image, MIB, out.len(), out.as_mut_ptr() as *mut _) };
    t.check(
        "discard + write_zeroes read back zeros",
        r1 == 32768 && r2 == 32768 && out.iter().all(|&x| x == 0),
        &format!("r1={} r2={}", r1, r2),
    );

    let c = completion();
    let rc = unsafe { rbd_aio_write(image, IMAGE_SIZE - 4, 8, pattern.as_ptr() as *const _, c) };
    t.check_rc("write past end -> -EINVAL", rc, -libc::EINVAL);
    unsafe { rbd_aio_release(c) };
}

// ════════════════════════════════════════════════════════════
// Part C: Completion delivery
// ════════════════════════════════════════════════════════════

static CALLBACKS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn on_complete(c: rbd_completion_t, _arg: *mut c_void) {
    rbd_aio_release(c);
    CALLBACKS.fetch_add(1, Ordering::SeqCst);
}

/// Issue `n` discards, then drain them through `rbd_poll_io_events`,
/// draining `rfd` each time it becomes readable.
fn poll_round(image: rbd_image_t, rfd: c_int, n: usize) -> usize {
    for i in 0..n {
        let c = completion();
        unsafe { rbd_aio_discard(image, 8 * MIB + i as u64 * 4096, 4096, c) };
    }
    let mut got = 0;
    let mut comps = [ptr::null_mut(); 16];
    let mut scratch = [0u8; 64];
    let deadline = Instant::now() + Duration::from_secs(5);
    while got < n && Instant::now() < deadline {
        let mut pfd = libc::pollfd { fd: rfd, events: libc::POLLIN, revents: 0 };
        unsafe {
            libc::poll(&mut pfd, 1, 100);
            libc::read(rfd, scratch.as_mut_ptr() as *mut c_void, scratch.len());
        }
        loop {
            let k = unsafe { rbd_poll_io_events(image, comps.as_mut_ptr(), comps.len() as c_int) };
            if k <= 0 {
                break;
            }
            for &c in &comps[..k as usize] {
                unsafe { rbd_aio_release(c) };
            }
            got += k as usize;
        }
    }
    got
}

fn test_delivery(t: &mut TestRunner, image: rbd_image_t) {
    t.section("Part C: Completion Delivery");

    let c = completion();
    unsafe { rbd_aio_flush(image, c) };
    t.check_rc("wait: rbd_aio_wait_for_complete", unsafe { rbd_aio_wait_for_complete(c) }, 0);
    t.check("wait: flush result 0", unsafe { rbd_aio_get_return_value(c) } == 0, "non-zero");
    unsafe { rbd_aio_release(c) };

    for _ in 0..32 {
        let mut c = ptr::null_mut();
        unsafe {
            rbd_aio_create_completion(ptr::null_mut(), Some(on_complete), &mut c);
            rbd_aio_write_zeroes(image, 0, 4096, c, 0, 0);
        }
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while CALLBACKS.load(Ordering::SeqCst) < 32 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    let n = CALLBACKS.load(Ordering::SeqCst);
    t.check(&format!("callback: {} of 32 invoked", n), n == 32, "missing callbacks");

    let mut fds = [0; 2];
    let ok = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } == 0;
    t.check("pipe2()", ok, "pipe2 failed");
    if ok {
        t.check_rc(
            "rbd_set_image_notification(pipe)",
            unsafe { rbd_set_image_notification(image, fds[1], EVENT_TYPE_PIPE) },
            0,
        );
        let got = poll_round(image, fds[0], 24);
        t.check(&format!("pipe poll: {} of 24", got), got == 24, "lost completions");
    }

    let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    t.check("eventfd()", efd >= 0, "eventfd failed");
    if efd >= 0 {
        t.check_rc(
            "rbd_set_image_notification(eventfd)",
            unsafe { rbd_set_image_notification(image, efd, EVENT_TYPE_EVENTFD) },
            0,
        );
        let got = poll_round(image, efd, 40);
        t.check(&format!("eventfd poll: {} of 40", got), got == 40, "lost completions");
        let mut comps = [ptr::null_mut(); 4];
        t.check_rc("poll after drain -> 0", unsafe { rbd_poll_io_events(image, comps.as_mut_ptr(), 4) }, 0);
    }

    if ok {
        unsafe { libc::close(fds[0]); libc::close(fds[1]); }
    }
    if efd >= 0 {
        unsafe { libc::close(efd); }
    }
}

// ════════════════════════════════════════════════════════════
// Part D: Flush barrier
// ════════════════════════════════════════════════════════════

fn test_flush_barrier(t: &mut TestRunner) {
    t.section("Part D: Flush Barrier (fault injection)");

    let engine = match Engine::new(EngineConfig::default()) {
        Ok(e) => e,
        Err(e) => {
            t.fail("Engine::new", &e.to_string());
            return;
        }
    };
    let store = match WorkerStore::new(MemStore::new(), 2) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            t.fail("WorkerStore::new", &e.to_string());
            return;
        }
    };
    let setup = engine.pool_open("faults").and_then(|p| {
        engine.create_with_store(p, "img", MIB, 12, store.clone())?;
        engine.open(p, "img", None)
    });
    let image = match setup {
        Ok(i) => { t.pass("private engine + faulty store"); i }
        Err(e) => {
            t.fail("private engine + faulty store", &e.to_string());
            return;
        }
    };

    store.store().inject_fault(OpKind::Write, libc::EIO, 1);
    let data = vec![1u8; 4096];
    let run = || -> rbdshim_core::Result<(i64, i64)> {
        let w = engine.create_completion(0, None)?;
        let f = engine.create_completion(0, None)?;
        unsafe { engine.aio_write(image, 0, IoSegment::from_slice(&data), w)? };
        engine.aio_flush(image, f)?;
        let rw = engine.wait_for_complete(w)?;
        let rf = engine.wait_for_complete(f)?;
        engine.release(w)?;
        engine.release(f)?;
        Ok((rw, rf))
    };
    match run() {
        Ok((rw, rf)) => {
            t.check(&format!("write fails with {}", rw), rw == -(libc::EIO as i64), "expected -EIO");
            t.check(&format!("later flush fails with {}", rf), rf == -(libc::EIO as i64), "expected -EIO");
        }
        Err(e) => t.fail("write + flush", &e.to_string()),
    }
    t.check("next flush succeeds", engine.flush(image).is_ok(), "error reported twice");
    t.check("close drains", engine.close(image).is_ok(), "close failed");
}

// ════════════════════════════════════════════════════════════
// Part E: Unsupported calls
// ════════════════════════════════════════════════════════════

fn test_unsupported(t: &mut TestRunner, io: rados_ioctx_t, image: rbd_image_t) {
    t.section("Part E: Unsupported Calls");

    let snap = CString::new("snap1").unwrap_or_default();
    let eop = -libc::EOPNOTSUPP;
    t.check_rc("rbd_resize -> -EOPNOTSUPP", unsafe { rbd_resize(image, 2 * IMAGE_SIZE) }, eop);
    t.check_rc("rbd_snap_create -> -EOPNOTSUPP", unsafe { rbd_snap_create(image, snap.as_ptr()) }, eop);
    t.check_rc("rbd_snap_remove -> -EOPNOTSUPP", unsafe { rbd_snap_remove(image, snap.as_ptr()) }, eop);
    t.check_rc("rbd_snap_rollback -> -EOPNOTSUPP", unsafe { rbd_snap_rollback(image, snap.as_ptr()) }, eop);
    let mut size = 0u64;
    unsafe { rbd_get_size(image, &mut size) };
    t.check("size unchanged", size == IMAGE_SIZE, &format!("size={}", size));

    let name = CString::new("disk0").unwrap_or_default();
    let mut ro = ptr::null_mut();
    let rc = unsafe { rbd_open(io, name.as_ptr(), &mut ro, snap.as_ptr()) };
    t.check_rc("rbd_open(snap_name) read-only", rc, 0);
    if rc == 0 {
        t.check_rc("write via snapshot -> -EROFS", unsafe { rbd_write(ro, 0, 1, b"x".as_ptr() as *const _) }, -libc::EROFS);
        unsafe { rbd_close(ro) };
    }
}

// ════════════════════════════════════════════════════════════

fn main() {
    println!("=== rbdshim End-to-End Smoke Test ===");
    let store = std::env::var("RBDSHIM_STORE").unwrap_or_else(|_| "memory".into());
    println!("    store: {}", store);

    let mut t = TestRunner::new();

    let Some((io, image)) = test_lifecycle(&mut t) else {
        println!("\nFATAL: could not open an image");
        t.summary();
        std::process::exit(1);
    };

    test_data_path(&mut t, image);
    test_delivery(&mut t, image);
    test_flush_barrier(&mut t);
    test_unsupported(&mut t, io, image);

    t.section("Teardown");
    t.check_rc("rbd_close", unsafe { rbd_close(image) }, 0);
    let name = CString::new("disk0").unwrap_or_default();
    t.check_rc("rbd_remove", unsafe { rbd_remove(io, name.as_ptr()) }, 0);
    t.check_rc("rbdshim_pool_close", unsafe { rbdshim_pool_close(io) }, 0);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
