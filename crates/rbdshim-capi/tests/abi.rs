//! Drives the exported functions the way a C consumer would.

use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use libc::{c_char, c_int, c_void, iovec};
use rbd::*;
use rbd::aio::*;
use rbd::image::*;
use rbd::pool::*;

const MIB: u64 = 1 << 20;

struct Session {
    io: rados_ioctx_t,
    image: rbd_image_t,
    name: CString,
}

impl Session {
    /// Fresh pool + 1 MiB image; names are unique per test.
    fn open(tag: &str) -> Self {
        let pool = CString::new(format!("abi-{}", tag)).unwrap();
        let name = CString::new(format!("img-{}", tag)).unwrap();
        let mut io = ptr::null_mut();
        let mut image = ptr::null_mut();
        unsafe {
            assert_eq!(rbdshim_pool_open(pool.as_ptr(), &mut io), 0);
            let mut order: c_int = 12;
            assert_eq!(rbd_create(io, name.as_ptr(), MIB, &mut order), 0);
            assert_eq!(order, 12);
            assert_eq!(rbd_open(io, name.as_ptr(), &mut image, ptr::null()), 0);
        }
        Session { io, image, name }
    }

    fn completion(&self) -> rbd_completion_t {
        let mut c = ptr::null_mut();
        assert_eq!(unsafe { rbd_aio_create_completion(ptr::null_mut(), None, &mut c) }, 0);
        c
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        unsafe {
            rbd_close(self.image);
            rbd_remove(self.io, self.name.as_ptr());
            rbdshim_pool_close(self.io);
        }
    }
}

#[test]
fn stat_reports_geometry_and_checks_size() {
    let s = Session::open("stat");
    let mut info = rbd_image_info_t::default();
    unsafe {
        assert_eq!(rbd_stat(s.image, &mut info, std::mem::size_of::<rbd_image_info_t>()), 0);
        assert_eq!(rbd_stat(s.image, &mut info, 8), -libc::ERANGE);
        let mut size = 0u64;
        assert_eq!(rbd_get_size(s.image, &mut size), 0);
        assert_eq!(size, MIB);
        assert_eq!(rbd_invalidate_cache(s.image), 0);
    }
    assert_eq!(info.size, MIB);
    assert_eq!(info.obj_size, 4096);
    assert_eq!(info.num_objs, 256);
    assert_eq!(info.order, 12);
    assert!(info.block_name_prefix.iter().all(|&b| b == 0));
    assert_eq!(info.parent_pool, 0);
}

#[test]
fn default_order_is_written_back() {
    let pool = CString::new("abi-order").unwrap();
    let name = CString::new("deflt").unwrap();
    let mut io = ptr::null_mut();
    unsafe {
        assert_eq!(rbdshim_pool_open(pool.as_ptr(), &mut io), 0);
        let mut order: c_int = 0;
        assert_eq!(rbd_create(io, name.as_ptr(), 8 * MIB, &mut order), 0);
        assert_eq!(order, 22);
        assert_eq!(rbd_create(io, name.as_ptr(), 8 * MIB, ptr::null_mut()), -libc::EEXIST);
        let mut bad: c_int = 40;
        let other = CString::new("bad").unwrap();
        assert_eq!(rbd_create(io, other.as_ptr(), MIB, &mut bad), -libc::EINVAL);
        assert_eq!(rbd_remove(io, name.as_ptr()), 0);
        assert_eq!(rbd_remove(io, name.as_ptr()), -libc::ENOENT);
        assert_eq!(rbdshim_pool_close(io), 0);
    }
}

#[test]
fn sync_write_then_aio_read() {
    let s = Session::open("sync");
    let data = b"hello, block device";
    let mut out = vec![0u8; data.len()];
    unsafe {
        assert_eq!(rbd_write(s.image, 512, data.len(), data.as_ptr() as *const _), data.len() as c_int);
        assert_eq!(rbd_flush(s.image), 0);

        let c = s.completion();
        assert_eq!(rbd_aio_read(s.image, 512, out.len(), out.as_mut_ptr() as *mut _, c), 0);
        assert_eq!(rbd_aio_wait_for_complete(c), 0);
        assert_eq!(rbd_aio_get_return_value(c), data.len() as isize);
        rbd_aio_release(c);
    }
    assert_eq!(out, data);
}

#[test]
fn vectored_io_through_iovec() {
    let s = Session::open("iov");
    let mut a = [0x41u8; 100];
    let mut b = [0x42u8; 156];
    let iov = [
        iovec { iov_base: a.as_mut_ptr() as *mut c_void, iov_len: a.len() },
        iovec { iov_base: b.as_mut_ptr() as *mut c_void, iov_len: b.len() },
    ];
    unsafe {
        let c = s.completion();
        assert_eq!(rbd_aio_writev(s.image, iov.as_ptr(), 2, 4096, c), 0);
        rbd_aio_wait_for_complete(c);
        assert_eq!(rbd_aio_get_return_value(c), 256);
        rbd_aio_release(c);

        let mut out = [0u8; 256];
        assert_eq!(rbd_read(s.image, 4096, 256, out.as_mut_ptr() as *mut _), 256);
        assert!(out[..100].iter().all(|&x| x == 0x41));
        assert!(out[100..].iter().all(|&x| x == 0x42));

        let c = s.completion();
        assert_eq!(rbd_aio_readv(s.image, iov.as_ptr(), -1, 0, c), -libc::EINVAL);
        assert_eq!(rbd_aio_readv(s.image, ptr::null(), 2, 0, c), -libc::EINVAL);
        rbd_aio_release(c);
    }
}

#[test]
fn writesame_checks_stamp_length() {
    let s = Session::open("ws");
    unsafe {
        let c = s.completion();
        assert_eq!(rbd_aio_writesame(s.image, 0, 10, b"ABCD".as_ptr() as *const _, 4, c, 0), -libc::EINVAL);
        assert_eq!(rbd_aio_writesame(s.image, 0, 10, b"ABCDE".as_ptr() as *const _, 5, c, 0), 0);
        rbd_aio_wait_for_complete(c);
        assert_eq!(rbd_aio_get_return_value(c), 10);
        rbd_aio_release(c);

        let mut out = [0u8; 10];
        rbd_read(s.image, 0, 10, out.as_mut_ptr() as *mut _);
        assert_eq!(&out, b"ABCDEABCDE");

        let c = s.completion();
        assert_eq!(rbd_aio_discard(s.image, 0, 5, c), 0);
        rbd_aio_wait_for_complete(c);
        rbd_aio_release(c);
        let c = s.completion();
        assert_eq!(rbd_aio_write_zeroes(s.image, 5, 5, c, 0, 0), 0);
        rbd_aio_wait_for_complete(c);
        rbd_aio_release(c);
        rbd_read(s.image, 0, 10, out.as_mut_ptr() as *mut _);
        assert_eq!(out, [0u8; 10]);
    }
}

static CALLBACKS: AtomicUsize = AtomicUsize::new(0);
static CALLBACK_MISMATCHES: AtomicUsize = AtomicUsize::new(0);

// Panicking across the C boundary aborts, so mismatches are counted.
unsafe extern "C" fn count_and_release(c: rbd_completion_t, arg: *mut c_void) {
    let ok = arg as usize == 0xabc && rbd_aio_get_arg(c) as usize == 0xabc && rbd_aio_get_return_value(c) == 0;
    if !ok {
        CALLBACK_MISMATCHES.fetch_add(1, Ordering::SeqCst);
    }
    rbd_aio_release(c);
    CALLBACKS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn callback_receives_handle_and_argument() {
    let s = Session::open("cb");
    unsafe {
        for _ in 0..16 {
            let mut c = ptr::null_mut();
            assert_eq!(rbd_aio_create_completion(0xabc as *mut c_void, Some(count_and_release), &mut c), 0);
            assert_eq!(rbd_aio_flush(s.image, c), 0);
        }
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while CALLBACKS.load(Ordering::SeqCst) < 16 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(CALLBACKS.load(Ordering::SeqCst), 16);
    assert_eq!(CALLBACK_MISMATCHES.load(Ordering::SeqCst), 0);
}

static SLOW_READS: AtomicUsize = AtomicUsize::new(0);
static SLOW_MISMATCHES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn slow_reader(c: rbd_completion_t, _arg: *mut c_void) {
    std::thread::sleep(Duration::from_millis(50));
    if rbd_aio_get_return_value(c) != 4096 {
        SLOW_MISMATCHES.fetch_add(1, Ordering::SeqCst);
    }
    SLOW_READS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn waiter_wakes_only_after_callback_returns() {
    let s = Session::open("slowcb");
    let data = [7u8; 4096];
    unsafe {
        let mut c = ptr::null_mut();
        assert_eq!(rbd_aio_create_completion(ptr::null_mut(), Some(slow_reader), &mut c), 0);
        assert_eq!(rbd_aio_write(s.image, 0, data.len(), data.as_ptr() as *const c_char, c), 0);
        assert_eq!(rbd_aio_wait_for_complete(c), 0);
        assert_eq!(SLOW_READS.load(Ordering::SeqCst), 1);
        rbd_aio_release(c);
    }
    assert_eq!(SLOW_MISMATCHES.load(Ordering::SeqCst), 0);
}

#[test]
fn eventfd_poll_loop() {
    let s = Session::open("poll");
    let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(efd >= 0);
    unsafe {
        assert_eq!(rbd_set_image_notification(s.image, efd, 7), -libc::EINVAL);
        assert_eq!(rbd_set_image_notification(s.image, efd, EVENT_TYPE_EVENTFD), 0);

        let mut issued = Vec::new();
        for i in 0..8u64 {
            let c = s.completion();
            assert_eq!(rbd_aio_discard(s.image, i * 4096, 4096, c), 0);
            issued.push(c);
        }

        let mut got = Vec::new();
        let mut comps = [ptr::null_mut(); 4];
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < issued.len() && Instant::now() < deadline {
            let mut pfd = libc::pollfd { fd: efd, events: libc::POLLIN, revents: 0 };
            libc::poll(&mut pfd, 1, 100);
            let mut counter = 0u64;
            libc::read(efd, &mut counter as *mut u64 as *mut c_void, 8);
            loop {
                let n = rbd_poll_io_events(s.image, comps.as_mut_ptr(), comps.len() as c_int);
                assert!(n >= 0);
                if n == 0 {
                    break;
                }
                for &c in &comps[..n as usize] {
                    assert_eq!(rbd_aio_get_return_value(c), 4096);
                    got.push(c);
                    rbd_aio_release(c);
                }
            }
        }
        assert_eq!(got.len(), issued.len());
        for c in &issued {
            assert!(got.contains(c));
        }
        assert_eq!(rbd_poll_io_events(s.image, comps.as_mut_ptr(), 4), 0);
        libc::close(efd);
    }
}

#[test]
fn stale_and_null_handles_are_rejected() {
    let s = Session::open("stale");
    unsafe {
        let c = s.completion();
        rbd_aio_release(c);
        assert_eq!(rbd_aio_get_return_value(c), -(libc::EBADF as isize));
        assert_eq!(rbd_aio_wait_for_complete(c), -libc::EBADF);
        assert_eq!(rbd_aio_flush(s.image, c), -libc::EBADF);
        assert!(rbd_aio_get_arg(c).is_null());

        assert_eq!(rbd_close(ptr::null_mut()), -libc::EBADF);
        assert_eq!(rbd_flush(ptr::null_mut()), -libc::EBADF);
        assert_eq!(rbd_aio_create_completion(ptr::null_mut(), None, ptr::null_mut()), -libc::EINVAL);
    }
}

#[test]
fn pending_completion_reports_in_progress() {
    let s = Session::open("pending");
    unsafe {
        let c = s.completion();
        assert_eq!(rbd_aio_get_return_value(c), -(libc::EINPROGRESS as isize));
        rbd_aio_release(c);
    }
}

#[test]
fn snapshot_open_is_read_only() {
    let s = Session::open("snap");
    let snap_name = CString::new("golden").unwrap();
    let mut snap = ptr::null_mut();
    unsafe {
        assert_eq!(rbd_open(s.io, s.name.as_ptr(), &mut snap, snap_name.as_ptr()), 0);
        assert_eq!(rbd_write(snap, 0, 4, b"nope".as_ptr() as *const _), -libc::EROFS);
        let mut out = [0u8; 4];
        assert_eq!(rbd_read(snap, 0, 4, out.as_mut_ptr() as *mut _), 4);
        assert_eq!(rbd_close(snap), 0);
    }
}

#[test]
fn unsupported_calls_leave_image_alone() {
    let s = Session::open("stubs");
    let snap = CString::new("s1").unwrap();
    let mut max: c_int = 4;
    let mut snaps = [rbd_snap_info_t { id: 0, size: 0, name: ptr::null() }; 4];
    unsafe {
        assert_eq!(rbd_resize(s.image, 2 * MIB), -libc::EOPNOTSUPP);
        assert_eq!(rbd_snap_create(s.image, snap.as_ptr()), -libc::EOPNOTSUPP);
        assert_eq!(rbd_snap_list(s.image, snaps.as_mut_ptr(), &mut max), -libc::EOPNOTSUPP);
        rbd_snap_list_end(snaps.as_mut_ptr());
        assert_eq!(rbd_snap_remove(s.image, snap.as_ptr()), -libc::EOPNOTSUPP);
        assert_eq!(rbd_snap_rollback(s.image, snap.as_ptr()), -libc::EOPNOTSUPP);
        assert_eq!(max, 4);

        // Names and handles are never looked at.
        let bad_utf8: [u8; 3] = [0xff, 0xfe, 0];
        let bad = bad_utf8.as_ptr() as *const c_char;
        assert_eq!(rbd_snap_create(s.image, bad), -libc::EOPNOTSUPP);
        assert_eq!(rbd_snap_remove(s.image, bad), -libc::EOPNOTSUPP);
        assert_eq!(rbd_snap_rollback(s.image, ptr::null()), -libc::EOPNOTSUPP);
        assert_eq!(rbd_resize(ptr::null_mut(), MIB), -libc::EOPNOTSUPP);
        assert_eq!(rbd_snap_list(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()), -libc::EOPNOTSUPP);

        let mut size = 0u64;
        rbd_get_size(s.image, &mut size);
        assert_eq!(size, MIB);
    }
}

static PROGRESS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn on_progress(done: u64, total: u64, data: *mut c_void) -> c_int {
    if done == total && data as usize == 0x77 {
        PROGRESS.fetch_add(1, Ordering::SeqCst);
    }
    0
}

#[test]
fn remove_with_progress_reports_once() {
    let pool = CString::new("abi-progress").unwrap();
    let name = CString::new("gone").unwrap();
    let mut io = ptr::null_mut();
    let mut image = ptr::null_mut();
    unsafe {
        assert_eq!(rbdshim_pool_open(pool.as_ptr(), &mut io), 0);
        assert_eq!(rbd_create(io, name.as_ptr(), MIB, ptr::null_mut()), 0);
        assert_eq!(rbd_open(io, name.as_ptr(), &mut image, ptr::null()), 0);
        assert_eq!(rbd_remove_with_progress(io, name.as_ptr(), Some(on_progress), 0x77 as *mut c_void), -libc::EBUSY);
        assert_eq!(rbdshim_pool_close(io), -libc::EBUSY);
        assert_eq!(rbd_close(image), 0);
        assert_eq!(rbd_remove_with_progress(io, name.as_ptr(), Some(on_progress), 0x77 as *mut c_void), 0);
        assert_eq!(rbdshim_pool_close(io), 0);
    }
    assert_eq!(PROGRESS.load(Ordering::SeqCst), 1);
}
