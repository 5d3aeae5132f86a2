//! The three ways a caller consumes completions: wait, callback, poll.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use rbdshim_core::{IoSegment, NotifyKind, RbdError};

#[test]
fn wait_returns_byte_count() {
    let f = memory_image();
    let data = vec![0x5au8; 8192];
    let c = f.engine.create_completion(7, None).unwrap();
    unsafe { f.engine.aio_write(f.image, 4096, IoSegment::from_slice(&data), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(8192));
    assert_eq!(f.engine.get_result(c), Ok(8192));
    assert_eq!(f.engine.get_arg(c), Ok(7));
    f.engine.release(c).unwrap();

    let mut out = vec![0u8; 8192];
    let c = f.engine.create_completion(0, None).unwrap();
    unsafe { f.engine.aio_read(f.image, 4096, IoSegment::from_mut_slice(&mut out), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(8192));
    f.engine.release(c).unwrap();
    assert_eq!(out, data);
}

#[test]
fn result_before_ready_is_in_progress() {
    let (f, store) = manual_image();
    let c = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_flush(f.image, c).unwrap();
    assert_eq!(f.engine.get_result(c), Err(RbdError::NotReady));
    assert_eq!(f.engine.get_arg(c), Err(RbdError::NotReady));
    assert_eq!(f.engine.is_complete(c), Ok(false));
    store.run_all();
    assert_eq!(f.engine.get_result(c), Ok(0));
}

#[test]
fn callback_runs_once_with_argument() {
    let f = memory_image();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let c = f
        .engine
        .create_completion(
            0xfeed,
            Some(Box::new(move |id, arg| s.lock().unwrap().push((id, arg)))),
        )
        .unwrap();
    f.engine.aio_discard(f.image, 0, 4096, c).unwrap();
    f.engine.wait_for_complete(c).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(c, 0xfeed)]);
    f.engine.release(c).unwrap();
}

#[test]
fn callback_reads_result_before_waiter_wakes() {
    let f = Arc::new(memory_image());
    let seen = Arc::new(Mutex::new(None));
    let (f2, s) = (Arc::clone(&f), Arc::clone(&seen));
    let c = f
        .engine
        .create_completion(
            0,
            Some(Box::new(move |id, _| {
                std::thread::sleep(Duration::from_millis(50));
                *s.lock().unwrap() = Some((f2.engine.get_result(id), f2.engine.is_complete(id)));
            })),
        )
        .unwrap();
    let data = vec![1u8; 4096];
    unsafe { f.engine.aio_write(f.image, 0, IoSegment::from_slice(&data), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(4096));
    f.engine.release(c).unwrap();

    assert_eq!(*seen.lock().unwrap(), Some((Ok(4096), Ok(false))));
    assert_eq!(f.engine.live_completions(), 0);
}

#[test]
fn callback_finishes_before_poll_sees_completion() {
    let f = Arc::new(memory_image());
    let efd = eventfd();
    f.engine.set_image_notification(f.image, efd, NotifyKind::EventFd).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let fin = Arc::clone(&finished);
    let c = f
        .engine
        .create_completion(
            0,
            Some(Box::new(move |_, _| {
                std::thread::sleep(Duration::from_millis(50));
                fin.store(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    f.engine.aio_flush(f.image, c).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut polled = Vec::new();
    while polled.is_empty() && std::time::Instant::now() < deadline {
        if drain_eventfd(efd) > 0 {
            assert_eq!(finished.load(Ordering::SeqCst), 1, "signalled before the callback returned");
        }
        polled = f.engine.poll_io_events(f.image, 4).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(polled, vec![c]);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(f.engine.get_result(c), Ok(0));
    f.engine.release(c).unwrap();
    close_fd(efd);
}

#[test]
fn callback_may_release_its_completion() {
    let f = Arc::new(memory_image());
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        let f2 = Arc::clone(&f);
        let d = Arc::clone(&done);
        let c = f
            .engine
            .create_completion(
                0,
                Some(Box::new(move |id, _| {
                    f2.engine.release(id).unwrap();
                    d.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        f.engine.aio_write_zeroes(f.image, 0, 512, c).unwrap();
    }
    // The engine reclaims each object just after its callback returns.
    for _ in 0..1000 {
        if done.load(Ordering::SeqCst) == 32 && f.engine.live_completions() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(done.load(Ordering::SeqCst), 32);
    assert_eq!(f.engine.live_completions(), 0);
}

#[test]
fn poll_returns_exactly_the_ready_ones_then_zero() {
    let (f, store) = manual_image();
    let efd = eventfd();
    f.engine.set_image_notification(f.image, efd, NotifyKind::EventFd).unwrap();

    let comps: Vec<_> = (0..5)
        .map(|i| {
            let c = f.engine.create_completion(i, None).unwrap();
            f.engine.aio_discard(f.image, i as u64 * 4096, 4096, c).unwrap();
            c
        })
        .collect();
    assert!(store.wait_parked(5, Duration::from_secs(5)));

    // Resolve 3 of the 5.
    store.run_next();
    store.run_next();
    store.run_next();
    assert_eq!(drain_eventfd(efd), 3);

    let polled = f.engine.poll_io_events(f.image, 10).unwrap();
    assert_eq!(polled.len(), 3);
    let polled: HashSet<_> = polled.into_iter().collect();
    assert!(polled.iter().all(|c| comps.contains(c)));
    assert!(f.engine.poll_io_events(f.image, 10).unwrap().is_empty());

    for c in polled {
        f.engine.release(c).unwrap();
    }
    store.run_all();
    assert_eq!(f.engine.poll_io_events(f.image, 1).unwrap().len(), 1);
    assert_eq!(f.engine.poll_io_events(f.image, 8).unwrap().len(), 1);
    close_fd(efd);
}

#[test]
fn poll_with_pipe_notification() {
    let f = memory_image();
    let (rd, wr) = pipe();
    f.engine.set_image_notification(f.image, wr, NotifyKind::Pipe).unwrap();
    let c = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_flush(f.image, c).unwrap();
    f.engine.wait_for_complete(c).unwrap();

    let mut polled = Vec::new();
    for _ in 0..500 {
        polled = f.engine.poll_io_events(f.image, 4).unwrap();
        if !polled.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(polled, vec![c]);

    let mut byte = [0u8; 4];
    let n = unsafe { libc::read(rd, byte.as_mut_ptr() as *mut libc::c_void, byte.len()) };
    assert_eq!(n, 1);
    f.engine.release(c).unwrap();
    close_fd(rd);
    close_fd(wr);
}

#[test]
fn new_notification_target_replaces_old() {
    let (f, store) = manual_image();
    let first = eventfd();
    let second = eventfd();
    f.engine.set_image_notification(f.image, first, NotifyKind::EventFd).unwrap();
    f.engine.set_image_notification(f.image, second, NotifyKind::EventFd).unwrap();

    let c = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_discard(f.image, 0, 4096, c).unwrap();
    store.run_all();

    assert_eq!(drain_eventfd(first), 0);
    assert_eq!(drain_eventfd(second), 1);
    assert_eq!(f.engine.poll_io_events(f.image, 8).unwrap(), vec![c]);
    assert!(f.engine.poll_io_events(f.image, 8).unwrap().is_empty());
    f.engine.release(c).unwrap();
    close_fd(first);
    close_fd(second);
}

#[test]
fn nothing_queued_without_notification() {
    let f = memory_image();
    let c = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_flush(f.image, c).unwrap();
    f.engine.wait_for_complete(c).unwrap();
    assert!(f.engine.poll_io_events(f.image, 8).unwrap().is_empty());
    f.engine.release(c).unwrap();
}

#[test]
fn released_before_poll_is_skipped() {
    let (f, store) = manual_image();
    let efd = eventfd();
    f.engine.set_image_notification(f.image, efd, NotifyKind::EventFd).unwrap();
    let a = f.engine.create_completion(0, None).unwrap();
    let b = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_flush(f.image, a).unwrap();
    store.run_all();
    f.engine.aio_flush(f.image, b).unwrap();
    store.run_all();

    f.engine.release(a).unwrap();
    assert_eq!(f.engine.poll_io_events(f.image, 8).unwrap(), vec![b]);
    f.engine.release(b).unwrap();
    close_fd(efd);
}

#[test]
fn concurrent_issue_delivers_each_completion_once() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    let f = Arc::new(memory_image());
    let efd = eventfd();
    f.engine.set_image_notification(f.image, efd, NotifyKind::EventFd).unwrap();
    let callbacks = Arc::new(AtomicUsize::new(0));

    let issuers: Vec<_> = (0..THREADS)
        .map(|t| {
            let f = Arc::clone(&f);
            let callbacks = Arc::clone(&callbacks);
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let cb = Arc::clone(&callbacks);
                    let c = f
                        .engine
                        .create_completion(
                            t * PER_THREAD + i,
                            Some(Box::new(move |_, _| {
                                cb.fetch_add(1, Ordering::SeqCst);
                            })),
                        )
                        .unwrap();
                    let off = ((t * PER_THREAD + i) % 256) as u64 * 4096;
                    f.engine.aio_write_zeroes(f.image, off, 4096, c).unwrap();
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let total = THREADS * PER_THREAD;
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    while seen.len() < total && std::time::Instant::now() < deadline {
        for c in f.engine.poll_io_events(f.image, 64).unwrap() {
            assert_eq!(f.engine.get_result(c), Ok(4096));
            assert!(seen.insert(c), "{} delivered twice", c);
            f.engine.release(c).unwrap();
        }
        drain_eventfd(efd);
    }
    for t in issuers {
        t.join().unwrap();
    }
    assert_eq!(seen.len(), total);
    // Every callback returned before its completion was queued.
    assert_eq!(callbacks.load(Ordering::SeqCst), total);
    assert!(f.engine.poll_io_events(f.image, 64).unwrap().is_empty());
    assert_eq!(f.engine.live_completions(), 0);
    close_fd(efd);
}
