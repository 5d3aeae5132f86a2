#![allow(dead_code)]

use std::os::unix::io::RawFd;
use std::sync::Arc;

use rbdshim_core::{ImageId, PoolId};
use rbdshim_engine::testing::ManualStore;
use rbdshim_engine::{Engine, EngineConfig};

pub const MIB: u64 = 1 << 20;

pub struct Fixture {
    pub engine: Engine,
    pub pool: PoolId,
    pub image: ImageId,
}

/// Engine with one open 1 MiB memory image on worker threads.
pub fn memory_image() -> Fixture {
    let engine = Engine::new(EngineConfig::default().workers(2)).unwrap();
    let pool = engine.pool_open("rbd").unwrap();
    engine.create(pool, "disk", MIB, 12).unwrap();
    let image = engine.open(pool, "disk", None).unwrap();
    Fixture { engine, pool, image }
}

/// Engine with one open 1 MiB image whose operations wait for the test.
pub fn manual_image() -> (Fixture, Arc<ManualStore>) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let pool = engine.pool_open("rbd").unwrap();
    let store = Arc::new(ManualStore::new());
    engine.create_with_store(pool, "manual", MIB, 12, store.clone()).unwrap();
    let image = engine.open(pool, "manual", None).unwrap();
    (Fixture { engine, pool, image }, store)
}

pub fn eventfd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "eventfd failed");
    fd
}

/// Read and reset an eventfd counter; 0 if nothing was signalled.
pub fn drain_eventfd(fd: RawFd) -> u64 {
    let mut val = 0u64;
    let n = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    if n == 8 {
        val
    } else {
        0
    }
}

pub fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0, "pipe2 failed");
    (fds[0], fds[1])
}

pub fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}
