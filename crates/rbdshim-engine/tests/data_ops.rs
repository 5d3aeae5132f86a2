//! Data path: vectored I/O, write-same, discard and write-zeroes.

mod common;

use common::*;
use rbdshim_core::{IoSegment, RbdError};

fn read_back(f: &Fixture, offset: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    assert_eq!(f.engine.read(f.image, offset, &mut out), Ok(len));
    out
}

#[test]
fn vectored_write_then_vectored_read() {
    let f = memory_image();
    let a = vec![0x11u8; 1000];
    let b = vec![0x22u8; 3000];
    let c = f.engine.create_completion(0, None).unwrap();
    unsafe {
        f.engine
            .aio_writev(f.image, 70_000, vec![IoSegment::from_slice(&a), IoSegment::from_slice(&b)], c)
            .unwrap();
    }
    assert_eq!(f.engine.wait_for_complete(c), Ok(4000));
    f.engine.release(c).unwrap();

    let mut x = vec![0u8; 2500];
    let mut y = vec![0u8; 1500];
    let c = f.engine.create_completion(0, None).unwrap();
    unsafe {
        f.engine
            .aio_readv(f.image, 70_000, vec![IoSegment::from_mut_slice(&mut x), IoSegment::from_mut_slice(&mut y)], c)
            .unwrap();
    }
    assert_eq!(f.engine.wait_for_complete(c), Ok(4000));
    f.engine.release(c).unwrap();

    let mut joined = x;
    joined.extend_from_slice(&y);
    let mut expect = a;
    expect.extend_from_slice(&b);
    assert_eq!(joined, expect);
}

#[test]
fn write_same_repeats_stamp() {
    let f = memory_image();
    let c = f.engine.create_completion(0, None).unwrap();
    unsafe { f.engine.aio_write_same(f.image, 100, 10, IoSegment::from_slice(b"ABCDE"), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(10));
    f.engine.release(c).unwrap();
    assert_eq!(read_back(&f, 99, 12), b"\0ABCDEABCDE\0");
}

#[test]
fn write_same_large_range() {
    let f = memory_image();
    let stamp: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    let len = 512 * 1024u64;
    let c = f.engine.create_completion(0, None).unwrap();
    unsafe { f.engine.aio_write_same(f.image, 0, len, IoSegment::from_slice(&stamp), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(len as i64));
    f.engine.release(c).unwrap();

    let data = read_back(&f, 0, len as usize);
    assert!(data.chunks(512).all(|chunk| chunk == stamp.as_slice()));
}

#[test]
fn write_same_rejects_uneven_stamp() {
    let f = memory_image();
    let c = f.engine.create_completion(0, None).unwrap();
    let err = unsafe { f.engine.aio_write_same(f.image, 0, 10, IoSegment::from_slice(b"ABCD"), c) };
    assert_eq!(err.map_err(|e| e.errno()), Err(libc::EINVAL));
    let err = unsafe { f.engine.aio_write_same(f.image, 0, 10, IoSegment::new(std::ptr::null_mut(), 5), c) };
    assert_eq!(err.map_err(|e| e.errno()), Err(libc::EINVAL));
    assert_eq!(f.engine.is_complete(c), Ok(false));
    assert_eq!(read_back(&f, 0, 10), vec![0u8; 10]);
    f.engine.release(c).unwrap();
}

#[test]
fn discard_and_write_zeroes_read_back_zeros() {
    let f = memory_image();
    let ones = vec![0xffu8; 256 * 1024];
    f.engine.write(f.image, 0, &ones).unwrap();

    let c = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_discard(f.image, 1000, 100_000, c).unwrap();
    assert_eq!(f.engine.wait_for_complete(c), Ok(100_000));
    f.engine.release(c).unwrap();

    let c = f.engine.create_completion(0, None).unwrap();
    f.engine.aio_write_zeroes(f.image, 150_000, 50_000, c).unwrap();
    assert_eq!(f.engine.wait_for_complete(c), Ok(50_000));
    f.engine.release(c).unwrap();

    let data = read_back(&f, 0, ones.len());
    for (i, &b) in data.iter().enumerate() {
        let zeroed = (1000..101_000).contains(&i) || (150_000..200_000).contains(&i);
        assert_eq!(b, if zeroed { 0 } else { 0xff }, "byte {}", i);
    }
}

#[test]
fn out_of_range_requests_rejected() {
    let f = memory_image();
    let c = f.engine.create_completion(0, None).unwrap();
    assert!(matches!(f.engine.aio_discard(f.image, MIB, 1, c), Err(RbdError::InvalidArgument(_))));
    assert!(matches!(
        f.engine.aio_write_zeroes(f.image, u64::MAX - 10, 100, c),
        Err(RbdError::InvalidArgument(_))
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(
        unsafe { f.engine.aio_read(f.image, MIB - 4, IoSegment::from_mut_slice(&mut buf), c) },
        Err(RbdError::InvalidArgument(_))
    ));
    // Ending exactly at the image end is fine.
    unsafe { f.engine.aio_read(f.image, MIB - 8, IoSegment::from_mut_slice(&mut buf), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(8));
    f.engine.release(c).unwrap();
}

#[test]
fn zero_length_requests_complete_with_zero() {
    let f = memory_image();
    let c = f.engine.create_completion(0, None).unwrap();
    unsafe { f.engine.aio_write(f.image, 0, IoSegment::new(std::ptr::null_mut(), 0), c).unwrap() };
    assert_eq!(f.engine.wait_for_complete(c), Ok(0));
    f.engine.release(c).unwrap();
}

#[test]
fn file_pool_persists_across_engines() {
    let dir = std::env::temp_dir().join(format!("rbdshim-it-{}", std::process::id()));
    let config = || {
        rbdshim_engine::EngineConfig::default()
            .store(rbdshim_engine::StoreKind::File)
            .dir(dir.clone())
            .workers(2)
    };

    {
        let engine = rbdshim_engine::Engine::new(config()).unwrap();
        let pool = engine.pool_open("rbd").unwrap();
        engine.create(pool, "persist", MIB, 0).unwrap();
        let image = engine.open(pool, "persist", None).unwrap();
        engine.write(image, 4096, b"kept").unwrap();
        engine.flush(image).unwrap();
        engine.close(image).unwrap();
    }

    let engine = rbdshim_engine::Engine::new(config()).unwrap();
    let pool = engine.pool_open("rbd").unwrap();
    assert_eq!(engine.list(pool).unwrap(), vec!["persist".to_string()]);
    let image = engine.open(pool, "persist", None).unwrap();
    let info = engine.stat(image).unwrap();
    assert_eq!(info.size, MIB);
    let mut out = [0u8; 4];
    engine.read(image, 4096, &mut out).unwrap();
    assert_eq!(&out, b"kept");
    engine.close(image).unwrap();
    engine.remove(pool, "persist").unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
