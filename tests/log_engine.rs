// End-to-end properties of the append engine: capacity accounting, crash
// atomicity, overrun rejection, rewind, walk, and checker verdicts.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use palog::core::desc::{data_start, DESC_OFF};
use palog::{check, CheckStatus, CreateConfig, ErrorKind, LogPool, MutationHook, MIN_POOL};

fn create_pool(dir: &tempfile::TempDir, name: &str) -> (PathBuf, LogPool) {
    let path = dir.path().join(name);
    let pool = LogPool::create(&path, MIN_POOL, CreateConfig::default()).expect("create pool");
    (path, pool)
}

#[test]
fn capacity_is_constant_across_the_handle_lifetime() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, pool) = create_pool(&dir, "cap.palog");

    let expected = MIN_POOL - data_start();
    assert_eq!(pool.capacity(), expected);
    pool.append(&[1u8; 1000]).expect("append");
    assert_eq!(pool.capacity(), expected);
    pool.rewind().expect("rewind");
    assert_eq!(pool.capacity(), expected);
    drop(pool);

    let reopened = LogPool::open(&path).expect("reopen");
    assert_eq!(reopened.capacity(), expected);
}

#[test]
fn concrete_scenario_from_empty_to_overrun_to_rewind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "scenario.palog");

    assert_eq!(pool.tell(), 0);
    assert_eq!(pool.capacity(), MIN_POOL - data_start());

    pool.append(&[0xAB; 100]).expect("append 100 bytes");
    assert_eq!(pool.tell(), 100);

    let oversize = vec![0u8; (pool.capacity() - 100 + 1) as usize];
    let err = pool.append(&oversize).expect_err("must not fit");
    assert_eq!(err.kind(), ErrorKind::NoSpace);
    assert_eq!(pool.tell(), 100);

    pool.rewind().expect("rewind");
    assert_eq!(pool.tell(), 0);
}

#[test]
fn filling_the_pool_exactly_then_overrunning() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "full.palog");

    let fill = vec![0x5A; pool.capacity() as usize];
    pool.append(&fill).expect("fill to the brim");
    assert_eq!(pool.tell(), pool.capacity());

    let err = pool.append(&[1]).expect_err("pool is full");
    assert_eq!(err.kind(), ErrorKind::NoSpace);
    assert_eq!(pool.tell(), pool.capacity());
}

/// Panics at the descriptor-update boundary, i.e. after the appended data
/// has been made durable but before the write offset advances. Everything
/// up to that point is exactly what a power cut would leave behind.
struct CrashBeforeCommit;

impl MutationHook for CrashBeforeCommit {
    fn unprotect(&self, offset: usize, _len: usize) {
        if offset == DESC_OFF {
            panic!("simulated crash before descriptor update");
        }
    }
}

#[test]
fn interrupted_append_is_invisible_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, pool) = create_pool(&dir, "crash.palog");
    pool.append(b"committed").expect("first append");
    drop(pool);

    let pool = LogPool::open_with_hook(
        &path,
        Default::default(),
        Box::new(CrashBeforeCommit),
    )
    .expect("open with hook");
    let result = catch_unwind(AssertUnwindSafe(|| pool.append(b"lost to the crash")));
    assert!(result.is_err());
    drop(pool);

    let reopened = LogPool::open(&path).expect("reopen after crash");
    assert_eq!(reopened.tell(), 9);
    let mut seen = Vec::new();
    reopened.walk(0, |chunk| {
        seen.extend_from_slice(chunk);
        true
    });
    assert_eq!(seen, b"committed");

    let report = check(&path).expect("check after crash");
    assert_eq!(report.status, CheckStatus::Consistent);
}

#[test]
fn interrupted_vectored_append_is_invisible_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, pool) = create_pool(&dir, "crashv.palog");
    drop(pool);

    let pool = LogPool::open_with_hook(
        &path,
        Default::default(),
        Box::new(CrashBeforeCommit),
    )
    .expect("open with hook");
    let result =
        catch_unwind(AssertUnwindSafe(|| pool.append_vectored(&[b"one", b"two", b"three"])));
    assert!(result.is_err());
    drop(pool);

    let reopened = LogPool::open(&path).expect("reopen after crash");
    assert_eq!(reopened.tell(), 0);
}

#[test]
fn rewind_is_idempotent_and_resets_accounting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "rewind.palog");

    pool.rewind().expect("rewind empty pool");
    assert_eq!(pool.tell(), 0);
    pool.rewind().expect("rewind twice");
    assert_eq!(pool.tell(), 0);

    pool.append(&[1u8; 300]).expect("append N");
    pool.rewind().expect("rewind");
    pool.append(&[2u8; 120]).expect("append M");
    assert_eq!(pool.tell(), 120);
}

#[test]
fn whole_buffer_walk_delivers_everything_in_one_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "walk0.palog");

    let mut expected = Vec::new();
    for round in 0u8..5 {
        let record = vec![round; 100 + round as usize];
        pool.append(&record).expect("append");
        expected.extend_from_slice(&record);
    }

    let mut calls = 0;
    let mut seen = Vec::new();
    pool.walk(0, |chunk| {
        calls += 1;
        seen.extend_from_slice(chunk);
        true
    });
    assert_eq!(calls, 1);
    assert_eq!(seen, expected);
}

#[test]
fn whole_buffer_walk_of_an_empty_pool_sees_one_empty_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "walkempty.palog");

    let mut calls = 0;
    pool.walk(0, |chunk| {
        calls += 1;
        assert!(chunk.is_empty());
        true
    });
    assert_eq!(calls, 1);
}

#[test]
fn chunked_walk_splits_without_reordering_or_loss() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "walkk.palog");

    let total = 10_000usize;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    pool.append(&payload).expect("append");

    let chunk = 4096u64;
    let mut calls = 0;
    let mut seen = Vec::new();
    pool.walk(chunk, |bytes| {
        calls += 1;
        assert!(bytes.len() as u64 <= chunk);
        seen.extend_from_slice(bytes);
        true
    });
    assert_eq!(calls, total.div_ceil(chunk as usize));
    assert_eq!(seen, payload);
}

#[test]
fn walk_stops_the_moment_the_visitor_declines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_path, pool) = create_pool(&dir, "walkstop.palog");
    pool.append(&vec![7u8; 9000]).expect("append");

    let mut calls = 0;
    pool.walk(1024, |_bytes| {
        calls += 1;
        false
    });
    assert_eq!(calls, 1);
}

#[test]
fn append_order_is_preserved_across_vectored_and_plain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, pool) = create_pool(&dir, "order.palog");

    pool.append(b"first|").expect("append");
    pool.append_vectored(&[b"second|", b"third|"]).expect("appendv");
    pool.append(b"fourth").expect("append");
    drop(pool);

    let reopened = LogPool::open(&path).expect("reopen");
    let mut seen = Vec::new();
    reopened.walk(0, |chunk| {
        seen.extend_from_slice(chunk);
        true
    });
    assert_eq!(seen, b"first|second|third|fourth");
}

#[test]
fn checker_runs_alongside_an_open_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, pool) = create_pool(&dir, "live.palog");
    pool.append(b"live data").expect("append");

    // copy-on-write view, so the writer's lock does not exclude it
    let report = check(&path).expect("check while open");
    assert_eq!(report.status, CheckStatus::Consistent);

    pool.append(b", more").expect("append after check");
    assert_eq!(pool.tell(), 15);
}

#[test]
fn checker_distinguishes_unknown_from_broken() {
    let dir = tempfile::tempdir().expect("tempdir");

    let missing: &Path = &dir.path().join("nope.palog");
    assert!(check(missing).is_err());

    let (path, pool) = create_pool(&dir, "verdict.palog");
    drop(pool);
    let report = check(&path).expect("check");
    assert_eq!(report.status, CheckStatus::Consistent);
}
