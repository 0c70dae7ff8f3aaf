// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-guarded typed segments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use xproc::{lock_key, GuardedSharedMemory, IpcError, NamedMutex, SharedMemorySegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{prefix}_guarded_{}_{n}", std::process::id());
    SharedMemorySegment::unlink_by_name(&name);
    NamedMutex::clear_storage(&lock_key(&name));
    name
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Counters {
    hits: u64,
    last_writer: u32,
}

unsafe impl xproc::ShmSafe for Counters {}

#[test]
fn lock_key_is_derived() {
    let name = unique_name("derived");
    let g = GuardedSharedMemory::<u64>::open(&name).expect("open");
    assert!(g.is_valid());
    assert_eq!(g.key(), name);
    assert_eq!(g.lock_key(), format!("{name}#lock"));
    assert_eq!(g.segment().size(), std::mem::size_of::<u64>());
}

#[test]
fn guard_reads_and_writes_value() {
    let name = unique_name("rw");
    let mut g = GuardedSharedMemory::<Counters>::open(&name).expect("open");
    {
        let mut access = g.lock().expect("lock");
        assert_eq!(*access, Counters::default());
        access.hits = 3;
        access.last_writer = 9;
    }
    let mut other = GuardedSharedMemory::<Counters>::open(&name).expect("open other");
    let access = other.lock().expect("lock other");
    assert_eq!(access.get(), Counters { hits: 3, last_writer: 9 });
}

#[test]
fn increments_are_serialised_across_instances() {
    let name = unique_name("serialised");
    let threads = 4;
    let per_thread = 200;

    // Keep one instance alive so the segment outlives the workers.
    let mut keep = GuardedSharedMemory::<Counters>::open(&name).expect("open");

    let handles: Vec<_> = (0..threads)
        .map(|id| {
            let name = name.clone();
            thread::spawn(move || {
                let mut g = GuardedSharedMemory::<Counters>::open(&name).expect("open");
                for _ in 0..per_thread {
                    let mut access = g.lock().expect("lock");
                    // Non-atomic read-modify-write; only the lock keeps it exact.
                    let hits = access.hits;
                    thread::yield_now();
                    access.hits = hits + 1;
                    access.last_writer = id;
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let access = keep.lock().expect("lock");
    assert_eq!(access.hits, u64::from(threads * per_thread));
}

#[test]
fn try_lock_sees_other_holder() {
    let name = unique_name("try");
    let mut holder = GuardedSharedMemory::<u32>::open(&name).expect("open holder");
    let access = holder.lock().expect("lock");

    let name_t = name.clone();
    let busy = thread::spawn(move || {
        let mut g = GuardedSharedMemory::<u32>::open(&name_t).expect("open");
        let busy = g.try_lock().expect("try_lock").is_none();
        busy
    })
    .join()
    .unwrap();
    assert!(busy);

    access.unlock().expect("unlock");

    let name_t = name.clone();
    let free = thread::spawn(move || {
        let mut g = GuardedSharedMemory::<u32>::open(&name_t).expect("open");
        let free = g.try_lock().expect("try_lock").is_some();
        free
    })
    .join()
    .unwrap();
    assert!(free);
}

#[test]
fn guard_drop_releases_for_waiter() {
    let name = unique_name("drop");
    let (locked_tx, locked_rx) = mpsc::channel::<()>();

    let name_t = name.clone();
    let waiter = thread::spawn(move || {
        locked_rx.recv().unwrap();
        let mut g = GuardedSharedMemory::<u64>::open(&name_t).expect("open");
        let access = g.lock().expect("lock");
        *access
    });

    let mut g = GuardedSharedMemory::<u64>::open(&name).expect("open");
    {
        let mut access = g.lock().expect("lock");
        locked_tx.send(()).unwrap();
        thread::sleep(std::time::Duration::from_millis(20));
        access.set(77);
    }
    assert_eq!(waiter.join().unwrap(), 77);
}

#[test]
fn bytes_view_covers_segment() {
    let name = unique_name("bytes");
    let mut g = GuardedSharedMemory::<[u8; 16]>::open(&name).expect("open");
    let mut access = g.lock().expect("lock");
    access.write_bytes(b"abc").expect("write");
    assert_eq!(access.bytes().len(), 16);
    assert_eq!(&access.bytes()[..3], b"abc");
    assert!(matches!(access.write_bytes(&[0u8; 17]), Err(IpcError::InvalidSize { size: 17 })));
}

#[test]
fn name_too_long_is_inert() {
    let name = "g".repeat(xproc::shm_name::MAX_KEY_LEN + 1);
    let mut g = GuardedSharedMemory::<u64>::new(&name);
    assert!(!g.is_valid());
    assert!(matches!(g.error(), Some(IpcError::NameTooLong { .. })));
    assert!(matches!(g.lock(), Err(IpcError::Inert { .. })));
    assert!(matches!(g.try_lock(), Err(IpcError::Inert { .. })));
}
