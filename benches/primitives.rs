// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Primitive operation benchmarks.
//
// Run with:
//   cargo bench --bench primitives
//
// Groups:
//   mutex          uncontended lock/unlock and try_lock/unlock
//   segment_open   open + map + unmap of an existing segment, by size
//   guarded_write  lock, write a value, unlock
//   handle_record  read_record on a published key

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use xproc::{lock_key, GuardedSharedMemory, NamedMutex, SharedMemorySegment};

fn bench_name(what: &str) -> String {
    format!("xproc_bench_{what}_{}", std::process::id())
}

fn bench_mutex(c: &mut Criterion) {
    let name = bench_name("mutex");
    NamedMutex::clear_storage(&name);
    let mut mtx = match NamedMutex::open(&name) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("mutex unavailable, skipping: {e}");
            return;
        }
    };

    let mut group = c.benchmark_group("mutex");
    group.bench_function("lock_unlock", |b| {
        b.iter(|| {
            mtx.lock().ok();
            mtx.unlock().ok();
        });
    });
    group.bench_function("try_lock_unlock", |b| {
        b.iter(|| {
            if black_box(mtx.try_lock().unwrap_or(false)) {
                mtx.unlock().ok();
            }
        });
    });
    group.finish();
}

fn bench_segment_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_open");

    for &size in &[64usize, 4096, 1 << 20] {
        let name = bench_name(&format!("seg_{size}"));
        SharedMemorySegment::unlink_by_name(&name);
        // Hold one mapping so every iteration opens an existing object.
        let _keep = SharedMemorySegment::new(&name, size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &sz| {
            b.iter(|| black_box(SharedMemorySegment::new(&name, sz)));
        });
    }

    group.finish();
}

fn bench_guarded_write(c: &mut Criterion) {
    let name = bench_name("guarded");
    SharedMemorySegment::unlink_by_name(&name);
    NamedMutex::clear_storage(&lock_key(&name));
    let mut g = GuardedSharedMemory::<[u64; 8]>::new(&name);

    let mut group = c.benchmark_group("guarded_write");
    group.throughput(Throughput::Bytes(std::mem::size_of::<[u64; 8]>() as u64));
    group.bench_function("lock_set_unlock", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n = n.wrapping_add(1);
            if let Ok(mut access) = g.lock() {
                access.set([n; 8]);
            }
        });
    });
    group.finish();
}

fn bench_handle_record(c: &mut Criterion) {
    let name = bench_name("handle");
    SharedMemorySegment::unlink_by_name(&name);
    NamedMutex::clear_storage(&lock_key(&name));

    let file = match tempfile::tempfile() {
        Ok(f) => f,
        Err(_) => return,
    };
    #[cfg(unix)]
    let handle = std::os::fd::AsFd::as_fd(&file);
    #[cfg(windows)]
    let handle = std::os::windows::io::AsHandle::as_handle(&file);

    let Ok(_publisher) = xproc::HandlePublisher::publish(&name, handle) else {
        return;
    };

    c.bench_function("handle_record/read", |b| {
        b.iter(|| black_box(xproc::read_record(&name).ok()));
    });
}

criterion_group!(
    benches,
    bench_mutex,
    bench_segment_open,
    bench_guarded_write,
    bench_handle_record
);
criterion_main!(benches);
