use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netmap_core::config::PoolBounds;
use netmap_core::pool::{Pool, PoolKind};

fn configured_buf_pool(objtotal: u32) -> Pool {
    let bounds = PoolBounds::for_kind(PoolKind::Buf);
    let mut pool = Pool::new(PoolKind::Buf, bounds.objminsize, bounds.objmaxsize, bounds.nummin, bounds.nummax);
    pool.configure(objtotal, 2048).expect("configure");
    pool.finalize().expect("finalize");
    pool
}

fn allocate_free_one(c: &mut Criterion) {
    let mut pool = configured_buf_pool(4096);

    c.bench_function("buf_pool_allocate_then_free", |b| {
        b.iter(|| {
            let (_, idx) = pool.allocate(None).expect("allocate");
            pool.free_by_index(black_box(idx)).expect("free");
        });
    });
}

fn allocate_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("buf_pool_allocate_batch");
    group.measurement_time(Duration::from_secs(5));

    for &batch in &[16u32, 64, 256, 1024] {
        let mut pool = configured_buf_pool(4096);
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("{batch}_objects"), |b| {
            b.iter(|| {
                let mut idxs = Vec::with_capacity(batch as usize);
                for _ in 0..batch {
                    let (_, idx) = pool.allocate(None).expect("allocate");
                    idxs.push(idx);
                }
                for idx in idxs.drain(..) {
                    pool.free_by_index(black_box(idx)).expect("free");
                }
            });
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(3));
    targets = allocate_free_one, allocate_batch
}

criterion_main!(benches);
