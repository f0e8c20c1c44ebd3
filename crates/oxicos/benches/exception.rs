// Exception and lifecycle benchmarks for the OxiCOS runtime
//
// These benchmarks measure:
// - allocation and release with and without a deinit chain
// - protected regions on the non-throwing path
// - throw/catch cost against the number of protected objects
// - autorelease pool drain

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxicos::runtime::{
    AutoreleasePool, ClassId, Region, RegistryBuilder, Runtime, Throws, try_protected,
};
use oxicos::throw;

fn runtime() -> (&'static Runtime, ClassId, ClassId) {
    let mut builder = RegistryBuilder::new();
    let plain = builder.define_class("Plain", ClassId::OBJECT, 16).unwrap();
    let chained = builder.define_class("Chained", plain, 16).unwrap();
    builder
        .define_deinit(chained, |call| {
            black_box(call.arg(0).allocated_size());
            call.next_method()
        })
        .unwrap();
    builder
        .define_deinit(plain, |call| call.next_method())
        .unwrap();
    (builder.freeze().unwrap(), plain, chained)
}

/// Benchmark allocate + release.
fn bench_alloc_release(c: &mut Criterion) {
    let (rt, plain, chained) = runtime();
    let mut group = c.benchmark_group("alloc_release");
    let region = Region::enter();

    group.bench_function("root_deinit", |b| {
        b.iter(|| drop(black_box(rt.allocate(ClassId::OBJECT, 16))));
    });
    group.bench_function("one_deinit", |b| {
        b.iter(|| drop(black_box(rt.allocate(plain, 0))));
    });
    group.bench_function("two_deinits", |b| {
        b.iter(|| drop(black_box(rt.allocate(chained, 0))));
    });

    group.finish();
    region.leave();
}

/// Benchmark entering and leaving a region without throwing.
fn bench_region_no_throw(c: &mut Criterion) {
    let (rt, plain, _) = runtime();
    let obj = try_protected(|_| rt.allocate(plain, 0)).unwrap();

    c.bench_function("region_protect_leave", |b| {
        b.iter(|| {
            let region = Region::enter();
            let slot = region.protect(obj.clone());
            region.leave();
            black_box(slot.take())
        });
    });
}

/// Benchmark throw/catch against the number of protected objects released.
fn bench_throw_catch(c: &mut Criterion) {
    let (rt, plain, _) = runtime();
    let mut group = c.benchmark_group("throw_catch");

    for protected in [0_usize, 1, 8, 32] {
        group.bench_with_input(
            BenchmarkId::from_parameter(protected),
            &protected,
            |b, &protected| {
                b.iter(|| {
                    let caught = try_protected(|region| -> Throws<()> {
                        let mut slots = Vec::with_capacity(protected);
                        for _ in 0..protected {
                            slots.push(region.protect(rt.allocate(plain, 0)?));
                        }
                        Err(throw!(None))
                    });
                    black_box(caught.is_err())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark draining an autorelease pool.
fn bench_pool_drain(c: &mut Criterion) {
    let (rt, plain, _) = runtime();
    let mut group = c.benchmark_group("pool_drain");

    for count in [16_usize, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let pool = AutoreleasePool::new();
                for _ in 0..count {
                    let obj = try_protected(|_| rt.allocate(plain, 0)).unwrap();
                    pool.autorelease(obj);
                }
                drop(pool);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_release,
    bench_region_no_throw,
    bench_throw_catch,
    bench_pool_drain
);
criterion_main!(benches);
