use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::BoxFuture;
use futures::FutureExt;

use lightbox_core::{
    BoundedLruCache, CancellationToken, ItemProcessor, ProcessError, RequestScheduler,
    SchedulerConfig, ThumbnailRequest,
};

fn bench_cache_operations(c: &mut Criterion) {
    let mut cache: BoundedLruCache<u32, Vec<u8>> =
        BoundedLruCache::new(NonZeroUsize::new(1000).unwrap());
    let thumb = vec![128u8; 256 * 256]; // typical thumbnail payload

    c.bench_function("cache_add", |b| {
        b.iter(|| {
            cache.add(black_box(42), black_box(thumb.clone()));
        })
    });

    // Pre-populate for lookup benchmarks
    for i in 0..1000u32 {
        cache.add(i, thumb.clone());
    }

    c.bench_function("cache_try_get", |b| {
        b.iter(|| {
            let _ = cache.try_get(&black_box(500));
        })
    });

    c.bench_function("cache_contains", |b| {
        b.iter(|| {
            let _ = cache.contains(&black_box(500));
        })
    });
}

struct NoopProcessor;

impl ItemProcessor for NoopProcessor {
    fn process_item(
        &self,
        _index: usize,
        _token: CancellationToken,
    ) -> BoxFuture<'_, Result<(), ProcessError>> {
        async { Ok(()) }.boxed()
    }
}

fn bench_scheduler_operations(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let scheduler = RequestScheduler::with_config(
        Arc::new(NoopProcessor),
        SchedulerConfig {
            batch_size: 5,
            item_yield: Duration::from_micros(10),
            batch_yield: Duration::from_micros(50),
        },
    );

    c.bench_function("scheduler_enqueue", |b| {
        b.iter(|| {
            scheduler.enqueue(ThumbnailRequest::new(
                black_box(100),
                black_box(104),
                false,
                CancellationToken::new(),
                None,
            ));
        })
    });

    // Pre-populate overlapping spans for the merge benchmark
    c.bench_function("scheduler_optimize", |b| {
        b.iter(|| {
            for i in 0..10 {
                scheduler.enqueue(ThumbnailRequest::new(
                    i * 4,
                    i * 4 + 6,
                    false,
                    CancellationToken::new(),
                    None,
                ));
            }
            scheduler.optimize_requests();
        })
    });

    scheduler.clear_queue();
}

criterion_group!(benches, bench_cache_operations, bench_scheduler_operations);
criterion_main!(benches);
