//! Micro-benchmarks for the dispatch hot paths

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use media_dispatch::{InMemoryCounterStore, RateLimitConfig, RateLimiter, RetryConfig, RetryPolicy};

fn bench_backoff_delay(c: &mut Criterion) {
    let policy = RetryPolicy::new(RetryConfig::default());
    c.bench_function("retry_backoff_delay", |b| {
        b.iter(|| {
            for attempt in 0..8u32 {
                black_box(policy.backoff_delay(black_box(attempt)));
            }
        })
    });
}

fn bench_rate_limiter_gate(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        RateLimitConfig::builtin(),
    ));

    c.bench_function("rate_limiter_check_and_record", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let allowed = limiter
                    .can_proceed("owner-1", "instagram", "media/upload")
                    .await
                    .unwrap();
                if allowed {
                    black_box(
                        limiter
                            .record("owner-1", "instagram", "media/upload")
                            .await
                            .unwrap(),
                    );
                }
            })
        })
    });
}

criterion_group!(benches, bench_backoff_delay, bench_rate_limiter_gate);
criterion_main!(benches);
