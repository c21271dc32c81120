use boardwarden::middleware::rate_limit::{EndpointRateLimiter, RateLimiter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

fn bench_single_key(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    // High rate so the bucket never runs dry during measurement
    let limiter = RateLimiter::new(1_000_000_000.0, 1_000_000);

    c.bench_function("allow_single_key", |b| {
        b.iter(|| rt.block_on(async { black_box(limiter.allow("ip:127.0.0.1").await) }));
    });
}

fn bench_many_keys(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("allow_many_keys");

    for visitors in [100usize, 10_000].iter() {
        let limiter = RateLimiter::new(1_000_000_000.0, 1_000_000);
        let keys: Vec<String> = (0..*visitors).map(|i| format!("ip:10.0.{}.{}", i / 256, i % 256)).collect();
        // Pre-populate the registry so the benchmark measures lookups, not inserts
        rt.block_on(async {
            for key in &keys {
                limiter.allow(key).await;
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(visitors), visitors, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                let key = &keys[i % keys.len()];
                i += 1;
                rt.block_on(async { black_box(limiter.allow(key).await) })
            });
        });
    }
    group.finish();
}

fn bench_endpoint_lookup(c: &mut Criterion) {
    let mut endpoints = EndpointRateLimiter::new();
    for (i, pattern) in ["/thread/*", "/board/*/new", "/board/*/edit", "/user/*", "/search"].iter().enumerate() {
        endpoints.add_endpoint(pattern, 1.0 + i as f64, 5).unwrap();
    }

    c.bench_function("endpoint_limiter_for", |b| {
        b.iter(|| black_box(endpoints.limiter_for(black_box("/board/general/new")).is_some()));
    });
}

criterion_group!(benches, bench_single_key, bench_many_keys, bench_endpoint_lookup);
criterion_main!(benches);
