//! sessiond Benchmark Suite
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p sessiond
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sessiond::auth::validation::{validate_credentials, validate_sign_up};
use sessiond::auth::{Fingerprint, ProvisioningLock};
use sessiond::error::ErrorKind;
use sessiond::resilience::{CircuitBreaker, RetryPolicy};
use sessiond::traits::{Credentials, SignUpRequest, UserId};
use std::time::Duration;

// ============================================================================
// Fingerprint Benchmarks
// ============================================================================

fn bench_fingerprints(c: &mut Criterion) {
    let mut group = c.benchmark_group("Fingerprints");

    group.bench_function("sign_in", |b| {
        b.iter(|| {
            Fingerprint::builder("sign_in")
                .arg(black_box("jane@example.com"))
                .secret(black_box("correct horse battery staple"))
                .build()
        })
    });

    group.bench_function("sign_out_no_secret", |b| {
        b.iter(|| Fingerprint::builder("sign_out").arg(black_box("u1")).build())
    });

    group.finish();
}

// ============================================================================
// Validation and Classification Benchmarks
// ============================================================================

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Validation");

    let credentials = Credentials::new("jane@example.com", "secret1");
    group.bench_function("credentials", |b| {
        b.iter(|| validate_credentials(black_box(&credentials)))
    });

    let request = SignUpRequest::new("jane@example.com", "secret1").with_display_name("Jane");
    group.bench_function("sign_up", |b| b.iter(|| validate_sign_up(black_box(&request))));

    group.bench_function("classify_conflict", |b| {
        b.iter(|| {
            ErrorKind::classify(
                black_box(Some(409)),
                black_box(Some("23505")),
                black_box("duplicate key value violates unique constraint"),
            )
        })
    });

    group.finish();
}

// ============================================================================
// Resilience Primitive Benchmarks
// ============================================================================

fn bench_resilience(c: &mut Criterion) {
    let mut group = c.benchmark_group("Resilience");

    for retries in [3u32, 10] {
        let policy = RetryPolicy::new()
            .with_max_retries(retries)
            .with_max_delay(Duration::from_secs(60));
        group.bench_with_input(BenchmarkId::new("backoff_schedule", retries), &policy, |b, p| {
            b.iter(|| p.delays().count())
        });
    }

    let breaker = CircuitBreaker::with_name("bench");
    group.bench_function("breaker_check_closed", |b| b.iter(|| breaker.check()));

    let lock = ProvisioningLock::new();
    let user = UserId::new("u1");
    group.bench_function("provisioning_lock_cycle", |b| {
        b.iter(|| drop(lock.try_acquire(black_box(&user))))
    });

    group.finish();
}

criterion_group!(benches, bench_fingerprints, bench_validation, bench_resilience);
criterion_main!(benches);
