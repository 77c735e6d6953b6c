//! Criterion benchmarks for hot paths in fleetd.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Convergence retry backoff computation (called on every retry loop)
//!   - Remote shell argument quoting (called on every SSH exec)
//!   - Pairing-code validation (called on every pairing-approve request)

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fleetd::pairing::is_valid_code;
use fleetd::scheduler::backoff::{next_backoff, BackoffConfig};
use fleetd::ssh_driver::shell_quote;

fn bench_backoff(c: &mut Criterion) {
    let cfg = BackoffConfig::default();

    c.bench_function("next_backoff_early_attempt", |b| {
        b.iter(|| black_box(next_backoff(black_box(0), &cfg)));
    });

    c.bench_function("next_backoff_capped_attempt", |b| {
        b.iter(|| black_box(next_backoff(black_box(20), &cfg)));
    });
}

fn bench_shell_quote(c: &mut Criterion) {
    c.bench_function("shell_quote_plain_token", |b| {
        b.iter(|| black_box(shell_quote(black_box("gw_tok_abcdef123456"))));
    });

    c.bench_function("shell_quote_with_embedded_quotes", |b| {
        b.iter(|| black_box(shell_quote(black_box("it's a \"tricky\" value"))));
    });
}

fn bench_pairing_code_validation(c: &mut Criterion) {
    let valid = "A1b2-C3d4_E5f6";
    let invalid = "abc; rm -rf /";

    c.bench_function("pairing_code_valid", |b| {
        b.iter(|| black_box(is_valid_code(black_box(valid))));
    });

    c.bench_function("pairing_code_invalid", |b| {
        b.iter(|| black_box(is_valid_code(black_box(invalid))));
    });
}

criterion_group!(
    benches,
    bench_backoff,
    bench_shell_quote,
    bench_pairing_code_validation
);
criterion_main!(benches);
