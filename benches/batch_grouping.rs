//! Benchmarks for batch cohort grouping
//!
//! This benchmark measures:
//! - Grouping a flushed cohort by (method, endpoint)
//! - Building the downstream envelope for each group

use alltrue_guardrails::batch::{group_cohort, SubmittedUnit};
use alltrue_guardrails::http::HttpMethod;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

fn cohort(size: usize, endpoints: usize) -> Vec<SubmittedUnit> {
    (0..size)
        .map(|i| {
            let method = if i % 3 == 0 {
                HttpMethod::Get
            } else {
                HttpMethod::Post
            };
            SubmittedUnit::new(
                format!("/process-input/provider-{}", i % endpoints),
                method,
                Some(json!({"completion_request_id": format!("req-{i}"), "original_request_body": "{}"})),
            )
        })
        .collect()
}

fn bench_group_cohort(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_cohort");
    for (size, endpoints) in [(5, 1), (50, 4), (500, 16)] {
        let units = cohort(size, endpoints);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(
            BenchmarkId::new("units", format!("{size}x{endpoints}")),
            &units,
            |b, units| b.iter(|| group_cohort(black_box(units.clone()))),
        );
    }
    group.finish();
}

fn bench_envelopes(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelopes");
    let batches = group_cohort(cohort(200, 8));
    group.bench_function("to_body", |b| {
        b.iter(|| {
            for batch in &batches {
                black_box(batch.envelope().to_body());
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_group_cohort, bench_envelopes);
criterion_main!(benches);
