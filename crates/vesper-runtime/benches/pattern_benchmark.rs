//! Benchmarks for the pattern engine and statement routing
//!
//! Run with: cargo bench -p vesper-runtime -- pattern
//!
//! Benchmark groups:
//! - followed_by: `every a=A -> b=B` with and without correlation
//! - within: the same pattern bounded by engine time
//! - grouped_sum: stream statement with a grouped aggregation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use vesper_core::{
    ClassShape, EventRef, Expr, MapEvent, PatternExpr, SelectItem, StatementSpec, Type,
    TypeRegistry,
};
use vesper_runtime::config::PatternConfig;
use vesper_runtime::{CompiledPattern, PatternEngine, StatementRuntime};

fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    for name in ["A", "B"] {
        registry.register_class(
            ClassShape::event(name)
                .property("id", Type::Int)
                .property("key", Type::Int),
        );
    }
    registry
}

/// Alternating A/B events, `keys` distinct correlation keys
fn generate_events(count: usize, keys: i64) -> Vec<EventRef> {
    (0..count)
        .map(|i| {
            let ty = if i % 4 == 3 { "B" } else { "A" };
            MapEvent::new(ty)
                .with_field("id", i as i64)
                .with_field("key", i as i64 % keys)
                .into_ref()
        })
        .collect()
}

fn followed_by(correlated: bool) -> PatternExpr {
    let b = PatternExpr::tagged("b", "B");
    let b = if correlated {
        b.with_predicate(Expr::equals(Expr::path(["b", "key"]), Expr::path(["a", "key"])))
    } else {
        b
    };
    PatternExpr::every(PatternExpr::followed_by(PatternExpr::tagged("a", "A"), b))
}

fn engine(pattern: &PatternExpr, registry: &TypeRegistry) -> PatternEngine {
    let compiled = CompiledPattern::compile(pattern, registry).unwrap();
    PatternEngine::new(Arc::new(compiled), &PatternConfig::default(), 0)
}

fn bench_followed_by(c: &mut Criterion) {
    let mut group = c.benchmark_group("followed_by");
    let registry = registry();

    for size in [1_000, 10_000] {
        let events = generate_events(size, 16);
        group.throughput(Throughput::Elements(size as u64));

        for correlated in [false, true] {
            let pattern = followed_by(correlated);
            let label = if correlated { "correlated" } else { "plain" };
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| {
                    let mut engine = engine(&pattern, &registry);
                    let mut matches = 0;
                    for event in &events {
                        matches += engine.advance(black_box(event)).len();
                    }
                    matches
                })
            });
        }
    }

    group.finish();
}

fn bench_within(c: &mut Criterion) {
    let mut group = c.benchmark_group("within");
    let registry = registry();
    let pattern = PatternExpr::every(PatternExpr::within(
        PatternExpr::followed_by(PatternExpr::tagged("a", "A"), PatternExpr::tagged("b", "B")),
        Duration::from_millis(50),
    ));

    for size in [1_000, 10_000] {
        let events = generate_events(size, 16);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("advance", size), &size, |b, _| {
            b.iter(|| {
                let mut engine = engine(&pattern, &registry);
                let mut matches = 0;
                for (i, event) in events.iter().enumerate() {
                    // one millisecond per event
                    matches += engine.advance_time(i as i64 * 1_000_000).len();
                    matches += engine.advance(black_box(event)).len();
                }
                matches
            })
        });
    }

    group.finish();
}

fn bench_grouped_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouped_sum");

    for keys in [10, 1_000] {
        let events = generate_events(10_000, keys);
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |b, _| {
            b.iter_batched(
                || {
                    let rt = StatementRuntime::new(registry());
                    let spec = StatementSpec::from_stream("A", None)
                        .select(SelectItem::expr(Expr::ident("key")))
                        .select(SelectItem::expr(Expr::func("sum", vec![Expr::ident("id")])))
                        .group_by(Expr::ident("key"));
                    rt.create_statement(&spec).unwrap();
                    rt
                },
                |rt| {
                    let mut rows = 0;
                    for event in &events {
                        for output in rt.send_event(black_box(event)) {
                            rows += output.rows.len();
                        }
                    }
                    rows
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_followed_by, bench_within, bench_grouped_sum);

criterion_main!(benches);
