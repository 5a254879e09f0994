use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

mod common;
use common::*;

fn bench_compile_stack(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_stack");
    for layers in [4, 32, 256] {
        let mut stack = layer_stack(8, layers);
        group.bench_with_input(BenchmarkId::new("layers", layers), &layers, |b, _| {
            b.iter(|| black_box(stack.graph.compile(black_box(stack.output)).unwrap()))
        });
    }
    group.finish();
}

fn bench_compile_wide(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_wide");
    for terms in [16, 128, 1024] {
        let (mut graph, output) = wide_sum(terms);
        group.bench_with_input(BenchmarkId::new("terms", terms), &terms, |b, _| {
            b.iter(|| black_box(graph.compile(black_box(output)).unwrap()))
        });
    }
    group.finish();
}

fn bench_build_and_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_and_compile");
    for layers in [4, 32] {
        group.bench_with_input(BenchmarkId::new("layers", layers), &layers, |b, &layers| {
            b.iter(|| {
                let mut stack = layer_stack(8, layers);
                black_box(stack.graph.compile(stack.output).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_compile_stack,
    bench_compile_wide,
    bench_build_and_compile
);
criterion_main!(benches);
