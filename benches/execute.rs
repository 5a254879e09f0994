use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hetgrad::Reduction;

mod common;
use common::*;

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    for len in [1_000, 100_000] {
        let mut stack = layer_stack(len, 8);
        let x0 = stack.graph.value(stack.x).unwrap();
        group.bench_with_input(BenchmarkId::new("stack8", len), &len, |b, _| {
            b.iter(|| {
                // Rewriting the input drops every cached result downstream.
                stack.graph.set_value(stack.x, &x0).unwrap();
                black_box(stack.graph.value(stack.output).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("backward");
    for len in [1_000, 100_000] {
        let mut stack = layer_stack(len, 8);
        group.bench_with_input(BenchmarkId::new("stack8", len), &len, |b, _| {
            b.iter(|| {
                for &w in &stack.weights {
                    stack.graph.zero_gradient(w).unwrap();
                }
                stack.graph.backward(black_box(stack.output)).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");
    for len in [1_000, 100_000] {
        let mut stack = layer_stack(len, 2);
        group.bench_with_input(BenchmarkId::new("sum", len), &len, |b, _| {
            b.iter(|| black_box(stack.graph.reduce(stack.output, None, Reduction::Sum).unwrap()))
        });
    }
    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");
    let len = 10_000;
    let mut stack = layer_stack(len, 4);
    group.bench_function(BenchmarkId::new("stack4", len), |b| {
        b.iter(|| {
            for &w in &stack.weights {
                stack.graph.zero_gradient(w).unwrap();
            }
            stack.graph.backward(stack.output).unwrap();
            for &w in &stack.weights {
                stack.graph.apply_gradient(w, 1e-3).unwrap();
            }
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_forward,
    bench_backward,
    bench_reduce,
    bench_train_step
);
criterion_main!(benches);
