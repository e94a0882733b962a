//! Benchmarks for transaction drain cost.
//!
//! Run with: cargo bench -p ftui-flow --bench drain_bench

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ftui_flow::{FlowConfig, Holder, Node, Partition, SimplePolicy, with_transaction};

// =============================================================================
// Graph shapes
// =============================================================================

/// `len` nodes linked head to tail, each forwarding its firing.
fn chain(partition: &Arc<Partition>, len: usize) -> Arc<Node> {
    let nodes: Vec<Arc<Node>> = (0..len).map(|_| Node::new()).collect();
    let forward = Holder::new(|tx, to, firing| to.send(tx, Arc::clone(firing)));
    with_transaction(partition, |tx| {
        for pair in nodes.windows(2).rev() {
            tx.link(&pair[0], &forward, &pair[1]).unwrap();
        }
    })
    .unwrap();
    Arc::clone(&nodes[0])
}

/// One source fanning out to `width` sinks.
fn fan_out(partition: &Arc<Partition>, width: usize) -> Arc<Node> {
    let source = Node::new();
    let sink = Holder::new(|_, _, firing| {
        black_box(firing);
    });
    with_transaction(partition, |tx| {
        for _ in 0..width {
            tx.link(&source, &sink, &Node::new()).unwrap();
        }
    })
    .unwrap();
    source
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow/drain/chain");
    for &len in &[8usize, 64, 512] {
        let partition = Partition::new("bench", FlowConfig::default(), Arc::new(SimplePolicy));
        let head = chain(&partition, len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &head, |b, head| {
            b.iter(|| with_transaction(&partition, |tx| head.send(tx, Arc::new(1_u64))).unwrap());
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow/drain/fan_out");
    for &width in &[8usize, 64, 512] {
        let partition = Partition::new("bench", FlowConfig::default(), Arc::new(SimplePolicy));
        let source = fan_out(&partition, width);
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &source, |b, source| {
            b.iter(|| with_transaction(&partition, |tx| source.send(tx, Arc::new(1_u64))).unwrap());
        });
    }
    group.finish();
}

fn bench_empty_transaction(c: &mut Criterion) {
    let partition = Partition::new("bench", FlowConfig::default(), Arc::new(SimplePolicy));
    c.bench_function("flow/transaction/empty", |b| {
        b.iter(|| black_box(with_transaction(&partition, |tx| tx.id()).unwrap()));
    });
}

criterion_group!(benches, bench_chain, bench_fan_out, bench_empty_transaction);
criterion_main!(benches);
