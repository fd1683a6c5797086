//! Benchmarks for Meshcast mesh resolution
//!
//! Measures performance of:
//! - One-way edge filtering
//! - Mesh resolution over complete graphs
//! - Mesh resolution over partially acknowledged views

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshcast_topology::{find_meshes, Graph, NeighbourDelta, NeighbourViews};

/// Benchmark filtering of a graph where every other edge is one-way
fn bench_retain_bidirectional(c: &mut Criterion) {
    let mut group = c.benchmark_group("retain_bidirectional");

    for &nodes in &[10u32, 50, 100, 200] {
        let mut graph = Graph::complete(0..nodes);
        for from in 0..nodes {
            for to in (0..nodes).filter(|to| (from + to) % 2 == 0 && from < *to) {
                graph.remove_edge(&from, &to);
            }
        }

        group.throughput(Throughput::Elements(graph.edge_count() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &graph, |b, g| {
            b.iter(|| {
                let mut g = g.clone();
                g.retain_bidirectional();
                g
            })
        });
    }
    group.finish();
}

/// Benchmark resolution over complete graphs (single mesh result)
fn bench_complete_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_meshes_complete");
    group.sample_size(20);

    for &nodes in &[10u32, 50, 100] {
        let graph = Graph::complete(0..nodes);
        group.throughput(Throughput::Elements(nodes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &graph, |b, g| {
            b.iter(|| find_meshes(black_box(&0), g, g))
        });
    }
    group.finish();
}

/// Benchmark resolution from gossiped views where peers see only their ring neighbours
fn bench_ring_views(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_meshes_ring_views");

    for &peers in &[16u32, 64, 256] {
        let mut views = NeighbourViews::new();
        for peer in 1..=peers {
            let mut delta = NeighbourDelta::new();
            for offset in 1..=3 {
                delta.record_added((peer + offset - 1) % peers + 1);
                delta.record_added((peer + peers - offset - 1) % peers + 1);
            }
            views.apply(peer, &delta, &delta);
        }
        let engaged: Vec<u32> = (1..=peers).collect();
        let (outbound, inbound) = views.graphs(&0, &engaged);

        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(peers),
            &(outbound, inbound),
            |b, (out, inb)| b.iter(|| find_meshes(black_box(&0), out, inb)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_retain_bidirectional, bench_complete_graph, bench_ring_views);

criterion_main!(benches);
