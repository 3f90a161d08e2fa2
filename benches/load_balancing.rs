use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use portero::core::transport::{MemoryConnectMode, MemoryConnector};
use portero::core::{Cluster, ClusterSettings, NodeSpec, Request};
use portero::{Algorithm, EventBus};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn create_cluster(algorithm: Algorithm, node_count: usize) -> Arc<Cluster> {
    let cluster = Cluster::with_connector(
        "bench",
        ClusterSettings::default().with_algorithm(algorithm),
        EventBus::new(),
        Arc::new(MemoryConnector::new(MemoryConnectMode::Accept)),
    );
    for i in 0..node_count {
        let addr: SocketAddr = format!("10.1.{}.{}:8080", i / 250, i % 250 + 1).parse().unwrap();
        cluster.add_node(NodeSpec::new(format!("node-{}", i), addr)).unwrap();
    }
    cluster
}

/// Requests from `clients` distinct addresses spread over several /24 subnets
fn create_requests(clients: u32) -> Vec<Request> {
    (0..clients)
        .map(|i| {
            let ip = Ipv4Addr::from(0xC000_0000 + i * 7);
            Request::new(SocketAddr::new(ip.into(), 1024 + (i % 50000) as u16))
        })
        .collect()
}

fn bench_algorithms(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let requests = create_requests(1024);

    let mut group = c.benchmark_group("next_node");
    for algorithm in [
        Algorithm::RoundRobin,
        Algorithm::Random,
        Algorithm::SourceIpHash,
        Algorithm::FourTupleHash,
        Algorithm::StickySession,
    ] {
        for node_count in [3, 32, 256] {
            let cluster = create_cluster(algorithm, node_count);
            group.bench_with_input(
                BenchmarkId::new(algorithm.to_string(), node_count),
                &node_count,
                |b, _| {
                    let mut i = 0;
                    b.iter(|| {
                        i = (i + 1) % requests.len();
                        black_box(cluster.next_node(&requests[i]).unwrap());
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_sticky_cookie_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("sticky_cookie");
    for node_count in [3, 32, 256] {
        let cluster = create_cluster(Algorithm::StickySession, node_count);
        let first = cluster.next_node(&create_requests(1)[0]).unwrap();
        let pair = first
            .set_cookie
            .as_deref()
            .and_then(|cookie| cookie.split(';').next())
            .unwrap()
            .to_string();
        let request = create_requests(1)
            .remove(0)
            .with_header("Cookie", pair);

        group.bench_with_input(BenchmarkId::new("pinned", node_count), &node_count, |b, _| {
            b.iter(|| black_box(cluster.next_node(&request).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_algorithms, bench_sticky_cookie_lookup);
criterion_main!(benches);
