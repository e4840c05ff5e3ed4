//! Benchmark for mesh config rendering
//!
//! Every registration re-renders the full gateway file, so rendering has to
//! stay cheap at a few thousand peers.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mesh_network_manager::crd::{ObjectRef, ServiceBinding, ServicePort};
use mesh_network_manager::mesh::{
    parse_peers, render_interface, render_peer, render_stream, render_stream_file,
    InterfaceSettings, MeshKeyPair,
};
use mesh_network_manager::PodBinding;
use std::net::Ipv4Addr;

fn settings() -> InterfaceSettings {
    let keys = MeshKeyPair::generate();
    InterfaceSettings {
        address: "10.80.0.1/16".parse().unwrap(),
        listen_port: 51820,
        private_key: keys.private_key,
        public_key: keys.public_key,
        endpoint: "gw.example.net:51820".into(),
        pod_listen_port: 51820,
        keepalive_secs: 25,
        client_allowed_ips: vec!["10.80.0.0/16".parse().unwrap(), "10.90.0.0/16".parse().unwrap()],
    }
}

fn peers(settings: &InterfaceSettings, count: u32) -> Vec<String> {
    (0..count)
        .map(|i| {
            let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 80, 0, 2)) + i);
            let keys = MeshKeyPair::generate();
            let mut binding = PodBinding::free(ip, keys.private_key, keys.public_key);
            if i % 2 == 0 {
                binding.reserve(&format!("bench.pod-{}", i));
                binding.bind(ObjectRef::new("bench", format!("pod-{}", i)), Ipv4Addr::new(172, 16, 0, 9));
            }
            render_peer(&binding, settings).unwrap()
        })
        .collect()
}

fn bench_render_interface(c: &mut Criterion) {
    let settings = settings();
    let services: Vec<Ipv4Addr> = (11..61).map(|i| Ipv4Addr::new(10, 90, 0, i)).collect();

    let mut group = c.benchmark_group("render_interface");
    for count in [100u32, 1000, 5000] {
        let fragments = peers(&settings, count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &fragments, |b, fragments| {
            b.iter(|| render_interface(black_box(&settings), services.iter(), fragments.iter()));
        });
    }
    group.finish();
}

fn bench_parse_peers(c: &mut Criterion) {
    let settings = settings();
    let fragments = peers(&settings, 1000);
    let text = render_interface(&settings, std::iter::empty(), fragments.iter());

    let mut group = c.benchmark_group("parse_peers");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("1000_peers", |b| {
        b.iter(|| parse_peers(black_box(&text)).unwrap());
    });
    group.finish();
}

fn bench_render_stream(c: &mut Criterion) {
    let fragments: Vec<String> = (0..500u32)
        .map(|i| {
            let binding = ServiceBinding::for_service(
                Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 90, 0, 11)) + i),
                ObjectRef::new("bench", format!("svc-{}", i)),
                Ipv4Addr::new(10, 96, 0, 10),
                vec![ServicePort::tcp(80), ServicePort::tcp(443), ServicePort::udp(53)],
            );
            render_stream(&binding, "cluster.local").unwrap()
        })
        .collect();

    c.bench_function("render_stream_file_500_services", |b| {
        b.iter(|| render_stream_file(black_box(&fragments).iter()));
    });
}

criterion_group!(benches, bench_render_interface, bench_parse_peers, bench_render_stream);
criterion_main!(benches);
