//! Performance benchmarks for the wayfinder client.
//!
//! These benchmarks measure:
//! - Target parsing and default-scheme mapping
//! - Picker throughput (the per-call hot path)
//! - Timeout header encoding
//! - Unary call overhead through a ready channel on the mock transport
//! - Address list shuffling (1 vs 10 vs 100 addresses)
//!
//! Run with: `cargo bench -p wayfinder-client`

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::{hint::black_box, sync::Arc, time::Duration};

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use wayfinder_client::{
    Address, CallOptions, Channel, Metadata, PickArgs, PickFirstPicker, Picker, ResolverRegistry,
    SubchannelPool, Target, encode_timeout, load_balancer::shuffled, mock::MockConnector,
    mock::MockSubchannel,
};

/// Creates a runtime for async benchmarks.
fn create_runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create runtime")
}

fn bench_target_parse(c: &mut Criterion) {
    let registry = ResolverRegistry::with_defaults();
    let mut group = c.benchmark_group("target_parse");
    for input in ["dns:///api.example.com:443", "ipv4:10.0.0.1:80,10.0.0.2:80", "localhost:50051"] {
        group.bench_with_input(BenchmarkId::from_parameter(input), &input, |b, &input| {
            b.iter(|| {
                let target = Target::parse(black_box(input)).unwrap();
                black_box(registry.map_default_scheme(&target))
            });
        });
    }
    group.finish();
}

fn bench_pick(c: &mut Criterion) {
    let subchannel = MockSubchannel::new(Address::tcp("10.0.0.1", 443));
    let picker = PickFirstPicker::new(subchannel);
    let metadata = Metadata::new();
    c.bench_function("pick_first_pick", |b| {
        b.iter(|| black_box(picker.pick(PickArgs { path: "/svc/Method", metadata: &metadata })));
    });
}

fn bench_encode_timeout(c: &mut Criterion) {
    c.bench_function("encode_timeout", |b| {
        b.iter(|| encode_timeout(black_box(Duration::from_millis(1_234))).unwrap());
    });
}

fn bench_unary_call(c: &mut Criterion) {
    let rt = create_runtime();
    let connector = MockConnector::new();
    let channel = rt.block_on(async {
        let channel = Channel::builder()
            .target("ipv4:10.0.0.1:443")
            .connector(connector.clone())
            .subchannel_pool(Arc::new(SubchannelPool::new()))
            .build()
            .unwrap();
        channel
            .wait_for_ready(tokio::time::Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        channel
    });
    let payload = Bytes::from_static(b"ping");

    let mut group = c.benchmark_group("unary_call");
    group.throughput(Throughput::Elements(1));
    group.bench_function("mock_transport", |b| {
        b.to_async(&rt).iter(|| async {
            let call = channel.create_call("/svc/Echo", CallOptions::default());
            black_box(call.unary(payload.clone()).await.unwrap())
        });
    });
    group.finish();
}

fn bench_shuffle(c: &mut Criterion) {
    let mut group = c.benchmark_group("shuffle_address_list");
    for count in [1usize, 10, 100] {
        let addresses: Vec<Address> =
            (0..count).map(|i| Address::tcp(format!("10.0.{}.{}", i / 256, i % 256), 443)).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &addresses, |b, addresses| {
            b.iter(|| black_box(shuffled(addresses)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_target_parse,
    bench_pick,
    bench_encode_timeout,
    bench_unary_call,
    bench_shuffle
);
criterion_main!(benches);
