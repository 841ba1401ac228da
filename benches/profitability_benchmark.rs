use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;
use switchminer_rs::benchmark::BenchmarkStore;
use switchminer_rs::device::{AlgorithmId, Device, DeviceKind};
use switchminer_rs::market::MarketSnapshot;
use switchminer_rs::switching::{rank_with, DeviceState, SwitchingConfig, SwitchingEngine};
use switchminer_rs::utils::extract_hashrate;
use tokio::time::Instant;
use uuid::Uuid;

const ALGORITHMS: usize = 32;

fn fixture() -> (Device, BenchmarkStore, MarketSnapshot) {
    let algorithms: Vec<AlgorithmId> = (0..ALGORITHMS)
        .map(|i| AlgorithmId::new(format!("algo{:02}", i)))
        .collect();
    let device = Device::new(Uuid::new_v4(), "gpu0", DeviceKind::Gpu, algorithms.clone());

    let store = BenchmarkStore::new();
    let mut rates = BTreeMap::new();
    for (i, algorithm) in algorithms.into_iter().enumerate() {
        store
            .record(device.id, algorithm.clone(), 1_000_000.0 * (i + 1) as f64)
            .unwrap();
        rates.insert(algorithm, 0.001 * ((ALGORITHMS - i) as f64).sqrt());
    }

    let snapshot = MarketSnapshot {
        version: 1,
        rates,
        fetched_at: Some(chrono::Utc::now()),
    };
    (device, store, snapshot)
}

/// 基准测试：单设备收益排名
fn bench_rank(c: &mut Criterion) {
    let (device, store, snapshot) = fixture();
    let table = store.entries();

    c.bench_function("rank_32_algorithms", |b| {
        b.iter(|| black_box(rank_with(black_box(&device), &table, &snapshot)))
    });
}

/// 基准测试：切换决策
fn bench_decide(c: &mut Criterion) {
    let (device, store, snapshot) = fixture();
    let ranking = rank_with(&device, &store.entries(), &snapshot);
    let engine = SwitchingEngine::new(SwitchingConfig::default());
    let state = DeviceState::Running(AlgorithmId::new("algo00"));
    let started = Instant::now();

    c.bench_function("switch_decision", |b| {
        b.iter(|| black_box(engine.decide(&state, black_box(&ranking), Some(started), Instant::now())))
    });
}

/// 基准测试：worker 输出中的算力解析
fn bench_extract_hashrate(c: &mut Criterion) {
    let lines = [
        "GPU0: 62.35 MH/s, shares: 12/0/0",
        "[2024-01-01 12:00:00] speed 10s/60s/15m 5123.4 n/a n/a H/s max 5210.1 H/s",
        "Total Speed: 1.24 GH/s, Shares Accepted: 3",
        "new job from pool diff 4295032833",
    ];

    c.bench_function("extract_hashrate", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(extract_hashrate(black_box(line)));
            }
        })
    });
}

criterion_group!(benches, bench_rank, bench_decide, bench_extract_hashrate);
criterion_main!(benches);
