//! Criterion benchmarks for the operation hot paths.
//!
//! Every operation takes the branch bus lock, calls the backend and classifies
//! the outcome, so these numbers bound the per-cycle overhead of the core on
//! top of a zero-latency highway.
//!
//! Run with: cargo bench --bench camac_ops

use camac_core::{Action, CamacConfig, CamacDriver, ControlBlock};
use camac_driver_mock::{MockHighway, MockModule};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn driver() -> CamacDriver<MockHighway> {
    let highway = MockHighway::builder()
        .module(0, 1, 5, MockModule::new("Scaler").with_register(0, 42))
        .module(0, 1, 6, MockModule::new("ADC"))
        .build();
    let config = CamacConfig {
        branches: Some(vec![0]),
        monitor_period_ms: 3_600_000,
        ..CamacConfig::default()
    };
    let driver = CamacDriver::new(highway, config);
    driver.library_init().unwrap();
    driver.crate_init(0, 1).unwrap();
    driver
}

fn single_action(c: &mut Criterion) {
    let driver = driver();
    let address = driver.encode(0, 1, 5, 0).unwrap();

    c.bench_function("single_action_read", |b| {
        b.iter(|| {
            let mut data: u32 = 0;
            driver.single_action(0, black_box(address), &mut data).unwrap();
            black_box(data)
        });
    });

    c.bench_function("encode", |b| {
        b.iter(|| driver.encode(black_box(0), black_box(1), black_box(5), black_box(3)).unwrap());
    });
}

fn general_multi_action(c: &mut Criterion) {
    let driver = driver();
    let scaler = driver.encode(0, 1, 5, 0).unwrap();
    let adc = driver.encode(0, 1, 6, 0).unwrap();
    let mut group = c.benchmark_group("general_multi_action");

    for len in [1usize, 8, 64] {
        let template: Vec<Action<u32>> = (0..len)
            .map(|i| Action::new(0, if i % 2 == 0 { scaler } else { adc }))
            .collect();

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("reads", len), &len, |b, &len| {
            let mut actions = template.clone();
            b.iter(|| {
                let mut cb = ControlBlock::new(len);
                driver.general_multi_action(&mut actions, &mut cb).unwrap();
                black_box(cb.tally)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, single_action, general_multi_action);
criterion_main!(benches);
