use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BatchSize;
use criterion::BenchmarkId;
use criterion::Criterion;
use std::hint::black_box;

use warden::registry::ConnectionRegistry;
use warden::wire::SourceKey;

const BASE_TS: i64 = 1_700_000_000;

fn source_keys(n: usize) -> Vec<SourceKey> {
    (0..n)
        .map(|i| {
            format!("10.0.{}.{}:500", i / 256 % 256, i % 256)
                .parse()
                .unwrap()
        })
        .collect()
}

fn registry_bench(bench: &mut Criterion) {
    let mut group = bench.benchmark_group("registry");

    for account_count in [100usize, 10_000] {
        group.bench_function(BenchmarkId::new("record", account_count), |b| {
            let reg = ConnectionRegistry::new(60);
            let accounts: Vec<String> =
                (0..account_count).map(|i| format!("acct{}", i)).collect();
            let keys = source_keys(4);
            let mut i = 0usize;
            b.iter(|| {
                reg.record(
                    black_box(&accounts[i % accounts.len()]),
                    keys[i % keys.len()].clone(),
                    BASE_TS + i as i64,
                );
                i += 1;
            });
        });
    }

    group.bench_function(BenchmarkId::new("active_sources", "8_sources"), |b| {
        let reg = ConnectionRegistry::new(60);
        for (i, key) in source_keys(8).into_iter().enumerate() {
            reg.record("848055128", key, BASE_TS + i as i64);
        }
        b.iter(|| black_box(reg.active_sources(black_box("848055128"), BASE_TS + 10)));
    });

    group.bench_function(BenchmarkId::new("sweep", "1k_accounts"), |b| {
        let keys = source_keys(1);
        b.iter_batched(
            || {
                let reg = ConnectionRegistry::new(60);
                for i in 0..1_000 {
                    reg.record(&format!("acct{}", i), keys[0].clone(), BASE_TS);
                }
                reg
            },
            |reg| black_box(reg.sweep(BASE_TS + 100)),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, registry_bench);
criterion_main!(benches);
