use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ledgerlock_core::transaction::coordinator_for;
use ledgerlock_core::{ContextId, DeadlockDetector, DetectionStrategy, ResourceId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const STRATEGIES: [DetectionStrategy; 2] =
    [DetectionStrategy::IncrementalDfs, DetectionStrategy::TransitiveClosure];

fn bench_uncontended_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_transfers");

    for strategy in STRATEGIES {
        let bank = coordinator_for(&[(1, i64::MAX / 2), (2, 0)], Duration::from_millis(100), strategy)
            .unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::from_parameter(strategy), |b| {
            b.iter(|| black_box(bank.transfer(ResourceId(1), ResourceId(2), 1).unwrap()));
        });
    }
    group.finish();
}

fn bench_contended_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_transfers");
    group.sample_size(20);

    for strategy in STRATEGIES {
        for threads in [2, 4, 8].iter() {
            group.throughput(Throughput::Elements(500 * *threads as u64));
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), threads),
                threads,
                |b, &threads| {
                    let accounts: Vec<(u64, i64)> = (1..=4).map(|id| (id, 1_000_000)).collect();
                    let bank = Arc::new(
                        coordinator_for(&accounts, Duration::from_millis(20), strategy).unwrap(),
                    );

                    b.iter(|| {
                        let handles: Vec<_> = (0..threads)
                            .map(|t| {
                                let bank = Arc::clone(&bank);
                                thread::spawn(move || {
                                    let mut rng = StdRng::seed_from_u64(t as u64);
                                    for _ in 0..500 {
                                        let from = rng.gen_range(1..=4u64);
                                        let to = from % 4 + 1;
                                        // Failures are part of the workload.
                                        let _ = black_box(bank.transfer(
                                            ResourceId(from),
                                            ResourceId(to),
                                            1,
                                        ));
                                    }
                                })
                            })
                            .collect();

                        for handle in handles {
                            handle.join().unwrap();
                        }
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_cycle_probe(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_probe");

    for strategy in STRATEGIES {
        for chain in [8usize, 32, 64].iter() {
            let detector = DeadlockDetector::new(strategy, Some(chain + 1)).unwrap();
            let ids: Vec<ContextId> = (0..=*chain as u64).map(ContextId).collect();
            // Waits stay installed while the guards live.
            let _edges: Vec<_> = ids
                .windows(2)
                .map(|pair| detector.enter_wait(pair[0], pair[1], ResourceId(0)).unwrap())
                .collect();

            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), chain),
                chain,
                |b, &chain| {
                    b.iter(|| {
                        let closes = detector.would_create_cycle(ids[chain], ids[0]).unwrap();
                        assert!(black_box(closes));
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_transfers,
    bench_contended_transfers,
    bench_cycle_probe
);
criterion_main!(benches);
