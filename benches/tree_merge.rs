use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fuzzx_dsa::{BranchTree, Coverage};
use fuzzx_io::{InputType, LocationId, Predicate, StdinRecord, Termination, TraceRecord};

fn synthetic_trace(seed: u64, len: u32) -> Vec<TraceRecord> {
    (0..len)
        .map(|i| TraceRecord {
            loc: LocationId::flat(i),
            direction: (seed >> (i % 64)) & 1 != 0,
            value: (i as f64) - (seed % 97) as f64,
            num_stdin_bytes: i + 1,
            xor_like: false,
            predicate: Predicate::Less,
        })
        .collect()
}

fn merge_performance(c: &mut Criterion) {
    c.bench_function("merge_64_deep_trace", |b| {
        let stdin = Arc::new(StdinRecord::from_bytes(&[0x55; 64], vec![InputType::U8; 64]));
        b.iter(|| {
            let mut tree = BranchTree::new();
            let mut coverage = Coverage::new();
            for seed in 0..16u64 {
                let trace = Arc::new(synthetic_trace(seed, 64));
                let _ = tree.merge(
                    black_box(&trace),
                    &stdin,
                    Termination::Normal,
                    seed as u32,
                    &mut coverage,
                );
            }
            tree.arena.len()
        })
    });
}

criterion_group!(benches, merge_performance);
criterion_main!(benches);
