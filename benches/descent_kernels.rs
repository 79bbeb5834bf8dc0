use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fuzzx_analysis::math;
use fuzzx_io::{bits_to_bytes, bytes_to_bits};
use rand::rngs::SmallRng;
use rand::SeedableRng;

fn hamming_sampling(c: &mut Criterion) {
    c.bench_function("hamming_class_seed_plan_64_bits", |b| {
        b.iter(|| math::sample_counts_per_hamming_class(black_box(64), black_box(64)))
    });

    c.bench_function("hamming_class_sample_32_of_64", |b| {
        let mut rng = SmallRng::seed_from_u64(5);
        b.iter(|| math::generate_sample_of_hamming_class(black_box(64), black_box(32), &mut rng))
    });
}

fn bit_packing(c: &mut Criterion) {
    let bytes = vec![0x55u8; 1800];
    c.bench_function("bits_to_bytes_1800", |b| {
        let bits = bytes_to_bits(&bytes);
        b.iter(|| bits_to_bytes(black_box(&bits)))
    });
}

criterion_group!(benches, hamming_sampling, bit_packing);
criterion_main!(benches);
