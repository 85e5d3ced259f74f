//! Performance benchmarks for the header search path

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sha256d_miner::crypto::{sha256_header_full, sha256_midstate, HeaderHasher};
use sha256d_miner::target::{bits_to_target, pool_target, scale_target_by_difficulty, Target};
use sha256d_miner::worker::{AcceleratorEngine, EmulatedShaPeripheral, HashEngine, SoftwareEngine};
use sha256d_miner::{BlockHeader, MiningJob, MiningStats};
use std::hint::black_box;
use std::sync::Arc;

const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

fn genesis_job() -> MiningJob {
    let bytes = hex::decode(GENESIS_HEADER).expect("valid hex");
    let header = BlockHeader::deserialize(&bytes).expect("valid header");
    MiningJob::from_header(1, "genesis", header, "00000000", 1.0)
}

fn bench_header_hashing(c: &mut Criterion) {
    let job = genesis_job();
    let header = *job.header_bytes();
    let hasher = HeaderHasher::new(sha256_midstate(&header), &header);

    let mut group = c.benchmark_group("header_hash");
    group.throughput(Throughput::Elements(1));

    group.bench_function("full_double_hash", |b| {
        b.iter(|| black_box(sha256_header_full(black_box(&header))));
    });

    let mut nonce = 0u32;
    group.bench_function("midstate_early_reject", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            black_box(hasher.hash_nonce(black_box(nonce)))
        });
    });

    group.finish();
}

fn bench_engines(c: &mut Criterion) {
    let job = genesis_job();
    let mut group = c.benchmark_group("engine_batch");
    const BATCH: u32 = 1024;
    group.throughput(Throughput::Elements(u64::from(BATCH)));

    let mut software = SoftwareEngine::new();
    software.load_job(&job).expect("load");
    group.bench_with_input(BenchmarkId::new("software", BATCH), &BATCH, |b, &batch| {
        b.iter(|| {
            for nonce in 0..batch {
                black_box(software.try_nonce(&job, nonce).expect("hash"));
            }
        });
    });

    let mut accelerator =
        AcceleratorEngine::new(EmulatedShaPeripheral::new(), Arc::new(MiningStats::new()));
    accelerator.load_job(&job).expect("load");
    group.bench_with_input(BenchmarkId::new("emulated_accelerator", BATCH), &BATCH, |b, &batch| {
        b.iter(|| {
            for nonce in 0..batch {
                black_box(accelerator.try_nonce(&job, nonce).expect("hash"));
            }
        });
    });

    group.finish();
}

fn bench_target_arithmetic(c: &mut Criterion) {
    let network = bits_to_target(0x1703_a30c);

    c.bench_function("bits_to_target", |b| {
        b.iter(|| black_box(bits_to_target(black_box(0x1d00_ffff))));
    });

    c.bench_function("scale_target_by_difficulty", |b| {
        b.iter(|| {
            black_box(scale_target_by_difficulty(
                &Target::DIFFICULTY_ONE,
                black_box(65536.0),
            ))
        });
    });

    c.bench_function("pool_target", |b| {
        b.iter(|| black_box(pool_target(black_box(4096.0), &network)));
    });
}

criterion_group!(benches, bench_header_hashing, bench_engines, bench_target_arithmetic);
criterion_main!(benches);
