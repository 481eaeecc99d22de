use criterion::{criterion_group, criterion_main};

use crate::benchmarks::{hashing::bench_hashing, projection::bench_projection};

mod benchmarks;

criterion_group!(benches, bench_projection, bench_hashing);
criterion_main!(benches);
