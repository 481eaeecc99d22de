use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use batstore::{bat_find, Value};

use super::{bench_engine, random_int_bat};

const ITEM_COUNTS: [usize; 3] = [1_000, 10_000, 100_000];

pub fn bench_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashing");
    for &len in ITEM_COUNTS.iter() {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("build", len), &len, |bench, &len| {
            let eng = bench_engine();
            let r = random_int_bat(&eng, len);
            let id = r.read().id();
            bench.iter(|| {
                // drop and rebuild the index every round
                r.read().drop_hash();
                eng.build_hash(id).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("probe", len), &len, |bench, &len| {
            let eng = bench_engine();
            let r = random_int_bat(&eng, len);
            eng.build_hash(r.read().id()).unwrap();
            let b = r.read();
            let probe = b.value(len / 2).unwrap();
            bench.iter(|| black_box(bat_find(&b, &probe).unwrap()));
        });
    }
    group.finish();
}
