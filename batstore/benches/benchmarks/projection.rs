use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use batstore::{project, AtomType, Role, Value};

use super::{bench_engine, random_int_bat, random_oid_bat};

const ITEM_COUNTS: [usize; 3] = [1_000, 10_000, 100_000];

pub fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection");
    for &len in ITEM_COUNTS.iter() {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("dense", len), &len, |bench, &len| {
            let eng = bench_engine();
            let r = random_int_bat(&eng, len);
            let l = eng.dense_bat(0, 0, len).unwrap();
            bench.iter(|| {
                let bn = project(eng.bbp(), &l.read(), &r.read()).unwrap();
                black_box(bn.read().count())
            });
        });
        group.bench_with_input(BenchmarkId::new("materialized", len), &len, |bench, &len| {
            let eng = bench_engine();
            let r = random_int_bat(&eng, len);
            let l = random_oid_bat(&eng, len, len);
            bench.iter(|| {
                let bn = project(eng.bbp(), &l.read(), &r.read()).unwrap();
                black_box(bn.read().count())
            });
        });
        group.bench_with_input(BenchmarkId::new("string-trick", len), &len, |bench, &len| {
            let eng = bench_engine();
            let r = eng.new_bat(0, AtomType::Str, len, Role::Transient).unwrap();
            {
                let mut b = r.write();
                for i in 0..len {
                    b.append(&Value::Str(format!("value {}", i % 64))).unwrap();
                }
            }
            let l = random_oid_bat(&eng, len, len);
            bench.iter(|| {
                let bn = project(eng.bbp(), &l.read(), &r.read()).unwrap();
                black_box(bn.read().count())
            });
        });
    }
    group.finish();
}
