pub mod hashing;
pub mod projection;

use batstore::{AtomType, BatHandle, Engine, Role, Settings, Value};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const SEED: [u8; 32] = [100; 32];

pub fn bench_engine() -> Engine {
    Engine::transient(&Settings::default())
}

pub fn random_int_bat(eng: &Engine, len: usize) -> BatHandle {
    let mut rng = StdRng::from_seed(SEED);
    let h = eng.new_bat(0, AtomType::Int, len, Role::Transient).unwrap();
    {
        let mut b = h.write();
        for _ in 0..len {
            b.append(&Value::Int(rng.gen())).unwrap();
        }
    }
    h
}

pub fn random_oid_bat(eng: &Engine, len: usize, domain: usize) -> BatHandle {
    let mut rng = StdRng::from_seed(SEED);
    let h = eng.new_bat(0, AtomType::Oid, len, Role::Transient).unwrap();
    {
        let mut b = h.write();
        for _ in 0..len {
            b.append(&Value::Oid(rng.gen_range(0..domain as u64))).unwrap();
        }
    }
    h
}
