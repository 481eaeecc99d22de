//! Sorting BATs.
//!
//! [`bat_sort`] returns three aligned BATs: the sorted values, the
//! permutation of input OIDs that produces them (the "order" BAT), and the
//! group identifier of every output position. The kernel is a comparator
//! sort generic over the atom's ordering; stability is requested by flag
//! (the unstable variant is allowed to reorder equal keys).

use std::cmp::Ordering;

use log::debug;

use crate::bat::{Bat, BatHandle, Role};
use crate::bbp::Bbp;
use crate::debug::{self, Cat};
use crate::types::{AtomType, Bun, Oid};
use crate::value::Value;
use crate::Result;

/// Sort policy flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortFlags {
    /// Keep equal keys in input order.
    pub stable: bool,
    /// Descending instead of ascending.
    pub reverse: bool,
    /// Nil values come after all others instead of before.
    pub nils_last: bool,
}

fn order_cmp(a: &Value, b: &Value, flags: SortFlags) -> Ordering {
    match (a.is_nil(), b.is_nil()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if flags.nils_last {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, true) => {
            if flags.nils_last {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, false) => {
            let o = a.cmp_nilaware(b).unwrap_or(Ordering::Equal);
            if flags.reverse {
                o.reverse()
            } else {
                o
            }
        }
    }
}

/// Sorts `b`'s tail. Returns `(values, order, groups)`:
///
/// * `values` — the tail values in the requested order;
/// * `order` — the input OID delivering each output position;
/// * `groups` — a dense group id per output position, bumped whenever the
///   key changes.
pub fn bat_sort(
    bbp: &Bbp,
    b: &Bat,
    flags: SortFlags,
) -> Result<(BatHandle, BatHandle, BatHandle)> {
    let n = b.count();
    let mut keyed: Vec<(Value, Bun)> = (0..n)
        .map(|p| b.value(p).map(|v| (v, p)))
        .collect::<Result<_>>()?;
    if flags.stable {
        keyed.sort_by(|x, y| order_cmp(&x.0, &y.0, flags));
    } else {
        keyed.sort_unstable_by(|x, y| order_cmp(&x.0, &y.0, flags));
    }
    if debug::enabled(Cat::Algo) {
        debug!(
            "BATsort: {} values, stable={} reverse={} nils_last={}",
            n, flags.stable, flags.reverse, flags.nils_last
        );
    }
    let values = bbp.new_bat(0, b.ttype(), n, Role::Transient)?;
    let order = bbp.new_bat(0, AtomType::Oid, n, Role::Transient)?;
    let groups = bbp.new_bat(0, AtomType::Oid, n, Role::Transient)?;
    {
        let mut vg = values.write();
        let mut og = order.write();
        let mut gg = groups.write();
        let mut gid: Oid = 0;
        for (i, (v, p)) in keyed.iter().enumerate() {
            if i > 0 && order_cmp(&keyed[i - 1].0, v, flags) != Ordering::Equal {
                gid += 1;
            }
            vg.append_force(v, true)?;
            og.append_force(&Value::Oid(b.hseqbase() + *p as Oid), true)?;
            gg.append_force(&Value::Oid(gid), true)?;
        }
    }
    Ok((values, order, groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn pool() -> Bbp {
        Bbp::transient(Settings::default())
    }

    fn int_bat(bbp: &Bbp, vals: &[i32]) -> BatHandle {
        let h = bbp.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        {
            let mut b = h.write();
            for &v in vals {
                b.append(&Value::Int(v)).unwrap();
            }
        }
        h
    }

    fn ints(h: &BatHandle) -> Vec<i32> {
        let g = h.read();
        (0..g.count())
            .map(|p| match g.value(p).unwrap() {
                Value::Int(v) => v,
                v => panic!("unexpected {:?}", v),
            })
            .collect()
    }

    fn oids(h: &BatHandle) -> Vec<u64> {
        let g = h.read();
        (0..g.count())
            .map(|p| match g.value(p).unwrap() {
                Value::Oid(v) => v,
                v => panic!("unexpected {:?}", v),
            })
            .collect()
    }

    #[test]
    fn stable_sort_with_permutation() {
        let p = pool();
        let b = int_bat(&p, &[3, 1, 2, 1, 3]);
        let (values, order, groups) = bat_sort(
            &p,
            &b.read(),
            SortFlags {
                stable: true,
                ..SortFlags::default()
            },
        )
        .unwrap();
        assert_eq!(ints(&values), vec![1, 1, 2, 3, 3]);
        assert_eq!(oids(&order), vec![1, 3, 2, 0, 4]);
        assert_eq!(oids(&groups), vec![0, 0, 1, 2, 2]);
        let vg = values.read();
        assert!(vg.sorted);
        vg.assert_props().unwrap();
    }

    #[test]
    fn reverse_sort() {
        let p = pool();
        let b = int_bat(&p, &[3, 1, 2]);
        let (values, _, _) = bat_sort(
            &p,
            &b.read(),
            SortFlags {
                reverse: true,
                ..SortFlags::default()
            },
        )
        .unwrap();
        assert_eq!(ints(&values), vec![3, 2, 1]);
        assert!(values.read().revsorted);
    }

    #[test]
    fn nils_first_and_last() {
        let p = pool();
        let h = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        {
            let mut b = h.write();
            for v in [Value::Int(2), Value::nil(AtomType::Int), Value::Int(1)] {
                b.append(&v).unwrap();
            }
        }
        let (values, _, _) = bat_sort(&p, &h.read(), SortFlags::default()).unwrap();
        let g = values.read();
        assert!(g.value(0).unwrap().is_nil());
        assert_eq!(g.value(1).unwrap(), Value::Int(1));
        assert!(g.sorted);

        let (values, _, _) = bat_sort(
            &p,
            &h.read(),
            SortFlags {
                nils_last: true,
                ..SortFlags::default()
            },
        )
        .unwrap();
        let g = values.read();
        assert_eq!(g.value(0).unwrap(), Value::Int(1));
        assert!(g.value(2).unwrap().is_nil());
    }

    #[test]
    fn sorted_strings() {
        let p = pool();
        let h = p.new_bat(0, AtomType::Str, 0, Role::Transient).unwrap();
        {
            let mut b = h.write();
            for s in ["pear", "apple", "plum", "apple"] {
                b.append(&Value::Str(s.into())).unwrap();
            }
        }
        let (values, order, groups) = bat_sort(
            &p,
            &h.read(),
            SortFlags {
                stable: true,
                ..SortFlags::default()
            },
        )
        .unwrap();
        let g = values.read();
        let got: Vec<Value> = (0..4).map(|i| g.value(i).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                Value::Str("apple".into()),
                Value::Str("apple".into()),
                Value::Str("pear".into()),
                Value::Str("plum".into())
            ]
        );
        assert_eq!(oids(&order), vec![1, 3, 0, 2]);
        assert_eq!(oids(&groups), vec![0, 0, 1, 2]);
    }
}
