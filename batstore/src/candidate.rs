//! Candidate iterators: an abstract selection of OIDs.
//!
//! Operators take an optional candidate list restricting which OIDs of a BAT
//! they touch. Four physical shapes share one iteration API: a dense range, a
//! materialized sorted OID array, a dense range minus a sorted exception list
//! (a void tail with a variable heap), and a bitmask.

use parking_lot::RwLockReadGuard;

use crate::bat::{msk_get, void_oid_at, Bat};
use crate::heap::Heap;
use crate::types::{AtomType, Bun, Oid, OID_NIL};
use crate::{Error, Result};

enum CandKind<'a> {
    Dense,
    Materialized {
        heap: RwLockReadGuard<'a, Heap>,
        baseoff: Bun,
    },
    Exceptions {
        vheap: RwLockReadGuard<'a, Heap>,
    },
    Mask {
        heap: RwLockReadGuard<'a, Heap>,
        baseoff: Bun,
        /// bit cursor for sequential iteration
        cursor: Bun,
        nbits: Bun,
    },
}

/// Iterator over the OIDs selected by a candidate BAT.
pub struct CandIter<'a> {
    kind: CandKind<'a>,
    /// First OID of a dense or exception shape; first *selected* OID for
    /// masks.
    seq: Oid,
    /// The candidate BAT's own head sequence.
    hseq: Oid,
    ncand: Bun,
    next: Bun,
}

impl<'a> CandIter<'a> {
    /// Interprets `s` as a candidate list. Materialized lists must be sorted
    /// ascending and nil-free.
    pub fn new(s: &'a Bat) -> Result<CandIter<'a>> {
        match s.ttype() {
            AtomType::Oid => {
                let heap = s.theap.read();
                Ok(CandIter {
                    kind: CandKind::Materialized {
                        heap,
                        baseoff: s.baseoff,
                    },
                    seq: 0,
                    hseq: s.hseqbase(),
                    ncand: s.count(),
                    next: 0,
                })
            }
            AtomType::Void if s.tseqbase() == OID_NIL => Ok(CandIter {
                kind: CandKind::Dense,
                seq: 0,
                hseq: s.hseqbase(),
                ncand: 0,
                next: 0,
            }),
            AtomType::Void => {
                if let Some(vh) = &s.tvheap {
                    Ok(CandIter {
                        kind: CandKind::Exceptions { vheap: vh.read() },
                        seq: s.tseqbase(),
                        hseq: s.hseqbase(),
                        ncand: s.count(),
                        next: 0,
                    })
                } else {
                    Ok(CandIter {
                        kind: CandKind::Dense,
                        seq: s.tseqbase(),
                        hseq: s.hseqbase(),
                        ncand: s.count(),
                        next: 0,
                    })
                }
            }
            AtomType::Msk => {
                let heap = s.theap.read();
                let nbits = s.count();
                let mut ncand = 0;
                for p in 0..nbits {
                    if msk_get(heap.all_bytes(), s.baseoff + p) {
                        ncand += 1;
                    }
                }
                Ok(CandIter {
                    kind: CandKind::Mask {
                        heap,
                        baseoff: s.baseoff,
                        cursor: 0,
                        nbits,
                    },
                    seq: s.hseqbase(),
                    hseq: s.hseqbase(),
                    ncand,
                    next: 0,
                })
            }
            t => Err(Error::TypeMismatch {
                expected: "oid/void/msk candidate",
                actual: t.name(),
            }),
        }
    }

    /// A dense iterator over all OIDs of `b`.
    pub fn full(b: &Bat) -> CandIter<'static> {
        CandIter {
            kind: CandKind::Dense,
            seq: b.hseqbase(),
            hseq: b.hseqbase(),
            ncand: b.count(),
            next: 0,
        }
    }

    /// Total number of candidates.
    pub fn ncand(&self) -> Bun {
        self.ncand
    }

    /// The candidate BAT's head sequence.
    pub fn hseq(&self) -> Oid {
        self.hseq
    }

    /// Position of the iteration cursor.
    pub fn idx(&self) -> Bun {
        self.next
    }

    /// The next candidate OID.
    pub fn next_oid(&mut self) -> Option<Oid> {
        if self.next >= self.ncand {
            return None;
        }
        let p = self.next;
        self.next += 1;
        match &mut self.kind {
            CandKind::Dense => Some(self.seq + p as Oid),
            CandKind::Materialized { heap, baseoff } => {
                Some(read_oid(heap.all_bytes(), *baseoff + p))
            }
            CandKind::Exceptions { vheap } => Some(void_oid_at(vheap, self.seq, p)),
            CandKind::Mask {
                heap,
                baseoff,
                cursor,
                nbits,
            } => {
                while *cursor < *nbits && !msk_get(heap.all_bytes(), *baseoff + *cursor) {
                    *cursor += 1;
                }
                let oid = self.seq + *cursor as Oid;
                *cursor += 1;
                Some(oid)
            }
        }
    }

    /// Random access: the candidate OID at position `p`. For masks this scans
    /// from the start of the word stream.
    pub fn oid_at(&self, p: Bun) -> Option<Oid> {
        if p >= self.ncand {
            return None;
        }
        match &self.kind {
            CandKind::Dense => Some(self.seq + p as Oid),
            CandKind::Materialized { heap, baseoff } => {
                Some(read_oid(heap.all_bytes(), *baseoff + p))
            }
            CandKind::Exceptions { vheap } => Some(void_oid_at(vheap, self.seq, p)),
            CandKind::Mask {
                heap,
                baseoff,
                nbits,
                ..
            } => {
                let mut seen = 0;
                for bit in 0..*nbits {
                    if msk_get(heap.all_bytes(), *baseoff + bit) {
                        if seen == p {
                            return Some(self.seq + bit as Oid);
                        }
                        seen += 1;
                    }
                }
                None
            }
        }
    }

    /// Restarts sequential iteration.
    pub fn reset(&mut self) {
        self.next = 0;
        if let CandKind::Mask { cursor, .. } = &mut self.kind {
            *cursor = 0;
        }
    }
}

impl std::fmt::Debug for CandIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match &self.kind {
            CandKind::Dense => "dense",
            CandKind::Materialized { .. } => "materialized",
            CandKind::Exceptions { .. } => "exceptions",
            CandKind::Mask { .. } => "mask",
        };
        f.debug_struct("CandIter")
            .field("shape", &shape)
            .field("seq", &self.seq)
            .field("ncand", &self.ncand)
            .field("next", &self.next)
            .finish()
    }
}

fn read_oid(bytes: &[u8], p: Bun) -> Oid {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[p * 8..p * 8 + 8]);
    u64::from_le_bytes(b)
}

impl<'a> Iterator for CandIter<'a> {
    type Item = Oid;

    fn next(&mut self) -> Option<Oid> {
        self.next_oid()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.ncand - self.next.min(self.ncand);
        (rest, Some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bat::Role;
    use crate::value::Value;

    #[test]
    fn dense_candidates() {
        let b = Bat::dense(1, 0, 5, 4, 0, "00/01/1").unwrap();
        let mut ci = CandIter::new(&b).unwrap();
        assert_eq!(ci.ncand(), 4);
        assert_eq!(ci.by_ref().collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        assert_eq!(ci.oid_at(2), Some(7));
    }

    #[test]
    fn materialized_candidates() {
        let mut b = Bat::new(1, 0, AtomType::Oid, 0, Role::Transient, 0, "00/01/1").unwrap();
        for o in [3u64, 7, 9] {
            b.append(&Value::Oid(o)).unwrap();
        }
        let mut ci = CandIter::new(&b).unwrap();
        assert_eq!(ci.ncand(), 3);
        assert_eq!(ci.oid_at(1), Some(7));
        assert_eq!(ci.by_ref().collect::<Vec<_>>(), vec![3, 7, 9]);
    }

    #[test]
    fn exception_candidates() {
        let mut b = Bat::dense(1, 0, 10, 4, 0, "00/01/1").unwrap();
        // exceptions 11 and 13: candidates are 10, 12, 14, 15
        let mut vh = crate::heap::Heap::new(0, 1, "x.theap".to_string());
        vh.extend(16).unwrap();
        vh.all_bytes_mut()[..8].copy_from_slice(&11u64.to_le_bytes());
        vh.all_bytes_mut()[8..16].copy_from_slice(&13u64.to_le_bytes());
        vh.set_free(16);
        b.tvheap = Some(vh.into_shared());
        let ci = CandIter::new(&b).unwrap();
        assert_eq!(ci.ncand(), 4);
        let got: Vec<_> = CandIter::new(&b).unwrap().collect();
        assert_eq!(got, vec![10, 12, 14, 15]);
        assert_eq!(ci.oid_at(3), Some(15));
    }

    #[test]
    fn mask_candidates() {
        let mut b = Bat::new(1, 20, AtomType::Msk, 0, Role::Transient, 0, "00/01/1").unwrap();
        for i in 0..10 {
            b.append(&Value::Msk(i % 2 == 1)).unwrap();
        }
        let mut ci = CandIter::new(&b).unwrap();
        assert_eq!(ci.ncand(), 5);
        assert_eq!(ci.by_ref().collect::<Vec<_>>(), vec![21, 23, 25, 27, 29]);
        assert_eq!(ci.oid_at(0), Some(21));
        assert_eq!(ci.oid_at(4), Some(29));
    }

    #[test]
    fn full_range() {
        let mut b = Bat::new(1, 100, AtomType::Int, 0, Role::Transient, 0, "00/01/1").unwrap();
        b.append(&Value::Int(1)).unwrap();
        b.append(&Value::Int(2)).unwrap();
        let ci = CandIter::full(&b);
        assert_eq!(ci.collect::<Vec<_>>(), vec![100, 101]);
    }
}
