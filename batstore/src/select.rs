//! Value selection: computing candidate lists from predicates.
//!
//! [`bat_select`] scans a BAT (optionally restricted by a candidate list)
//! and returns the OIDs whose value falls in a band. Nil bounds mean
//! unbounded, except that two nil bounds select the nil values themselves.
//! `anti` complements the selection within the non-nil values. The result is
//! a sorted, duplicate-free OID BAT, dense when the hits are contiguous.

use std::cmp::Ordering;

use log::debug;

use crate::bat::{Bat, BatHandle, Role};
use crate::bbp::Bbp;
use crate::candidate::CandIter;
use crate::debug::{self, Cat};
use crate::hash::{hash_candidates, hash_find};
use crate::types::{AtomType, Oid};
use crate::value::Value;
use crate::{Error, Result};

/// Comparison operators accepted by [`theta_select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThetaOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `>`
    Gt,
}

fn in_band(v: &Value, low: &Value, high: &Value, li: bool, hi: bool) -> bool {
    if v.is_nil() {
        return false;
    }
    if !low.is_nil() {
        match v.cmp_nilaware(low) {
            Some(Ordering::Less) => return false,
            Some(Ordering::Equal) if !li => return false,
            None => return false,
            _ => {}
        }
    }
    if !high.is_nil() {
        match v.cmp_nilaware(high) {
            Some(Ordering::Greater) => return false,
            Some(Ordering::Equal) if !hi => return false,
            None => return false,
            _ => {}
        }
    }
    true
}

/// Builds the result BAT from sorted hit OIDs, dense when contiguous.
fn result_from_oids(bbp: &Bbp, hits: Vec<Oid>) -> Result<BatHandle> {
    let dense = hits.len() > 1
        && hits
            .windows(2)
            .all(|w| w[1] == w[0] + 1);
    if dense || hits.len() <= 1 {
        let seq = hits.first().copied().unwrap_or(0);
        return bbp.dense_bat(0, seq, hits.len());
    }
    let h = bbp.new_bat(0, AtomType::Oid, hits.len(), Role::Transient)?;
    {
        let mut b = h.write();
        for o in hits {
            b.append_force(&Value::Oid(o), true)?;
        }
        b.sorted = true;
        b.key = true;
        b.nonil = true;
        b.nil = false;
    }
    Ok(h)
}

/// Range selection over `b`, restricted to `cand` when given.
pub fn bat_select(
    bbp: &Bbp,
    b: &Bat,
    cand: Option<&Bat>,
    low: &Value,
    high: &Value,
    li: bool,
    hi: bool,
    anti: bool,
) -> Result<BatHandle> {
    if low.tpe() != b.ttype() || high.tpe() != b.ttype() {
        return Err(Error::TypeMismatch {
            expected: b.ttype().name(),
            actual: low.tpe().name(),
        });
    }
    let nil_select = low.is_nil() && high.is_nil();
    if debug::enabled(Cat::Algo) {
        debug!(
            "BATselect: bat[{}] {} .. {} li={} hi={} anti={}",
            b.cacheid, low, high, li, hi, anti
        );
    }

    // equality probes go through the hash index when one is there
    if !nil_select && !anti && li && hi && low.cmp_nilaware(high) == Some(Ordering::Equal) {
        let hs = b.hash.read();
        if let Some(h) = hs.as_ref() {
            if cand.is_none() {
                let mut hits: Vec<Oid> = hash_candidates(b, h, low)
                    .map(|p| b.hseqbase() + p as Oid)
                    .collect();
                hits.sort_unstable();
                if debug::enabled(Cat::Algo) {
                    debug!("BATselect: hash probe, {} hits", hits.len());
                }
                return result_from_oids(bbp, hits);
            }
        }
    }

    let mut ci = match cand {
        Some(s) => CandIter::new(s)?,
        None => CandIter::full(b),
    };
    let mut hits = Vec::new();
    while let Some(o) = ci.next_oid() {
        if o < b.hseqbase() {
            continue;
        }
        let p = (o - b.hseqbase()) as usize;
        if p >= b.count() {
            continue;
        }
        let v = b.value(p)?;
        let keep = if nil_select {
            if anti {
                !v.is_nil()
            } else {
                v.is_nil()
            }
        } else if anti {
            !v.is_nil() && !in_band(&v, low, high, li, hi)
        } else {
            in_band(&v, low, high, li, hi)
        };
        if keep {
            hits.push(o);
        }
    }
    result_from_oids(bbp, hits)
}

/// Theta selection: all OIDs whose value compares to `v` under `op`.
pub fn theta_select(
    bbp: &Bbp,
    b: &Bat,
    cand: Option<&Bat>,
    v: &Value,
    op: ThetaOp,
) -> Result<BatHandle> {
    let nil = Value::nil(b.ttype());
    match op {
        ThetaOp::Eq => bat_select(bbp, b, cand, v, v, true, true, false),
        ThetaOp::Ne => bat_select(bbp, b, cand, v, v, true, true, true),
        ThetaOp::Lt => bat_select(bbp, b, cand, &nil, v, false, false, false),
        ThetaOp::Le => bat_select(bbp, b, cand, &nil, v, false, true, false),
        ThetaOp::Gt => bat_select(bbp, b, cand, v, &nil, false, false, false),
        ThetaOp::Ge => bat_select(bbp, b, cand, v, &nil, true, false, false),
    }
}

/// Point lookup: the first OID holding `v`, via the hash index when built.
pub fn bat_find(b: &Bat, v: &Value) -> Result<Option<Oid>> {
    let hs = b.hash.read();
    if let Some(h) = hs.as_ref() {
        return Ok(hash_find(b, h, v)?.map(|p| b.hseqbase() + p as Oid));
    }
    drop(hs);
    for p in 0..b.count() {
        if b.value(p)?.cmp_nilaware(v) == Some(Ordering::Equal) {
            return Ok(Some(b.hseqbase() + p as Oid));
        }
    }
    Ok(None)
}
