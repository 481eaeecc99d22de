//! Projection: positional lookup of one BAT's tail through another's OIDs.
//!
//! [`project2`] returns a BAT aligned with the left input whose values are
//! taken from the first right input where the OID falls inside it and from
//! the second right input otherwise. A specialization ladder avoids work
//! where possible: a dense left input inside one right operand degenerates
//! to a zero-copy slice; string results reuse the right operand's dictionary
//! heap by reference count (the "string trick") instead of copying strings;
//! fixed-width types run a bytewise inner loop; everything else falls back
//! to a value loop.

use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;

use crate::bat::{Access, Bat, BatHandle, Role};
use crate::bbp::Bbp;
use crate::candidate::CandIter;
use crate::debug::{self, Cat};
use crate::strheap;
use crate::types::{AtomType, Bun, Oid, OID_NIL};
use crate::value::Value;
use crate::{Error, Result};

/// `BATproject`: one right operand.
pub fn project(bbp: &Bbp, l: &Bat, r: &Bat) -> Result<BatHandle> {
    project2(bbp, l, r, None)
}

/// `BATproject2`: values come from `r1` for OIDs below `r1.hseq + r1.count`
/// and from `r2` beyond. `r2`, when present, must continue `r1`'s OID range
/// seamlessly and agree on the tail type.
pub fn project2(bbp: &Bbp, l: &Bat, r1: &Bat, r2: Option<&Bat>) -> Result<BatHandle> {
    if l.ttype() != AtomType::Oid && l.ttype() != AtomType::Void {
        return Err(Error::TypeMismatch {
            expected: "oid",
            actual: l.ttype().name(),
        });
    }
    if let Some(r2) = r2 {
        if r2.ttype() != r1.ttype() && r2.ttype() != AtomType::Void && r1.ttype() != AtomType::Void
        {
            return Err(Error::TypeMismatch {
                expected: r1.ttype().name(),
                actual: r2.ttype().name(),
            });
        }
        if r2.hseqbase() != r1.hseqbase() + r1.count() as Oid {
            return Err(Error::OidOutOfRange(r2.hseqbase()));
        }
    }
    let lcount = l.count();
    let tpe = r1.ttype();

    // dense left: the projection is a slice of one right operand
    if l.is_dense() && lcount > 0 {
        let lo = l.tseqbase();
        let hi = lo + lcount as Oid;
        if lo >= r1.hseqbase() && hi <= r1.hseqbase() + r1.count() as Oid {
            let bn = bbp.slice(r1, (lo - r1.hseqbase()) as Bun, (hi - r1.hseqbase()) as Bun)?;
            bn.write().hseqbase = l.hseqbase();
            if debug::enabled(Cat::Algo) {
                debug!("BATproject: slice of r1");
            }
            return Ok(bn);
        }
        match r2 {
            Some(r2) if lo >= r2.hseqbase() && hi <= r2.hseqbase() + r2.count() as Oid => {
                let bn =
                    bbp.slice(r2, (lo - r2.hseqbase()) as Bun, (hi - r2.hseqbase()) as Bun)?;
                bn.write().hseqbase = l.hseqbase();
                return Ok(bn);
            }
            Some(r2) if lo >= r1.hseqbase() && hi <= r2.hseqbase() + r2.count() as Oid => {
                // straddles both operands, fall through to the copy loops
            }
            _ => return Err(Error::OidOutOfRange(lo)),
        }
    }

    // trivial: every output is nil (no input rows, or only nil sources)
    let r1_void_nil = r1.ttype() == AtomType::Void && r1.tseqbase() == OID_NIL;
    let r2_void_nil = r2.map_or(true, |r| r.ttype() == AtomType::Void && r.tseqbase() == OID_NIL);
    if lcount == 0
        || (l.ttype() == AtomType::Void && l.tseqbase() == OID_NIL)
        || (r1_void_nil && r2_void_nil)
    {
        let out_tpe = if tpe == AtomType::Oid { AtomType::Void } else { tpe };
        if debug::enabled(Cat::Algo) {
            debug!("BATproject: constant nil");
        }
        return bbp.constant_bat(l.hseqbase(), out_tpe, &Value::nil(tpe), lcount);
    }

    if tpe.storage() == AtomType::Str && l.nonil {
        match r2 {
            None => {
                // worthwhile when the left side is not tiny relative to the
                // right, or when the right is frozen anyway
                if r1.count() == 0
                    || lcount > (r1.count() >> 3)
                    || r1.access() == Access::Read
                {
                    return project_str(bbp, l, r1, None);
                }
            }
            Some(r2) => {
                let shared = match (&r1.tvheap, &r2.tvheap) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    _ => false,
                };
                if shared || !strheap::dedup_active(&r1.tvheap.as_ref().unwrap().read()) {
                    return project_str(bbp, l, r1, Some(r2));
                }
            }
        }
    }

    if tpe == AtomType::Oid || (tpe == AtomType::Void && !r1_void_nil) {
        return project_oid(bbp, l, r1, r2);
    }
    if !tpe.varsized() && tpe != AtomType::Void && tpe != AtomType::Msk {
        return project_fixed(bbp, l, r1, r2);
    }
    project_any(bbp, l, r1, r2)
}

struct RightBounds {
    r1seq: Oid,
    r1end: Oid,
    r2seq: Oid,
    r2end: Oid,
}

fn bounds(r1: &Bat, r2: Option<&Bat>) -> RightBounds {
    let r1seq = r1.hseqbase();
    let r1end = r1seq + r1.count() as Oid;
    let (r2seq, r2end) = match r2 {
        Some(r2) => (r2.hseqbase(), r2.hseqbase() + r2.count() as Oid),
        None => (r1end, r1end),
    };
    RightBounds {
        r1seq,
        r1end,
        r2seq,
        r2end,
    }
}

fn result_props(bn: &mut Bat, l: &Bat, r1: &Bat, r2: Option<&Bat>) {
    let cnt = bn.count();
    bn.nil = false;
    match r2 {
        Some(r2) => {
            bn.nonil = l.nonil && r1.nonil && r2.nonil;
            bn.sorted = cnt <= 1;
            bn.revsorted = cnt <= 1;
            bn.key = cnt <= 1;
        }
        None => {
            bn.nonil = l.nonil && r1.nonil;
            // order and uniqueness survive the projection only when the
            // left side has no nil oids (nil outputs sort first)
            bn.sorted = cnt <= 1
                || (l.nonil && ((l.sorted && r1.sorted) || (l.revsorted && r1.revsorted)));
            bn.revsorted = cnt <= 1
                || (l.nonil && ((l.sorted && r1.revsorted) || (l.revsorted && r1.sorted)));
            bn.key = cnt <= 1 || (l.nonil && l.key && r1.key);
        }
    }
}

/// Drops a half-built result from the pool after a failed projection.
fn reclaim(bbp: &Bbp, handle: BatHandle) {
    let id = handle.read().id();
    drop(handle);
    let _ = bbp.unfix(id);
    let _ = bbp.release(id);
}

fn fill_fixed(bn: &mut Bat, l: &Bat, r1: &Bat, r2: Option<&Bat>, b: &RightBounds) -> Result<bool> {
    let lcount = l.count();
    let w = bn.width;
    let nilb = bn.ttype().nil_bytes();
    let mut saw_nil = false;
    let mut ci = CandIter::new(l)?;
    let r1h = r1.theap.read();
    let r2h = r2.map(|r| r.theap.read());
    let mut out = bn.theap.write();
    out.extend(lcount * w)?;
    let outb = out.all_bytes_mut();
    for lo in 0..lcount {
        let o = ci.next_oid().ok_or(Error::PositionOutOfRange(lo))?;
        if o == OID_NIL {
            outb[lo * w..lo * w + w].copy_from_slice(nilb);
            saw_nil = true;
            continue;
        }
        if o < b.r1seq || o >= b.r2end {
            return Err(Error::OidOutOfRange(o));
        }
        let (src, baseoff, seq) = if o < b.r1end {
            (&r1h, r1.baseoff, b.r1seq)
        } else {
            (r2h.as_ref().unwrap(), r2.unwrap().baseoff, b.r2seq)
        };
        let off = (baseoff + (o - seq) as Bun) * w;
        let sb = src.all_bytes();
        outb[lo * w..lo * w + w].copy_from_slice(&sb[off..off + w]);
    }
    Ok(saw_nil)
}

/// Fixed-width inner loop: copies `width` bytes per projected value.
fn project_fixed(bbp: &Bbp, l: &Bat, r1: &Bat, r2: Option<&Bat>) -> Result<BatHandle> {
    let tpe = r1.ttype();
    let lcount = l.count();
    let handle = bbp.new_bat(l.hseqbase(), tpe, lcount, Role::Transient)?;
    let b = bounds(r1, r2);
    let mut bn = handle.write();
    match fill_fixed(&mut bn, l, r1, r2, &b) {
        Ok(saw_nil) => {
            bn.set_count_raw(lcount);
            result_props(&mut bn, l, r1, r2);
            if saw_nil {
                bn.nil = true;
                bn.nonil = false;
            }
            drop(bn);
            Ok(handle)
        }
        Err(e) => {
            drop(bn);
            reclaim(bbp, handle);
            Err(e)
        }
    }
}

fn read_right_oid(r: &Bat, idx: Bun) -> Result<Oid> {
    match r.value(idx)? {
        Value::Oid(o) | Value::Void(o) => Ok(o),
        v => Err(Error::TypeMismatch {
            expected: "oid",
            actual: v.tpe().name(),
        }),
    }
}

/// OID results: the right operands may be dense, dense-with-exceptions, or
/// materialized.
fn fill_oid(bn: &mut Bat, l: &Bat, r1: &Bat, r2: Option<&Bat>, b: &RightBounds) -> Result<bool> {
    let lcount = l.count();
    let mut saw_nil = false;
    let mut ci = CandIter::new(l)?;
    let mut out = bn.theap.write();
    out.extend(lcount * 8)?;
    let outb = out.all_bytes_mut();
    for lo in 0..lcount {
        let o = ci.next_oid().ok_or(Error::PositionOutOfRange(lo))?;
        let v = if o == OID_NIL {
            OID_NIL
        } else if o < b.r1seq || o >= b.r2end {
            return Err(Error::OidOutOfRange(o));
        } else if o < b.r1end {
            read_right_oid(r1, (o - b.r1seq) as Bun)?
        } else {
            read_right_oid(r2.unwrap(), (o - b.r2seq) as Bun)?
        };
        if v == OID_NIL {
            saw_nil = true;
        }
        outb[lo * 8..lo * 8 + 8].copy_from_slice(&v.to_le_bytes());
    }
    Ok(saw_nil)
}

fn project_oid(bbp: &Bbp, l: &Bat, r1: &Bat, r2: Option<&Bat>) -> Result<BatHandle> {
    let lcount = l.count();
    let handle = bbp.new_bat(l.hseqbase(), AtomType::Oid, lcount, Role::Transient)?;
    let b = bounds(r1, r2);
    let mut bn = handle.write();
    match fill_oid(&mut bn, l, r1, r2, &b) {
        Ok(saw_nil) => {
            bn.set_count_raw(lcount);
            result_props(&mut bn, l, r1, r2);
            if saw_nil {
                bn.nil = true;
                bn.nonil = false;
            }
            drop(bn);
            Ok(handle)
        }
        Err(e) => {
            drop(bn);
            reclaim(bbp, handle);
            Err(e)
        }
    }
}

fn fill_any(bn: &mut Bat, l: &Bat, r1: &Bat, r2: Option<&Bat>, b: &RightBounds) -> Result<()> {
    let tpe = r1.ttype();
    let mut ci = CandIter::new(l)?;
    for lo in 0..l.count() {
        let o = ci.next_oid().ok_or(Error::PositionOutOfRange(lo))?;
        let v = if o == OID_NIL {
            Value::nil(tpe)
        } else if o < b.r1seq || o >= b.r2end {
            return Err(Error::OidOutOfRange(o));
        } else if o < b.r1end {
            r1.value((o - b.r1seq) as Bun)?
        } else {
            r2.unwrap().value((o - b.r2seq) as Bun)?
        };
        bn.append_force(&v, true)?;
    }
    Ok(())
}

/// Generic value loop for varsized and irregular types.
fn project_any(bbp: &Bbp, l: &Bat, r1: &Bat, r2: Option<&Bat>) -> Result<BatHandle> {
    let lcount = l.count();
    let handle = bbp.new_bat(l.hseqbase(), r1.ttype(), lcount, Role::Transient)?;
    let b = bounds(r1, r2);
    let mut bn = handle.write();
    match fill_any(&mut bn, l, r1, r2, &b) {
        Ok(()) => {
            let saw_nil = bn.nil;
            result_props(&mut bn, l, r1, r2);
            if saw_nil {
                bn.nil = true;
                bn.nonil = false;
            }
            drop(bn);
            Ok(handle)
        }
        Err(e) => {
            drop(bn);
            reclaim(bbp, handle);
            Err(e)
        }
    }
}

/// The string trick: the result stores projected *offsets* and aliases the
/// right operand's dictionary heap by reference count instead of copying
/// strings. With two right operands their dictionaries are concatenated
/// into a fresh heap and the second operand's offsets are shifted.
fn project_str(bbp: &Bbp, l: &Bat, r1: &Bat, r2: Option<&Bat>) -> Result<BatHandle> {
    let handle = bbp.new_bat(l.hseqbase(), AtomType::Str, l.count(), Role::Transient)?;
    let mut bn = handle.write();
    match project_str_into(bbp, &mut bn, l, r1, r2) {
        Ok(()) => {
            drop(bn);
            Ok(handle)
        }
        Err(e) => {
            drop(bn);
            reclaim(bbp, handle);
            Err(e)
        }
    }
}

fn project_str_into(
    bbp: &Bbp,
    bn: &mut Bat,
    l: &Bat,
    r1: &Bat,
    r2: Option<&Bat>,
) -> Result<()> {
    let lcount = l.count();
    let b = bounds(r1, r2);
    let r1vh = r1.tvheap.as_ref().expect("string BAT without vheap");

    // h1off: shift applied to offsets taken from r2
    let mut h1off: u64 = 0;
    let shared_with_r2 = r2
        .and_then(|r| r.tvheap.as_ref())
        .map_or(false, |r2vh| Arc::ptr_eq(r1vh, r2vh));
    let w;
    if r2.is_none() || shared_with_r2 {
        // alias the dictionary, accounted through the buffer pool; the
        // projected offsets are reinterpreted as-is
        let parent = r1vh.read().parentid;
        bn.tvheap = Some(Arc::clone(r1vh));
        if parent > 0 {
            let _ = bbp.share(parent);
        }
        w = r1.width.max(r2.map_or(r1.width, |r| r.width));
        if debug::enabled(Cat::Algo) {
            debug!("BATproject: sharing string heap of bat[{}]", parent);
        }
    } else {
        // concatenate both dictionaries into the fresh heap
        let r2vh = r2.unwrap().tvheap.as_ref().expect("string BAT without vheap");
        let r1v = r1vh.read();
        let r2v = r2vh.read();
        h1off = (r1v.free() as u64 + 7) & !7;
        let total = h1off as usize + r2v.free();
        let own = bn.tvheap.as_ref().unwrap();
        let mut vh = own.write();
        vh.extend(total)?;
        vh.all_bytes_mut()[..r1v.free()].copy_from_slice(r1v.base());
        vh.all_bytes_mut()[h1off as usize..total].copy_from_slice(r2v.base());
        vh.set_free(total);
        // offsets shifted into the spliced heap may need a wider encoding
        w = strheap::var_width_for(h1off + r2v.free() as u64)
            .max(r1.width)
            .max(r2.unwrap().width);
    }
    bn.width = w;
    bn.shift = w.trailing_zeros() as u8;

    {
        let mut ci = CandIter::new(l)?;
        let r1h = r1.theap.read();
        let r2h = r2.map(|r| r.theap.read());
        let mut out = bn.theap.write();
        out.extend(lcount * w)?;
        for lo in 0..lcount {
            let o = ci.next_oid().ok_or(Error::PositionOutOfRange(lo))?;
            if o < b.r1seq || o >= b.r2end {
                return Err(Error::OidOutOfRange(o));
            }
            let v = if o < b.r1end {
                let base = &r1h.all_bytes()[r1.baseoff * r1.width..];
                strheap::var_get(base, r1.width, (o - b.r1seq) as Bun)
            } else {
                let r2 = r2.unwrap();
                let base = &r2h.as_ref().unwrap().all_bytes()[r2.baseoff * r2.width..];
                strheap::var_get(base, r2.width, (o - b.r2seq) as Bun) + h1off
            };
            strheap::var_put(out.all_bytes_mut(), w, lo, v);
        }
    }
    bn.set_count_raw(lcount);
    bn.sorted = lcount <= 1;
    bn.revsorted = lcount <= 1;
    bn.key = lcount <= 1;
    bn.nil = false;
    bn.nonil = r1.nonil && r2.map_or(true, |r| r.nonil);
    // a result that aliases or splices foreign dictionaries must not append
    bn.restricted = Access::Read;
    Ok(())
}

enum ChainLink<'a> {
    Dense(Oid),
    AllNil,
    Cand(CandIter<'a>),
}

/// `BATprojectchain`: the iterated projection of a chain of OID BATs ending
/// in a value BAT, computed in one pass without materializing intermediates.
pub fn project_chain(bbp: &Bbp, bats: &[&Bat]) -> Result<BatHandle> {
    let n = bats.len();
    if n == 0 {
        return Err(Error::TypeMismatch {
            expected: "at least one BAT",
            actual: "none",
        });
    }
    let last = bats[n - 1];
    if n == 1 {
        let h = bbp.insert(|id, physical| {
            let farmid = last.theap.read().farmid;
            last.copy(id, Role::Transient, farmid, physical)
        })?;
        return Ok(h);
    }
    for b in &bats[..n - 1] {
        if b.ttype() != AtomType::Oid && b.ttype() != AtomType::Void {
            return Err(Error::TypeMismatch {
                expected: "oid",
                actual: b.ttype().name(),
            });
        }
    }
    let cnt0 = bats[0].count();
    let mut allnil = bats[0].count() == 0;
    let mut issorted = true;
    let mut nonil = true;
    let mut links: SmallVec<[ChainLink<'_>; 8]> = SmallVec::new();
    for (i, b) in bats.iter().enumerate() {
        issorted &= b.sorted;
        if i + 1 < n {
            nonil &= b.nonil;
        }
        if b.ttype() == AtomType::Void && b.tseqbase() == OID_NIL {
            allnil = true;
            links.push(ChainLink::AllNil);
        } else if b.is_dense() {
            links.push(ChainLink::Dense(b.tseqbase()));
        } else if i + 1 < n {
            links.push(ChainLink::Cand(CandIter::new(b)?));
        } else {
            links.push(ChainLink::Dense(0)); // unused, the tail is fetched by value
        }
    }
    let tpe = bats[n - 1].ttype();
    if allnil || cnt0 == 0 {
        let out_tpe = if tpe == AtomType::Oid { AtomType::Void } else { tpe };
        if debug::enabled(Cat::Algo) {
            debug!("BATprojectchain: nil/empty result");
        }
        return bbp.constant_bat(bats[0].hseqbase(), out_tpe, &Value::nil(tpe), cnt0);
    }

    let stringtrick = nonil && tpe.storage() == AtomType::Str && bats[n - 1].nonil;

    let out_tpe = if stringtrick { AtomType::Str } else { tpe };
    let handle = bbp.new_bat(bats[0].hseqbase(), out_tpe, cnt0, Role::Transient)?;
    let mut bn = handle.write();
    let res = chain_into(bbp, &mut bn, bats, &mut links, last, stringtrick, nonil, tpe);
    match res {
        Ok(()) => {
            bn.sorted = cnt0 <= 1 || issorted;
            bn.revsorted = cnt0 <= 1;
            bn.tseq = OID_NIL;
            drop(bn);
            Ok(handle)
        }
        Err(e) => {
            drop(bn);
            reclaim(bbp, handle);
            Err(e)
        }
    }
}

/// Resolves one head position through the OID links of the chain.
fn chain_resolve(bats: &[&Bat], links: &mut [ChainLink<'_>], p: Bun) -> Result<Oid> {
    let n = bats.len();
    let mut o = match &mut links[0] {
        ChainLink::Dense(seq) => *seq + p as Oid,
        ChainLink::AllNil => OID_NIL,
        ChainLink::Cand(ci) => ci.oid_at(p).ok_or(Error::PositionOutOfRange(p))?,
    };
    for i in 1..n - 1 {
        if o == OID_NIL {
            return Ok(OID_NIL);
        }
        let b = bats[i];
        if o < b.hseqbase() || o >= b.hseqbase() + b.count() as Oid {
            return Err(Error::OidOutOfRange(o));
        }
        let idx = (o - b.hseqbase()) as Bun;
        o = match &mut links[i] {
            ChainLink::Dense(seq) => *seq + idx as Oid,
            ChainLink::AllNil => OID_NIL,
            ChainLink::Cand(ci) => ci.oid_at(idx).ok_or(Error::PositionOutOfRange(idx))?,
        };
    }
    Ok(o)
}

#[allow(clippy::too_many_arguments)]
fn chain_into(
    bbp: &Bbp,
    bn: &mut Bat,
    bats: &[&Bat],
    links: &mut [ChainLink<'_>],
    last: &Bat,
    stringtrick: bool,
    nonil: bool,
    tpe: AtomType,
) -> Result<()> {
    let cnt0 = bats[0].count();
    if stringtrick {
        let vh = last.tvheap.as_ref().expect("string BAT without vheap");
        let parent = vh.read().parentid;
        bn.tvheap = Some(Arc::clone(vh));
        if parent > 0 {
            let _ = bbp.share(parent);
        }
        bn.width = last.width;
        bn.shift = last.shift;
        {
            let lh = last.theap.read();
            let mut out = bn.theap.write();
            out.extend(cnt0 * last.width)?;
            for p in 0..cnt0 {
                let o = chain_resolve(bats, links, p)?;
                if o < last.hseqbase() || o >= last.hseqbase() + last.count() as Oid {
                    return Err(Error::OidOutOfRange(o));
                }
                let base = &lh.all_bytes()[last.baseoff * last.width..];
                let v = strheap::var_get(base, last.width, (o - last.hseqbase()) as Bun);
                strheap::var_put(out.all_bytes_mut(), last.width, p, v);
            }
        }
        bn.set_count_raw(cnt0);
        bn.restricted = Access::Read;
        bn.nil = false;
        bn.nonil = last.nonil;
        bn.key = false;
    } else {
        let mut saw_nil = false;
        for p in 0..cnt0 {
            let o = chain_resolve(bats, links, p)?;
            let v = if o == OID_NIL {
                saw_nil = true;
                Value::nil(tpe)
            } else {
                if o < last.hseqbase() || o >= last.hseqbase() + last.count() as Oid {
                    return Err(Error::OidOutOfRange(o));
                }
                last.value((o - last.hseqbase()) as Bun)?
            };
            bn.append_force(&v, true)?;
        }
        bn.nil = saw_nil;
        bn.nonil = !saw_nil && nonil && last.nonil;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn pool() -> Bbp {
        Bbp::transient(Settings::default())
    }

    fn int_bat(bbp: &Bbp, hseq: Oid, vals: &[i32]) -> BatHandle {
        let h = bbp.new_bat(hseq, AtomType::Int, 0, Role::Transient).unwrap();
        {
            let mut b = h.write();
            for &v in vals {
                b.append(&Value::Int(v)).unwrap();
            }
        }
        h
    }

    #[test]
    fn dense_projection_is_a_slice() {
        let p = pool();
        let r = int_bat(&p, 0, &[10, 20, 30, 40, 50]);
        let l = p.dense_bat(0, 2, 3).unwrap();
        let bn = project(&p, &l.read(), &r.read()).unwrap();
        let g = bn.read();
        assert!(g.is_view());
        assert_eq!(g.count(), 3);
        for (i, want) in [30, 40, 50].iter().enumerate() {
            assert_eq!(g.value(i).unwrap(), Value::Int(*want));
        }
    }

    #[test]
    fn materialized_projection() {
        let p = pool();
        let r = int_bat(&p, 0, &[10, 20, 30, 40, 50]);
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            for o in [4u64, 0, 2, 2] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let bn = project(&p, &l.read(), &r.read()).unwrap();
        let g = bn.read();
        let got: Vec<Value> = (0..4).map(|i| g.value(i).unwrap()).collect();
        assert_eq!(
            got,
            vec![Value::Int(50), Value::Int(10), Value::Int(30), Value::Int(30)]
        );
        g.assert_props().unwrap();
    }

    #[test]
    fn nil_oid_projects_nil() {
        let p = pool();
        let r = int_bat(&p, 0, &[1, 2, 3]);
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            g.append(&Value::Oid(1)).unwrap();
            g.append(&Value::nil(AtomType::Oid)).unwrap();
        }
        let bn = project(&p, &l.read(), &r.read()).unwrap();
        let g = bn.read();
        assert_eq!(g.value(0).unwrap(), Value::Int(2));
        assert!(g.value(1).unwrap().is_nil());
        assert!(g.nil);
        assert!(!g.nonil);
    }

    #[test]
    fn out_of_bounds_oid_fails() {
        let p = pool();
        let r = int_bat(&p, 0, &[1, 2, 3]);
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        l.write().append(&Value::Oid(9)).unwrap();
        assert!(matches!(
            project(&p, &l.read(), &r.read()),
            Err(Error::OidOutOfRange(9))
        ));
    }

    #[test]
    fn string_trick_shares_the_dictionary() {
        let p = pool();
        let r = p.new_bat(0, AtomType::Str, 0, Role::Transient).unwrap();
        {
            let mut g = r.write();
            for s in ["a", "b", "a", "c"] {
                g.append(&Value::Str(s.into())).unwrap();
            }
        }
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            for o in [3u64, 0, 2] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let bn = project(&p, &l.read(), &r.read()).unwrap();
        let g = bn.read();
        let rg = r.read();
        let got: Vec<Value> = (0..3).map(|i| g.value(i).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                Value::Str("c".into()),
                Value::Str("a".into()),
                Value::Str("a".into())
            ]
        );
        // the dictionary heap is the same allocation, held twice
        assert!(Arc::ptr_eq(
            g.tvheap.as_ref().unwrap(),
            rg.tvheap.as_ref().unwrap()
        ));
        assert_eq!(Arc::strong_count(rg.tvheap.as_ref().unwrap()), 2);
        assert_eq!(p.share_count(rg.cacheid).unwrap(), 1);
    }

    #[test]
    fn project2_concatenates_ranges() {
        let p = pool();
        let r1 = int_bat(&p, 0, &[10, 20]);
        let r2 = int_bat(&p, 2, &[30, 40]);
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            for o in [3u64, 1, 0, 2] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let bn = project2(&p, &l.read(), &r1.read(), Some(&r2.read())).unwrap();
        let g = bn.read();
        let got: Vec<Value> = (0..4).map(|i| g.value(i).unwrap()).collect();
        assert_eq!(
            got,
            vec![Value::Int(40), Value::Int(20), Value::Int(10), Value::Int(30)]
        );
    }

    #[test]
    fn project2_string_heaps_concatenate() {
        let p = pool();
        let r1 = p.new_bat(0, AtomType::Str, 0, Role::Transient).unwrap();
        {
            let mut g = r1.write();
            for s in ["x", "y"] {
                g.append(&Value::Str(s.into())).unwrap();
            }
        }
        let r2 = p.new_bat(2, AtomType::Str, 0, Role::Transient).unwrap();
        {
            let mut g = r2.write();
            for s in ["z", "w"] {
                g.append(&Value::Str(s.into())).unwrap();
            }
        }
        // disable r1's dictionary so the splice path is taken
        {
            let r1g = r1.read();
            let mut vh = r1g.tvheap.as_ref().unwrap().write();
            let grow = crate::strheap::STR_ELIM_LIMIT + 1024;
            vh.extend(grow).unwrap();
            let total = vh.size();
            vh.set_free(total);
        }
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            for o in [0u64, 2, 1, 3] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let bn = project2(&p, &l.read(), &r1.read(), Some(&r2.read())).unwrap();
        let g = bn.read();
        let got: Vec<Value> = (0..4).map(|i| g.value(i).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                Value::Str("x".into()),
                Value::Str("z".into()),
                Value::Str("y".into()),
                Value::Str("w".into())
            ]
        );
    }

    #[test]
    fn projection_identity() {
        let p = pool();
        let r = int_bat(&p, 0, &[7, 8, 9]);
        let l = p.dense_bat(0, 0, 3).unwrap();
        let bn = project(&p, &l.read(), &r.read()).unwrap();
        let g = bn.read();
        let rg = r.read();
        for i in 0..3 {
            assert_eq!(g.value(i).unwrap(), rg.value(i).unwrap());
        }
    }

    #[test]
    fn double_projection_associates() {
        let p = pool();
        let r = int_bat(&p, 0, &[100, 200, 300, 400]);
        let m = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = m.write();
            for o in [3u64, 0, 1] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            for o in [2u64, 0] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        // project(project(l, m), r)
        let lm = project(&p, &l.read(), &m.read()).unwrap();
        let left = project(&p, &lm.read(), &r.read()).unwrap();
        // project(l, project(m, r))
        let mr = project(&p, &m.read(), &r.read()).unwrap();
        let right = project(&p, &l.read(), &mr.read()).unwrap();
        let lg = left.read();
        let rg = right.read();
        assert_eq!(lg.count(), rg.count());
        for i in 0..lg.count() {
            assert_eq!(lg.value(i).unwrap(), rg.value(i).unwrap());
        }
    }

    #[test]
    fn chain_projection_single_pass() {
        let p = pool();
        let r = int_bat(&p, 0, &[100, 200, 300, 400]);
        let m = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = m.write();
            for o in [3u64, 0, 1] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let l = p.new_bat(0, AtomType::Oid, 0, Role::Transient).unwrap();
        {
            let mut g = l.write();
            for o in [2u64, 0] {
                g.append(&Value::Oid(o)).unwrap();
            }
        }
        let (lg, mg, rg) = (l.read(), m.read(), r.read());
        let bn = project_chain(&p, &[&lg, &mg, &rg]).unwrap();
        let g = bn.read();
        assert_eq!(g.count(), 2);
        assert_eq!(g.value(0).unwrap(), Value::Int(200));
        assert_eq!(g.value(1).unwrap(), Value::Int(400));
    }

    #[test]
    fn chain_degenerates_on_all_nil() {
        let p = pool();
        let r = int_bat(&p, 0, &[1, 2]);
        let mid = p.dense_bat(0, OID_NIL, 3).unwrap();
        let l = p.dense_bat(0, 0, 3).unwrap();
        let (lg, mg, rg) = (l.read(), mid.read(), r.read());
        let bn = project_chain(&p, &[&lg, &mg, &rg]).unwrap();
        let g = bn.read();
        assert_eq!(g.count(), 3);
        for i in 0..3 {
            assert!(g.value(i).unwrap().is_nil());
        }
    }
}
