//! BAT descriptors: a single typed column with an implicit OID head.
//!
//! A BAT owns a main heap (the "tail") and, for variable-width types, a
//! variable heap holding the dictionary-encoded values. The descriptor also
//! caches data properties (sortedness, uniqueness, nil presence) that query
//! operators rely on; mutations invalidate them conservatively and the debug
//! validator [`Bat::assert_props`] checks every cached flag against the data.

use std::sync::Arc;
use std::thread::ThreadId;

use log::debug;
use parking_lot::RwLock;

use crate::debug::{self, Cat};
use crate::hash::Hash;
use crate::heap::{Heap, SharedHeap};
use crate::strheap;
use crate::types::{AtomType, BatId, Bun, Oid, BUN_MAX, OID_NIL};
use crate::value::Value;
use crate::{Error, Result};

/// Which farm family a BAT belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Saved by commits, survives restarts.
    Persistent,
    /// Dropped at shutdown.
    Transient,
}

/// Access restriction of a BAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No modifications allowed.
    Read,
    /// Appends allowed, existing values immutable.
    Append,
    /// Appends and updates allowed.
    Write,
}

/// Smallest capacity handed out to growing BATs.
const BAT_TINY: Bun = 128;

/// A shared, lockable BAT handle as stored in the buffer pool.
pub type BatHandle = Arc<RwLock<Bat>>;

/// A single column with an implicit dense OID head starting at `hseqbase`.
#[derive(Debug)]
pub struct Bat {
    /// Buffer-pool identifier; also the stable physical name.
    pub(crate) cacheid: BatId,
    /// First OID of the head.
    pub(crate) hseqbase: Oid,
    pub(crate) role: Role,
    pub(crate) transient: bool,
    pub(crate) restricted: Access,
    pub(crate) creator: ThreadId,
    /// An image of this BAT exists on disk.
    pub(crate) copied_to_disk: bool,
    /// The on-disk image matches the heaps.
    pub(crate) dirty_flushed: bool,
    /// Descriptor fields changed since the last commit.
    pub(crate) dirty_desc: bool,
    /// First position not covered by the last BAT-level commit.
    pub(crate) inserted: Bun,
    pub(crate) count: Bun,
    pub(crate) capacity: Bun,

    // tail column
    pub(crate) ttype: AtomType,
    /// Bytes per slot; for varsized types the current offset width.
    pub(crate) width: usize,
    pub(crate) shift: u8,
    pub(crate) varsized: bool,
    /// Dense tail start; `OID_NIL` disables denseness.
    pub(crate) tseq: Oid,
    /// Offset into the heap in whole items (views of slices).
    pub(crate) baseoff: Bun,

    // property cache
    pub(crate) key: bool,
    /// The key property is an enforced constraint, not just an observation.
    pub(crate) key_pinned: bool,
    pub(crate) sorted: bool,
    pub(crate) revsorted: bool,
    pub(crate) nonil: bool,
    pub(crate) nil: bool,
    /// Two positions holding equal values when `key` is false.
    pub(crate) nokey: [Bun; 2],
    /// Position violating ascending order when `sorted` is false.
    pub(crate) nosorted: Bun,
    /// Position violating descending order when `revsorted` is false.
    pub(crate) norevsorted: Bun,

    pub(crate) theap: SharedHeap,
    pub(crate) tvheap: Option<SharedHeap>,
    pub(crate) hash: RwLock<Option<Hash>>,
}

/// Bytes needed in the main heap for `count` slots.
pub(crate) fn tail_bytes(ttype: AtomType, width: usize, count: Bun) -> usize {
    match ttype {
        AtomType::Void => 0,
        AtomType::Msk => (count + 31) / 32 * 4,
        _ => count * width,
    }
}

/// Reads mask bit `p`.
pub(crate) fn msk_get(base: &[u8], p: Bun) -> bool {
    base[p / 8] & (1 << (p % 8)) != 0
}

/// Writes mask bit `p`.
pub(crate) fn msk_set(base: &mut [u8], p: Bun, v: bool) {
    if v {
        base[p / 8] |= 1 << (p % 8);
    } else {
        base[p / 8] &= !(1 << (p % 8));
    }
}

impl Bat {
    /// Creates a fresh BAT of the given tail type with room for `capacity`
    /// values. The caller (normally the buffer pool) supplies the identity
    /// and the physical base name used for heap files.
    pub fn new(
        cacheid: BatId,
        hseq: Oid,
        ttype: AtomType,
        capacity: Bun,
        role: Role,
        farmid: u32,
        physical: &str,
    ) -> Result<Bat> {
        let width = ttype.width().max(if ttype.varsized() { 1 } else { 0 });
        let mut theap = Heap::new(farmid, cacheid, format!("{}.tail", physical));
        let capacity = capacity.max(if ttype == AtomType::Void { 0 } else { BAT_TINY });
        let bytes = tail_bytes(ttype, width, capacity);
        if bytes > 0 {
            theap.extend(bytes)?;
        }
        let tvheap = if ttype.varsized() {
            let mut vh = Heap::new(farmid, cacheid, format!("{}.theap", physical));
            strheap::str_heap_init(&mut vh)?;
            Some(vh.into_shared())
        } else {
            None
        };
        if debug::enabled(Cat::Bat) {
            debug!("COLnew: bat[{}] type {} capacity {}", cacheid, ttype, capacity);
        }
        Ok(Bat {
            cacheid,
            hseqbase: hseq,
            role,
            transient: role == Role::Transient,
            restricted: Access::Write,
            creator: std::thread::current().id(),
            copied_to_disk: false,
            dirty_flushed: false,
            dirty_desc: true,
            inserted: 0,
            count: 0,
            capacity,
            ttype,
            width,
            shift: ttype.shift(),
            varsized: ttype.varsized(),
            tseq: if ttype == AtomType::Void { 0 } else { OID_NIL },
            baseoff: 0,
            key: true,
            key_pinned: false,
            sorted: true,
            revsorted: true,
            nonil: false,
            nil: false,
            nokey: [0, 0],
            nosorted: 0,
            norevsorted: 0,
            theap: theap.into_shared(),
            tvheap,
            hash: RwLock::new(None),
        })
    }

    /// Creates a zero-storage void BAT whose tail is the dense sequence
    /// `[tseq, tseq + cnt)`.
    pub fn dense(cacheid: BatId, hseq: Oid, tseq: Oid, cnt: Bun, farmid: u32, physical: &str) -> Result<Bat> {
        let mut b = Bat::new(cacheid, hseq, AtomType::Void, 0, Role::Transient, farmid, physical)?;
        b.tseq = tseq;
        b.count = cnt;
        b.capacity = cnt;
        b.inserted = 0;
        b.key = tseq != OID_NIL || cnt <= 1;
        b.sorted = true;
        b.revsorted = tseq == OID_NIL || cnt <= 1;
        b.nonil = tseq != OID_NIL;
        b.nil = tseq == OID_NIL && cnt > 0;
        Ok(b)
    }

    /// Number of values.
    pub fn count(&self) -> Bun {
        self.count
    }

    /// Current capacity in values.
    pub fn capacity(&self) -> Bun {
        self.capacity
    }

    /// First OID of the head.
    pub fn hseqbase(&self) -> Oid {
        self.hseqbase
    }

    /// Tail type.
    pub fn ttype(&self) -> AtomType {
        self.ttype
    }

    /// Dense tail start, `OID_NIL` when the tail is not dense.
    pub fn tseqbase(&self) -> Oid {
        self.tseq
    }

    /// True for a void tail with a concrete sequence start and no exception
    /// list: the values are exactly `tseq, tseq+1, ...`.
    pub fn is_dense(&self) -> bool {
        self.ttype == AtomType::Void && self.tseq != OID_NIL && self.tvheap.is_none()
    }

    /// The buffer-pool identifier.
    pub fn id(&self) -> BatId {
        self.cacheid
    }

    /// The farm family the BAT belongs to.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The thread that created this BAT.
    pub fn creator(&self) -> ThreadId {
        self.creator
    }

    /// First position not covered by the last BAT-level commit.
    pub fn inserted(&self) -> Bun {
        self.inserted
    }

    /// Bytes per slot (the current offset width for varsized tails).
    pub fn width(&self) -> usize {
        self.width
    }

    /// Cached ascending-order property.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Cached descending-order property.
    pub fn is_revsorted(&self) -> bool {
        self.revsorted
    }

    /// Cached uniqueness property.
    pub fn is_key(&self) -> bool {
        self.key
    }

    /// Cached contains-a-nil property.
    pub fn has_nil(&self) -> bool {
        self.nil
    }

    /// Cached nil-free property.
    pub fn is_nonil(&self) -> bool {
        self.nonil
    }

    /// The variable heap, for varsized tails.
    pub fn vheap(&self) -> Option<&SharedHeap> {
        self.tvheap.as_ref()
    }

    /// The main heap.
    pub fn heap(&self) -> &SharedHeap {
        &self.theap
    }

    /// True when this BAT aliases another BAT's heap.
    pub fn is_view(&self) -> bool {
        self.theap.read().parentid != self.cacheid
            || self
                .tvheap
                .as_ref()
                .map_or(false, |vh| vh.read().parentid != self.cacheid)
    }

    /// The access restriction.
    pub fn access(&self) -> Access {
        self.restricted
    }

    /// Changes the access restriction. Views are permanently read-only.
    pub fn set_access(&mut self, mode: Access) -> Result<()> {
        if mode != Access::Read && self.is_view() {
            return Err(Error::ReadOnly);
        }
        self.restricted = mode;
        self.dirty_desc = true;
        Ok(())
    }

    /// Marks the BAT persistent or transient. Views and pointer BATs cannot
    /// be persistent.
    pub fn set_transient(&mut self, transient: bool) -> Result<()> {
        if !transient && (self.is_view() || self.ttype == AtomType::Ptr) {
            return Err(Error::ReadOnly);
        }
        self.transient = transient;
        self.role = if transient { Role::Transient } else { Role::Persistent };
        self.dirty_desc = true;
        Ok(())
    }

    /// Capacity to grow to when full.
    pub(crate) fn grows(&self) -> Bun {
        let cap = self.capacity.max(BAT_TINY);
        if cap < (1 << 20) {
            (cap * 2).min(BUN_MAX)
        } else {
            (cap + cap / 2).min(BUN_MAX)
        }
    }

    /// Grows the heaps to hold at least `newcap` values. Capacity never
    /// shrinks.
    pub fn extend(&mut self, newcap: Bun) -> Result<()> {
        if newcap <= self.capacity {
            return Ok(());
        }
        if newcap > BUN_MAX {
            return Err(Error::Full(BUN_MAX));
        }
        let bytes = tail_bytes(self.ttype, self.width, newcap);
        if bytes > 0 {
            self.theap.write().extend(bytes)?;
        }
        self.capacity = newcap;
        Ok(())
    }

    /// Byte offset of slot `p` in the main heap. Widths are powers of two,
    /// so this is a shift.
    #[inline]
    pub(crate) fn tail_off(&self, p: Bun) -> usize {
        (self.baseoff + p) << self.shift
    }

    /// Reads the value at position `p`.
    pub fn value(&self, p: Bun) -> Result<Value> {
        if p >= self.count {
            return Err(Error::PositionOutOfRange(p));
        }
        match self.ttype {
            AtomType::Void => {
                if self.tseq == OID_NIL {
                    Ok(Value::Oid(OID_NIL))
                } else if let Some(vh) = &self.tvheap {
                    // dense with exceptions
                    let vh = vh.read();
                    Ok(Value::Oid(void_oid_at(&vh, self.tseq, p)))
                } else {
                    Ok(Value::Oid(self.tseq + p as Oid))
                }
            }
            AtomType::Msk => {
                let h = self.theap.read();
                Ok(Value::Msk(msk_get(h.all_bytes(), self.baseoff + p)))
            }
            AtomType::Str => {
                let h = self.theap.read();
                let off = strheap::var_get(
                    &h.all_bytes()[self.baseoff * self.width..],
                    self.width,
                    p,
                );
                let vh = self.tvheap.as_ref().unwrap().read();
                Ok(Value::Str(strheap::str_get(&vh, off as usize).to_string()))
            }
            t => {
                let h = self.theap.read();
                let off = self.tail_off(p);
                Ok(Value::from_fixed_bytes(t, &h.all_bytes()[off..off + self.width]))
            }
        }
    }

    fn check_update_access(&self, force: bool, append: bool) -> Result<()> {
        if self.theap.read().parentid != self.cacheid {
            // views are never updatable, not even with force
            return Err(Error::ReadOnly);
        }
        if force {
            return Ok(());
        }
        match self.restricted {
            Access::Write => Ok(()),
            Access::Append if append => Ok(()),
            _ => Err(Error::ReadOnly),
        }
    }

    fn check_type(&self, v: &Value) -> Result<()> {
        if v.tpe() != self.ttype {
            return Err(Error::TypeMismatch {
                expected: self.ttype.name(),
                actual: v.tpe().name(),
            });
        }
        Ok(())
    }

    /// Appends a single value.
    pub fn append(&mut self, v: &Value) -> Result<()> {
        self.append_force(v, false)
    }

    /// Appends a single value, optionally bypassing the access restriction.
    pub fn append_force(&mut self, v: &Value, force: bool) -> Result<()> {
        self.check_update_access(force, true)?;
        if self.ttype == AtomType::Void {
            // a void tail has no storage; only the next sequence value or a
            // count bump on an all-nil void is representable
            match v {
                Value::Oid(o) | Value::Void(o) => {
                    if self.tseq == OID_NIL {
                        if *o != OID_NIL {
                            return Err(Error::TypeMismatch {
                                expected: "void/nil",
                                actual: "oid",
                            });
                        }
                    } else if *o != self.tseq + self.count as Oid {
                        return Err(Error::TypeMismatch {
                            expected: "next dense oid",
                            actual: "oid",
                        });
                    }
                    self.count += 1;
                    self.capacity = self.capacity.max(self.count);
                    self.dirty_desc = true;
                    return Ok(());
                }
                _ => return Err(self.check_type(v).unwrap_err()),
            }
        }
        self.check_type(v)?;
        if self.key && self.count > 0 && !v.is_nil() {
            // cheap uniqueness maintenance: a hash probe when there is one,
            // otherwise the order properties bound where a duplicate could
            // sit; a pinned key falls back to a full scan
            use std::cmp::Ordering::*;
            let dup = {
                let hs = self.hash.read();
                if let Some(h) = hs.as_ref() {
                    crate::hash::hash_find(self, h, v)?
                } else {
                    let last = self.value(self.count - 1)?;
                    match last.cmp_nilaware(v) {
                        Some(Equal) => Some(self.count - 1),
                        Some(Less) if self.sorted => None,
                        Some(Greater) if self.revsorted => None,
                        _ => {
                            if self.key_pinned {
                                self.find_pos(v)?
                            } else {
                                // cannot check cheaply, give the property up
                                self.key = false;
                                self.nokey = [0, 0];
                                None
                            }
                        }
                    }
                }
            };
            if let Some(p0) = dup {
                if self.key_pinned {
                    return Err(Error::KeyViolation);
                }
                self.key = false;
                self.nokey = [p0, self.count];
            }
        }
        if self.count >= self.capacity {
            if self.count >= BUN_MAX {
                return Err(Error::Full(BUN_MAX));
            }
            let g = self.grows();
            self.extend(g)?;
        }
        let p = self.count;
        let prev = if p > 0 { Some(self.value(p - 1)?) } else { None };
        self.put_value(p, v)?;
        self.count = p + 1;
        {
            let mut h = self.theap.write();
            let f = tail_bytes(self.ttype, self.width, self.baseoff + self.count);
            h.set_free(f);
        }
        self.update_props_on_append(v, prev.as_ref());
        let mut hs = self.hash.write();
        if let Some(h) = hs.as_mut() {
            if !h.insert(v, p) {
                *hs = None;
            }
        }
        self.dirty_desc = true;
        Ok(())
    }

    /// Appends a sequence of values.
    pub fn append_multi(&mut self, vs: &[Value]) -> Result<()> {
        for v in vs {
            self.append(v)?;
        }
        Ok(())
    }

    /// Appends every value of another BAT.
    pub fn append_bat(&mut self, other: &Bat, force: bool) -> Result<()> {
        for p in 0..other.count() {
            self.append_force(&other.value(p)?, force)?;
        }
        Ok(())
    }

    /// Writes `v` into slot `p` without touching count or properties.
    fn put_value(&mut self, p: Bun, v: &Value) -> Result<()> {
        match self.ttype {
            AtomType::Msk => {
                let bit = matches!(v, Value::Msk(true));
                let mut h = self.theap.write();
                let need = tail_bytes(AtomType::Msk, 0, self.baseoff + p + 1);
                if need > h.size() {
                    h.extend(need)?;
                }
                msk_set(h.all_bytes_mut(), self.baseoff + p, bit);
                Ok(())
            }
            AtomType::Str => {
                let s = match v {
                    Value::Str(s) => s.as_str(),
                    _ => unreachable!(),
                };
                let off = {
                    let mut vh = self.tvheap.as_mut().unwrap().write();
                    strheap::str_intern(&mut vh, s)?
                };
                if !strheap::var_fits(off, self.width) {
                    let new_w = strheap::var_width_for(off);
                    let mut h = self.theap.write();
                    strheap::widen_offsets(&mut h, self.baseoff + self.count, self.width, new_w)?;
                    drop(h);
                    self.width = new_w;
                    self.shift = new_w.trailing_zeros() as u8;
                    self.capacity = self.capacity.max(self.count);
                    // re-derive capacity from the grown heap
                    let hsize = self.theap.read().size();
                    self.capacity = hsize / new_w - self.baseoff;
                }
                let mut h = self.theap.write();
                let need = (self.baseoff + p + 1) * self.width;
                if need > h.size() {
                    h.extend(need)?;
                }
                let base = self.baseoff * self.width;
                strheap::var_put(&mut h.all_bytes_mut()[base..], self.width, p, off);
                h.dirty = true;
                Ok(())
            }
            _ => {
                let (bytes, n) = v.fixed_bytes().expect("fixed type");
                let off = self.tail_off(p);
                let mut h = self.theap.write();
                h.all_bytes_mut()[off..off + n].copy_from_slice(&bytes[..n]);
                h.dirty = true;
                Ok(())
            }
        }
    }

    fn update_props_on_append(&mut self, v: &Value, prev: Option<&Value>) {
        let p = self.count - 1;
        if v.is_nil() {
            self.nil = true;
            self.nonil = false;
        } else if self.count == 1 {
            self.nonil = true;
        }
        match prev {
            None => {
                self.sorted = true;
                self.revsorted = true;
                self.key = self.key || self.count == 1;
            }
            Some(prev) => {
                if let Some(ord) = prev.cmp_nilaware(v) {
                    use std::cmp::Ordering::*;
                    match ord {
                        Less => {
                            if self.revsorted {
                                self.revsorted = false;
                                self.norevsorted = p;
                            }
                        }
                        Greater => {
                            if self.sorted {
                                self.sorted = false;
                                self.nosorted = p;
                            }
                        }
                        Equal => {
                            if self.key {
                                self.key = false;
                                self.nokey = [p - 1, p];
                            }
                        }
                    }
                }
            }
        }
    }

    /// Position of the first occurrence of `v`, by scan.
    fn find_pos(&self, v: &Value) -> Result<Option<Bun>> {
        for p in 0..self.count {
            if self.value(p)?.cmp_nilaware(v) == Some(std::cmp::Ordering::Equal) {
                return Ok(Some(p));
            }
        }
        Ok(None)
    }

    /// Declares (and verifies) the key constraint, or withdraws it.
    pub fn set_key(&mut self, on: bool) -> Result<()> {
        if on {
            if !self.key {
                // verify against the data before accepting the constraint
                use std::cmp::Ordering::Equal;
                let mut vals: Vec<Value> = (0..self.count)
                    .map(|p| self.value(p))
                    .collect::<Result<_>>()?;
                vals.sort_by(|a, b| a.cmp_nilaware(b).unwrap_or(Equal));
                for w in vals.windows(2) {
                    if !w[0].is_nil() && w[0].cmp_nilaware(&w[1]) == Some(Equal) {
                        return Err(Error::KeyViolation);
                    }
                }
                self.key = true;
            }
            self.key_pinned = true;
        } else {
            self.key_pinned = false;
            self.key = self.count <= 1;
        }
        self.dirty_desc = true;
        Ok(())
    }

    /// Overwrites the value at OID `o`.
    pub fn replace(&mut self, o: Oid, v: &Value, force: bool) -> Result<()> {
        self.check_update_access(force, false)?;
        if o < self.hseqbase {
            return Err(Error::OidOutOfRange(o));
        }
        let p = (o - self.hseqbase) as Bun;
        if p >= self.count {
            return Err(Error::OidOutOfRange(o));
        }
        if self.ttype == AtomType::Void {
            return Err(Error::ReadOnly);
        }
        self.check_type(v)?;
        self.put_value(p, v)?;
        // conservative: order and uniqueness knowledge is lost, nil may have
        // appeared, nil-freedom may be gone
        self.invalidate_props_on_update(v);
        *self.hash.write() = None;
        self.dirty_desc = true;
        Ok(())
    }

    fn invalidate_props_on_update(&mut self, v: &Value) {
        if self.count > 1 {
            // flags drop without a witness: position 0 means "unknown"
            self.sorted = false;
            self.nosorted = 0;
            self.revsorted = false;
            self.norevsorted = 0;
            self.key = false;
            self.nokey = [0, 0];
        }
        if v.is_nil() {
            self.nil = true;
            self.nonil = false;
        } else {
            self.nil = false; // unknown now
        }
        self.triv_props();
    }

    /// Deletes the value at OID `o`. The model has no holes: deleting the
    /// last BUN shrinks the BAT, deleting any other moves the last BUN into
    /// the vacated slot (losing order properties).
    pub fn delete(&mut self, o: Oid) -> Result<()> {
        self.check_update_access(false, false)?;
        if o < self.hseqbase {
            return Err(Error::OidOutOfRange(o));
        }
        let p = (o - self.hseqbase) as Bun;
        if p >= self.count {
            return Err(Error::OidOutOfRange(o));
        }
        if self.ttype == AtomType::Void {
            // only the last element of a dense sequence can go
            if p != self.count - 1 {
                return Err(Error::ReadOnly);
            }
            self.count -= 1;
            self.dirty_desc = true;
            return Ok(());
        }
        if p != self.count - 1 {
            let last = self.value(self.count - 1)?;
            self.put_value(p, &last)?;
            if self.count > 2 {
                self.sorted = false;
                self.nosorted = 0;
                self.revsorted = false;
                self.norevsorted = 0;
            }
        }
        self.count -= 1;
        self.inserted = self.inserted.min(self.count);
        {
            let mut h = self.theap.write();
            let f = tail_bytes(self.ttype, self.width, self.baseoff + self.count);
            h.set_free(f);
        }
        self.nil = false; // unknown
        *self.hash.write() = None;
        self.triv_props();
        self.dirty_desc = true;
        Ok(())
    }

    /// Resets the BAT to empty, restoring the initial property state.
    pub fn clear(&mut self) -> Result<()> {
        self.check_update_access(false, false)?;
        self.count = 0;
        self.inserted = 0;
        {
            let mut h = self.theap.write();
            let f = tail_bytes(self.ttype, self.width, self.baseoff);
            h.set_free(f);
        }
        if let Some(vh) = &self.tvheap {
            let mut vh = vh.write();
            if vh.parentid == self.cacheid {
                strheap::str_heap_init(&mut vh)?;
            }
        }
        self.width = self.ttype.width().max(if self.varsized { 1 } else { 0 });
        self.shift = self.ttype.shift();
        self.key = true;
        self.sorted = true;
        self.revsorted = true;
        self.nonil = false;
        self.nil = false;
        *self.hash.write() = None;
        self.dirty_desc = true;
        Ok(())
    }

    /// Creates a zero-copy read-only view of positions `[lo, hi)`. The view
    /// shares this BAT's heaps by reference count; `newid` is its identity in
    /// the buffer pool.
    pub fn slice_view(&self, newid: BatId, lo: Bun, hi: Bun) -> Result<Bat> {
        if lo > hi || hi > self.count {
            return Err(Error::PositionOutOfRange(hi));
        }
        let cnt = hi - lo;
        let b = Bat {
            cacheid: newid,
            hseqbase: self.hseqbase + lo as Oid,
            role: Role::Transient,
            transient: true,
            restricted: Access::Read,
            creator: std::thread::current().id(),
            copied_to_disk: false,
            dirty_flushed: false,
            dirty_desc: false,
            inserted: cnt,
            count: cnt,
            capacity: cnt,
            ttype: self.ttype,
            width: self.width,
            shift: self.shift,
            varsized: self.varsized,
            tseq: if self.ttype == AtomType::Void && self.tseq != OID_NIL {
                self.tseq + lo as Oid
            } else {
                self.tseq
            },
            baseoff: self.baseoff + lo,
            key: self.key,
            key_pinned: false,
            sorted: self.sorted,
            revsorted: self.revsorted,
            nonil: self.nonil,
            nil: if cnt == self.count { self.nil } else { false },
            nokey: [0, 0],
            nosorted: 0,
            norevsorted: 0,
            theap: Arc::clone(&self.theap),
            tvheap: self.tvheap.as_ref().map(Arc::clone),
            hash: RwLock::new(None),
        };
        Ok(b)
    }

    /// Materializes a copy with its own heaps (no view indirection).
    pub fn copy(&self, newid: BatId, role: Role, farmid: u32, physical: &str) -> Result<Bat> {
        if self.ttype == AtomType::Void {
            let mut c = Bat::dense(newid, self.hseqbase, self.tseq, self.count, farmid, physical)?;
            if self.tvheap.is_some() {
                // materialize the exception list as real oids
                c = Bat::new(newid, self.hseqbase, AtomType::Oid, self.count, role, farmid, physical)?;
                for p in 0..self.count {
                    c.append(&self.value(p)?)?;
                }
            }
            return Ok(c);
        }
        let mut c = Bat::new(newid, self.hseqbase, self.ttype, self.count, role, farmid, physical)?;
        for p in 0..self.count {
            c.append(&self.value(p)?)?;
        }
        c.key = self.key;
        c.sorted = self.sorted;
        c.revsorted = self.revsorted;
        c.nonil = self.nonil;
        c.nil = self.nil;
        Ok(c)
    }

    /// Directly sets the count after bulk-filling the heap (projection inner
    /// loops). The heap's logical end is synchronized.
    pub(crate) fn set_count_raw(&mut self, n: Bun) {
        self.count = n;
        self.capacity = self.capacity.max(n);
        let f = tail_bytes(self.ttype, self.width, self.baseoff + n);
        let mut h = self.theap.write();
        if f <= h.size() {
            h.set_free(f);
        }
    }

    /// Fills in properties that can be deduced cheaply.
    pub fn triv_props(&mut self) {
        if self.count == 0 {
            self.key = true;
            self.sorted = true;
            self.revsorted = true;
            self.nil = false;
        } else if self.count == 1 {
            self.key = true;
            self.sorted = true;
            self.revsorted = true;
        }
        if self.is_dense() {
            self.key = true;
            self.sorted = true;
            self.revsorted = self.count <= 1;
            self.nonil = true;
            self.nil = false;
        }
    }

    /// Validates every cached property flag against the actual data. Used by
    /// tests and debug builds; must never disagree with the data.
    pub fn assert_props(&self) -> Result<()> {
        use std::cmp::Ordering::*;
        let fail = |msg: String| Err(Error::corrupt(format!("bat[{}]", self.cacheid), msg));
        if self.inserted > self.count {
            return fail(format!("inserted {} > count {}", self.inserted, self.count));
        }
        if self.count > self.capacity {
            return fail(format!("count {} > capacity {}", self.count, self.capacity));
        }
        if self.ttype != AtomType::Void {
            let h = self.theap.read();
            let expect = tail_bytes(self.ttype, self.width, self.baseoff + self.count);
            if h.free() != expect {
                return fail(format!("heap free {} != {}", h.free(), expect));
            }
        }
        if self.is_dense() {
            for i in 0..self.count {
                if self.value(i)? != Value::Oid(self.tseq + i as Oid) {
                    return fail(format!("dense value at {} broken", i));
                }
            }
        }
        let mut any_nil = false;
        let mut prev: Option<Value> = None;
        for i in 0..self.count {
            let v = self.value(i)?;
            any_nil |= v.is_nil();
            if let Some(p) = &prev {
                match p.cmp_nilaware(&v) {
                    Some(Greater) if self.sorted => {
                        return fail(format!("sorted but order broken at {}", i))
                    }
                    Some(Less) if self.revsorted => {
                        return fail(format!("revsorted but order broken at {}", i))
                    }
                    _ => {}
                }
            }
            prev = Some(v);
        }
        if self.nonil && any_nil {
            return fail("nonil but nil present".to_string());
        }
        if self.nil && !any_nil {
            return fail("nil flag set but no nil present".to_string());
        }
        if self.key {
            let mut vals: Vec<(Value, Bun)> = (0..self.count)
                .map(|i| self.value(i).map(|v| (v, i)))
                .collect::<Result<_>>()?;
            vals.sort_by(|a, b| a.0.cmp_nilaware(&b.0).unwrap_or(Equal));
            for w in vals.windows(2) {
                if !w[0].0.is_nil() && w[0].0.cmp_nilaware(&w[1].0) == Some(Equal) {
                    return fail(format!(
                        "key but positions {} and {} are equal",
                        w[0].1, w[1].1
                    ));
                }
            }
        }
        if !self.sorted && self.count > 1 && self.nosorted > 0 && self.nosorted < self.count {
            let a = self.value(self.nosorted - 1)?;
            let b = self.value(self.nosorted)?;
            if a.cmp_nilaware(&b) != Some(Greater) {
                return fail(format!("nosorted witness {} does not prove", self.nosorted));
            }
        }
        if !self.revsorted
            && self.count > 1
            && self.norevsorted > 0
            && self.norevsorted < self.count
        {
            let a = self.value(self.norevsorted - 1)?;
            let b = self.value(self.norevsorted)?;
            if a.cmp_nilaware(&b) != Some(Less) {
                return fail(format!(
                    "norevsorted witness {} does not prove",
                    self.norevsorted
                ));
            }
        }
        Ok(())
    }

    /// Drops the hash index, if any.
    pub fn drop_hash(&self) {
        *self.hash.write() = None;
    }

    /// Marks all current content as flushed: the BAT-level commit.
    pub fn commit_delta(&mut self) {
        if debug::enabled(Cat::Delta) {
            debug!("BATcommit: bat[{}] inserted {} -> {}", self.cacheid, self.inserted, self.count);
        }
        self.inserted = self.count;
        self.dirty_desc = false;
    }

    /// Undoes appends since the last BAT-level commit.
    pub fn abort_delta(&mut self) {
        if debug::enabled(Cat::Delta) {
            debug!("BATabort: bat[{}] count {} -> {}", self.cacheid, self.count, self.inserted);
        }
        self.count = self.inserted;
        let f = tail_bytes(self.ttype, self.width, self.baseoff + self.count);
        let mut h = self.theap.write();
        if f <= h.size() {
            h.set_free(f);
        }
        drop(h);
        *self.hash.write() = None;
        self.nil = false;
        self.triv_props();
    }
}

/// Position-to-OID computation for a dense tail with an exception list: the
/// OID at position `p` is `tseq + p + k` where `k` counts the exceptions
/// skipped up to that point (binary search over the sorted list).
pub(crate) fn void_oid_at(vheap: &Heap, tseq: Oid, p: Bun) -> Oid {
    let bytes = vheap.base();
    let nexc = bytes.len() / 8;
    let exc = |i: usize| -> Oid {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        u64::from_le_bytes(b)
    };
    let (mut lo, mut hi) = (0usize, nexc);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if exc(mid) <= tseq + (p + mid) as Oid {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    tseq + (p + lo) as Oid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_bat(vals: &[i32]) -> Bat {
        let mut b = Bat::new(1, 0, AtomType::Int, 0, Role::Transient, 0, "00/01/1").unwrap();
        for &v in vals {
            b.append(&Value::Int(v)).unwrap();
        }
        b
    }

    #[test]
    fn append_and_read_ints() {
        let b = int_bat(&[10, 20, 30, 40, 50]);
        assert_eq!(b.count(), 5);
        assert_eq!(b.value(2).unwrap(), Value::Int(30));
        assert!(b.sorted);
        assert!(!b.revsorted);
        assert!(b.key);
        assert!(b.nonil);
        b.assert_props().unwrap();
    }

    #[test]
    fn append_tracks_order_properties() {
        let b = int_bat(&[3, 1, 2]);
        assert!(!b.sorted);
        assert_eq!(b.nosorted, 1);
        assert!(!b.revsorted);
        b.assert_props().unwrap();

        let b = int_bat(&[5, 5]);
        assert!(!b.key);
        assert_eq!(b.nokey, [0, 1]);
        b.assert_props().unwrap();
    }

    #[test]
    fn nil_tracking() {
        let mut b = int_bat(&[1]);
        assert!(b.nonil && !b.nil);
        b.append(&Value::nil(AtomType::Int)).unwrap();
        assert!(b.nil && !b.nonil);
        b.assert_props().unwrap();
    }

    #[test]
    fn append_wrong_type_fails() {
        let mut b = int_bat(&[]);
        assert!(matches!(
            b.append(&Value::Lng(1)),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn read_only_rejects_appends() {
        let mut b = int_bat(&[1]);
        b.set_access(Access::Read).unwrap();
        assert!(matches!(b.append(&Value::Int(2)), Err(Error::ReadOnly)));
        // force bypasses the restriction
        b.append_force(&Value::Int(2), true).unwrap();
        assert_eq!(b.count(), 2);
    }

    #[test]
    fn key_property_degrades_without_constraint() {
        let mut b = int_bat(&[1, 2, 3]);
        assert!(b.key);
        // duplicate of a non-adjacent value: the property is given up, the
        // append goes through
        b.append(&Value::Int(2)).unwrap();
        assert!(!b.key);
        b.assert_props().unwrap();
    }

    #[test]
    fn key_constraint_rejects_duplicates() {
        let mut b = int_bat(&[1, 2, 3]);
        b.set_key(true).unwrap();
        assert!(matches!(b.append(&Value::Int(2)), Err(Error::KeyViolation)));
        assert_eq!(b.count(), 3);
        // nil values are exempt
        b.append(&Value::nil(AtomType::Int)).unwrap();
        b.append(&Value::nil(AtomType::Int)).unwrap();
        // declaring the constraint over duplicate data is refused
        let mut c = int_bat(&[5, 5]);
        assert!(matches!(c.set_key(true), Err(Error::KeyViolation)));
    }

    #[test]
    fn replace_and_delete() {
        let mut b = int_bat(&[10, 20, 30, 40]);
        b.replace(1, &Value::Int(99), false).unwrap();
        assert_eq!(b.value(1).unwrap(), Value::Int(99));
        b.assert_props().unwrap();

        // deleting a middle BUN moves the last one into its place
        b.delete(0).unwrap();
        assert_eq!(b.count(), 3);
        assert_eq!(b.value(0).unwrap(), Value::Int(40));
        b.assert_props().unwrap();

        // deleting the last BUN just shrinks
        b.delete(b.hseqbase + 2).unwrap();
        assert_eq!(b.count(), 2);
        b.assert_props().unwrap();
    }

    #[test]
    fn clear_resets() {
        let mut b = int_bat(&[1, 2, 3]);
        b.clear().unwrap();
        assert_eq!(b.count(), 0);
        assert!(b.sorted && b.revsorted && b.key);
        assert!(!b.nil && !b.nonil);
        b.assert_props().unwrap();
    }

    #[test]
    fn dense_bat_values() {
        let b = Bat::dense(1, 0, 2, 3, 0, "00/01/1").unwrap();
        assert!(b.is_dense());
        assert_eq!(b.value(0).unwrap(), Value::Oid(2));
        assert_eq!(b.value(2).unwrap(), Value::Oid(4));
        b.assert_props().unwrap();
    }

    #[test]
    fn string_bat_dedups_and_widens() {
        let mut b = Bat::new(1, 0, AtomType::Str, 0, Role::Transient, 0, "00/01/1").unwrap();
        b.append(&Value::Str("a".into())).unwrap();
        b.append(&Value::Str("b".into())).unwrap();
        b.append(&Value::Str("a".into())).unwrap();
        assert_eq!(b.width, 1);
        {
            let h = b.theap.read();
            let base = h.base();
            assert_eq!(
                strheap::var_get(base, 1, 0),
                strheap::var_get(base, 1, 2),
                "equal strings share an offset"
            );
        }
        assert_eq!(b.value(2).unwrap(), Value::Str("a".into()));
        assert!(!b.key);
        b.assert_props().unwrap();
    }

    #[test]
    fn offset_width_upgrade_across_byte_boundary() {
        let mut b = Bat::new(1, 0, AtomType::Str, 0, Role::Transient, 0, "00/01/1").unwrap();
        // unique strings until the vheap offsets outgrow one byte
        let mut i = 0;
        while b.width == 1 {
            b.append(&Value::Str(format!("padding string {}", i))).unwrap();
            i += 1;
        }
        assert_eq!(b.width, 2);
        // all earlier strings still read back exactly
        for p in 0..b.count() {
            assert_eq!(
                b.value(p).unwrap(),
                Value::Str(format!("padding string {}", p))
            );
        }
        b.assert_props().unwrap();
    }

    #[test]
    fn slice_views_share_heaps() {
        let b = int_bat(&[10, 20, 30, 40, 50]);
        let v = b.slice_view(2, 1, 4).unwrap();
        assert!(v.is_view());
        assert_eq!(v.count(), 3);
        assert_eq!(v.hseqbase(), 1);
        assert_eq!(v.value(0).unwrap(), Value::Int(20));
        assert_eq!(v.value(2).unwrap(), Value::Int(40));
        // the parent heap is shared, refcount reflects both holders
        assert_eq!(Arc::strong_count(&b.theap), 2);
        v.assert_props().unwrap();
    }

    #[test]
    fn views_are_read_only() {
        let b = int_bat(&[1, 2, 3]);
        let mut v = b.slice_view(2, 0, 2).unwrap();
        assert!(matches!(v.append(&Value::Int(9)), Err(Error::ReadOnly)));
        assert!(matches!(
            v.append_force(&Value::Int(9), true),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(v.set_access(Access::Write), Err(Error::ReadOnly)));
    }

    #[test]
    fn void_with_exceptions() {
        // dense range from 10, skipping 11 and 13
        let mut vh = Heap::new(0, 1, "x.theap".to_string());
        vh.extend(16).unwrap();
        vh.all_bytes_mut()[..8].copy_from_slice(&11u64.to_le_bytes());
        vh.all_bytes_mut()[8..16].copy_from_slice(&13u64.to_le_bytes());
        vh.set_free(16);
        assert_eq!(void_oid_at(&vh, 10, 0), 10);
        assert_eq!(void_oid_at(&vh, 10, 1), 12);
        assert_eq!(void_oid_at(&vh, 10, 2), 14);
        assert_eq!(void_oid_at(&vh, 10, 3), 15);
    }

    #[test]
    fn delta_commit_and_abort() {
        let mut b = int_bat(&[1, 2, 3]);
        b.commit_delta();
        assert_eq!(b.inserted, 3);
        b.append(&Value::Int(4)).unwrap();
        b.append(&Value::Int(5)).unwrap();
        b.abort_delta();
        assert_eq!(b.count(), 3);
        assert_eq!(b.value(2).unwrap(), Value::Int(3));
        b.assert_props().unwrap();
    }

    #[test]
    fn capacity_is_bounded() {
        let mut b = int_bat(&[1]);
        assert!(matches!(b.extend(BUN_MAX + 1), Err(Error::Full(_))));
        // growth requests inside the bound are clamped, not rejected
        b.extend(1024).unwrap();
        assert!(b.capacity() >= 1024);
    }

    #[test]
    fn msk_bat() {
        let mut b = Bat::new(1, 0, AtomType::Msk, 0, Role::Transient, 0, "00/01/1").unwrap();
        for i in 0..40 {
            b.append(&Value::Msk(i % 3 == 0)).unwrap();
        }
        assert_eq!(b.count(), 40);
        assert_eq!(b.value(0).unwrap(), Value::Msk(true));
        assert_eq!(b.value(1).unwrap(), Value::Msk(false));
        assert_eq!(b.value(39).unwrap(), Value::Msk(true));
        let h = b.theap.read();
        assert_eq!(h.free(), (40 + 31) / 32 * 4);
    }
}
