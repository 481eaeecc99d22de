//! Bucket-chained hash indexes over BAT tails.
//!
//! The index is two heaps: a bucket array (`.thashb`, heads of chains, with a
//! 32-byte header in front) and a link array (`.thashl`, one next-pointer per
//! BUN). Entries are 2, 4, or 8 bytes wide, the smallest width that can
//! address the BAT; the all-ones pattern of the width is the nil link.
//!
//! Buckets are found by type-specialized multi-shift XOR mixers; the bucket
//! count need not be a power of two: a probe value is masked with `mask2`
//! and folded through `mask1` when it lands beyond `nbucket` (`mask1 <
//! nbucket <= mask2 + 1`). Growing splits one bucket at a time, rehashing
//! only the entries of the split bucket.

use std::convert::TryInto;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::bat::Bat;
use crate::debug::{self, Cat};
use crate::heap::Heap;
use crate::strheap;
use crate::types::{AtomType, Bun};
use crate::value::Value;
use crate::{Error, Result};

/// Byte size of the header stored in front of the bucket array.
pub const HASH_HEADER_BYTES: usize = 32;

/// A hash index. Lives under the owning BAT's hash rwlock.
#[derive(Debug)]
pub struct Hash {
    pub(crate) tpe: AtomType,
    /// Entry width in bytes: 2, 4 or 8.
    pub(crate) width: usize,
    pub(crate) mask1: u64,
    pub(crate) mask2: u64,
    pub(crate) nbucket: u64,
    /// Number of distinct values seen at build time.
    pub(crate) nunique: u64,
    /// Number of non-empty buckets at build time.
    pub(crate) nheads: u64,
    pub(crate) heaplink: Heap,
    pub(crate) heapbckt: Heap,
    /// False when the heaps are read-only file mappings.
    pub(crate) writable: bool,
}

/// The nil link of a given width.
fn nil_of(width: usize) -> u64 {
    match width {
        2 => u64::from(u16::MAX),
        4 => u64::from(u32::MAX),
        _ => u64::MAX,
    }
}

/// Smallest entry width that can address `count` BUNs, keeping the all-ones
/// pattern free for nil.
fn width_for(count: Bun) -> usize {
    if count < u16::MAX as Bun {
        2
    } else if count < u32::MAX as Bun {
        4
    } else {
        8
    }
}

// Multi-shift XOR mixers. The shifts spread every input bit over the low
// bits so that masking with a power-of-two-minus-one keeps entropy.

fn mix_int(x: u32) -> u32 {
    (x >> 7) ^ (x >> 13) ^ (x >> 21) ^ x
}

fn mix_lng(x: u64) -> u64 {
    (x >> 7) ^ (x >> 13) ^ (x >> 21) ^ (x >> 31) ^ (x >> 38) ^ (x >> 46) ^ (x >> 56) ^ x
}

fn mix_hge(x: u128) -> u128 {
    (x >> 7)
        ^ (x >> 13)
        ^ (x >> 21)
        ^ (x >> 31)
        ^ (x >> 38)
        ^ (x >> 46)
        ^ (x >> 56)
        ^ (x >> 65)
        ^ (x >> 70)
        ^ (x >> 78)
        ^ (x >> 85)
        ^ (x >> 90)
        ^ (x >> 98)
        ^ (x >> 107)
        ^ (x >> 116)
        ^ x
}

fn mix_uuid(bytes: &[u8; 16]) -> u64 {
    let u1 = u64::from_be_bytes(bytes[..8].try_into().unwrap());
    let u2 = u64::from_be_bytes(bytes[8..].try_into().unwrap());
    mix_lng(u1) ^ mix_lng(u2)
}

/// Mixes a value down to a probe word.
pub fn hash_value(v: &Value) -> u64 {
    match v {
        Value::Str(s) => strheap::str_hash(s),
        Value::Uuid(u) => mix_uuid(u.as_bytes()),
        Value::Hge(x) => mix_hge(*x as u128) as u64,
        Value::Bte(x) | Value::Bit(x) => u64::from(*x as u8),
        Value::Sht(x) => u64::from(*x as u16),
        Value::Int(x) | Value::Bat(x) => u64::from(mix_int(*x as u32)),
        Value::Date(d) => u64::from(mix_int(d.raw() as u32)),
        Value::Flt(f) => u64::from(mix_int(f.to_bits())),
        Value::Lng(x) => mix_lng(*x as u64),
        Value::Dbl(f) => mix_lng(f.to_bits()),
        Value::Daytime(d) => mix_lng(d.raw() as u64),
        Value::Timestamp(d) => mix_lng(d.raw() as u64),
        Value::Oid(o) | Value::Void(o) => mix_lng(*o),
        Value::Ptr(p) => mix_lng(*p as u64),
        Value::Msk(m) => u64::from(*m),
    }
}

impl Hash {
    /// The bucket a probe word falls into.
    #[inline]
    pub fn bucket(&self, v: u64) -> u64 {
        let x = v & self.mask2;
        if x < self.nbucket {
            x
        } else {
            x & self.mask1
        }
    }

    fn get_at(heap: &Heap, width: usize, off: usize, i: u64) -> u64 {
        let pos = off + i as usize * width;
        let b = heap.all_bytes();
        match width {
            2 => u64::from(LittleEndian::read_u16(&b[pos..])),
            4 => u64::from(LittleEndian::read_u32(&b[pos..])),
            _ => LittleEndian::read_u64(&b[pos..]),
        }
    }

    fn put_at(heap: &mut Heap, width: usize, off: usize, i: u64, v: u64) {
        let pos = off + i as usize * width;
        let b = heap.all_bytes_mut();
        match width {
            2 => LittleEndian::write_u16(&mut b[pos..], v as u16),
            4 => LittleEndian::write_u32(&mut b[pos..], v as u32),
            _ => LittleEndian::write_u64(&mut b[pos..], v),
        }
    }

    /// Head of the chain for bucket `i`.
    pub fn get(&self, i: u64) -> u64 {
        Hash::get_at(&self.heapbckt, self.width, HASH_HEADER_BYTES, i)
    }

    fn put(&mut self, i: u64, v: u64) {
        Hash::put_at(&mut self.heapbckt, self.width, HASH_HEADER_BYTES, i, v);
    }

    /// Next link after BUN `i`.
    pub fn get_link(&self, i: u64) -> u64 {
        Hash::get_at(&self.heaplink, self.width, 0, i)
    }

    fn put_link(&mut self, i: u64, v: u64) {
        Hash::put_at(&mut self.heaplink, self.width, 0, i, v);
    }

    /// The nil link.
    pub fn nil(&self) -> u64 {
        nil_of(self.width)
    }

    /// Links BUN `p` holding value `v` into the index. Returns false when
    /// the index cannot take the insert (read-only mapping or the position
    /// outgrew the entry width); the caller then drops the index.
    pub fn insert(&mut self, v: &Value, p: Bun) -> bool {
        if !self.writable || p as u64 >= self.nil() {
            return false;
        }
        let need = (p + 1) * self.width;
        if need > self.heaplink.size() && self.heaplink.extend(need.max(64)).is_err() {
            return false;
        }
        self.heaplink.set_free(need.max(self.heaplink.free()));
        let b = self.bucket(hash_value(v));
        let head = self.get(b);
        if head == self.nil() {
            self.nheads += 1;
        }
        self.put_link(p as u64, head);
        self.put(b, p as u64);
        true
    }

    /// Splits buckets until the bucket count has doubled (or the address
    /// space of the probe width is exhausted), rehashing only the entries of
    /// each split bucket.
    pub fn grow_buckets(&mut self, b: &Bat) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let target = self.nbucket * 2;
        while self.nbucket < target {
            if self.nbucket > self.mask2 {
                self.mask1 = self.mask2;
                self.mask2 = self.mask2 * 2 + 1;
            }
            let split = self.nbucket - (self.mask1 + 1);
            let newb = self.nbucket;
            let need = HASH_HEADER_BYTES + (newb as usize + 1) * self.width;
            if need > self.heapbckt.size() {
                self.heapbckt.extend(need.max(self.heapbckt.size() * 2))?;
                self.heapbckt.set_free(self.heapbckt.size());
            }
            self.nbucket += 1;
            // walk the split chain, re-linking every entry into either the
            // old or the new bucket
            let mut cur = self.get(split);
            let nil = self.nil();
            self.put(split, nil);
            self.put(newb, nil);
            while cur != nil {
                let next = self.get_link(cur);
                let v = b.value(cur as Bun)?;
                let dest = self.bucket(hash_value(&v));
                debug_assert!(dest == split || dest == newb);
                let head = self.get(dest);
                self.put_link(cur, head);
                self.put(dest, cur);
                cur = next;
            }
        }
        if debug::enabled(Cat::Algo) {
            debug!("HASHgrowbucket: bat[{}] now {} buckets", b.cacheid, self.nbucket);
        }
        self.heapbckt.dirty = true;
        Ok(())
    }

    /// Serializes the header into the bucket heap's leading bytes.
    pub(crate) fn write_header(&mut self) {
        let mut hdr = [0u8; HASH_HEADER_BYTES];
        LittleEndian::write_u32(&mut hdr[0..], self.mask1 as u32);
        LittleEndian::write_u32(&mut hdr[4..], self.mask2 as u32);
        LittleEndian::write_u32(&mut hdr[8..], self.nbucket as u32);
        hdr[12] = self.tpe.id();
        hdr[13] = self.width as u8;
        LittleEndian::write_u64(&mut hdr[16..], self.nunique);
        LittleEndian::write_u64(&mut hdr[24..], self.nheads);
        self.heapbckt.all_bytes_mut()[..HASH_HEADER_BYTES].copy_from_slice(&hdr);
    }

    /// Reads back a header written by [`Hash::write_header`].
    pub(crate) fn read_header(
        heapbckt: &Heap,
    ) -> Result<(u64, u64, u64, AtomType, usize, u64, u64)> {
        let b = heapbckt.all_bytes();
        if b.len() < HASH_HEADER_BYTES {
            return Err(Error::corrupt("hash", "bucket heap too small"));
        }
        let mask1 = u64::from(LittleEndian::read_u32(&b[0..]));
        let mask2 = u64::from(LittleEndian::read_u32(&b[4..]));
        let nbucket = u64::from(LittleEndian::read_u32(&b[8..]));
        let tpe = AtomType::from_id(b[12])
            .ok_or_else(|| Error::corrupt("hash", format!("unknown type id {}", b[12])))?;
        let width = b[13] as usize;
        if !matches!(width, 2 | 4 | 8) {
            return Err(Error::corrupt("hash", format!("bad width {}", width)));
        }
        let nunique = LittleEndian::read_u64(&b[16..]);
        let nheads = LittleEndian::read_u64(&b[24..]);
        Ok((mask1, mask2, nbucket, tpe, width, nunique, nheads))
    }
}

/// Builds a hash index over `b`'s tail if none exists yet. `floor` bounds
/// the initial bucket count from below; `grow_threshold` is the average
/// chain length that triggers bucket doubling on an existing index.
pub fn bat_hash(b: &Bat, floor: Bun, grow_threshold: usize) -> Result<()> {
    {
        let r = b.hash.read();
        if let Some(h) = r.as_ref() {
            if grow_threshold > 0
                && h.writable
                && b.count() as u64 > h.nbucket * grow_threshold as u64
            {
                drop(r);
                let mut w = b.hash.write();
                if let Some(h) = w.as_mut() {
                    h.grow_buckets(b)?;
                }
            }
            return Ok(());
        }
    }
    let mut w = b.hash.write();
    if w.is_some() {
        return Ok(());
    }
    let count = b.count();
    let width = width_for(count.max(floor));
    let nbucket = count.max(floor).max(1) as u64;
    let c = 64 - (nbucket.max(2) - 1).leading_zeros();
    let mask2 = (1u64 << c) - 1;
    let mask1 = mask2 >> 1;
    let farmid = b.theap.read().farmid;
    let physical = b
        .theap
        .read()
        .filename
        .trim_end_matches(".tail")
        .to_string();
    let mut heaplink = Heap::new(farmid, b.cacheid, format!("{}.thashl", physical));
    heaplink.extend((count.max(1)) * width)?;
    heaplink.set_free(count * width);
    let mut heapbckt = Heap::new(farmid, b.cacheid, format!("{}.thashb", physical));
    heapbckt.extend(HASH_HEADER_BYTES + nbucket as usize * width)?;
    heapbckt.set_free(HASH_HEADER_BYTES + nbucket as usize * width);
    let mut h = Hash {
        tpe: b.ttype(),
        width,
        mask1,
        mask2,
        nbucket,
        nunique: 0,
        nheads: 0,
        heaplink,
        heapbckt,
        writable: true,
    };
    // empty all buckets
    let nil = h.nil();
    for i in 0..nbucket {
        h.put(i, nil);
    }
    for p in 0..count {
        let v = b.value(p)?;
        let bv = h.bucket(hash_value(&v));
        let head = h.get(bv);
        if head == nil {
            h.nheads += 1;
            h.nunique += 1;
        } else {
            // chain walk to maintain the unique-value count
            let mut cur = head;
            let mut seen = false;
            while cur != nil {
                if b.value(cur as Bun)?.cmp_nilaware(&v) == Some(std::cmp::Ordering::Equal) {
                    seen = true;
                    break;
                }
                cur = h.get_link(cur);
            }
            if !seen {
                h.nunique += 1;
            }
        }
        h.put_link(p as u64, head);
        h.put(bv, p as u64);
    }
    if debug::enabled(Cat::Algo) {
        debug!(
            "BAThash: bat[{}] {} entries, {} buckets, {} unique",
            b.cacheid, count, nbucket, h.nunique
        );
    }
    *w = Some(h);
    Ok(())
}

/// Loads a persisted hash index from its two files as read-only mappings.
/// The index is validated against the BAT before use.
pub fn hash_load(
    b: &Bat,
    link_path: std::path::PathBuf,
    bckt_path: std::path::PathBuf,
) -> Result<Hash> {
    let farmid = b.theap.read().farmid;
    let physical = b
        .theap
        .read()
        .filename
        .trim_end_matches(".tail")
        .to_string();
    let blen = std::fs::metadata(&bckt_path)?.len() as usize;
    let mut heapbckt = Heap::new(farmid, b.cacheid, format!("{}.thashb", physical));
    heapbckt.set_path(bckt_path);
    heapbckt.load_readonly(blen)?;
    let (mask1, mask2, nbucket, tpe, width, nunique, nheads) = Hash::read_header(&heapbckt)?;
    if tpe != b.ttype() {
        return Err(Error::corrupt(
            "hash",
            format!("index type {} does not match BAT type {}", tpe, b.ttype()),
        ));
    }
    if HASH_HEADER_BYTES + nbucket as usize * width > blen {
        return Err(Error::corrupt("hash", "bucket file too small"));
    }
    let llen = std::fs::metadata(&link_path)?.len() as usize;
    if llen < b.count() * width {
        return Err(Error::corrupt("hash", "link file shorter than BAT"));
    }
    let mut heaplink = Heap::new(farmid, b.cacheid, format!("{}.thashl", physical));
    heaplink.set_path(link_path);
    heaplink.load_readonly(llen)?;
    Ok(Hash {
        tpe,
        width,
        mask1,
        mask2,
        nbucket,
        nunique,
        nheads,
        heaplink,
        heapbckt,
        writable: false,
    })
}

/// Iterator over the BUN positions holding a probe value.
pub struct HashIter<'a> {
    b: &'a Bat,
    h: &'a Hash,
    v: &'a Value,
    cur: u64,
}

impl std::fmt::Debug for HashIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIter")
            .field("bat", &self.b.id())
            .field("cur", &self.cur)
            .finish()
    }
}

impl<'a> Iterator for HashIter<'a> {
    type Item = Bun;

    fn next(&mut self) -> Option<Bun> {
        let nil = self.h.nil();
        while self.cur != nil {
            let p = self.cur;
            self.cur = self.h.get_link(p);
            if let Ok(w) = self.b.value(p as Bun) {
                if w.cmp_nilaware(self.v) == Some(std::cmp::Ordering::Equal) {
                    return Some(p as Bun);
                }
            }
        }
        None
    }
}

/// All positions holding `v`, newest first.
pub fn hash_candidates<'a>(b: &'a Bat, h: &'a Hash, v: &'a Value) -> HashIter<'a> {
    HashIter {
        b,
        h,
        v,
        cur: h.get(h.bucket(hash_value(v))),
    }
}

/// First (most recently inserted) position holding `v`, or `None`.
pub fn hash_find(b: &Bat, h: &Hash, v: &Value) -> Result<Option<Bun>> {
    if v.tpe() != h.tpe {
        return Err(Error::TypeMismatch {
            expected: h.tpe.name(),
            actual: v.tpe().name(),
        });
    }
    Ok(hash_candidates(b, h, v).next())
}

/// Probe helper: the oldest position holding `v` (useful for stable lookups).
pub fn hash_find_first(b: &Bat, h: &Hash, v: &Value) -> Result<Option<Bun>> {
    Ok(hash_candidates(b, h, v).min())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bat::Role;
    use crate::types::BUN_MAX;

    fn int_bat(vals: &[i32]) -> Bat {
        let mut b = Bat::new(1, 0, AtomType::Int, 0, Role::Transient, 0, "00/01/1").unwrap();
        for &v in vals {
            b.append(&Value::Int(v)).unwrap();
        }
        b
    }

    #[test]
    fn mixer_fixpoints() {
        // the documented fixpoints of the reference mixers
        assert_eq!(mix_int(0x8106_0038), 0x8000_0000);
        assert_eq!(mix_lng(0x8106_0039_4347_424F), 0x8000_0000_0000_0000);
    }

    #[test]
    fn build_and_probe() {
        let b = int_bat(&[10, 20, 30, 40, 50]);
        bat_hash(&b, 1024, 4).unwrap();
        let hs = b.hash.read();
        let h = hs.as_ref().unwrap();
        assert_eq!(h.nunique, 5);
        assert_eq!(hash_find(&b, h, &Value::Int(30)).unwrap(), Some(2));
        assert_eq!(hash_find(&b, h, &Value::Int(99)).unwrap(), None);
    }

    #[test]
    fn duplicates_enumerate_all_positions() {
        let b = int_bat(&[7, 1, 7, 2, 7]);
        bat_hash(&b, 64, 4).unwrap();
        let hs = b.hash.read();
        let h = hs.as_ref().unwrap();
        let mut pos: Vec<Bun> = hash_candidates(&b, h, &Value::Int(7)).collect();
        pos.sort_unstable();
        assert_eq!(pos, vec![0, 2, 4]);
        assert_eq!(h.nunique, 3);
        assert_eq!(hash_find_first(&b, h, &Value::Int(7)).unwrap(), Some(0));
    }

    #[test]
    fn inserts_maintain_index() {
        let mut b = int_bat(&[1, 2, 3]);
        bat_hash(&b, 64, 4).unwrap();
        b.append(&Value::Int(4)).unwrap();
        let hs = b.hash.read();
        let h = hs.as_ref().unwrap();
        assert_eq!(hash_find(&b, h, &Value::Int(4)).unwrap(), Some(3));
    }

    #[test]
    fn growing_keeps_probes_correct() {
        let vals: Vec<i32> = (0..500).map(|i| i * 3).collect();
        let b = int_bat(&vals);
        // deliberately tiny bucket floor
        bat_hash(&b, 8, 4).unwrap();
        {
            let mut hs = b.hash.write();
            let h = hs.as_mut().unwrap();
            let before = h.nbucket;
            h.grow_buckets(&b).unwrap();
            assert_eq!(h.nbucket, before * 2);
        }
        let hs = b.hash.read();
        let h = hs.as_ref().unwrap();
        for (p, &v) in vals.iter().enumerate() {
            assert_eq!(hash_find(&b, h, &Value::Int(v)).unwrap(), Some(p));
        }
        assert_eq!(hash_find(&b, h, &Value::Int(1)).unwrap(), None);
    }

    #[test]
    fn width_scales_with_count() {
        assert_eq!(width_for(100), 2);
        assert_eq!(width_for(70_000), 4);
        assert_eq!(width_for(5_000_000_000), 8);
        assert_eq!(width_for(BUN_MAX), 8);
    }

    #[test]
    fn string_hashing() {
        let mut b = Bat::new(1, 0, AtomType::Str, 0, Role::Transient, 0, "00/01/1").unwrap();
        for s in ["apple", "pear", "apple", "plum"] {
            b.append(&Value::Str(s.into())).unwrap();
        }
        bat_hash(&b, 64, 4).unwrap();
        let hs = b.hash.read();
        let h = hs.as_ref().unwrap();
        let mut pos: Vec<Bun> = hash_candidates(&b, h, &Value::Str("apple".into())).collect();
        pos.sort_unstable();
        assert_eq!(pos, vec![0, 2]);
        assert_eq!(h.nunique, 3);
    }

    #[test]
    fn header_round_trip() {
        let b = int_bat(&[5, 6, 7]);
        bat_hash(&b, 16, 4).unwrap();
        let mut hs = b.hash.write();
        let h = hs.as_mut().unwrap();
        h.write_header();
        let (m1, m2, nb, t, w, nu, nh) = Hash::read_header(&h.heapbckt).unwrap();
        assert_eq!((m1, m2, nb), (h.mask1, h.mask2, h.nbucket));
        assert_eq!(t, AtomType::Int);
        assert_eq!(w, h.width);
        assert_eq!(nu, h.nunique);
        assert_eq!(nh, h.nheads);
    }
}
