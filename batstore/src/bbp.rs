//! The BAT Buffer Pool: the registry mapping BAT identifiers to descriptors.
//!
//! The pool is a two-level slot table (pages are allocated on demand and
//! never move), with a LIFO free list threaded through the slots. Every slot
//! carries two reference counts: memory references ([`Bbp::fix`] /
//! [`Bbp::unfix`]) keep the descriptor loaded, logical references
//! ([`Bbp::retain`] / [`Bbp::release`]) keep the BAT alive. A BAT whose
//! logical count reaches zero is destroyed; one whose memory count reaches
//! zero merely becomes a candidate for unloading under memory pressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::bat::{tail_bytes, Access, Bat, BatHandle, Role};
use crate::debug::{self, Cat};
use crate::farm::{physical_of, Farm, FARM_PERSISTENT, FARM_TRANSIENT};
use crate::heap::StorageMode;
use crate::settings::Settings;
use crate::strheap;
use crate::types::{AtomType, BatId, Bun, Oid, OID_NIL};
use crate::value::Value;
use crate::{Error, Result};

/// Slots per page of the two-level table.
const BBP_PAGE: usize = 1024;

/// Longest accepted logical name.
const MAX_NAME: usize = 128;

// Status bits of a slot. The persistent-state triplet DELETED / EXISTING /
// NEW has at most one bit set at any time.
/// Descriptor is in memory.
pub const BBPLOADED: u32 = 1;
/// Dirty BAT is not in memory.
pub const BBPSWAPPED: u32 = 2;
/// Non-persistent BAT has an image on disk.
pub const BBPTMP: u32 = 4;
/// Persistent at last commit, to become transient.
pub const BBPDELETED: u32 = 16;
/// Persistent at last commit, stays persistent.
pub const BBPEXISTING: u32 = 32;
/// Became persistent since the last commit.
pub const BBPNEW: u32 = 64;
/// Mask of currently persistent BATs.
pub const BBPPERSISTENT: u32 = BBPEXISTING | BBPNEW;
/// Mask of the durable state bits.
pub const BBPSTATUS: u32 = 127;
/// Unload in progress.
pub const BBPUNLOADING: u32 = 128;
/// Load in progress.
pub const BBPLOADING: u32 = 256;
/// Save in progress.
pub const BBPSAVING: u32 = 512;
/// Renamed in the current transaction.
pub const BBPRENAMED: u32 = 1024;
/// Destruction in progress.
pub const BBPDELETING: u32 = 2048;
/// In active use; the trimmer skips it.
pub const BBPHOT: u32 = 4096;
/// Between backup staging and save.
pub const BBPSYNCING: u32 = 8192;
/// States in which a slot must not be touched.
pub const BBPUNSTABLE: u32 = BBPUNLOADING | BBPDELETING;
/// States with an operation in flight.
pub const BBPWAITING: u32 = BBPUNLOADING | BBPLOADING | BBPSAVING | BBPDELETING | BBPSYNCING;

/// One record of the `BBP.dir` directory file.
#[derive(Debug, Clone)]
pub(crate) struct DirRecord {
    pub id: BatId,
    pub name: String,
    pub physical: String,
    pub options: String,
    pub role: u8,
    pub count: Bun,
    pub capacity: Bun,
    pub tail_free: usize,
    pub vheap_free: usize,
    pub props: u32,
    pub type_id: u8,
    pub hseq: Oid,
    pub tseq: Oid,
}

const PROP_KEY: u32 = 1;
const PROP_SORTED: u32 = 2;
const PROP_REVSORTED: u32 = 4;
const PROP_NONIL: u32 = 8;
const PROP_NIL: u32 = 16;

/// Per-slot bookkeeping protected by a mutex.
#[derive(Debug, Default)]
struct SlotMeta {
    name: String,
    /// Previous logical name kept for rename rollback.
    bak: Option<String>,
    options: String,
    physical: String,
    next_free: BatId,
    /// Last committed on-disk descriptor, used for lazy loads.
    desc: Option<DirRecord>,
}

#[derive(Debug)]
struct Slot {
    bat: RwLock<Option<BatHandle>>,
    refs: AtomicU32,
    lrefs: AtomicU32,
    share: AtomicU32,
    status: AtomicU32,
    meta: Mutex<SlotMeta>,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            bat: RwLock::new(None),
            refs: AtomicU32::new(0),
            lrefs: AtomicU32::new(0),
            share: AtomicU32::new(0),
            status: AtomicU32::new(0),
            meta: Mutex::new(SlotMeta::default()),
        }
    }
}

/// The process-wide BAT registry of one engine instance.
#[derive(Debug)]
pub struct Bbp {
    pages: RwLock<Vec<Box<[Slot]>>>,
    free_head: Mutex<BatId>,
    size: AtomicI32,
    names: Mutex<HashMap<String, BatId>>,
    pub(crate) farms: Vec<Farm>,
    pub(crate) settings: Settings,
    pub(crate) logno: AtomicU64,
    pub(crate) transid: AtomicU64,
}

impl Bbp {
    /// Creates a pool over the given farms. An empty farm list yields a
    /// transient-only pool (no persistence).
    pub fn new(farms: Vec<Farm>, settings: Settings) -> Bbp {
        Bbp {
            pages: RwLock::new(Vec::new()),
            free_head: Mutex::new(0),
            size: AtomicI32::new(1), // slot 0 is never used
            names: Mutex::new(HashMap::new()),
            farms,
            settings,
            logno: AtomicU64::new(0),
            transid: AtomicU64::new(0),
        }
    }

    /// A transient-only pool (tests, scratch work).
    pub fn transient(settings: Settings) -> Bbp {
        Bbp::new(Vec::new(), settings)
    }

    /// The farm serving a role, if any.
    pub(crate) fn farm_for(&self, role: Role) -> Option<&Farm> {
        let bit = match role {
            Role::Persistent => FARM_PERSISTENT,
            Role::Transient => FARM_TRANSIENT,
        };
        self.farms.iter().find(|f| f.roles & bit != 0)
    }

    fn ensure_page(&self, id: BatId) {
        let needed = id as usize / BBP_PAGE + 1;
        let mut pages = self.pages.write();
        while pages.len() < needed {
            let mut v = Vec::with_capacity(BBP_PAGE);
            v.resize_with(BBP_PAGE, Slot::empty);
            pages.push(v.into_boxed_slice());
        }
    }

    fn with_slot<R>(&self, id: BatId, f: impl FnOnce(&Slot) -> R) -> Result<R> {
        if id <= 0 {
            return Err(Error::NoSuchBat(id));
        }
        let pages = self.pages.read();
        let page = pages
            .get(id as usize / BBP_PAGE)
            .ok_or(Error::NoSuchBat(id))?;
        Ok(f(&page[id as usize % BBP_PAGE]))
    }

    /// Number of slot ids handed out so far (the high-water mark).
    pub fn size(&self) -> BatId {
        self.size.load(Ordering::Relaxed)
    }

    fn alloc_id(&self) -> Result<BatId> {
        let mut free = self.free_head.lock();
        if *free != 0 {
            let id = *free;
            *free = self.with_slot(id, |s| s.meta.lock().next_free)?;
            return Ok(id);
        }
        let id = self.size.fetch_add(1, Ordering::Relaxed);
        self.ensure_page(id);
        Ok(id)
    }

    /// Registers a new BAT built by `make`, which receives the allocated id
    /// and physical base name. The new BAT starts with one memory and one
    /// logical reference.
    pub fn insert(&self, make: impl FnOnce(BatId, &str) -> Result<Bat>) -> Result<BatHandle> {
        let id = self.alloc_id()?;
        let physical = physical_of(id);
        let name = format!("tmp_{:x}", id);
        let bat = match make(id, &physical) {
            Ok(b) => b,
            Err(e) => {
                // return the slot to the free list
                let mut free = self.free_head.lock();
                let _ = self.with_slot(id, |s| s.meta.lock().next_free = *free);
                *free = id;
                return Err(e);
            }
        };
        let persistent = !bat.transient;
        let handle: BatHandle = std::sync::Arc::new(RwLock::new(bat));
        self.with_slot(id, |s| {
            *s.bat.write() = Some(std::sync::Arc::clone(&handle));
            s.refs.store(1, Ordering::Relaxed);
            s.lrefs
                .store(if persistent { 2 } else { 1 }, Ordering::Relaxed);
            s.share.store(0, Ordering::Relaxed);
            s.status.store(
                BBPLOADED | BBPHOT | if persistent { BBPNEW } else { 0 },
                Ordering::Relaxed,
            );
            let mut m = s.meta.lock();
            m.name = name.clone();
            m.bak = None;
            m.options = String::new();
            m.physical = physical;
            m.desc = None;
        })?;
        self.names.lock().insert(name, id);
        if debug::enabled(Cat::Bat) {
            debug!("BBP: new bat[{}]", id);
        }
        Ok(handle)
    }

    /// `COLnew`: a fresh BAT registered in the pool.
    pub fn new_bat(
        &self,
        hseq: Oid,
        ttype: AtomType,
        capacity: Bun,
        role: Role,
    ) -> Result<BatHandle> {
        if role == Role::Persistent && self.farm_for(Role::Persistent).is_none() {
            return Err(Error::corrupt("bbp", "no persistent farm configured"));
        }
        let farmid = self.farm_for(role).map_or(0, |f| f.id);
        self.insert(|id, physical| Bat::new(id, hseq, ttype, capacity, role, farmid, physical))
    }

    /// `BATdense`: a zero-storage void BAT over `[tseq, tseq + cnt)`.
    pub fn dense_bat(&self, hseq: Oid, tseq: Oid, cnt: Bun) -> Result<BatHandle> {
        self.insert(|id, physical| Bat::dense(id, hseq, tseq, cnt, 0, physical))
    }

    /// A BAT holding `cnt` copies of `v` (all-nil OID tails become void).
    pub fn constant_bat(&self, hseq: Oid, ttype: AtomType, v: &Value, cnt: Bun) -> Result<BatHandle> {
        if (ttype == AtomType::Oid || ttype == AtomType::Void) && v.is_nil() {
            return self.dense_bat(hseq, OID_NIL, cnt);
        }
        let h = self.new_bat(hseq, ttype, cnt, Role::Transient)?;
        {
            let mut b = h.write();
            for _ in 0..cnt {
                b.append_force(v, true)?;
            }
        }
        Ok(h)
    }

    /// A read-only view of `[lo, hi)` of `b`, registered in the pool.
    pub fn slice(&self, b: &Bat, lo: Bun, hi: Bun) -> Result<BatHandle> {
        let h = self.insert(|id, _physical| b.slice_view(id, lo, hi))?;
        // views hold a share on the heap owners (which may sit behind a
        // chain of views)
        let tp = b.theap.read().parentid;
        if tp > 0 {
            let _ = self.share(tp);
        }
        if let Some(vh) = &b.tvheap {
            let vp = vh.read().parentid;
            if vp > 0 && vp != tp {
                let _ = self.share(vp);
            }
        }
        Ok(h)
    }

    /// Bumps the memory reference count.
    pub fn fix(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            s.refs.fetch_add(1, Ordering::AcqRel);
            s.status.fetch_or(BBPHOT, Ordering::AcqRel);
        })
    }

    /// Drops a memory reference. At zero the BAT becomes unloadable (it is
    /// not unloaded eagerly).
    pub fn unfix(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            let prev = s.refs.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "unfix below zero on bat[{}]", id);
        })?;
        self.maybe_destroy(id)
    }

    /// Bumps the logical reference count.
    pub fn retain(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            s.lrefs.fetch_add(1, Ordering::AcqRel);
        })
    }

    /// Drops a logical reference; at zero the BAT is scheduled for
    /// destruction.
    pub fn release(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            let prev = s.lrefs.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "release below zero on bat[{}]", id);
        })?;
        self.maybe_destroy(id)
    }

    /// A fix combined with a retain: keeps the BAT alive and loaded.
    pub fn keepref(&self, id: BatId) -> Result<()> {
        self.fix(id)?;
        self.retain(id)
    }

    /// Records a heap-sharing reference against the owner of a shared heap.
    pub fn share(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            s.share.fetch_add(1, Ordering::AcqRel);
            s.lrefs.fetch_add(1, Ordering::AcqRel);
        })
    }

    /// Releases a heap-sharing reference.
    pub fn unshare(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            s.share.fetch_sub(1, Ordering::AcqRel);
        })?;
        self.release(id)
    }

    /// Current share count of a BAT.
    pub fn share_count(&self, id: BatId) -> Result<u32> {
        self.with_slot(id, |s| s.share.load(Ordering::Acquire))
    }

    /// Current (memory, logical) reference counts.
    pub fn refcounts(&self, id: BatId) -> Result<(u32, u32)> {
        self.with_slot(id, |s| {
            (
                s.refs.load(Ordering::Acquire),
                s.lrefs.load(Ordering::Acquire),
            )
        })
    }

    /// The status bits of a slot.
    pub fn status(&self, id: BatId) -> Result<u32> {
        self.with_slot(id, |s| s.status.load(Ordering::Acquire))
    }

    pub(crate) fn status_or(&self, id: BatId, bits: u32) -> Result<()> {
        self.with_slot(id, |s| {
            s.status.fetch_or(bits, Ordering::AcqRel);
        })
    }

    pub(crate) fn status_clear(&self, id: BatId, bits: u32) -> Result<()> {
        self.with_slot(id, |s| {
            s.status.fetch_and(!bits, Ordering::AcqRel);
        })
    }

    /// Re-examines a slot after its pending on-disk deletion completed.
    pub(crate) fn sweep(&self, id: BatId) -> Result<()> {
        self.maybe_destroy(id)
    }

    /// Destroys the BAT if nothing keeps it alive: no refs, no logical refs,
    /// no in-flight operation. A BAT whose on-disk deletion still awaits the
    /// next commit (`BBPDELETED`) stays around until the commit sweeps it.
    fn maybe_destroy(&self, id: BatId) -> Result<()> {
        let destroy = self.with_slot(id, |s| {
            if s.refs.load(Ordering::Acquire) == 0
                && s.lrefs.load(Ordering::Acquire) == 0
                && s.status.load(Ordering::Acquire) & (BBPWAITING | BBPDELETED) == 0
            {
                s.status.fetch_or(BBPDELETING, Ordering::AcqRel);
                true
            } else {
                false
            }
        })?;
        if !destroy {
            return Ok(());
        }
        if debug::enabled(Cat::Bat) {
            debug!("BBP: destroying bat[{}]", id);
        }
        let (name, parents) = self.with_slot(id, |s| {
            let taken = s.bat.write().take();
            let mut parents: Vec<BatId> = Vec::new();
            if let Some(handle) = taken {
                let b = handle.read();
                let tp = b.theap.read().parentid;
                if tp != id && tp > 0 {
                    parents.push(tp);
                }
                if let Some(vh) = &b.tvheap {
                    let vp = vh.read().parentid;
                    if vp != id && vp > 0 && !parents.contains(&vp) {
                        parents.push(vp);
                    }
                }
                // transient files disappear with the descriptor
                if b.transient {
                    b.theap.write().remove = true;
                    if let Some(vh) = &b.tvheap {
                        let mut vh = vh.write();
                        if vh.parentid == id {
                            vh.remove = true;
                        }
                    }
                }
            }
            let mut m = s.meta.lock();
            let name = std::mem::take(&mut m.name);
            m.bak = None;
            m.desc = None;
            s.status.store(0, Ordering::Release);
            (name, parents)
        })?;
        if !name.is_empty() {
            self.names.lock().remove(&name);
        }
        {
            let mut free = self.free_head.lock();
            self.with_slot(id, |s| s.meta.lock().next_free = *free)?;
            *free = id;
        }
        // a destroyed view lets go of its parents' heaps
        for pid in parents {
            let _ = self.unshare(pid);
        }
        Ok(())
    }

    /// Returns the descriptor of `id`, fixing the BAT; loads it from disk
    /// when it is not in memory.
    pub fn descriptor(&self, id: BatId) -> Result<BatHandle> {
        loop {
            let existing = self.with_slot(id, |s| s.bat.read().as_ref().map(std::sync::Arc::clone))?;
            if let Some(h) = existing {
                self.fix(id)?;
                return Ok(h);
            }
            // not loaded: load from the stored directory record
            let (rec, claimed) = self.with_slot(id, |s| {
                let st = s.status.load(Ordering::Acquire);
                if st & BBPLOADING != 0 {
                    return (None, false);
                }
                s.status.fetch_or(BBPLOADING, Ordering::AcqRel);
                (s.meta.lock().desc.clone(), true)
            })?;
            if !claimed {
                std::thread::yield_now();
                continue;
            }
            let rec = match rec {
                Some(r) => r,
                None => {
                    self.status_clear(id, BBPLOADING)?;
                    return Err(Error::NoSuchBat(id));
                }
            };
            let loaded = self.load_from_record(&rec);
            let result = match loaded {
                Ok(bat) => {
                    let handle: BatHandle = std::sync::Arc::new(RwLock::new(bat));
                    self.with_slot(id, |s| {
                        *s.bat.write() = Some(std::sync::Arc::clone(&handle));
                        s.refs.fetch_add(1, Ordering::AcqRel);
                        s.status.fetch_or(BBPLOADED | BBPHOT, Ordering::AcqRel);
                    })?;
                    Ok(handle)
                }
                Err(e) => Err(e),
            };
            self.status_clear(id, BBPLOADING)?;
            return result;
        }
    }

    /// Reconstructs a descriptor from its directory record and loads its
    /// heaps.
    fn load_from_record(&self, rec: &DirRecord) -> Result<Bat> {
        let farm = self
            .farm_for(Role::Persistent)
            .ok_or_else(|| Error::corrupt("bbp", "no persistent farm to load from"))?;
        let ttype = AtomType::from_id(rec.type_id)
            .ok_or_else(|| Error::corrupt("BBP.dir", format!("unknown type id {}", rec.type_id)))?;
        if debug::enabled(Cat::Load) {
            debug!("BATload: bat[{}] {}", rec.id, rec.physical);
        }
        let width = if ttype.varsized() {
            if rec.count > 0 {
                (rec.tail_free / rec.count).max(1)
            } else {
                1
            }
        } else {
            ttype.width()
        };
        let mut bat = Bat::new(
            rec.id,
            rec.hseq,
            ttype,
            0,
            Role::Persistent,
            farm.id,
            &rec.physical,
        )?;
        bat.tseq = rec.tseq;
        if ttype.varsized() {
            bat.width = width;
            bat.shift = width.trailing_zeros() as u8;
        }
        // large heaps come in as copy-on-write mappings so the committed
        // file stays pristine until the next save
        if ttype != AtomType::Void {
            let mut th = bat.theap.write();
            let th_path = farm.filepath(&th.filename.clone());
            th.set_path(th_path);
            let mode = if rec.tail_free >= self.settings.mmap_threshold {
                StorageMode::Priv
            } else {
                StorageMode::Mem
            };
            th.load(rec.tail_free, mode)?;
        }
        if let Some(vh) = &bat.tvheap {
            let mut vh = vh.write();
            let vh_path = farm.filepath(&vh.filename.clone());
            vh.set_path(vh_path);
            let mode = if rec.vheap_free >= self.settings.mmap_threshold {
                StorageMode::Priv
            } else {
                StorageMode::Mem
            };
            vh.load(rec.vheap_free, mode)?;
            strheap::str_heap_attach(&mut vh);
        }
        bat.count = rec.count;
        bat.capacity = if ttype == AtomType::Void {
            rec.count
        } else {
            rec.count.max(rec.tail_free / bat.width.max(1))
        };
        bat.inserted = rec.count;
        bat.key = rec.props & PROP_KEY != 0;
        bat.sorted = rec.props & PROP_SORTED != 0;
        bat.revsorted = rec.props & PROP_REVSORTED != 0;
        bat.nonil = rec.props & PROP_NONIL != 0;
        bat.nil = rec.props & PROP_NIL != 0;
        bat.copied_to_disk = true;
        bat.dirty_flushed = true;
        bat.dirty_desc = false;
        bat.restricted = Access::Write;
        Ok(bat)
    }

    /// Builds the directory record describing the current state of `b`.
    pub(crate) fn record_from(&self, b: &Bat, meta_name: &str, options: &str) -> DirRecord {
        let mut props = 0;
        if b.key {
            props |= PROP_KEY;
        }
        if b.sorted {
            props |= PROP_SORTED;
        }
        if b.revsorted {
            props |= PROP_REVSORTED;
        }
        if b.nonil {
            props |= PROP_NONIL;
        }
        if b.nil {
            props |= PROP_NIL;
        }
        DirRecord {
            id: b.cacheid,
            name: meta_name.to_string(),
            physical: physical_of(b.cacheid),
            options: options.to_string(),
            role: if b.transient { 1 } else { 0 },
            count: b.count(),
            capacity: b.capacity(),
            tail_free: tail_bytes(b.ttype, b.width, b.baseoff + b.count),
            vheap_free: b.tvheap.as_ref().map_or(0, |vh| vh.read().free()),
            props,
            type_id: b.ttype.id(),
            hseq: b.hseqbase,
            tseq: b.tseq,
        }
    }

    /// Writes the heaps of a persistent BAT to its farm files (`BATsave`)
    /// and refreshes the slot's directory record.
    pub fn save_bat(&self, id: BatId) -> Result<()> {
        let handle = self.descriptor(id)?;
        let res = (|| {
            self.status_or(id, BBPSAVING)?;
            let mut b = handle.write();
            if b.transient {
                return Err(Error::corrupt("bbp", "cannot save a transient BAT"));
            }
            if b.ttype == AtomType::Ptr {
                return Err(Error::corrupt("bbp", "pointer BATs are transient-only"));
            }
            let farm = self
                .farm_for(Role::Persistent)
                .ok_or_else(|| Error::corrupt("bbp", "no persistent farm"))?;
            let sync = self.settings.sync_on_commit;
            if b.ttype != AtomType::Void {
                let mut th = b.theap.write();
                if th.path().is_none() {
                    let p = farm.filepath(&th.filename.clone());
                    th.set_path(p);
                }
                th.save(sync)?;
            }
            if let Some(vh) = &b.tvheap {
                let mut vh = vh.write();
                if vh.path().is_none() {
                    let p = farm.filepath(&vh.filename.clone());
                    vh.set_path(p);
                }
                vh.save(sync)?;
            }
            // persist a useful hash index alongside the heaps
            {
                let mut hs = b.hash.write();
                if let Some(h) = hs.as_mut() {
                    if h.writable {
                        h.write_header();
                        if h.heaplink.path().is_none() {
                            let p = farm.filepath(&h.heaplink.filename.clone());
                            h.heaplink.set_path(p);
                        }
                        if h.heapbckt.path().is_none() {
                            let p = farm.filepath(&h.heapbckt.filename.clone());
                            h.heapbckt.set_path(p);
                        }
                        if h.heaplink.save(sync).is_err() || h.heapbckt.save(sync).is_err() {
                            warn!("hash persistence failed for bat[{}]", id);
                        }
                    }
                }
            }
            b.copied_to_disk = true;
            b.dirty_flushed = true;
            let rec = {
                let m = self.with_slot(id, |s| s.meta.lock().name.clone())?;
                let o = self.with_slot(id, |s| s.meta.lock().options.clone())?;
                self.record_from(&b, &m, &o)
            };
            self.with_slot(id, |s| s.meta.lock().desc = Some(rec))?;
            Ok(())
        })();
        self.status_clear(id, BBPSAVING)?;
        self.unfix(id)?;
        res
    }

    /// Changes the logical name of a BAT. The old name is remembered for
    /// rollback until the next commit.
    pub fn rename(&self, id: BatId, name: &str) -> Result<()> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::IllegalName(name.to_string()));
        }
        if name.len() > MAX_NAME {
            return Err(Error::NameTooLong(name.to_string()));
        }
        let mut names = self.names.lock();
        if let Some(&other) = names.get(name) {
            if other != id {
                return Err(Error::NameAlreadyInUse(name.to_string()));
            }
            return Ok(());
        }
        self.with_slot(id, |s| {
            let mut m = s.meta.lock();
            let old = std::mem::replace(&mut m.name, name.to_string());
            if m.bak.is_none() {
                m.bak = Some(old.clone());
            }
            s.status.fetch_or(BBPRENAMED, Ordering::AcqRel);
            names.remove(&old);
            names.insert(name.to_string(), id);
        })
    }

    /// Forgets the rename-rollback name once a commit made the new name
    /// durable.
    pub(crate) fn commit_rename(&self, id: BatId) -> Result<()> {
        self.with_slot(id, |s| {
            s.meta.lock().bak = None;
            s.status.fetch_and(!BBPRENAMED, Ordering::AcqRel);
        })
    }

    /// Reverts an uncommitted rename to the remembered previous name.
    pub(crate) fn rollback_rename(&self, id: BatId) -> Result<()> {
        let mut names = self.names.lock();
        self.with_slot(id, |s| {
            let mut m = s.meta.lock();
            if let Some(old) = m.bak.take() {
                names.remove(&m.name);
                names.insert(old.clone(), id);
                m.name = old;
            }
            s.status.fetch_and(!BBPRENAMED, Ordering::AcqRel);
        })
    }

    /// The logical name of a BAT.
    pub fn logical(&self, id: BatId) -> Result<String> {
        self.with_slot(id, |s| s.meta.lock().name.clone())
    }

    /// The physical base name of a BAT.
    pub fn physical(&self, id: BatId) -> Result<String> {
        self.with_slot(id, |s| s.meta.lock().physical.clone())
    }

    /// Finds a BAT id by logical name.
    pub fn lookup(&self, name: &str) -> Option<BatId> {
        self.names.lock().get(name).copied()
    }

    /// Flips a BAT between persistent and transient, maintaining the
    /// persistent-state triplet and the directory's logical reference.
    pub fn set_persistence(&self, id: BatId, persistent: bool) -> Result<()> {
        if persistent && self.farm_for(Role::Persistent).is_none() {
            return Err(Error::corrupt("bbp", "no persistent farm configured"));
        }
        let handle = self.descriptor(id)?;
        let res = (|| -> Result<()> {
            let mut b = handle.write();
            let was = !b.transient;
            if was == persistent {
                return Ok(());
            }
            b.set_transient(!persistent)?;
            drop(b);
            self.with_slot(id, |s| {
                let st = s.status.load(Ordering::Acquire);
                let mut new = st;
                if persistent {
                    if st & BBPDELETED != 0 {
                        new = (st & !BBPDELETED) | BBPEXISTING;
                    } else {
                        new |= BBPNEW;
                    }
                    s.lrefs.fetch_add(1, Ordering::AcqRel);
                } else if st & BBPEXISTING != 0 {
                    new = (st & !BBPEXISTING) | BBPDELETED;
                } else {
                    new &= !BBPNEW;
                }
                s.status.store(new, Ordering::Release);
            })?;
            if !persistent {
                self.release(id)?;
            }
            Ok(())
        })();
        self.unfix(id)?;
        res
    }

    /// All ids whose slot currently holds state.
    pub fn ids(&self) -> Vec<BatId> {
        let n = self.size.load(Ordering::Acquire);
        let mut out = Vec::new();
        for id in 1..n {
            let live = self
                .with_slot(id, |s| {
                    s.status.load(Ordering::Acquire) != 0 || s.bat.read().is_some()
                })
                .unwrap_or(false);
            if live {
                out.push(id);
            }
        }
        out
    }

    /// Ids of all currently persistent BATs.
    pub fn persistent_ids(&self) -> Vec<BatId> {
        self.ids()
            .into_iter()
            .filter(|&id| {
                self.status(id)
                    .map(|st| st & BBPPERSISTENT != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Unloads cold, unreferenced BATs: dirty persistent heaps are saved,
    /// clean ones dropped from memory. Returns the number of unloaded BATs.
    pub fn trim(&self) -> usize {
        let mut unloaded = 0;
        for id in self.ids() {
            let can = self
                .with_slot(id, |s| {
                    let st = s.status.load(Ordering::Acquire);
                    if s.refs.load(Ordering::Acquire) == 0
                        && st & BBPLOADED != 0
                        && st & (BBPHOT | BBPWAITING) == 0
                        && st & BBPPERSISTENT != 0
                        && s.meta.lock().desc.is_some()
                    {
                        s.status.fetch_or(BBPUNLOADING, Ordering::AcqRel);
                        true
                    } else {
                        // cold it down for the next pass
                        s.status.fetch_and(!BBPHOT, Ordering::AcqRel);
                        false
                    }
                })
                .unwrap_or(false);
            if !can {
                continue;
            }
            let dirty = self
                .with_slot(id, |s| {
                    s.bat
                        .read()
                        .as_ref()
                        .map(|h| {
                            let b = h.read();
                            b.theap.read().dirty
                                || b.tvheap.as_ref().map_or(false, |v| v.read().dirty)
                        })
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if dirty {
                self.status_clear(id, BBPUNLOADING).ok();
                if self.save_bat(id).is_err() {
                    continue;
                }
                self.status_or(id, BBPUNLOADING).ok();
            }
            let _ = self.with_slot(id, |s| {
                *s.bat.write() = None;
                s.status.fetch_and(!BBPLOADED, Ordering::AcqRel);
            });
            self.status_clear(id, BBPUNLOADING).ok();
            unloaded += 1;
            if debug::enabled(Cat::Bat) {
                debug!("BBPtrim: unloaded bat[{}]", id);
            }
        }
        unloaded
    }

    // ---------------------------------------------------------------
    // Directory file.

    /// Magic of the current directory format (octal, as written).
    pub const DIR_MAGIC: u32 = 0o061044;
    /// Previous accepted magic (tail-heap naming change).
    pub const DIR_MAGIC_PREV: u32 = 0o061043;

    /// Serializes the given records plus housekeeping counters.
    pub(crate) fn format_dir(records: &[DirRecord], logno: u64, transid: u64) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "BBP.dir, GDKversion {:06o} {} {}\n",
            Bbp::DIR_MAGIC,
            logno,
            transid
        ));
        for r in records {
            let options = if r.options.is_empty() { "-" } else { &r.options };
            out.push_str(&format!(
                "{} {} {} {} {} {} {} {} {} {} {} {} {}\n",
                r.id,
                r.name,
                r.physical,
                options,
                r.role,
                r.count,
                r.capacity,
                r.tail_free,
                r.vheap_free,
                r.props,
                r.type_id,
                r.hseq,
                r.tseq
            ));
        }
        out
    }

    /// Parses a directory file. Accepts the current and the previous magic.
    pub(crate) fn parse_dir(text: &str) -> Result<(Vec<DirRecord>, u64, u64)> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| Error::corrupt("BBP.dir", "empty file"))?;
        let mut hp = header.split_whitespace();
        if hp.next() != Some("BBP.dir,") || hp.next() != Some("GDKversion") {
            return Err(Error::corrupt("BBP.dir", "bad header"));
        }
        let magic = hp
            .next()
            .and_then(|m| u32::from_str_radix(m, 8).ok())
            .ok_or_else(|| Error::corrupt("BBP.dir", "bad magic"))?;
        if magic != Bbp::DIR_MAGIC && magic != Bbp::DIR_MAGIC_PREV {
            return Err(Error::corrupt(
                "BBP.dir",
                format!("unsupported version {:06o}", magic),
            ));
        }
        let logno: u64 = hp.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let transid: u64 = hp.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let mut records = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() != 13 {
                return Err(Error::corrupt(
                    "BBP.dir",
                    format!("bad record: {:?}", line),
                ));
            }
            let parse_err = |what: &str| Error::corrupt("BBP.dir", format!("bad {}: {:?}", what, line));
            records.push(DirRecord {
                id: f[0].parse().map_err(|_| parse_err("id"))?,
                name: f[1].to_string(),
                physical: f[2].to_string(),
                options: if f[3] == "-" { String::new() } else { f[3].to_string() },
                role: f[4].parse().map_err(|_| parse_err("role"))?,
                count: f[5].parse().map_err(|_| parse_err("count"))?,
                capacity: f[6].parse().map_err(|_| parse_err("capacity"))?,
                tail_free: f[7].parse().map_err(|_| parse_err("tail bytes"))?,
                vheap_free: f[8].parse().map_err(|_| parse_err("vheap bytes"))?,
                props: f[9].parse().map_err(|_| parse_err("props"))?,
                type_id: f[10].parse().map_err(|_| parse_err("type"))?,
                hseq: f[11].parse().map_err(|_| parse_err("hseq"))?,
                tseq: f[12].parse().map_err(|_| parse_err("tseq"))?,
            });
        }
        Ok((records, logno, transid))
    }

    /// Seeds slots from parsed directory records (engine startup).
    pub(crate) fn adopt_records(&self, records: Vec<DirRecord>, logno: u64, transid: u64) -> Result<()> {
        self.logno.store(logno, Ordering::Relaxed);
        self.transid.store(transid, Ordering::Relaxed);
        let mut names = self.names.lock();
        for rec in records {
            let id = rec.id;
            if id <= 0 {
                return Err(Error::corrupt("BBP.dir", format!("bad id {}", id)));
            }
            self.ensure_page(id);
            // keep the id allocator past every adopted id
            loop {
                let cur = self.size.load(Ordering::Relaxed);
                if cur > id {
                    break;
                }
                if self
                    .size
                    .compare_exchange(cur, id + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            self.with_slot(id, |s| {
                s.refs.store(0, Ordering::Relaxed);
                s.lrefs.store(1, Ordering::Relaxed); // the directory's reference
                s.status.store(BBPEXISTING, Ordering::Relaxed);
                let mut m = s.meta.lock();
                m.name = rec.name.clone();
                m.physical = rec.physical.clone();
                m.options = rec.options.clone();
                m.desc = Some(rec.clone());
            })?;
            names.insert(rec.name.clone(), id);
        }
        Ok(())
    }

    /// Directory records for the current persistent set: live descriptors
    /// where loaded and saved, stored records otherwise.
    pub(crate) fn current_records(&self, refreshed: Option<&[BatId]>) -> Result<Vec<DirRecord>> {
        let mut out = Vec::new();
        for id in self.persistent_ids() {
            let use_live = refreshed.map_or(true, |ids| ids.contains(&id));
            let rec = self.with_slot(id, |s| {
                let m = s.meta.lock();
                if !use_live {
                    return m.desc.clone();
                }
                drop(m);
                if let Some(h) = s.bat.read().as_ref() {
                    let b = h.read();
                    let m = s.meta.lock();
                    Some(self.record_from(&b, &m.name, &m.options))
                } else {
                    s.meta.lock().desc.clone()
                }
            })?;
            match rec {
                Some(r) => out.push(r),
                None => {
                    return Err(Error::corrupt(
                        "bbp",
                        format!("persistent bat[{}] has no descriptor", id),
                    ))
                }
            }
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool() -> Bbp {
        Bbp::transient(Settings::default())
    }

    #[test]
    fn ids_grow_and_recycle_lifo() {
        let p = pool();
        let b1 = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        let id1 = b1.read().cacheid;
        let b2 = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        let id2 = b2.read().cacheid;
        assert!(id1 >= 1 && id2 == id1 + 1);
        drop(b1);
        p.unfix(id1).unwrap();
        p.release(id1).unwrap();
        // the freed slot is reused first
        let b3 = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        assert_eq!(b3.read().cacheid, id1);
    }

    #[test]
    fn names_are_unique() {
        let p = pool();
        let b1 = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        let b2 = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        let (id1, id2) = (b1.read().cacheid, b2.read().cacheid);
        p.rename(id1, "orders").unwrap();
        assert!(matches!(
            p.rename(id2, "orders"),
            Err(Error::NameAlreadyInUse(_))
        ));
        assert!(matches!(
            p.rename(id2, "no/slash"),
            Err(Error::IllegalName(_))
        ));
        let long = "x".repeat(200);
        assert!(matches!(p.rename(id2, &long), Err(Error::NameTooLong(_))));
        assert_eq!(p.lookup("orders"), Some(id1));
        assert_eq!(p.logical(id1).unwrap(), "orders");
    }

    #[test]
    fn refcounts_drive_destruction() {
        let p = pool();
        let b = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        let id = b.read().cacheid;
        assert_eq!(p.refcounts(id).unwrap(), (1, 1));
        p.fix(id).unwrap();
        assert_eq!(p.refcounts(id).unwrap(), (2, 1));
        p.unfix(id).unwrap();
        drop(b);
        p.unfix(id).unwrap();
        // still logically alive
        assert!(p.status(id).unwrap() & BBPLOADED != 0);
        p.release(id).unwrap();
        assert!(matches!(p.descriptor(id), Err(Error::NoSuchBat(_))));
    }

    #[test]
    fn share_counts() {
        let p = pool();
        let b = p.new_bat(0, AtomType::Str, 0, Role::Transient).unwrap();
        let id = b.read().cacheid;
        p.share(id).unwrap();
        assert_eq!(p.share_count(id).unwrap(), 1);
        p.unshare(id).unwrap();
        assert_eq!(p.share_count(id).unwrap(), 0);
    }

    #[test]
    fn slices_are_registered_views() {
        let p = pool();
        let b = p.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        {
            let mut g = b.write();
            for i in 0..5 {
                g.append(&Value::Int(i)).unwrap();
            }
        }
        let v = {
            let g = b.read();
            p.slice(&g, 1, 4).unwrap()
        };
        let vg = v.read();
        assert!(vg.is_view());
        assert_eq!(vg.count(), 3);
        assert_eq!(vg.value(0).unwrap(), Value::Int(1));
        let parent = b.read();
        assert_eq!(Arc::strong_count(&parent.theap), 2);
        assert_eq!(p.share_count(parent.cacheid).unwrap(), 1);
    }

    #[test]
    fn dir_format_round_trip() {
        let p = pool();
        let b = p.new_bat(7, AtomType::Int, 0, Role::Transient).unwrap();
        {
            let mut g = b.write();
            for i in 0..3 {
                g.append(&Value::Int(i)).unwrap();
            }
        }
        let g = b.read();
        let rec = p.record_from(&g, "testbat", "");
        let text = Bbp::format_dir(&[rec.clone()], 42, 7);
        let (records, logno, transid) = Bbp::parse_dir(&text).unwrap();
        assert_eq!(logno, 42);
        assert_eq!(transid, 7);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, rec.id);
        assert_eq!(r.name, "testbat");
        assert_eq!(r.count, 3);
        assert_eq!(r.tail_free, 12);
        assert_eq!(r.type_id, AtomType::Int.id());
    }

    #[test]
    fn dir_rejects_old_magic() {
        let text = "BBP.dir, GDKversion 061042 0 0\n";
        assert!(Bbp::parse_dir(text).is_err());
        let text = "BBP.dir, GDKversion 061043 0 0\n";
        assert!(Bbp::parse_dir(text).is_ok());
    }
}
