//! Heaps: contiguous typed byte regions, malloc'd or file-backed.
//!
//! A heap is the backing store of a BAT column (and of hash indexes). It can
//! live in process memory or be a mapping of its backing file; the desired
//! mode after the next resize is tracked separately so a heap can migrate
//! between representations as it grows or becomes read-only.
//!
//! Heaps are shared by reference count ([`SharedHeap`]): view BATs and
//! projection results alias the heap of their parent BAT. Dropping the last
//! reference releases memory and, when the `remove` flag is set, unlinks the
//! backing file.

// the mapping calls are the one place the engine crosses the unsafe line
#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::debug::{self, Cat};
use crate::types::BatId;
use crate::{Error, Result};

/// Granularity used when rounding file-backed heap sizes.
pub(crate) const PAGE_SIZE: usize = 4096;

/// A heap shared between BATs by reference count.
pub type SharedHeap = Arc<RwLock<Heap>>;

/// How the bytes of a heap are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Process memory.
    Mem,
    /// Shared file-backed mapping; stores propagate to the file.
    Mmap,
    /// Copy-on-write private mapping of the backing file.
    Priv,
    /// Bytes owned by someone else (never freed or saved here).
    Ext,
    /// Like `Mmap` but the filename is an absolute path outside the farm.
    Abs,
}

#[derive(Debug)]
enum HeapBuf {
    None,
    Mem(Vec<u8>),
    Map { map: MmapMut, file: File },
    MapRo { map: Mmap },
}

/// A contiguous byte region with a logical end (`free`) and an allocated
/// capacity (`size`); `free <= size` always holds.
#[derive(Debug)]
pub struct Heap {
    buf: HeapBuf,
    free: usize,
    size: usize,
    mode: StorageMode,
    /// Desired storage mode after the next resize.
    pub(crate) newmode: StorageMode,
    /// Storage root this heap's file belongs to.
    pub(crate) farmid: u32,
    /// Id of the BAT that owns this heap; differs from the reader's own id
    /// for views and shared variable heaps.
    pub(crate) parentid: BatId,
    /// File name relative to the farm's BAT directory, e.g. `0a/01/010a.tail`.
    pub(crate) filename: String,
    /// Absolute path of the backing file, when one is configured.
    path: Option<PathBuf>,
    /// Unsaved modifications exist.
    pub(crate) dirty: bool,
    /// Unlink the backing file when the last reference goes away.
    pub(crate) remove: bool,
    /// Offset of the free-list head slot; `usize::MAX` when the heap is not
    /// used as a block allocator. Re-established after load by `fl_attach`.
    fl_head: usize,
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

impl Heap {
    /// Creates an empty in-memory heap.
    pub fn new(farmid: u32, parentid: BatId, filename: String) -> Heap {
        Heap {
            buf: HeapBuf::None,
            free: 0,
            size: 0,
            mode: StorageMode::Mem,
            newmode: StorageMode::Mem,
            farmid,
            parentid,
            filename,
            path: None,
            dirty: false,
            remove: false,
            fl_head: usize::MAX,
        }
    }

    /// Wraps a heap in the shared reference-counted handle.
    pub fn into_shared(self) -> SharedHeap {
        Arc::new(RwLock::new(self))
    }

    /// Configures the absolute backing-file path. Required before the heap
    /// can switch to a file-backed mode or be saved.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// The absolute backing-file path, if configured.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Logical end of live bytes.
    pub fn free(&self) -> usize {
        self.free
    }

    /// Allocated capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current storage mode.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Moves the logical end. `new_free` must not exceed `size`.
    pub fn set_free(&mut self, new_free: usize) {
        assert!(new_free <= self.size);
        self.free = new_free;
        self.dirty = true;
    }

    /// The live bytes `[0, free)`.
    pub fn base(&self) -> &[u8] {
        &self.all_bytes()[..self.free]
    }

    /// All allocated bytes `[0, size)`.
    pub fn all_bytes(&self) -> &[u8] {
        match &self.buf {
            HeapBuf::None => &[],
            HeapBuf::Mem(v) => &v[..],
            HeapBuf::Map { map, .. } => &map[..],
            HeapBuf::MapRo { map } => &map[..],
        }
    }

    /// Mutable view of all allocated bytes.
    pub fn all_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            HeapBuf::None => &mut [],
            HeapBuf::Mem(v) => &mut v[..],
            HeapBuf::Map { map, .. } => &mut map[..],
            HeapBuf::MapRo { .. } => panic!("write access to read-only heap mapping"),
        }
    }

    pub(crate) fn read_u64_at(&self, off: usize) -> u64 {
        let b = self.all_bytes();
        let mut a = [0u8; 8];
        a.copy_from_slice(&b[off..off + 8]);
        u64::from_le_bytes(a)
    }

    pub(crate) fn write_u64_at(&mut self, off: usize, v: u64) {
        self.all_bytes_mut()[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Grows the heap to at least `newsize` bytes, switching to the desired
    /// storage mode when a backing file is configured. All previously derived
    /// pointers and slices into the heap are invalidated.
    pub fn extend(&mut self, newsize: usize) -> Result<()> {
        let newsize = round_up(newsize.max(1), 8);
        if newsize <= self.size {
            return Ok(());
        }
        let want_map = self.path.is_some()
            && matches!(self.newmode, StorageMode::Mmap | StorageMode::Abs | StorageMode::Priv);
        if debug::enabled(Cat::Heap) {
            debug!(
                "HEAPextend: {} {} -> {} bytes ({})",
                self.filename,
                self.size,
                newsize,
                if want_map { "map" } else { "mem" }
            );
        }
        if want_map {
            let newsize = round_up(newsize, PAGE_SIZE);
            let path = self.path.clone().unwrap();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(newsize as u64)?;
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            // carry over bytes when migrating from process memory
            if let HeapBuf::Mem(old) = &self.buf {
                map[..old.len().min(newsize)].copy_from_slice(&old[..old.len().min(newsize)]);
            }
            self.buf = HeapBuf::Map { map, file };
            self.mode = StorageMode::Mmap;
            self.size = newsize;
        } else {
            match &mut self.buf {
                HeapBuf::Mem(v) => v.resize(newsize, 0),
                HeapBuf::None => self.buf = HeapBuf::Mem(vec![0; newsize]),
                HeapBuf::Map { .. } | HeapBuf::MapRo { .. } => {
                    // growing a mapped heap without a file path: fall back to
                    // a private memory copy
                    let mut v = vec![0; newsize];
                    v[..self.size].copy_from_slice(self.all_bytes());
                    self.buf = HeapBuf::Mem(v);
                    self.mode = StorageMode::Mem;
                }
            }
            self.size = newsize;
        }
        Ok(())
    }

    /// Writes the live bytes to the backing file. For mapped heaps this is a
    /// sync of the mapping; for memory heaps the file is rewritten. A save
    /// failure removes the partial file so no corrupt image is left behind.
    pub fn save(&mut self, dosync: bool) -> Result<()> {
        let dosync = dosync && !debug::enabled(Cat::NoSync);
        let path = match &self.path {
            Some(p) => p.clone(),
            None => {
                return Err(Error::corrupt(
                    self.filename.clone(),
                    "heap has no backing file",
                ))
            }
        };
        if debug::enabled(Cat::Io) {
            debug!("HEAPsave: {} {} bytes", self.filename, self.free);
        }
        match &self.buf {
            // shared mappings write through; a sync of the mapping is the save
            HeapBuf::Map { map, .. }
                if matches!(self.mode, StorageMode::Mmap | StorageMode::Abs) =>
            {
                if dosync {
                    map.flush()?;
                }
            }
            _ => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                // write a fresh file and move it into place: an interrupted
                // save leaves the previous image untouched, and backups that
                // alias the old inode stay intact
                let tmp = path.with_extension(format!(
                    "{}.new",
                    path.extension().and_then(|e| e.to_str()).unwrap_or("")
                ));
                let res = (|| -> Result<()> {
                    let mut f = File::create(&tmp)?;
                    f.write_all(&self.all_bytes()[..self.free])?;
                    if dosync {
                        f.sync_data()?;
                    }
                    std::fs::rename(&tmp, &path)?;
                    Ok(())
                })();
                if let Err(e) = res {
                    error!("HEAPsave failed for {}: {}", self.filename, e);
                    let _ = std::fs::remove_file(&tmp);
                    return Err(e);
                }
            }
        }
        self.dirty = false;
        Ok(())
    }

    /// Loads `free` bytes from the backing file into a heap of at least that
    /// size (rounded up to the page size for mapped modes).
    pub fn load(&mut self, free: usize, mode: StorageMode) -> Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => {
                return Err(Error::corrupt(
                    self.filename.clone(),
                    "heap has no backing file",
                ))
            }
        };
        if debug::enabled(Cat::Io) {
            debug!("HEAPload: {} {} bytes mode {:?}", self.filename, free, mode);
        }
        match mode {
            StorageMode::Mem => {
                let maxsize = round_up(free.max(1), PAGE_SIZE);
                let mut v = vec![0u8; maxsize];
                let mut f = File::open(&path)?;
                f.read_exact(&mut v[..free])?;
                self.buf = HeapBuf::Mem(v);
                self.size = maxsize;
            }
            StorageMode::Mmap | StorageMode::Abs => {
                let size = round_up(free.max(1), PAGE_SIZE);
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                if (file.metadata()?.len() as usize) < size {
                    file.set_len(size as u64)?;
                }
                let map = unsafe { MmapMut::map_mut(&file)? };
                self.buf = HeapBuf::Map { map, file };
                self.size = size;
            }
            StorageMode::Priv => {
                let file = File::open(&path)?;
                let size = round_up(free.max(1), PAGE_SIZE);
                if (file.metadata()?.len() as usize) < free {
                    return Err(Error::corrupt(
                        self.filename.clone(),
                        "backing file shorter than heap",
                    ));
                }
                let map = unsafe { MmapOptions::new().len(size.min(file.metadata()?.len() as usize)).map_copy(&file)? };
                self.size = map.len();
                self.buf = HeapBuf::Map { map, file };
            }
            StorageMode::Ext => {
                return Err(Error::corrupt(self.filename.clone(), "cannot load ext heap"))
            }
        }
        self.mode = mode;
        self.free = free;
        self.dirty = false;
        Ok(())
    }

    /// Maps the backing file read-only (used for hash indexes of persistent
    /// BATs).
    pub fn load_readonly(&mut self, free: usize) -> Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => {
                return Err(Error::corrupt(
                    self.filename.clone(),
                    "heap has no backing file",
                ))
            }
        };
        let file = File::open(&path)?;
        if (file.metadata()?.len() as usize) < free {
            return Err(Error::corrupt(
                self.filename.clone(),
                "backing file shorter than heap",
            ));
        }
        let map = unsafe { Mmap::map(&file)? };
        self.size = map.len();
        self.buf = HeapBuf::MapRo { map };
        self.mode = StorageMode::Mmap;
        self.free = free;
        self.dirty = false;
        Ok(())
    }

    /// Drops the in-memory image, keeping the descriptor fields. The heap can
    /// be reloaded from its backing file later.
    pub fn unload(&mut self) {
        self.buf = HeapBuf::None;
        self.size = 0;
        self.free = 0;
    }

    /// True when the heap currently holds bytes in memory.
    pub fn is_resident(&self) -> bool {
        !matches!(self.buf, HeapBuf::None)
    }

    // ------------------------------------------------------------------
    // Block allocator.
    //
    // Layout: [0, private) is a reserved prefix never handed out (the string
    // dictionary lives there). At `private` sits an 8-byte head slot holding
    // the offset of the first free block (0 for none). Every block starts
    // with an 8-byte size header followed by the payload; free blocks keep
    // the offset of the next free block in the first payload word. The free
    // list is threaded through the heap bytes themselves, so it survives a
    // save/load cycle unchanged.

    /// Initializes the heap as a block allocator with `bytes` total bytes, a
    /// reserved prefix of `private` bytes, and the given payload alignment
    /// (at most 8; all blocks are 8-aligned).
    pub fn fl_init(&mut self, bytes: usize, private: usize, align: usize) -> Result<()> {
        assert!(align <= 8 && 8 % align.max(1) == 0);
        let private = round_up(private, 8);
        let head = private;
        let first = head + 8;
        self.extend(round_up(bytes.max(first + 24), 8))?;
        let total = self.size;
        self.write_u64_at(head, first as u64);
        // seed one free block spanning the rest of the heap
        self.write_u64_at(first, (total - first) as u64);
        self.write_u64_at(first + 8, 0);
        self.free = total;
        self.fl_head = head;
        self.dirty = true;
        Ok(())
    }

    /// Re-establishes allocator bookkeeping after a load, given the reserved
    /// prefix size used at init time.
    pub fn fl_attach(&mut self, private: usize) {
        self.fl_head = round_up(private, 8);
    }

    /// Allocates a block of at least `nbytes` payload bytes and returns the
    /// payload offset. Extends the heap (doubling, page-rounded) when the
    /// free list is exhausted.
    pub fn fl_alloc(&mut self, nbytes: usize) -> Result<usize> {
        assert!(self.fl_head != usize::MAX, "allocator not initialized");
        let need = round_up(nbytes.max(8), 8) + 8;
        loop {
            let mut prev = self.fl_head;
            let mut cur = self.read_u64_at(self.fl_head) as usize;
            while cur != 0 {
                let bsize = self.read_u64_at(cur) as usize;
                let next = self.read_u64_at(cur + 8) as usize;
                if bsize >= need {
                    if bsize - need >= 24 {
                        // split off the remainder as a new free block
                        let rem = cur + need;
                        self.write_u64_at(cur, need as u64);
                        self.write_u64_at(rem, (bsize - need) as u64);
                        self.write_u64_at(rem + 8, next as u64);
                        self.write_u64_at(prev, rem as u64);
                    } else {
                        self.write_u64_at(prev, next as u64);
                    }
                    self.dirty = true;
                    return Ok(cur + 8);
                }
                prev = cur + 8;
                cur = next;
            }
            // exhausted: grow and thread the new region as a free block
            let old = self.size;
            let grown = round_up((old * 2).max(old + need).max(PAGE_SIZE), PAGE_SIZE);
            self.extend(grown)?;
            self.free = self.size;
            let region = self.size - old;
            self.write_u64_at(old, region as u64);
            self.write_u64_at(old + 8, 0);
            self.fl_dealloc_block(old);
        }
    }

    /// Returns a block (by payload offset) to the free list, coalescing with
    /// adjacent free blocks.
    pub fn fl_free(&mut self, payload_off: usize) {
        assert!(self.fl_head != usize::MAX, "allocator not initialized");
        self.fl_dealloc_block(payload_off - 8);
        self.dirty = true;
    }

    fn fl_dealloc_block(&mut self, block: usize) {
        let bsize = self.read_u64_at(block) as usize;
        // find insertion point, list is sorted by offset
        let mut prev = self.fl_head;
        let mut cur = self.read_u64_at(self.fl_head) as usize;
        while cur != 0 && cur < block {
            prev = cur + 8;
            cur = self.read_u64_at(cur + 8) as usize;
        }
        let mut start = block;
        let mut size = bsize;
        // coalesce with successor
        if cur != 0 && block + bsize == cur {
            size += self.read_u64_at(cur) as usize;
            let after = self.read_u64_at(cur + 8);
            self.write_u64_at(block + 8, after);
        } else {
            self.write_u64_at(block + 8, cur as u64);
        }
        // coalesce with predecessor
        if prev != self.fl_head {
            let pblock = prev - 8;
            let psize = self.read_u64_at(pblock) as usize;
            if pblock + psize == block {
                start = pblock;
                size += psize;
                let after = self.read_u64_at(block + 8);
                self.write_u64_at(pblock + 8, after);
            } else {
                self.write_u64_at(prev, block as u64);
            }
        } else {
            self.write_u64_at(prev, block as u64);
        }
        self.write_u64_at(start, size as u64);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.remove {
            if let Some(path) = &self.path {
                if debug::enabled(Cat::Heap) {
                    debug!("unlinking heap file {}", path.display());
                }
                // unmap before unlink
                self.buf = HeapBuf::None;
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_heap() -> Heap {
        Heap::new(0, 1, "00/01/1.theap".to_string())
    }

    #[test]
    fn extend_grows_and_zeroes() {
        let mut h = mem_heap();
        h.extend(100).unwrap();
        assert!(h.size() >= 100);
        assert!(h.all_bytes().iter().all(|&b| b == 0));
        h.all_bytes_mut()[0] = 7;
        h.extend(5000).unwrap();
        assert_eq!(h.all_bytes()[0], 7);
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut h = mem_heap();
        h.fl_init(4096, 64, 8).unwrap();
        let a = h.fl_alloc(10).unwrap();
        let b = h.fl_alloc(100).unwrap();
        assert!(a % 8 == 0 && b % 8 == 0);
        assert!(a >= 64 + 8);
        assert_ne!(a, b);
        h.fl_free(a);
        let c = h.fl_alloc(10).unwrap();
        // freed block is reused
        assert_eq!(c, a);
        h.fl_free(b);
        h.fl_free(c);
        // everything coalesced: a big block is available again
        let big = h.fl_alloc(2048).unwrap();
        assert_eq!(big, a);
    }

    #[test]
    fn alloc_grows_when_exhausted() {
        let mut h = mem_heap();
        h.fl_init(256, 0, 8).unwrap();
        let mut offs = Vec::new();
        for _ in 0..100 {
            offs.push(h.fl_alloc(64).unwrap());
        }
        offs.sort_unstable();
        offs.dedup();
        assert_eq!(offs.len(), 100);
        assert!(h.size() >= 100 * 72);
    }

    #[test]
    fn save_load_mem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.tail");
        let mut h = mem_heap();
        h.set_path(path.clone());
        h.extend(64).unwrap();
        h.all_bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        h.set_free(64);
        h.save(true).unwrap();

        let mut g = mem_heap();
        g.set_path(path);
        g.load(64, StorageMode::Mem).unwrap();
        assert_eq!(&g.base()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn save_load_mmap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.tail");
        let mut h = mem_heap();
        h.set_path(path.clone());
        h.newmode = StorageMode::Mmap;
        h.extend(PAGE_SIZE).unwrap();
        assert_eq!(h.mode(), StorageMode::Mmap);
        h.all_bytes_mut()[10] = 42;
        h.set_free(16);
        h.save(true).unwrap();

        let mut g = mem_heap();
        g.set_path(path);
        g.load(16, StorageMode::Mmap).unwrap();
        assert_eq!(g.base()[10], 42);
    }

    #[test]
    fn remove_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z.tail");
        let mut h = mem_heap();
        h.set_path(path.clone());
        h.extend(16).unwrap();
        h.set_free(16);
        h.save(true).unwrap();
        assert!(path.exists());
        h.remove = true;
        drop(h);
        assert!(!path.exists());
    }

    #[test]
    fn free_list_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fl.theap");
        let mut h = mem_heap();
        h.set_path(path.clone());
        h.fl_init(1024, 64, 8).unwrap();
        let a = h.fl_alloc(24).unwrap();
        let _b = h.fl_alloc(24).unwrap();
        h.fl_free(a);
        let free = h.free();
        h.save(true).unwrap();

        let mut g = mem_heap();
        g.set_path(path);
        g.load(free, StorageMode::Mem).unwrap();
        g.fl_attach(64);
        // the hole left by `a` is found again
        assert_eq!(g.fl_alloc(24).unwrap(), a);
    }
}
