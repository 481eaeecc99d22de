//! The transaction manager: atomic whole-farm checkpoints.
//!
//! A commit makes the current persistent set durable in five steps:
//!
//! 1. every dirty persistent BAT moves its previous on-disk files into
//!    `BACKUP/` and writes fresh heap files, fsynced;
//! 2. a new directory `BBP.dir.new` describing the committed state is
//!    written and fsynced;
//! 3. the containing directory is fsynced;
//! 4. `BBP.dir.new` is atomically renamed over `BBP.dir`;
//! 5. `BACKUP/` and `DELETE_ME/` are cleared (best effort — their contents
//!    trigger recovery, respectively deferred deletion, on the next start).
//!
//! A crash after step 4 needs no repair; a crash before it is undone at the
//! next start by moving the `BACKUP/` files back over their live
//! counterparts. Sub-commits stage into `BACKUP/SUBCOMMIT/` so recovery can
//! distinguish partial work.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::bat::Role;
use crate::bbp::{Bbp, BBPDELETED, BBPEXISTING, BBPNEW, BBPRENAMED, BBPSYNCING};
use crate::debug::{self, Cat};
use crate::farm::Farm;
use crate::types::{BatId, Bun};
use crate::{Error, Result};

/// File extensions a BAT may own on disk.
const HEAP_EXTS: [&str; 4] = [".tail", ".theap", ".thashl", ".thashb"];

/// Moves the existing on-disk files of `physical` into `dest_root`,
/// preserving the two-level directory layout. Missing files are fine; a BAT
/// committed for the first time has nothing to back up.
fn stage_backup(farm: &Farm, dest_root: &Path, physical: &str) -> Result<()> {
    for ext in HEAP_EXTS.iter() {
        let rel = format!("{}{}", physical, ext);
        let src = farm.filepath(&rel);
        if !src.exists() {
            continue;
        }
        let dst = dest_root.join(&rel);
        if dst.exists() {
            // an older backup of the same file wins: it is closer to the
            // last committed state
            fs::remove_file(&src)?;
            continue;
        }
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::rename(&src, &dst)?;
        if debug::enabled(Cat::Io) {
            debug!("TM: staged backup of {}", rel);
        }
    }
    Ok(())
}

/// Recursively moves every file under `src` to the same relative location
/// under `dst`, overwriting. Used to reinstate backups.
fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let p = entry.path();
        let target = dst.join(entry.file_name());
        if p.is_dir() {
            fs::create_dir_all(&target)?;
            move_tree(&p, &target)?;
            let _ = fs::remove_dir(&p);
        } else {
            if target.exists() {
                fs::remove_file(&target)?;
            }
            fs::rename(&p, &target)?;
        }
    }
    Ok(())
}

/// Removes every file under `dir`, keeping the directory itself (and
/// `keep`, when given, as an untouched subdirectory).
fn clear_tree(dir: &Path, keep: Option<&str>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() {
            if keep == p.file_name().and_then(|n| n.to_str()) {
                continue;
            }
            clear_tree(&p, None);
            let _ = fs::remove_dir(&p);
        } else {
            let _ = fs::remove_file(&p);
        }
    }
}

fn dir_is_empty(dir: &Path, ignore: Option<&str>) -> bool {
    match fs::read_dir(dir) {
        Ok(entries) => entries.flatten().all(|e| {
            ignore == e.file_name().to_str().as_deref()
                && e.path().is_dir()
                && dir_is_empty(&e.path(), None)
        }),
        Err(_) => true,
    }
}

fn write_dir_file(farm: &Farm, text: &str, dosync: bool) -> Result<()> {
    let new = farm.dir_file_new();
    {
        let mut f = fs::File::create(&new)?;
        f.write_all(text.as_bytes())?;
        if dosync {
            f.sync_data()?;
        }
    }
    if dosync {
        farm.sync_dir()?;
    }
    fs::rename(&new, farm.dir_file())?;
    if dosync {
        farm.sync_dir()?;
    }
    Ok(())
}

fn save_dirty(bbp: &Bbp, farm: &Farm, id: BatId) -> Result<bool> {
    if bbp.status(id)? & crate::bbp::BBPLOADED == 0 {
        // unloaded bats have no unsaved changes
        return Ok(false);
    }
    let handle = bbp.descriptor(id)?;
    let (needs, physical) = {
        let b = handle.read();
        let dirty = b.dirty_desc
            || !b.copied_to_disk
            || !b.dirty_flushed
            || b.theap.read().dirty
            || b.tvheap.as_ref().map_or(false, |vh| vh.read().dirty);
        (dirty, crate::farm::physical_of(id))
    };
    if !needs {
        bbp.unfix(id)?;
        return Ok(false);
    }
    bbp.status_or(id, BBPSYNCING)?;
    let res = (|| {
        stage_backup(farm, &farm.backup_dir(), &physical)?;
        bbp.save_bat(id)
    })();
    bbp.status_clear(id, BBPSYNCING)?;
    bbp.unfix(id)?;
    res?;
    Ok(true)
}

/// Commits the whole persistent set of the pool's farm. On success the
/// on-disk state equals the in-memory state at the time of the call; on
/// failure the last committed state remains authoritative.
pub fn commit(bbp: &Bbp) -> Result<()> {
    let farm = bbp
        .farm_for(Role::Persistent)
        .ok_or_else(|| Error::corrupt("tm", "no persistent farm configured"))?;
    let sync = bbp.settings.sync_on_commit;
    let ids = bbp.persistent_ids();
    if debug::enabled(Cat::Delta) {
        debug!("TMcommit: {} persistent bats", ids.len());
    }
    // step 1: heaps first, with backups
    for &id in &ids {
        save_dirty(bbp, farm, id)?;
    }
    // bats leaving the persistent set: their files join the backup so a
    // crash before the directory swap can still restore them
    let mut deleted = Vec::new();
    for id in bbp.ids() {
        if bbp.status(id)? & BBPDELETED != 0 {
            deleted.push(id);
        }
    }
    for &id in &deleted {
        stage_backup(farm, &farm.backup_dir(), &crate::farm::physical_of(id))?;
    }
    // steps 2..4: the new directory becomes authoritative
    let logno = bbp.logno.load(Ordering::Relaxed) + 1;
    let transid = bbp.transid.load(Ordering::Relaxed) + 1;
    let records = bbp.current_records(None)?;
    write_dir_file(farm, &Bbp::format_dir(&records, logno, transid), sync)?;
    bbp.logno.store(logno, Ordering::Relaxed);
    bbp.transid.store(transid, Ordering::Relaxed);
    // step 5: the commit is durable; deleted files graduate from the backup
    // to the deferred-deletion area, then both safety nets are emptied
    for &id in &deleted {
        let physical = crate::farm::physical_of(id);
        for ext in HEAP_EXTS.iter() {
            let rel = format!("{}{}", physical, ext);
            let staged = farm.backup_dir().join(&rel);
            if staged.exists() {
                let flat = rel.replace('/', "_");
                let _ = fs::rename(&staged, farm.delete_dir().join(flat));
            }
        }
    }
    clear_tree(&farm.backup_dir(), Some("SUBCOMMIT"));
    clear_tree(&farm.delete_dir(), None);
    for &id in &ids {
        finalize_slot(bbp, id)?;
    }
    for &id in &deleted {
        bbp.status_clear(id, BBPDELETED)?;
        bbp.sweep(id)?;
    }
    Ok(())
}

fn finalize_slot(bbp: &Bbp, id: BatId) -> Result<()> {
    let st = bbp.status(id)?;
    if st & BBPNEW != 0 {
        bbp.status_clear(id, BBPNEW)?;
        bbp.status_or(id, BBPEXISTING)?;
    }
    bbp.commit_rename(id)?;
    if st & crate::bbp::BBPLOADED != 0 {
        if let Ok(handle) = bbp.descriptor(id) {
            handle.write().commit_delta();
            bbp.unfix(id)?;
        }
    }
    Ok(())
}

/// Commits only the listed BATs, each clamped to an intended size, with an
/// explicitly supplied `(logno, transid)` pair. All other persistent BATs
/// keep their previous on-disk state.
pub fn subcommit_list(
    bbp: &Bbp,
    list: &[(BatId, Bun)],
    logno: u64,
    transid: u64,
) -> Result<()> {
    let farm = bbp
        .farm_for(Role::Persistent)
        .ok_or_else(|| Error::corrupt("tm", "no persistent farm configured"))?;
    let sync = bbp.settings.sync_on_commit;
    let ids: Vec<BatId> = list.iter().map(|&(id, _)| id).collect();
    if debug::enabled(Cat::Delta) {
        debug!("TMsubcommit: {} bats, logno {}", ids.len(), logno);
    }
    for &(id, size) in list {
        {
            let handle = bbp.descriptor(id)?;
            {
                let mut b = handle.write();
                if size < b.count() {
                    // the caller vouches only for a prefix
                    b.count = size;
                    b.inserted = b.inserted.min(size);
                }
            }
            bbp.unfix(id)?;
        }
        bbp.status_or(id, BBPSYNCING)?;
        let physical = crate::farm::physical_of(id);
        let res = (|| {
            stage_backup(farm, &farm.subcommit_dir(), &physical)?;
            bbp.save_bat(id)
        })();
        bbp.status_clear(id, BBPSYNCING)?;
        res?;
    }
    let records = bbp.current_records(Some(&ids))?;
    write_dir_file(farm, &Bbp::format_dir(&records, logno, transid), sync)?;
    bbp.logno.store(logno, Ordering::Relaxed);
    bbp.transid.store(transid, Ordering::Relaxed);
    clear_tree(&farm.subcommit_dir(), None);
    for &id in &ids {
        finalize_slot(bbp, id)?;
    }
    Ok(())
}

/// Undoes uncommitted appends on every loaded persistent BAT. Not reliable
/// after a *failed* commit: the backup directory, reinstated at the next
/// start, is the authoritative undo there.
pub fn abort(bbp: &Bbp) {
    for id in bbp.persistent_ids() {
        let st = match bbp.status(id) {
            Ok(st) => st,
            Err(_) => continue,
        };
        if st & BBPRENAMED != 0 {
            let _ = bbp.rollback_rename(id);
        }
        if st & crate::bbp::BBPLOADED == 0 {
            continue;
        }
        if let Ok(handle) = bbp.descriptor(id) {
            handle.write().abort_delta();
            let _ = bbp.unfix(id);
        }
    }
}

/// Start-of-life repair: reinstates staged backups and discards an
/// unfinished directory swap. Runs before the directory file is read.
pub fn recover(farm: &Farm) -> Result<()> {
    let new = farm.dir_file_new();
    if new.exists() {
        // the rename never happened, the commit did not take place
        warn!("TM: discarding unfinished {}", new.display());
        fs::remove_file(&new)?;
    }
    let sub = farm.subcommit_dir();
    if !dir_is_empty(&sub, None) {
        warn!("TM: recovering sub-commit backup");
        move_tree(&sub, &farm.bat_dir())?;
    }
    let backup = farm.backup_dir();
    if !dir_is_empty(&backup, Some("SUBCOMMIT")) {
        warn!("TM: recovering commit backup");
        // don't drag SUBCOMMIT along; it was handled above
        for entry in fs::read_dir(&backup)?.flatten() {
            let p = entry.path();
            if p.is_dir() && entry.file_name() == "SUBCOMMIT" {
                continue;
            }
            if p.is_dir() {
                let target = farm.bat_dir().join(entry.file_name());
                fs::create_dir_all(&target)?;
                move_tree(&p, &target)?;
                let _ = fs::remove_dir(&p);
            } else {
                let target = farm.bat_dir().join(entry.file_name());
                if target.exists() {
                    fs::remove_file(&target)?;
                }
                fs::rename(&p, &target)?;
            }
        }
    }
    fs::create_dir_all(farm.subcommit_dir())?;
    Ok(())
}

/// Moves data files not referenced by any directory record into
/// `LEFTOVERS/`.
pub fn sweep_leftovers(farm: &Farm, known: &HashSet<String>) -> Result<()> {
    let bat = farm.bat_dir();
    for outer in fs::read_dir(&bat)?.flatten() {
        let name = outer.file_name();
        let name = name.to_string_lossy().into_owned();
        // only the two-level hashed data directories are swept
        if !outer.path().is_dir() || name.len() != 2 || !name.bytes().all(|b| b.is_ascii_hexdigit())
        {
            continue;
        }
        for inner in fs::read_dir(outer.path())?.flatten() {
            if !inner.path().is_dir() {
                continue;
            }
            for file in fs::read_dir(inner.path())?.flatten() {
                let rel = format!(
                    "{}/{}/{}",
                    name,
                    inner.file_name().to_string_lossy(),
                    file.file_name().to_string_lossy()
                );
                if !known.contains(&rel) {
                    warn!("TM: sweeping orphan {}", rel);
                    let flat = rel.replace('/', "_");
                    let _ = fs::rename(file.path(), farm.leftovers_dir().join(flat));
                }
            }
        }
    }
    Ok(())
}

/// The farm-relative file names a directory record may own.
pub(crate) fn known_files_of(physical: &str) -> impl Iterator<Item = String> + '_ {
    HEAP_EXTS.iter().map(move |ext| format!("{}{}", physical, ext))
}
