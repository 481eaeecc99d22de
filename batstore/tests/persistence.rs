//! Commit, recovery, and save/load behavior of a farm.

use std::fs;
use std::path::{Path, PathBuf};

use batstore::{AtomType, Engine, Role, Settings, Value};

fn settings() -> Settings {
    // keep tests deterministic: no background trimmer
    let mut s = Settings::default();
    s.trim_interval_ms = 0;
    s
}

/// All data files with the given extension under the farm's two-level
/// hashed directories.
fn data_files(root: &Path, ext: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let bat = root.join("bat");
    for outer in fs::read_dir(&bat).unwrap().flatten() {
        let name = outer.file_name().to_string_lossy().into_owned();
        if name.len() != 2 || !outer.path().is_dir() {
            continue;
        }
        for inner in fs::read_dir(outer.path()).unwrap().flatten() {
            for f in fs::read_dir(inner.path()).unwrap().flatten() {
                if f.path().extension().and_then(|e| e.to_str()) == Some(ext) {
                    out.push(f.path());
                }
            }
        }
    }
    out
}

#[test]
fn commit_and_reopen_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        {
            let mut b = h.write();
            for v in [1, 2, 3] {
                b.append(&Value::Int(v)).unwrap();
            }
            id = b.id();
        }
        eng.bbp().rename(id, "foo").unwrap();
        eng.commit().unwrap();
    }
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    assert_eq!(eng.bbp().lookup("foo"), Some(id));
    let h = eng.descriptor(id).unwrap();
    let b = h.read();
    assert_eq!(b.count(), 3);
    for (p, want) in [1, 2, 3].iter().enumerate() {
        assert_eq!(b.value(p).unwrap(), Value::Int(*want));
    }
    // declared properties survive the round trip
    assert!(b.is_sorted());
    assert!(b.is_key());
    assert!(b.is_nonil());
    assert_eq!(b.inserted(), 3);
    b.assert_props().unwrap();
}

#[test]
fn string_bats_persist_with_their_dictionary() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Str, 0, Role::Persistent).unwrap();
        {
            let mut b = h.write();
            for s in ["a", "b", "a", "c"] {
                b.append(&Value::Str(s.into())).unwrap();
            }
            id = b.id();
        }
        eng.commit().unwrap();
    }
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    let h = eng.descriptor(id).unwrap();
    let mut b = h.write();
    for (p, want) in ["a", "b", "a", "c"].iter().enumerate() {
        assert_eq!(b.value(p).unwrap(), Value::Str((*want).into()));
    }
    // the dictionary survived: appending a known string adds no bytes
    let before = b.vheap().unwrap().read().free();
    b.append(&Value::Str("b".into())).unwrap();
    assert_eq!(b.vheap().unwrap().read().free(), before);
}

#[test]
fn crash_between_heap_write_and_directory_rename() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        {
            let mut b = h.write();
            for v in [1, 2, 3] {
                b.append(&Value::Int(v)).unwrap();
            }
            id = b.id();
        }
        eng.bbp().rename(id, "foo").unwrap();
        eng.commit().unwrap();

        // the next transaction appends a value...
        h.write().append(&Value::Int(4)).unwrap();

        // ...and the "commit" dies between the heap write and the directory
        // rename: the old heap file is staged in BACKUP/, the new one is
        // written, BBP.dir is never touched
        let tails = data_files(dir.path(), "tail");
        assert_eq!(tails.len(), 1);
        let live = &tails[0];
        let rel = live.strip_prefix(dir.path().join("bat")).unwrap();
        let backup = dir.path().join("bat").join("BACKUP").join(rel);
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::rename(live, &backup).unwrap();
        eng.save_bat(id).unwrap();
        assert!(live.exists());
        assert_eq!(fs::metadata(live).unwrap().len(), 16);
        // process dies here
    }

    // restart: recovery reinstates the backup before anything is loaded
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    let h = eng.descriptor(id).unwrap();
    let b = h.read();
    assert_eq!(b.count(), 3);
    for (p, want) in [1, 2, 3].iter().enumerate() {
        assert_eq!(b.value(p).unwrap(), Value::Int(*want));
    }
    let tails = data_files(dir.path(), "tail");
    assert_eq!(fs::metadata(&tails[0]).unwrap().len(), 12);
}

#[test]
fn orphaned_directory_staging_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        {
            let mut b = h.write();
            b.append(&Value::Int(7)).unwrap();
            id = b.id();
        }
        eng.commit().unwrap();
    }
    // a BBP.dir.new left behind means the rename never happened
    let orphan = dir.path().join("bat").join("BBP.dir.new");
    fs::write(&orphan, "BBP.dir, GDKversion 061044 999 999\n").unwrap();
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    assert!(!orphan.exists());
    let h = eng.descriptor(id).unwrap();
    assert_eq!(h.read().value(0).unwrap(), Value::Int(7));
}

#[test]
fn dropping_persistence_defers_file_deletion_to_the_commit() {
    let dir = tempfile::tempdir().unwrap();
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        let id = {
            let mut b = h.write();
            b.append(&Value::Int(9)).unwrap();
            b.id()
        };
        eng.commit().unwrap();
        assert_eq!(data_files(dir.path(), "tail").len(), 1);

        eng.set_persistence(id, false).unwrap();
        eng.commit().unwrap();
        // the data file is gone from the live tree
        assert_eq!(data_files(dir.path(), "tail").len(), 0);
    }
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    assert!(eng.bbp().persistent_ids().is_empty());
}

#[test]
fn subcommit_leaves_other_bats_at_their_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let (ida, idb);
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let a = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        let b = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        {
            let mut g = a.write();
            g.append(&Value::Int(1)).unwrap();
            ida = g.id();
        }
        {
            let mut g = b.write();
            g.append(&Value::Int(10)).unwrap();
            idb = g.id();
        }
        eng.commit().unwrap();

        a.write().append(&Value::Int(2)).unwrap();
        b.write().append(&Value::Int(20)).unwrap();
        // only `a` takes part in the sub-commit
        eng.subcommit(&[(ida, 2)], 5, 3).unwrap();
    }
    let text = fs::read_to_string(dir.path().join("bat").join("BBP.dir")).unwrap();
    assert!(text.starts_with("BBP.dir, GDKversion 061044 5 3"));

    let eng = Engine::open(dir.path(), &settings()).unwrap();
    let a = eng.descriptor(ida).unwrap();
    let b = eng.descriptor(idb).unwrap();
    assert_eq!(a.read().count(), 2);
    assert_eq!(a.read().value(1).unwrap(), Value::Int(2));
    // `b` kept its previous committed state
    assert_eq!(b.read().count(), 1);
    assert_eq!(b.read().value(0).unwrap(), Value::Int(10));
}

#[test]
fn abort_rolls_back_renames_and_appends() {
    let dir = tempfile::tempdir().unwrap();
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
    let id = {
        let mut b = h.write();
        b.append(&Value::Int(1)).unwrap();
        b.id()
    };
    eng.bbp().rename(id, "first").unwrap();
    eng.commit().unwrap();

    eng.bbp().rename(id, "second").unwrap();
    h.write().append(&Value::Int(2)).unwrap();
    eng.abort();

    assert_eq!(eng.bbp().lookup("first"), Some(id));
    assert_eq!(eng.bbp().lookup("second"), None);
    assert_eq!(h.read().count(), 1);
    assert_eq!(h.read().value(0).unwrap(), Value::Int(1));
}

#[test]
fn trim_unloads_and_descriptor_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    let id = {
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        let mut b = h.write();
        for v in 0..100 {
            b.append(&Value::Int(v)).unwrap();
        }
        b.id()
    };
    eng.commit().unwrap();
    eng.bbp().unfix(id).unwrap();
    // first pass cools the bat down, second unloads it
    eng.trim();
    let n = eng.trim();
    assert_eq!(n, 1);
    assert_eq!(eng.bbp().status(id).unwrap() & batstore::BBPLOADED, 0);
    // loading on demand brings it back
    let h = eng.descriptor(id).unwrap();
    assert_ne!(eng.bbp().status(id).unwrap() & batstore::BBPLOADED, 0);
    assert_eq!(h.read().count(), 100);
    assert_eq!(h.read().value(42).unwrap(), Value::Int(42));
}

#[test]
fn hash_index_survives_via_its_files() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        {
            let mut b = h.write();
            for v in [10, 20, 30, 40, 50] {
                b.append(&Value::Int(v)).unwrap();
            }
            id = b.id();
        }
        eng.build_hash(id).unwrap();
        eng.commit().unwrap();
        assert_eq!(data_files(dir.path(), "thashb").len(), 1);
        assert_eq!(data_files(dir.path(), "thashl").len(), 1);
    }
    let eng = Engine::open(dir.path(), &settings()).unwrap();
    eng.build_hash(id).unwrap();
    let h = eng.descriptor(id).unwrap();
    let b = h.read();
    assert_eq!(batstore::bat_find(&b, &Value::Int(30)).unwrap(), Some(2));
    assert_eq!(batstore::bat_find(&b, &Value::Int(99)).unwrap(), None);
}

#[test]
fn unreferenced_files_are_swept_to_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    {
        let eng = Engine::open(dir.path(), &settings()).unwrap();
        let h = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
        h.write().append(&Value::Int(1)).unwrap();
        eng.commit().unwrap();
    }
    // plant an orphan where data files live
    let stray = dir.path().join("bat").join("ab").join("cd");
    fs::create_dir_all(&stray).unwrap();
    fs::write(stray.join("dead.tail"), b"junk").unwrap();
    let _eng = Engine::open(dir.path(), &settings()).unwrap();
    assert!(!stray.join("dead.tail").exists());
    let leftovers: Vec<_> = fs::read_dir(dir.path().join("bat").join("LEFTOVERS"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(leftovers.len(), 1);
}
