//! Farms: named storage roots.
//!
//! A farm is a directory tree holding the heaps of the BATs whose role it
//! serves. The layout under the root is:
//!
//! ```text
//! bat/BBP.dir            directory file
//! bat/BACKUP/            crash-recovery staging for whole commits
//! bat/BACKUP/SUBCOMMIT/  staging for partial commits
//! bat/DELETE_ME/         files awaiting the next successful commit
//! bat/LEFTOVERS/         orphans found at startup
//! bat/TEMP_DATA/         transient-farm spill data
//! bat/<xx>/<yy>/<name>.<ext>   heap files, two-level hashed directories
//! ```
//!
//! A farm is locked exclusively for the lifetime of the engine instance that
//! opened it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::warn;

use crate::{Error, Result};

/// Farm role bits.
pub const FARM_PERSISTENT: u8 = 1;
/// Farm role bit for transient data.
pub const FARM_TRANSIENT: u8 = 2;

/// Name of the directory that holds all BAT data inside a farm root.
pub const BAT_DIR: &str = "bat";

/// A storage root.
#[derive(Debug)]
pub struct Farm {
    pub(crate) id: u32,
    root: PathBuf,
    pub(crate) roles: u8,
    _lock: File,
}

impl Farm {
    /// Opens (creating if needed) a farm at `root` and takes its exclusive
    /// lock. Fails when another process holds the farm.
    pub fn open(id: u32, root: &Path, roles: u8) -> Result<Farm> {
        let bat = root.join(BAT_DIR);
        fs::create_dir_all(&bat)?;
        fs::create_dir_all(bat.join("BACKUP").join("SUBCOMMIT"))?;
        fs::create_dir_all(bat.join("DELETE_ME"))?;
        fs::create_dir_all(bat.join("LEFTOVERS"))?;
        fs::create_dir_all(bat.join("TEMP_DATA"))?;
        let lock_path = root.join(".farmlock");
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive().map_err(|e| {
            warn!("farm {} already locked: {}", root.display(), e);
            Error::Io(e)
        })?;
        Ok(Farm {
            id,
            root: root.to_path_buf(),
            roles,
            _lock: lock,
        })
    }

    /// The farm root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/bat`.
    pub fn bat_dir(&self) -> PathBuf {
        self.root.join(BAT_DIR)
    }

    /// The live directory file.
    pub fn dir_file(&self) -> PathBuf {
        self.bat_dir().join("BBP.dir")
    }

    /// The staging name of the directory file during a commit.
    pub fn dir_file_new(&self) -> PathBuf {
        self.bat_dir().join("BBP.dir.new")
    }

    /// Whole-commit backup staging.
    pub fn backup_dir(&self) -> PathBuf {
        self.bat_dir().join("BACKUP")
    }

    /// Partial-commit backup staging.
    pub fn subcommit_dir(&self) -> PathBuf {
        self.backup_dir().join("SUBCOMMIT")
    }

    /// Files whose deletion awaits the next successful commit.
    pub fn delete_dir(&self) -> PathBuf {
        self.bat_dir().join("DELETE_ME")
    }

    /// Orphaned files swept aside at startup.
    pub fn leftovers_dir(&self) -> PathBuf {
        self.bat_dir().join("LEFTOVERS")
    }

    /// Spill area of the transient role.
    pub fn tempdata_dir(&self) -> PathBuf {
        self.bat_dir().join("TEMP_DATA")
    }

    /// Absolute path of a heap file given its farm-relative name
    /// (`xx/yy/name.ext`).
    pub fn filepath(&self, relative: &str) -> PathBuf {
        self.bat_dir().join(relative)
    }

    /// Syncs the `bat/` directory entry itself (after renames).
    pub fn sync_dir(&self) -> Result<()> {
        let d = File::open(self.bat_dir())?;
        d.sync_all()?;
        Ok(())
    }
}

/// The two-level hashed directory prefix for a BAT id, `"xx/yy"`.
pub fn dir_of(id: i32) -> String {
    format!("{:02x}/{:02x}", (id >> 8) & 0xff, id & 0xff)
}

/// The farm-relative physical base name of a BAT id, `"xx/yy/<hexid>"`.
pub fn physical_of(id: i32) -> String {
    format!("{}/{:x}", dir_of(id), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let farm = Farm::open(0, dir.path(), FARM_PERSISTENT | FARM_TRANSIENT).unwrap();
        assert!(farm.backup_dir().is_dir());
        assert!(farm.subcommit_dir().is_dir());
        assert!(farm.delete_dir().is_dir());
        assert!(farm.leftovers_dir().is_dir());
        assert!(farm.tempdata_dir().is_dir());
    }

    #[test]
    fn double_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _farm = Farm::open(0, dir.path(), FARM_PERSISTENT).unwrap();
        assert!(Farm::open(1, dir.path(), FARM_PERSISTENT).is_err());
    }

    #[test]
    fn physical_names() {
        assert_eq!(dir_of(0x0102), "01/02");
        assert_eq!(physical_of(0x0102), "01/02/102");
        assert_eq!(dir_of(7), "00/07");
    }
}
