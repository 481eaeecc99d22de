//! The engine: a farm, its buffer pool, and the background trimmer.
//!
//! An [`Engine`] value is the embedding API's entry point. Opening one
//! locks the farm, runs crash recovery, reads the directory file, and
//! starts the memory trimmer. Multiple engines may coexist in one process
//! as long as they use different farm roots. Dropping the engine stops the
//! trimmer; transient BATs do not survive it.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::debug;

use crate::bat::{BatHandle, Role};
use crate::bbp::Bbp;
use crate::debug::{self as dbg, Cat};
use crate::farm::{physical_of, Farm, FARM_PERSISTENT, FARM_TRANSIENT};
use crate::hash;
use crate::settings::Settings;
use crate::tm;
use crate::types::{AtomType, BatId, Bun, Oid};
use crate::value::Value;
use crate::Result;

/// An open storage engine instance.
#[derive(Debug)]
pub struct Engine {
    bbp: Arc<Bbp>,
    trimmer: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
}

impl Engine {
    /// Opens (creating if necessary) the farm at `path`, recovers from any
    /// interrupted commit, and loads the directory of persistent BATs.
    pub fn open(path: &Path, settings: &Settings) -> Result<Engine> {
        dbg::init_from_env();
        let farm = Farm::open(0, path, FARM_PERSISTENT | FARM_TRANSIENT)?;
        tm::recover(&farm)?;
        let dir = farm.dir_file();
        let (records, logno, transid) = if dir.exists() {
            Bbp::parse_dir(&fs::read_to_string(&dir)?)?
        } else {
            (Vec::new(), 0, 0)
        };
        let known: HashSet<String> = records
            .iter()
            .flat_map(|r| tm::known_files_of(&r.physical))
            .collect();
        tm::sweep_leftovers(&farm, &known)?;
        if dbg::enabled(Cat::Load) {
            debug!(
                "engine open: {} persistent bats, logno {}",
                records.len(),
                logno
            );
        }
        let bbp = Arc::new(Bbp::new(vec![farm], *settings));
        bbp.adopt_records(records, logno, transid)?;
        let mut engine = Engine {
            bbp,
            trimmer: None,
            stop_tx: None,
        };
        engine.start_trimmer(settings.trim_interval_ms);
        Ok(engine)
    }

    /// An engine without a farm: transient BATs only, nothing persists.
    pub fn transient(settings: &Settings) -> Engine {
        dbg::init_from_env();
        Engine {
            bbp: Arc::new(Bbp::transient(*settings)),
            trimmer: None,
            stop_tx: None,
        }
    }

    fn start_trimmer(&mut self, interval_ms: u64) {
        if interval_ms == 0 {
            return;
        }
        let (tx, rx) = bounded::<()>(1);
        let bbp = Arc::clone(&self.bbp);
        let interval = Duration::from_millis(interval_ms);
        self.trimmer = Some(std::thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let n = bbp.trim();
                    if n > 0 && dbg::enabled(Cat::Bat) {
                        debug!("trimmer: unloaded {} bats", n);
                    }
                }
            }
        }));
        self.stop_tx = Some(tx);
    }

    /// The underlying buffer pool.
    pub fn bbp(&self) -> &Bbp {
        &self.bbp
    }

    /// Creates a BAT (`COLnew`).
    pub fn new_bat(
        &self,
        hseq: Oid,
        ttype: AtomType,
        capacity: Bun,
        role: Role,
    ) -> Result<BatHandle> {
        self.bbp.new_bat(hseq, ttype, capacity, role)
    }

    /// Creates a zero-storage dense void BAT (`BATdense`).
    pub fn dense_bat(&self, hseq: Oid, tseq: Oid, cnt: Bun) -> Result<BatHandle> {
        self.bbp.dense_bat(hseq, tseq, cnt)
    }

    /// A BAT holding `cnt` copies of `v`.
    pub fn constant_bat(
        &self,
        hseq: Oid,
        ttype: AtomType,
        v: &Value,
        cnt: Bun,
    ) -> Result<BatHandle> {
        self.bbp.constant_bat(hseq, ttype, v, cnt)
    }

    /// Fetches (loading if needed) the descriptor of a BAT.
    pub fn descriptor(&self, id: BatId) -> Result<BatHandle> {
        self.bbp.descriptor(id)
    }

    /// Marks a BAT persistent or transient.
    pub fn set_persistence(&self, id: BatId, persistent: bool) -> Result<()> {
        self.bbp.set_persistence(id, persistent)
    }

    /// Writes a persistent BAT's heaps to its farm (`BATsave`).
    pub fn save_bat(&self, id: BatId) -> Result<()> {
        self.bbp.save_bat(id)
    }

    /// Atomically commits the whole persistent set (`TMcommit`).
    pub fn commit(&self) -> Result<()> {
        tm::commit(&self.bbp)
    }

    /// Commits a subset of BATs with intended sizes (`TMsubcommit`).
    pub fn subcommit(&self, list: &[(BatId, Bun)], logno: u64, transid: u64) -> Result<()> {
        tm::subcommit_list(&self.bbp, list, logno, transid)
    }

    /// Undoes uncommitted appends on loaded persistent BATs (`TMabort`).
    pub fn abort(&self) {
        tm::abort(&self.bbp)
    }

    /// Ensures a hash index exists over the BAT's tail, loading a persisted
    /// index when one is on disk and still valid, building one otherwise.
    pub fn build_hash(&self, id: BatId) -> Result<()> {
        let handle = self.bbp.descriptor(id)?;
        let res = (|| {
            let b = handle.read();
            if b.hash.read().is_none() {
                if let Some(farm) = self.bbp.farm_for(Role::Persistent) {
                    if !b.transient {
                        let physical = physical_of(id);
                        let lp = farm.filepath(&format!("{}.thashl", physical));
                        let bp = farm.filepath(&format!("{}.thashb", physical));
                        if lp.exists() && bp.exists() {
                            if let Ok(h) = hash::hash_load(&b, lp, bp) {
                                *b.hash.write() = Some(h);
                                return Ok(());
                            }
                        }
                    }
                }
            }
            hash::bat_hash(
                &b,
                self.bbp.settings.hash_bucket_floor,
                self.bbp.settings.hash_grow_threshold,
            )
        })();
        self.bbp.unfix(id)?;
        res
    }

    /// Runs one trimmer pass synchronously.
    pub fn trim(&self) -> usize {
        self.bbp.trim()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // closing the channel stops the trimmer
        self.stop_tx.take();
        if let Some(t) = self.trimmer.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_engine_round_trip() {
        let eng = Engine::transient(&Settings::default());
        let b = eng.new_bat(0, AtomType::Int, 0, Role::Transient).unwrap();
        let id = {
            let mut g = b.write();
            g.append(&Value::Int(5)).unwrap();
            g.cacheid
        };
        let d = eng.descriptor(id).unwrap();
        assert_eq!(d.read().value(0).unwrap(), Value::Int(5));
        eng.bbp().unfix(id).unwrap();
    }

    #[test]
    fn open_creates_and_relocks() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        {
            let eng = Engine::open(dir.path(), &settings).unwrap();
            let b = eng.new_bat(0, AtomType::Int, 0, Role::Persistent).unwrap();
            let id = {
                let mut g = b.write();
                g.append(&Value::Int(1)).unwrap();
                g.cacheid
            };
            eng.commit().unwrap();
            drop(b);
            let _ = id;
        }
        // reopen after clean shutdown
        let eng = Engine::open(dir.path(), &settings).unwrap();
        assert_eq!(eng.bbp().persistent_ids().len(), 1);
    }
}
