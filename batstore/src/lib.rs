//! A column-oriented, main-memory-biased storage engine.
//!
//! # BATs
//!
//! The unit of storage is the *Binary Association Table* ([`Bat`]): a single
//! densely packed typed column paired with an implicit object-identifier
//! (OID) head. Higher-level relational tables are vertically decomposed into
//! sets of BATs sharing OID alignment. A BAT's bytes live in [`Heap`]s that
//! are either process memory or mappings of their backing files; string
//! columns add a dictionary-compressed variable heap.
//!
//! # The buffer pool
//!
//! Every BAT is registered in a [`Bbp`] (BAT buffer pool) under a small
//! integer id. The pool carries two reference counts per BAT — memory
//! references keep the descriptor loaded, logical references keep the BAT
//! alive — plus lazy loading, renaming, and the durable `BBP.dir` directory
//! of the persistent set.
//!
//! # Engines and commits
//!
//! An [`Engine`] owns a *farm* (a storage root), its buffer pool, and a
//! background memory trimmer. [`Engine::commit`] makes the persistent set
//! durable with a backup-directory scheme: heaps are saved first with their
//! previous versions staged aside, then a new directory file is atomically
//! renamed into place; an interrupted commit is rolled back at the next
//! open. You can interact with the engine from multiple threads; BAT handles
//! are shareable and internally locked.
//!
//! # Operators
//!
//! The engine ships the operator kernels that make it non-trivial:
//! [`project`]/[`project2`]/[`project_chain`] (positional lookup with the
//! dictionary-sharing "string trick"), [`bat_sort`], [`bat_select`] /
//! [`theta_select`], hash indexes ([`Engine::build_hash`]), and candidate
//! iterators ([`CandIter`]) over dense ranges, materialized OID lists,
//! dense-minus-exceptions lists, and bitmasks.
//!
//! # Example
//!
//! ```no_run
//! use batstore::{Engine, Settings, AtomType, Role, Value, project};
//!
//! # fn main() -> batstore::Result<()> {
//! let engine = Engine::open(std::path::Path::new("/tmp/farm"), &Settings::default())?;
//! let r = engine.new_bat(0, AtomType::Int, 0, Role::Persistent)?;
//! {
//!     let mut b = r.write();
//!     for v in [10, 20, 30, 40, 50] {
//!         b.append(&Value::Int(v))?;
//!     }
//! }
//! let l = engine.dense_bat(0, 2, 3)?;
//! let projected = project(engine.bbp(), &l.read(), &r.read())?;
//! assert_eq!(projected.read().value(0)?, Value::Int(30));
//! engine.commit()?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_debug_implementations,
    unsafe_code,
    bare_trait_objects,
    missing_docs
)]
#![allow(
    // Next `cast_*` lints don't give alternatives.
    clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss,
    // Next lints produce too much noise/false positives.
    clippy::module_name_repetitions, clippy::similar_names, clippy::must_use_candidate
)]

pub use self::{
    bat::{Access, Bat, BatHandle, Role},
    bbp::{
        Bbp, BBPDELETED, BBPDELETING, BBPEXISTING, BBPHOT, BBPLOADED, BBPLOADING, BBPNEW,
        BBPPERSISTENT, BBPRENAMED, BBPSAVING, BBPSTATUS, BBPSWAPPED, BBPSYNCING, BBPTMP,
        BBPUNLOADING, BBPUNSTABLE, BBPWAITING,
    },
    candidate::CandIter,
    engine::Engine,
    error::Error,
    hash::{bat_hash, hash_candidates, hash_find, hash_find_first, hash_value, Hash, HashIter},
    heap::{Heap, SharedHeap, StorageMode},
    project::{project, project2, project_chain},
    select::{bat_find, bat_select, theta_select, ThetaOp},
    settings::Settings,
    sort::{bat_sort, SortFlags},
    time::{Date, Daytime, Timestamp},
    types::{AtomType, BatId, Bun, Oid, BUN_MAX, BUN_NONE, OID_NIL},
    value::Value,
};

mod bat;
mod bbp;
mod candidate;
pub mod debug;
mod engine;
mod error;
mod farm;
mod hash;
mod heap;
mod project;
mod select;
mod settings;
mod sort;
mod strheap;
pub mod time;
mod tm;
pub mod types;
mod value;

/// A specialized `Result` type for operations on the storage engine.
pub type Result<T> = std::result::Result<T, Error>;
