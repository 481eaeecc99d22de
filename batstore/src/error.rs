//! An implementation of `Error` type.

use thiserror::Error;

use crate::types::{Bun, Oid};

/// The error type for operations on the storage engine.
///
/// Most variants are recoverable: the operation that produced them is a no-op
/// on its target and the caller may retry or give up. `Corrupt` is the
/// exception; it indicates an inconsistent on-disk image and is normally
/// raised while loading a farm.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation on a heap, directory or lock file failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Growing a heap or an auxiliary structure failed.
    #[error("allocation of {0} bytes failed")]
    Alloc(usize),

    /// The BAT cannot accommodate more elements.
    #[error("too many elements to accommodate ({0})")]
    Full(Bun),

    /// Operand types do not agree.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The type the operation required.
        expected: &'static str,
        /// The type it was given.
        actual: &'static str,
    },

    /// Attempt to update a BAT whose access mode forbids it.
    #[error("access denied: BAT is read-only")]
    ReadOnly,

    /// Appending a duplicate value to a BAT with the key property set.
    #[error("key constraint violated")]
    KeyViolation,

    /// An OID fell outside the range covered by the operands.
    #[error("oid {0} does not match always")]
    OidOutOfRange(Oid),

    /// A value position outside the BAT.
    #[error("position {0} out of range")]
    PositionOutOfRange(Bun),

    /// Text could not be converted to the requested type.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// The requested logical name is already in use by another BAT.
    #[error("name already in use: {0}")]
    NameAlreadyInUse(String),

    /// The requested logical name contains illegal characters.
    #[error("illegal name: {0}")]
    IllegalName(String),

    /// The requested logical name exceeds the maximum length.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// No BAT is registered under the given identifier.
    #[error("no such BAT: {0}")]
    NoSuchBat(crate::types::BatId),

    /// The on-disk image is inconsistent.
    #[error("corrupt {what}: {detail}")]
    Corrupt {
        /// Which structure is damaged (`"BBP.dir"`, a heap file, ...).
        what: String,
        /// Human-readable description of the damage.
        detail: String,
    },
}

impl Error {
    /// Creates a `Corrupt` error for the named structure.
    pub(crate) fn corrupt<W: Into<String>, D: Into<String>>(what: W, detail: D) -> Self {
        Error::Corrupt {
            what: what.into(),
            detail: detail.into(),
        }
    }
}
