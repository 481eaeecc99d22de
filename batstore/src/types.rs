//! Atom types and the atom registry.
//!
//! Every value stored in a BAT belongs to an *atom*: a physical type with a
//! stable small-integer identifier that appears in on-disk files. The
//! identifiers and the nil encodings below are part of the storage format and
//! must never be renumbered.

use std::cmp::Ordering;
use std::convert::TryInto;
use std::fmt;

use parking_lot::RwLock;

/// Object identifier. OIDs are non-negative; the all-ones pattern is nil.
pub type Oid = u64;

/// The nil OID.
pub const OID_NIL: Oid = u64::MAX;

/// A BUN position inside a BAT.
pub type Bun = usize;

/// Sentinel returned by lookups that found nothing.
pub const BUN_NONE: Bun = usize::MAX;

/// Maximum number of elements a single BAT may hold.
pub const BUN_MAX: Bun = BUN_NONE - 1;

/// Identifier of a BAT inside the buffer pool. Always positive for live BATs.
pub type BatId = i32;

/// The nil BAT identifier.
pub const BAT_NIL: BatId = i32::MIN;

/// Type id representing "any type" in polymorphic operator signatures.
pub const TYPE_ANY: u8 = 255;

/// Quiet-NaN bit patterns used as the nil encoding for floats.
const FLT_NIL_BITS: u32 = 0x7FC0_0000;
const DBL_NIL_BITS: u64 = 0x7FF8_0000_0000_0000;

/// The nil string: U+0080, the lowest non-ASCII code point, so the heap
/// keeps holding valid UTF-8.
pub const STR_NIL: &str = "\u{80}";

/// Built-in atom types.
///
/// The discriminants are the on-disk type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AtomType {
    /// Virtual OID sequence; occupies no storage.
    Void = 0,
    /// One bit per value, packed into 32-bit words.
    Msk = 1,
    /// Boolean with nil.
    Bit = 2,
    /// 8-bit signed integer.
    Bte = 3,
    /// 16-bit signed integer.
    Sht = 4,
    /// Reference to another BAT by id.
    Bat = 5,
    /// 32-bit signed integer.
    Int = 6,
    /// Object identifier.
    Oid = 7,
    /// Raw pointer; transient BATs only, never persisted.
    Ptr = 8,
    /// 32-bit float.
    Flt = 9,
    /// 64-bit float.
    Dbl = 10,
    /// 64-bit signed integer.
    Lng = 11,
    /// 128-bit signed integer.
    Hge = 12,
    /// Calendar date, 32 bits.
    Date = 13,
    /// Microseconds since midnight, 64 bits.
    Daytime = 14,
    /// Date plus daytime packed into 64 bits.
    Timestamp = 15,
    /// 128-bit UUID.
    Uuid = 16,
    /// Variable-length string, dictionary encoded in a variable heap.
    Str = 17,
}

impl AtomType {
    /// All built-in atoms, in id order.
    pub const ALL: [AtomType; 18] = [
        AtomType::Void,
        AtomType::Msk,
        AtomType::Bit,
        AtomType::Bte,
        AtomType::Sht,
        AtomType::Bat,
        AtomType::Int,
        AtomType::Oid,
        AtomType::Ptr,
        AtomType::Flt,
        AtomType::Dbl,
        AtomType::Lng,
        AtomType::Hge,
        AtomType::Date,
        AtomType::Daytime,
        AtomType::Timestamp,
        AtomType::Uuid,
        AtomType::Str,
    ];

    /// The stable on-disk identifier.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Looks up a built-in atom by its on-disk identifier.
    pub fn from_id(id: u8) -> Option<AtomType> {
        AtomType::ALL.get(id as usize).copied()
    }

    /// The atom's printable name, as used in directory files.
    pub fn name(self) -> &'static str {
        match self {
            AtomType::Void => "void",
            AtomType::Msk => "msk",
            AtomType::Bit => "bit",
            AtomType::Bte => "bte",
            AtomType::Sht => "sht",
            AtomType::Bat => "bat",
            AtomType::Int => "int",
            AtomType::Oid => "oid",
            AtomType::Ptr => "ptr",
            AtomType::Flt => "flt",
            AtomType::Dbl => "dbl",
            AtomType::Lng => "lng",
            AtomType::Hge => "hge",
            AtomType::Date => "date",
            AtomType::Daytime => "daytime",
            AtomType::Timestamp => "timestamp",
            AtomType::Uuid => "uuid",
            AtomType::Str => "str",
        }
    }

    /// Looks up a built-in atom by name.
    pub fn from_name(name: &str) -> Option<AtomType> {
        AtomType::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Bytes per slot in the main heap. Zero for `Void` and `Msk` (the
    /// latter packs 32 values into a word and is handled out of line).
    /// For `Str` this is the *initial* offset width; the column may widen it.
    pub fn width(self) -> usize {
        match self {
            AtomType::Void | AtomType::Msk => 0,
            AtomType::Bit | AtomType::Bte => 1,
            AtomType::Sht => 2,
            AtomType::Bat | AtomType::Int | AtomType::Flt | AtomType::Date => 4,
            AtomType::Oid
            | AtomType::Ptr
            | AtomType::Dbl
            | AtomType::Lng
            | AtomType::Daytime
            | AtomType::Timestamp => 8,
            AtomType::Hge | AtomType::Uuid => 16,
            AtomType::Str => 1,
        }
    }

    /// log2 of the width; 0 for width-0 types.
    pub fn shift(self) -> u8 {
        let w = self.width();
        if w == 0 {
            0
        } else {
            w.trailing_zeros() as u8
        }
    }

    /// True when values live in a variable heap and the main heap holds
    /// offsets.
    pub fn varsized(self) -> bool {
        matches!(self, AtomType::Str)
    }

    /// The representation used on disk. Types at or beyond `Str` are
    /// "extern": their in-BAT bytes are offsets into a variable heap.
    pub fn storage(self) -> AtomType {
        match self {
            AtomType::Bat => AtomType::Int,
            AtomType::Date => AtomType::Int,
            AtomType::Daytime | AtomType::Timestamp => AtomType::Lng,
            AtomType::Ptr => AtomType::Lng,
            t => t,
        }
    }

    /// True when the type has a meaningful linear order.
    pub fn linear(self) -> bool {
        !matches!(self, AtomType::Ptr | AtomType::Msk)
    }

    /// The nil encoding, little-endian, `width()` bytes (empty for void-like
    /// types, one byte for `Msk` which cannot be nil).
    pub fn nil_bytes(self) -> &'static [u8] {
        const B0: [u8; 0] = [];
        const BIT: [u8; 1] = [0x80];
        const SHT: [u8; 2] = i16::MIN.to_le_bytes();
        const INT: [u8; 4] = i32::MIN.to_le_bytes();
        const LNG: [u8; 8] = i64::MIN.to_le_bytes();
        const HGE: [u8; 16] = i128::MIN.to_le_bytes();
        const OID: [u8; 8] = u64::MAX.to_le_bytes();
        const FLT: [u8; 4] = FLT_NIL_BITS.to_le_bytes();
        const DBL: [u8; 8] = DBL_NIL_BITS.to_le_bytes();
        const DATE: [u8; 4] = [0; 4];
        const TS: [u8; 8] = [0; 8];
        const UUID: [u8; 16] = [0; 16];
        match self {
            AtomType::Void | AtomType::Msk | AtomType::Str => &B0,
            AtomType::Bit | AtomType::Bte => &BIT,
            AtomType::Sht => &SHT,
            AtomType::Bat | AtomType::Int => &INT,
            AtomType::Lng => &LNG,
            AtomType::Hge => &HGE,
            AtomType::Oid => &OID,
            AtomType::Ptr => &TS, // null pointer
            AtomType::Flt => &FLT,
            AtomType::Dbl => &DBL,
            AtomType::Date => &DATE,
            AtomType::Daytime => &LNG,
            AtomType::Timestamp => &TS,
            AtomType::Uuid => &UUID,
        }
    }

    /// Checks whether `width()` raw bytes hold the nil of this type. Floats
    /// treat every NaN as nil.
    pub fn is_nil_bytes(self, bytes: &[u8]) -> bool {
        match self {
            AtomType::Flt => f32::from_le_bytes(bytes[..4].try_into().unwrap()).is_nan(),
            AtomType::Dbl => f64::from_le_bytes(bytes[..8].try_into().unwrap()).is_nan(),
            AtomType::Void | AtomType::Msk | AtomType::Str => false,
            _ => bytes[..self.width()] == *self.nil_bytes(),
        }
    }

    /// Compares two fixed-width values in raw little-endian form. Nil sorts
    /// before every non-nil value. Must not be called for `Str` (resolve the
    /// offsets first) nor for `Void`/`Msk`.
    pub fn cmp_bytes(self, a: &[u8], b: &[u8]) -> Ordering {
        fn le<T: Ord, const N: usize>(f: impl Fn([u8; N]) -> T, a: &[u8], b: &[u8]) -> Ordering {
            f(a[..N].try_into().unwrap()).cmp(&f(b[..N].try_into().unwrap()))
        }
        let an = self.is_nil_bytes(a);
        let bn = self.is_nil_bytes(b);
        if an || bn {
            return bn.cmp(&an);
        }
        match self {
            AtomType::Bit | AtomType::Bte => le(i8::from_le_bytes, a, b),
            AtomType::Sht => le(i16::from_le_bytes, a, b),
            AtomType::Bat | AtomType::Int | AtomType::Date => le(i32::from_le_bytes, a, b),
            AtomType::Lng | AtomType::Daytime | AtomType::Timestamp => le(i64::from_le_bytes, a, b),
            AtomType::Hge => le(i128::from_le_bytes, a, b),
            AtomType::Oid | AtomType::Ptr => le(u64::from_le_bytes, a, b),
            AtomType::Uuid => a[..16].cmp(&b[..16]),
            AtomType::Flt => f32::from_le_bytes(a[..4].try_into().unwrap())
                .partial_cmp(&f32::from_le_bytes(b[..4].try_into().unwrap()))
                .unwrap_or(Ordering::Equal),
            AtomType::Dbl => f64::from_le_bytes(a[..8].try_into().unwrap())
                .partial_cmp(&f64::from_le_bytes(b[..8].try_into().unwrap()))
                .unwrap_or(Ordering::Equal),
            AtomType::Void | AtomType::Msk | AtomType::Str => Ordering::Equal,
        }
    }
}

impl fmt::Display for AtomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Descriptor of a registered atom. Built-in atoms delegate to [`AtomType`];
/// externally registered atoms supply their behavior through function
/// pointers.
#[derive(Clone)]
pub struct AtomDesc {
    /// Printable name, unique across the registry.
    pub name: &'static str,
    /// Fixed byte width (registered atoms must be fixed-width).
    pub size: usize,
    /// Whether the type has a linear order.
    pub linear: bool,
    /// The nil encoding, `size` bytes.
    pub nil: &'static [u8],
    /// Comparator over raw values.
    pub cmp: fn(&[u8], &[u8]) -> Ordering,
    /// Hash over raw values.
    pub hash: fn(&[u8]) -> u64,
    /// Parse from text; returns the value bytes and the number of input bytes
    /// consumed.
    pub parse: fn(&str) -> Option<(Vec<u8>, usize)>,
    /// Format to text.
    pub format: fn(&[u8]) -> String,
}

impl fmt::Debug for AtomDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomDesc")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("linear", &self.linear)
            .finish()
    }
}

/// Maximum number of atom ids, built-ins included. Registered ids appear in
/// on-disk files, so the table only ever grows.
pub const MAX_ATOMS: usize = 64;

/// First id handed out to registered atoms.
const FIRST_USER_ATOM: u8 = AtomType::Str as u8 + 1;

static USER_ATOMS: RwLock<Vec<AtomDesc>> = RwLock::new(Vec::new());

/// Registers a new fixed-width atom and returns its id. Registration happens
/// at process init; ids are handed out in order and remain stable.
pub fn register_atom(desc: AtomDesc) -> crate::Result<u8> {
    let mut table = USER_ATOMS.write();
    if FIRST_USER_ATOM as usize + table.len() >= MAX_ATOMS {
        return Err(crate::Error::Alloc(std::mem::size_of::<AtomDesc>()));
    }
    if AtomType::from_name(desc.name).is_some() || table.iter().any(|d| d.name == desc.name) {
        return Err(crate::Error::NameAlreadyInUse(desc.name.to_string()));
    }
    table.push(desc);
    Ok(FIRST_USER_ATOM + (table.len() - 1) as u8)
}

/// Looks up a registered (non-built-in) atom by id.
pub fn user_atom(id: u8) -> Option<AtomDesc> {
    if id < FIRST_USER_ATOM {
        return None;
    }
    USER_ATOMS.read().get((id - FIRST_USER_ATOM) as usize).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable() {
        assert_eq!(AtomType::Void.id(), 0);
        assert_eq!(AtomType::Oid.id(), 7);
        assert_eq!(AtomType::Str.id(), 17);
        for t in AtomType::ALL.iter() {
            assert_eq!(AtomType::from_id(t.id()), Some(*t));
            assert_eq!(AtomType::from_name(t.name()), Some(*t));
        }
    }

    #[test]
    fn widths_and_shifts() {
        assert_eq!(AtomType::Void.width(), 0);
        assert_eq!(AtomType::Int.width(), 4);
        assert_eq!(AtomType::Int.shift(), 2);
        assert_eq!(AtomType::Uuid.width(), 16);
        assert_eq!(AtomType::Uuid.shift(), 4);
        assert!(AtomType::Str.varsized());
        assert!(!AtomType::Lng.varsized());
    }

    #[test]
    fn nil_round_trip() {
        for t in AtomType::ALL.iter().copied() {
            if t.width() == 0 {
                continue;
            }
            assert!(t.is_nil_bytes(t.nil_bytes()), "{} nil not recognized", t);
        }
        // Date and timestamp nils are the all-zero pattern.
        assert_eq!(AtomType::Date.nil_bytes(), &[0, 0, 0, 0]);
        assert_eq!(AtomType::Timestamp.nil_bytes(), &[0; 8]);
        // Daytime nil is the minimum 64-bit integer.
        assert_eq!(AtomType::Daytime.nil_bytes(), &i64::MIN.to_le_bytes());
    }

    #[test]
    fn cmp_nil_sorts_first() {
        let nil = AtomType::Int.nil_bytes();
        let one = 1i32.to_le_bytes();
        assert_eq!(AtomType::Int.cmp_bytes(nil, &one), Ordering::Less);
        assert_eq!(AtomType::Int.cmp_bytes(&one, nil), Ordering::Greater);
        assert_eq!(AtomType::Int.cmp_bytes(nil, nil), Ordering::Equal);
    }

    #[test]
    fn user_atoms_register_past_the_builtins() {
        fn cmp(a: &[u8], b: &[u8]) -> Ordering {
            a[..4].cmp(&b[..4])
        }
        fn hash(a: &[u8]) -> u64 {
            u64::from(u32::from_le_bytes(a[..4].try_into().unwrap()))
        }
        fn parse(_: &str) -> Option<(Vec<u8>, usize)> {
            None
        }
        fn format(_: &[u8]) -> String {
            String::new()
        }
        let desc = AtomDesc {
            name: "inet",
            size: 4,
            linear: true,
            nil: &[0, 0, 0, 0],
            cmp,
            hash,
            parse,
            format,
        };
        let id = register_atom(desc.clone()).unwrap();
        assert!(id > AtomType::Str.id());
        assert_eq!(user_atom(id).unwrap().name, "inet");
        assert!(user_atom(AtomType::Int.id()).is_none());
        // names stay unique across built-ins and registered atoms
        assert!(register_atom(desc).is_err());
    }
}
