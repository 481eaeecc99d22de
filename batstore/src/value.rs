//! Typed value records.
//!
//! A [`Value`] carries one atom value together with its type tag. Operators
//! use it to pass scalars across the embedding API; BATs use it at their
//! append/lookup seams. Extern (variable-width) values own their buffer.

use std::cmp::Ordering;
use std::convert::TryInto;
use std::fmt;

use uuid::Uuid;

use crate::time::{parse_date, parse_daytime, parse_timestamp, Date, Daytime, Timestamp};
use crate::types::{AtomType, BatId, Oid, BAT_NIL, OID_NIL, STR_NIL};
use crate::{Error, Result};

/// A tagged value of one of the built-in atom types.
#[derive(Debug, Clone)]
pub enum Value {
    /// A virtual OID.
    Void(Oid),
    /// A mask bit. Cannot be nil.
    Msk(bool),
    /// Boolean; nil is `i8::MIN`.
    Bit(i8),
    /// 8-bit integer.
    Bte(i8),
    /// 16-bit integer.
    Sht(i16),
    /// BAT reference.
    Bat(BatId),
    /// 32-bit integer.
    Int(i32),
    /// Object identifier.
    Oid(Oid),
    /// Raw pointer value; transient BATs only.
    Ptr(usize),
    /// 32-bit float; nil is NaN.
    Flt(f32),
    /// 64-bit float; nil is NaN.
    Dbl(f64),
    /// 64-bit integer.
    Lng(i64),
    /// 128-bit integer.
    Hge(i128),
    /// Calendar date.
    Date(Date),
    /// Time of day.
    Daytime(Daytime),
    /// Date and time.
    Timestamp(Timestamp),
    /// UUID.
    Uuid(Uuid),
    /// String.
    Str(String),
}

impl Value {
    /// The value's atom type.
    pub fn tpe(&self) -> AtomType {
        match self {
            Value::Void(_) => AtomType::Void,
            Value::Msk(_) => AtomType::Msk,
            Value::Bit(_) => AtomType::Bit,
            Value::Bte(_) => AtomType::Bte,
            Value::Sht(_) => AtomType::Sht,
            Value::Bat(_) => AtomType::Bat,
            Value::Int(_) => AtomType::Int,
            Value::Oid(_) => AtomType::Oid,
            Value::Ptr(_) => AtomType::Ptr,
            Value::Flt(_) => AtomType::Flt,
            Value::Dbl(_) => AtomType::Dbl,
            Value::Lng(_) => AtomType::Lng,
            Value::Hge(_) => AtomType::Hge,
            Value::Date(_) => AtomType::Date,
            Value::Daytime(_) => AtomType::Daytime,
            Value::Timestamp(_) => AtomType::Timestamp,
            Value::Uuid(_) => AtomType::Uuid,
            Value::Str(_) => AtomType::Str,
        }
    }

    /// The nil of a given type.
    pub fn nil(t: AtomType) -> Value {
        match t {
            AtomType::Void => Value::Void(OID_NIL),
            AtomType::Msk => Value::Msk(false),
            AtomType::Bit => Value::Bit(i8::MIN),
            AtomType::Bte => Value::Bte(i8::MIN),
            AtomType::Sht => Value::Sht(i16::MIN),
            AtomType::Bat => Value::Bat(BAT_NIL),
            AtomType::Int => Value::Int(i32::MIN),
            AtomType::Oid => Value::Oid(OID_NIL),
            AtomType::Ptr => Value::Ptr(0),
            AtomType::Flt => Value::Flt(f32::NAN),
            AtomType::Dbl => Value::Dbl(f64::NAN),
            AtomType::Lng => Value::Lng(i64::MIN),
            AtomType::Hge => Value::Hge(i128::MIN),
            AtomType::Date => Value::Date(Date::NIL),
            AtomType::Daytime => Value::Daytime(Daytime::NIL),
            AtomType::Timestamp => Value::Timestamp(Timestamp::NIL),
            AtomType::Uuid => Value::Uuid(Uuid::nil()),
            AtomType::Str => Value::Str(STR_NIL.to_string()),
        }
    }

    /// True for the nil of the value's type.
    pub fn is_nil(&self) -> bool {
        match self {
            Value::Void(v) | Value::Oid(v) => *v == OID_NIL,
            Value::Msk(_) => false,
            Value::Bit(v) | Value::Bte(v) => *v == i8::MIN,
            Value::Sht(v) => *v == i16::MIN,
            Value::Bat(v) => *v == BAT_NIL,
            Value::Int(v) => *v == i32::MIN,
            Value::Ptr(v) => *v == 0,
            Value::Flt(v) => v.is_nan(),
            Value::Dbl(v) => v.is_nan(),
            Value::Lng(v) => *v == i64::MIN,
            Value::Hge(v) => *v == i128::MIN,
            Value::Date(v) => v.is_nil(),
            Value::Daytime(v) => v.is_nil(),
            Value::Timestamp(v) => v.is_nil(),
            Value::Uuid(v) => v.is_nil(),
            Value::Str(v) => v == STR_NIL,
        }
    }

    /// Byte length of the owned representation. For strings this counts the
    /// terminating NUL the heap stores.
    pub fn len(&self) -> usize {
        match self {
            Value::Str(s) => s.len() + 1,
            v => v.tpe().width(),
        }
    }

    /// True only for the zero-byte void representation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes a fixed-width value into little-endian bytes. Returns `None`
    /// for `Str` (which lives in a variable heap) and zero-width types.
    pub fn fixed_bytes(&self) -> Option<([u8; 16], usize)> {
        let mut out = [0u8; 16];
        let n = match self {
            Value::Bit(v) | Value::Bte(v) => {
                out[0] = *v as u8;
                1
            }
            Value::Sht(v) => {
                out[..2].copy_from_slice(&v.to_le_bytes());
                2
            }
            Value::Bat(v) => {
                out[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            Value::Int(v) => {
                out[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            Value::Date(v) => {
                out[..4].copy_from_slice(&v.raw().to_le_bytes());
                4
            }
            Value::Flt(v) => {
                out[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            Value::Oid(v) => {
                out[..8].copy_from_slice(&v.to_le_bytes());
                8
            }
            Value::Ptr(v) => {
                out[..8].copy_from_slice(&(*v as u64).to_le_bytes());
                8
            }
            Value::Dbl(v) => {
                out[..8].copy_from_slice(&v.to_le_bytes());
                8
            }
            Value::Lng(v) => {
                out[..8].copy_from_slice(&v.to_le_bytes());
                8
            }
            Value::Daytime(v) => {
                out[..8].copy_from_slice(&v.raw().to_le_bytes());
                8
            }
            Value::Timestamp(v) => {
                out[..8].copy_from_slice(&v.raw().to_le_bytes());
                8
            }
            Value::Hge(v) => {
                out.copy_from_slice(&v.to_le_bytes());
                16
            }
            Value::Uuid(v) => {
                out.copy_from_slice(v.as_bytes());
                16
            }
            Value::Void(_) | Value::Msk(_) | Value::Str(_) => return None,
        };
        Some((out, n))
    }

    /// Decodes a fixed-width value from little-endian bytes.
    pub fn from_fixed_bytes(t: AtomType, b: &[u8]) -> Value {
        match t {
            AtomType::Bit => Value::Bit(b[0] as i8),
            AtomType::Bte => Value::Bte(b[0] as i8),
            AtomType::Sht => Value::Sht(i16::from_le_bytes(b[..2].try_into().unwrap())),
            AtomType::Bat => Value::Bat(i32::from_le_bytes(b[..4].try_into().unwrap())),
            AtomType::Int => Value::Int(i32::from_le_bytes(b[..4].try_into().unwrap())),
            AtomType::Date => Value::Date(Date::from_raw(i32::from_le_bytes(
                b[..4].try_into().unwrap(),
            ))),
            AtomType::Flt => Value::Flt(f32::from_le_bytes(b[..4].try_into().unwrap())),
            AtomType::Oid => Value::Oid(u64::from_le_bytes(b[..8].try_into().unwrap())),
            AtomType::Ptr => {
                Value::Ptr(u64::from_le_bytes(b[..8].try_into().unwrap()) as usize)
            }
            AtomType::Dbl => Value::Dbl(f64::from_le_bytes(b[..8].try_into().unwrap())),
            AtomType::Lng => Value::Lng(i64::from_le_bytes(b[..8].try_into().unwrap())),
            AtomType::Daytime => Value::Daytime(Daytime::from_raw(i64::from_le_bytes(
                b[..8].try_into().unwrap(),
            ))),
            AtomType::Timestamp => Value::Timestamp(Timestamp::from_raw(i64::from_le_bytes(
                b[..8].try_into().unwrap(),
            ))),
            AtomType::Hge => Value::Hge(i128::from_le_bytes(b[..16].try_into().unwrap())),
            AtomType::Uuid => Value::Uuid(Uuid::from_slice(&b[..16]).unwrap()),
            AtomType::Void | AtomType::Msk | AtomType::Str => {
                panic!("{} has no fixed byte decoding", t)
            }
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Bit(v) | Value::Bte(v) => Some(i128::from(v)),
            Value::Sht(v) => Some(i128::from(v)),
            Value::Int(v) => Some(i128::from(v)),
            Value::Lng(v) => Some(i128::from(v)),
            Value::Hge(v) => Some(v),
            Value::Oid(v) | Value::Void(v) => Some(i128::from(v)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Flt(v) => Some(f64::from(v)),
            Value::Dbl(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Nil-aware comparison. Two nils are equal; nil orders before every
    /// non-nil value. `None` when the types are not comparable.
    pub fn cmp_nilaware(&self, other: &Value) -> Option<Ordering> {
        if self.tpe() != other.tpe() {
            return None;
        }
        match (self.is_nil(), other.is_nil()) {
            (true, true) => return Some(Ordering::Equal),
            (true, false) => return Some(Ordering::Less),
            (false, true) => return Some(Ordering::Greater),
            (false, false) => {}
        }
        match (self, other) {
            (Value::Void(a), Value::Void(b)) | (Value::Oid(a), Value::Oid(b)) => Some(a.cmp(b)),
            (Value::Msk(a), Value::Msk(b)) => Some(a.cmp(b)),
            (Value::Bit(a), Value::Bit(b)) | (Value::Bte(a), Value::Bte(b)) => Some(a.cmp(b)),
            (Value::Sht(a), Value::Sht(b)) => Some(a.cmp(b)),
            (Value::Bat(a), Value::Bat(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Ptr(a), Value::Ptr(b)) => Some(a.cmp(b)),
            (Value::Flt(a), Value::Flt(b)) => a.partial_cmp(b),
            (Value::Dbl(a), Value::Dbl(b)) => a.partial_cmp(b),
            (Value::Lng(a), Value::Lng(b)) => Some(a.cmp(b)),
            (Value::Hge(a), Value::Hge(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Daytime(a), Value::Daytime(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Converts the value to another type. Nil converts to the target's nil.
    /// Narrowing conversions fail when the value does not fit; string
    /// conversion fails unless the whole text parses.
    pub fn convert(&self, to: AtomType) -> Result<Value> {
        if self.tpe() == to {
            return Ok(self.clone());
        }
        if self.is_nil() {
            return Ok(Value::nil(to));
        }
        let overflow = || {
            Error::Conversion(format!(
                "value {} does not fit in type {}",
                self,
                to.name()
            ))
        };
        fn int_to(v: i128, to: AtomType, overflow: impl Fn() -> Error) -> Result<Value> {
            Ok(match to {
                AtomType::Bit => Value::Bit(if v == 0 { 0 } else { 1 }),
                AtomType::Bte => Value::Bte(v.try_into().map_err(|_| overflow())?),
                AtomType::Sht => Value::Sht(v.try_into().map_err(|_| overflow())?),
                AtomType::Int => Value::Int(v.try_into().map_err(|_| overflow())?),
                AtomType::Lng => Value::Lng(v.try_into().map_err(|_| overflow())?),
                AtomType::Hge => Value::Hge(v),
                AtomType::Oid | AtomType::Void => {
                    Value::Oid(v.try_into().map_err(|_| overflow())?)
                }
                AtomType::Flt => Value::Flt(v as f32),
                AtomType::Dbl => Value::Dbl(v as f64),
                _ => return Err(overflow()),
            })
        }
        match self {
            Value::Str(s) => {
                let (v, n) = Value::parse(to, s)?;
                if n != s.len() {
                    return Err(Error::Conversion(format!(
                        "trailing input converting {:?} to {}",
                        s,
                        to.name()
                    )));
                }
                Ok(v)
            }
            _ if to == AtomType::Str => Ok(Value::Str(self.to_string())),
            Value::Date(d) if to == AtomType::Timestamp => {
                Ok(Value::Timestamp(Timestamp::from_date(*d)))
            }
            Value::Timestamp(t) if to == AtomType::Date => Ok(Value::Date(t.date())),
            Value::Timestamp(t) if to == AtomType::Daytime => Ok(Value::Daytime(t.daytime())),
            Value::Flt(_) | Value::Dbl(_) => {
                let f = self.as_f64().unwrap();
                match to {
                    AtomType::Flt => Ok(Value::Flt(f as f32)),
                    AtomType::Dbl => Ok(Value::Dbl(f)),
                    _ => {
                        let t = f.trunc();
                        if t != f || t < -(2f64.powi(126)) || t > 2f64.powi(126) {
                            return Err(overflow());
                        }
                        int_to(t as i128, to, overflow)
                    }
                }
            }
            _ => match self.as_i128() {
                Some(v) => int_to(v, to, overflow),
                None => Err(Error::Conversion(format!(
                    "cannot convert {} to {}",
                    self.tpe().name(),
                    to.name()
                ))),
            },
        }
    }

    /// Parses a value of type `t` from the front of `s`. Returns the value
    /// and the number of bytes consumed. The token `nil` parses as nil for
    /// every type.
    pub fn parse(t: AtomType, s: &str) -> Result<(Value, usize)> {
        if s.starts_with("nil") && t != AtomType::Str {
            return Ok((Value::nil(t), 3));
        }
        let syntax = || Error::Conversion(format!("cannot parse {:?} as {}", s, t.name()));
        match t {
            AtomType::Str => Ok((Value::Str(s.to_string()), s.len())),
            AtomType::Date => parse_date(s).map(|(d, n)| (Value::Date(d), n)),
            AtomType::Daytime => parse_daytime(s).map(|(d, n)| (Value::Daytime(d), n)),
            AtomType::Timestamp => parse_timestamp(s).map(|(d, n)| (Value::Timestamp(d), n)),
            AtomType::Msk | AtomType::Bit => {
                if s.starts_with("true") {
                    Ok((if t == AtomType::Msk { Value::Msk(true) } else { Value::Bit(1) }, 4))
                } else if s.starts_with("false") {
                    Ok((if t == AtomType::Msk { Value::Msk(false) } else { Value::Bit(0) }, 5))
                } else if s.starts_with('1') {
                    Ok((if t == AtomType::Msk { Value::Msk(true) } else { Value::Bit(1) }, 1))
                } else if s.starts_with('0') {
                    Ok((if t == AtomType::Msk { Value::Msk(false) } else { Value::Bit(0) }, 1))
                } else {
                    Err(syntax())
                }
            }
            AtomType::Uuid => {
                let tok = &s[..s.len().min(36)];
                let u = Uuid::parse_str(tok).map_err(|_| syntax())?;
                Ok((Value::Uuid(u), tok.len()))
            }
            AtomType::Flt | AtomType::Dbl => {
                let n = float_prefix(s);
                if n == 0 {
                    return Err(syntax());
                }
                let f: f64 = s[..n].parse().map_err(|_| syntax())?;
                Ok((
                    if t == AtomType::Flt {
                        Value::Flt(f as f32)
                    } else {
                        Value::Dbl(f)
                    },
                    n,
                ))
            }
            _ => {
                // the integer family
                let neg = s.starts_with('-');
                let digits: usize = s[neg as usize..]
                    .bytes()
                    .take_while(u8::is_ascii_digit)
                    .count();
                if digits == 0 {
                    return Err(syntax());
                }
                let n = neg as usize + digits;
                let v: i128 = s[..n].parse().map_err(|_| syntax())?;
                let value = match t {
                    AtomType::Bte => Value::Bte(v.try_into().map_err(|_| syntax())?),
                    AtomType::Sht => Value::Sht(v.try_into().map_err(|_| syntax())?),
                    AtomType::Bat => Value::Bat(v.try_into().map_err(|_| syntax())?),
                    AtomType::Int => Value::Int(v.try_into().map_err(|_| syntax())?),
                    AtomType::Lng => Value::Lng(v.try_into().map_err(|_| syntax())?),
                    AtomType::Hge => Value::Hge(v),
                    AtomType::Oid | AtomType::Void => {
                        let o: Oid = v.try_into().map_err(|_| syntax())?;
                        if t == AtomType::Void {
                            Value::Void(o)
                        } else {
                            Value::Oid(o)
                        }
                    }
                    AtomType::Ptr => Value::Ptr(v.try_into().map_err(|_| syntax())?),
                    _ => return Err(syntax()),
                };
                Ok((value, n))
            }
        }
    }

    /// Parses a value, requiring the entire input to be consumed.
    pub fn parse_all(t: AtomType, s: &str) -> Result<Value> {
        let (v, n) = Value::parse(t, s)?;
        if n != s.len() {
            return Err(Error::Conversion(format!(
                "trailing input parsing {:?} as {}",
                s,
                t.name()
            )));
        }
        Ok(v)
    }
}

fn float_prefix(s: &str) -> usize {
    let b = s.as_bytes();
    let mut i = 0;
    if b.get(i) == Some(&b'-') || b.get(i) == Some(&b'+') {
        i += 1;
    }
    while b.get(i).map_or(false, u8::is_ascii_digit) {
        i += 1;
    }
    if b.get(i) == Some(&b'.') {
        i += 1;
        while b.get(i).map_or(false, u8::is_ascii_digit) {
            i += 1;
        }
    }
    if b.get(i) == Some(&b'e') || b.get(i) == Some(&b'E') {
        let mut j = i + 1;
        if b.get(j) == Some(&b'-') || b.get(j) == Some(&b'+') {
            j += 1;
        }
        if b.get(j).map_or(false, u8::is_ascii_digit) {
            i = j;
            while b.get(i).map_or(false, u8::is_ascii_digit) {
                i += 1;
            }
        }
    }
    i
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.cmp_nilaware(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        match self {
            Value::Void(v) | Value::Oid(v) => write!(f, "{}", v),
            Value::Msk(v) => write!(f, "{}", *v as u8),
            Value::Bit(v) => f.write_str(if *v == 0 { "false" } else { "true" }),
            Value::Bte(v) => write!(f, "{}", v),
            Value::Sht(v) => write!(f, "{}", v),
            Value::Bat(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Ptr(v) => write!(f, "{}", v),
            Value::Flt(v) => write!(f, "{}", v),
            Value::Dbl(v) => write!(f, "{}", v),
            Value::Lng(v) => write!(f, "{}", v),
            Value::Hge(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Daytime(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Str(v) => f.write_str(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_compares_equal_to_nil() {
        for t in AtomType::ALL.iter().copied() {
            if t == AtomType::Msk {
                continue;
            }
            let nil = Value::nil(t);
            assert!(nil.is_nil(), "{} nil not nil", t);
            assert_eq!(nil.cmp_nilaware(&Value::nil(t)), Some(Ordering::Equal));
        }
        assert_eq!(
            Value::nil(AtomType::Int).cmp_nilaware(&Value::Int(5)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn fixed_bytes_round_trip() {
        let vals = [
            Value::Bte(-7),
            Value::Sht(1000),
            Value::Int(-123456),
            Value::Lng(1 << 40),
            Value::Hge(i128::MAX - 1),
            Value::Oid(42),
            Value::Flt(1.5),
            Value::Dbl(-2.25),
            Value::Date(Date::new(2024, 2, 29)),
            Value::Daytime(Daytime::new(1, 2, 3, 4)),
            Value::Timestamp(Timestamp::UNIX_EPOCH),
        ];
        for v in vals.iter() {
            let (bytes, n) = v.fixed_bytes().unwrap();
            assert_eq!(n, v.tpe().width());
            assert_eq!(&Value::from_fixed_bytes(v.tpe(), &bytes[..n]), v);
        }
    }

    #[test]
    fn convert_numeric() {
        assert_eq!(
            Value::Int(42).convert(AtomType::Lng).unwrap(),
            Value::Lng(42)
        );
        assert_eq!(
            Value::Lng(127).convert(AtomType::Bte).unwrap(),
            Value::Bte(127)
        );
        assert!(Value::Lng(128).convert(AtomType::Bte).is_err());
        assert_eq!(
            Value::nil(AtomType::Int).convert(AtomType::Dbl).unwrap(),
            Value::nil(AtomType::Dbl)
        );
        assert_eq!(
            Value::Dbl(3.0).convert(AtomType::Int).unwrap(),
            Value::Int(3)
        );
        assert!(Value::Dbl(3.5).convert(AtomType::Int).is_err());
    }

    #[test]
    fn convert_strings_must_consume_everything() {
        assert_eq!(
            Value::Str("42".into()).convert(AtomType::Int).unwrap(),
            Value::Int(42)
        );
        assert!(Value::Str("42x".into()).convert(AtomType::Int).is_err());
        assert_eq!(
            Value::Int(-5).convert(AtomType::Str).unwrap(),
            Value::Str("-5".into())
        );
    }

    #[test]
    fn parse_format_round_trip() {
        let vals = [
            Value::Bit(1),
            Value::Bte(-12),
            Value::Sht(3000),
            Value::Int(7),
            Value::Lng(-9_000_000_000),
            Value::Hge(170141183460469231731687303715884105727),
            Value::Oid(9),
            Value::Dbl(0.125),
            Value::Date(Date::new(1999, 12, 31)),
            Value::Str("hello".into()),
            Value::Uuid(Uuid::parse_str("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap()),
        ];
        for v in vals.iter() {
            let s = v.to_string();
            let back = Value::parse_all(v.tpe(), &s).unwrap();
            assert_eq!(&back, v, "round-trip of {}", s);
        }
        // nil formats as a distinguished token and parses back as nil
        for t in [AtomType::Int, AtomType::Dbl, AtomType::Date, AtomType::Uuid] {
            let s = Value::nil(t).to_string();
            assert_eq!(s, "nil");
            assert!(Value::parse_all(t, &s).unwrap().is_nil());
        }
    }
}
