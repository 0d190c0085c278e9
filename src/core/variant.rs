//! Variant values carried across the dispatch boundary
//!
//! Every coercion here is total: an input that cannot be converted degrades to
//! the zero value of the target (`0`, `0.0`, `false`, `""`). Objects coerce
//! through their default member (`Value`), which is how `rs("name")` style
//! Field objects behave as plain values.

use super::array::ArrayRef;
use super::dispatch::{Member, ObjectRef};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Default)]
pub enum Variant {
    #[default]
    Empty,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDateTime),
    Array(ArrayRef),
    Object(ObjectRef),
}

const DATE_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_ONLY_LAYOUTS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

impl Variant {
    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    /// Empty or Null, the two "no value" states
    pub fn is_nothing(&self) -> bool {
        matches!(self, Variant::Empty | Variant::Null)
    }

    pub fn is_numeric(&self) -> bool {
        match self {
            Variant::Int(_) | Variant::Float(_) | Variant::Bool(_) => true,
            Variant::String(s) => parse_numeric(s).is_some(),
            _ => false,
        }
    }

    /// VBScript `TypeName` of the value
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Empty => "Empty",
            Variant::Null => "Null",
            Variant::Bool(_) => "Boolean",
            Variant::Int(_) => "Long",
            Variant::Float(_) => "Double",
            Variant::String(_) => "String",
            Variant::Bytes(_) => "Byte()",
            Variant::Date(_) => "Date",
            Variant::Array(_) => "Variant()",
            Variant::Object(obj) => obj.class_name(),
        }
    }

    /// Resolves an object to its default member, leaving other values as-is
    pub fn resolve_default(&self) -> Variant {
        match self {
            Variant::Object(obj) => match obj.get_property(&Member::default_member()) {
                Variant::Object(_) => Variant::Empty,
                inner => inner,
            },
            other => other.clone(),
        }
    }

    /// Integer coercion: strings accept `&H` hex and `&O` octal literals,
    /// floats truncate, `True` is `-1`.
    pub fn to_int(&self) -> i64 {
        match self {
            Variant::Empty | Variant::Null => 0,
            Variant::Bool(b) => {
                if *b {
                    -1
                } else {
                    0
                }
            }
            Variant::Int(i) => *i,
            Variant::Float(f) if f.is_finite() => *f as i64,
            Variant::Float(_) => 0,
            Variant::String(s) => match parse_numeric(s) {
                Some(Variant::Int(i)) => i,
                Some(Variant::Float(f)) if f.is_finite() => f as i64,
                _ => 0,
            },
            Variant::Bytes(_) => Variant::String(self.to_string()).to_int(),
            Variant::Date(_) => 0,
            Variant::Array(_) => 0,
            Variant::Object(_) => self.resolve_default().to_int(),
        }
    }

    pub fn to_float(&self) -> f64 {
        match self {
            Variant::Empty | Variant::Null => 0.0,
            Variant::Bool(b) => {
                if *b {
                    -1.0
                } else {
                    0.0
                }
            }
            Variant::Int(i) => *i as f64,
            Variant::Float(f) => *f,
            Variant::String(s) => match parse_numeric(s) {
                Some(Variant::Int(i)) => i as f64,
                Some(Variant::Float(f)) => f,
                _ => 0.0,
            },
            Variant::Bytes(_) => Variant::String(self.to_string()).to_float(),
            Variant::Date(_) | Variant::Array(_) => 0.0,
            Variant::Object(_) => self.resolve_default().to_float(),
        }
    }

    /// Boolean coercion: numbers are true when non-zero, strings when they
    /// read `true`, `yes` or a non-zero number.
    pub fn to_bool(&self) -> bool {
        match self {
            Variant::Empty | Variant::Null => false,
            Variant::Bool(b) => *b,
            Variant::Int(i) => *i != 0,
            Variant::Float(f) => *f != 0.0 && !f.is_nan(),
            Variant::String(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes") {
                    return true;
                }
                match parse_numeric(s) {
                    Some(n) => n.to_bool(),
                    None => false,
                }
            }
            Variant::Bytes(_) | Variant::Date(_) | Variant::Array(_) => false,
            Variant::Object(_) => self.resolve_default().to_bool(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Variant::Bytes(b) => b.clone(),
            Variant::String(s) => s.as_bytes().to_vec(),
            Variant::Empty | Variant::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        }
    }

    /// Date coercion; strings are tried against the common ISO and US layouts
    pub fn to_date(&self) -> Option<NaiveDateTime> {
        match self {
            Variant::Date(d) => Some(*d),
            Variant::String(s) => parse_date(s),
            Variant::Object(_) => self.resolve_default().to_date(),
            _ => None,
        }
    }

    /// Case-insensitive comparison of the string forms
    pub fn eq_text(&self, other: &Variant) -> bool {
        self.to_string().to_lowercase() == other.to_string().to_lowercase()
    }
}

/// Parses a numeric literal the way script source would.
///
/// Returns `Variant::Int` or `Variant::Float`, or `None` when the text is not
/// a number.
pub fn parse_numeric(text: &str) -> Option<Variant> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    if t.len() > 2 && t.as_bytes()[0] == b'&' {
        let radix = match t.as_bytes()[1] {
            b'h' | b'H' => 16,
            b'o' | b'O' => 8,
            _ => return None,
        };
        return i64::from_str_radix(&t[2..], radix).ok().map(Variant::Int);
    }
    if let Ok(i) = t.parse::<i64>() {
        return Some(Variant::Int(i));
    }
    let plausible = t
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if plausible && t.bytes().any(|b| b.is_ascii_digit()) {
        return t.parse::<f64>().ok().map(Variant::Float);
    }
    None
}

pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    let t = text.trim();
    for layout in DATE_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(t, layout) {
            return Some(dt);
        }
    }
    for layout in DATE_ONLY_LAYOUTS {
        if let Ok(d) = NaiveDate::parse_from_str(t, layout) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return false;
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return true;
    }
    let pairs = bytes.len() / 2;
    let zero_high = bytes.chunks_exact(2).filter(|pair| pair[1] == 0).count();
    zero_high * 2 >= pairs && bytes.chunks_exact(2).any(|pair| pair[0] != 0)
}

/// Decodes a byte string: UTF-16LE when it looks like it, else Latin-1
pub fn decode_bytes(bytes: &[u8]) -> String {
    if looks_like_utf16le(bytes) {
        let (text, _) = encoding_rs::UTF_16LE.decode_with_bom_removal(bytes);
        return text.into_owned();
    }
    let (text, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
    text.into_owned()
}

fn format_date(dt: &NaiveDateTime) -> String {
    if dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0 {
        dt.format("%-m/%-d/%Y").to_string()
    } else {
        dt.format("%-m/%-d/%Y %-I:%M:%S %p").to_string()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Empty | Variant::Null | Variant::Array(_) => Ok(()),
            Variant::Bool(true) => f.write_str("True"),
            Variant::Bool(false) => f.write_str("False"),
            Variant::Int(i) => write!(f, "{i}"),
            Variant::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
                    write!(f, "{}", *v as i64)
                } else {
                    write!(f, "{v}")
                }
            }
            Variant::String(s) => f.write_str(s),
            Variant::Bytes(b) => f.write_str(&decode_bytes(b)),
            Variant::Date(d) => f.write_str(&format_date(d)),
            Variant::Object(_) => match self.resolve_default() {
                Variant::Object(_) => Ok(()),
                inner => write!(f, "{inner}"),
            },
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Empty, Variant::Empty) | (Variant::Null, Variant::Null) => true,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Int(a), Variant::Int(b)) => a == b,
            (Variant::Float(a), Variant::Float(b)) => a == b,
            (Variant::Int(a), Variant::Float(b)) | (Variant::Float(b), Variant::Int(a)) => {
                (*a as f64) == *b
            }
            (Variant::String(a), Variant::String(b)) => a == b,
            (Variant::Bytes(a), Variant::Bytes(b)) => a == b,
            (Variant::Date(a), Variant::Date(b)) => a == b,
            (Variant::Array(a), Variant::Array(b)) => a.ptr_eq(b),
            (Variant::Object(a), Variant::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Ordering used by `Recordset.Sort`: numeric when both sides are the same
/// numeric kind, otherwise the string forms compare lexicographically.
pub fn compare_for_sort(a: &Variant, b: &Variant) -> Ordering {
    match (a, b) {
        (Variant::Int(x), Variant::Int(y)) => x.cmp(y),
        (Variant::Float(x), Variant::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Variant::Date(x), Variant::Date(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Variant::Empty | Variant::Null => serializer.serialize_none(),
            Variant::Bool(b) => serializer.serialize_bool(*b),
            Variant::Int(i) => serializer.serialize_i64(*i),
            Variant::Float(f) => serializer.serialize_f64(*f),
            Variant::String(s) => serializer.serialize_str(s),
            Variant::Bytes(_) | Variant::Date(_) => serializer.serialize_str(&self.to_string()),
            Variant::Array(arr) => {
                let values = arr.to_vec();
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in &values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            Variant::Object(_) => match self.resolve_default() {
                Variant::Object(_) => serializer.serialize_none(),
                inner => inner.serialize(serializer),
            },
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v as i64)
    }
}

impl From<usize> for Variant {
    fn from(v: usize) -> Self {
        Variant::Int(v as i64)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Variant::Bytes(v)
    }
}

impl From<NaiveDateTime> for Variant {
    fn from(v: NaiveDateTime) -> Self {
        Variant::Date(v)
    }
}

impl From<ArrayRef> for Variant {
    fn from(v: ArrayRef) -> Self {
        Variant::Array(v)
    }
}

impl From<ObjectRef> for Variant {
    fn from(v: ObjectRef) -> Self {
        Variant::Object(v)
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Variant::Null)
    }
}
