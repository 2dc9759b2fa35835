//! Runtime values.
//!
//! [`TypedValue`] is the tagged union over [`Datatype`]: one variant per kind,
//! plus `Array` for homogeneous sequences.  [`ElementValue`] is what a model
//! element actually holds; the composite shapes (a min/max pair, a set of
//! localized texts, a reference) are small fixed structures over
//! `TypedValue`, never open-ended trees.
//!
//! Every scalar has a canonical text form (`to_text` / `from_text`).  Protocol
//! bindings fall back to it when the wire carries a string for a non-string
//! datatype, or the other way round.
//!
//! | Datatype        | Text form                      |
//! |-----------------|--------------------------------|
//! | `xs:dateTime`   | RFC 3339, UTC (`...Z`)         |
//! | `xs:duration`   | ISO 8601 `PnDTnHnMn.nS`        |
//! | `xs:hexBinary`  | upper-case hex digits          |
//! | `xs:base64Binary` | standard base64 with padding |
//! | `rdf:langString`| `text@language`                |
//! | `qname`         | `namespaceIndex:name`          |

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::datatype::Datatype;
use super::reference::Reference;

/// A text could not be read as a value of the given datatype.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("'{text}' is not a valid {datatype} value")]
pub struct ValueFormatError {
    pub datatype: Datatype,
    pub text: String,
}

impl ValueFormatError {
    fn new(datatype: Datatype, text: &str) -> Self {
        Self {
            datatype,
            text: text.to_string(),
        }
    }
}

/// A text tagged with its language.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LangString {
    pub language: String,
    pub text: String,
}

impl LangString {
    pub fn new(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            text: text.into(),
        }
    }
}

/// A name qualified by a namespace index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub namespace_index: u16,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace_index: u16, name: impl Into<String>) -> Self {
        Self {
            namespace_index,
            name: name.into(),
        }
    }
}

/// An unordered set of localized texts, at most one per language.
///
/// Equality ignores insertion order: two sets holding the same
/// language/text pairs are equal however they were built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LangStringSet {
    entries: BTreeMap<String, String>,
}

impl LangStringSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the text for `language`, returning the old text.
    pub fn insert(&mut self, language: impl Into<String>, text: impl Into<String>) -> Option<String> {
        self.entries.insert(language.into(), text.into())
    }

    pub fn get(&self, language: &str) -> Option<&str> {
        self.entries.get(language).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by language.
    pub fn iter(&self) -> impl Iterator<Item = LangString> + '_ {
        self.entries
            .iter()
            .map(|(language, text)| LangString::new(language.clone(), text.clone()))
    }
}

impl FromIterator<LangString> for LangStringSet {
    fn from_iter<I: IntoIterator<Item = LangString>>(iter: I) -> Self {
        let mut set = Self::new();
        for s in iter {
            set.insert(s.language, s.text);
        }
        set
    }
}

/// A value of one [`Datatype`], or a homogeneous array of them.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UnsignedByte(u8),
    UnsignedShort(u16),
    UnsignedInt(u32),
    UnsignedLong(u64),
    Integer(i64),
    Float(f32),
    Double(f64),
    DateTime(DateTime<Utc>),
    Duration(Duration),
    AnyUri(String),
    HexBinary(Vec<u8>),
    Base64Binary(Vec<u8>),
    LangString(LangString),
    Uuid(Uuid),
    QualifiedName(QualifiedName),
    /// Elements all share the given datatype.
    Array(Datatype, Vec<TypedValue>),
}

impl TypedValue {
    /// The datatype of this value; for arrays, the element datatype.
    pub fn datatype(&self) -> Datatype {
        match self {
            TypedValue::String(_) => Datatype::String,
            TypedValue::Boolean(_) => Datatype::Boolean,
            TypedValue::Byte(_) => Datatype::Byte,
            TypedValue::Short(_) => Datatype::Short,
            TypedValue::Int(_) => Datatype::Int,
            TypedValue::Long(_) => Datatype::Long,
            TypedValue::UnsignedByte(_) => Datatype::UnsignedByte,
            TypedValue::UnsignedShort(_) => Datatype::UnsignedShort,
            TypedValue::UnsignedInt(_) => Datatype::UnsignedInt,
            TypedValue::UnsignedLong(_) => Datatype::UnsignedLong,
            TypedValue::Integer(_) => Datatype::Integer,
            TypedValue::Float(_) => Datatype::Float,
            TypedValue::Double(_) => Datatype::Double,
            TypedValue::DateTime(_) => Datatype::DateTime,
            TypedValue::Duration(_) => Datatype::Duration,
            TypedValue::AnyUri(_) => Datatype::AnyUri,
            TypedValue::HexBinary(_) => Datatype::HexBinary,
            TypedValue::Base64Binary(_) => Datatype::Base64Binary,
            TypedValue::LangString(_) => Datatype::LangString,
            TypedValue::Uuid(_) => Datatype::Uuid,
            TypedValue::QualifiedName(_) => Datatype::QualifiedName,
            TypedValue::Array(datatype, _) => *datatype,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, TypedValue::Array(..))
    }

    /// Parses the canonical text form of a scalar `datatype`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueFormatError`] when `text` is not a valid value of
    /// `datatype`, including integers outside the datatype's range.
    pub fn from_text(datatype: Datatype, text: &str) -> Result<Self, ValueFormatError> {
        let err = || ValueFormatError::new(datatype, text);
        let t = text.trim();
        let value = match datatype {
            Datatype::String => TypedValue::String(text.to_string()),
            Datatype::AnyUri => TypedValue::AnyUri(t.to_string()),
            Datatype::Boolean => match t {
                "true" | "1" => TypedValue::Boolean(true),
                "false" | "0" => TypedValue::Boolean(false),
                _ => return Err(err()),
            },
            Datatype::Byte => TypedValue::Byte(t.parse().map_err(|_| err())?),
            Datatype::Short => TypedValue::Short(t.parse().map_err(|_| err())?),
            Datatype::Int => TypedValue::Int(t.parse().map_err(|_| err())?),
            Datatype::Long => TypedValue::Long(t.parse().map_err(|_| err())?),
            Datatype::Integer => TypedValue::Integer(t.parse().map_err(|_| err())?),
            Datatype::UnsignedByte => TypedValue::UnsignedByte(t.parse().map_err(|_| err())?),
            Datatype::UnsignedShort => TypedValue::UnsignedShort(t.parse().map_err(|_| err())?),
            Datatype::UnsignedInt => TypedValue::UnsignedInt(t.parse().map_err(|_| err())?),
            Datatype::UnsignedLong => TypedValue::UnsignedLong(t.parse().map_err(|_| err())?),
            Datatype::Float => TypedValue::Float(t.parse().map_err(|_| err())?),
            Datatype::Double => TypedValue::Double(t.parse().map_err(|_| err())?),
            Datatype::DateTime => TypedValue::DateTime(
                DateTime::parse_from_rfc3339(t)
                    .map_err(|_| err())?
                    .with_timezone(&Utc),
            ),
            Datatype::Duration => TypedValue::Duration(parse_duration(t).ok_or_else(err)?),
            Datatype::HexBinary => TypedValue::HexBinary(parse_hex(t).ok_or_else(err)?),
            Datatype::Base64Binary => TypedValue::Base64Binary(
                base64::engine::general_purpose::STANDARD
                    .decode(t)
                    .map_err(|_| err())?,
            ),
            Datatype::LangString => {
                let (body, language) = text.rsplit_once('@').ok_or_else(err)?;
                TypedValue::LangString(LangString::new(language, body))
            }
            Datatype::Uuid => TypedValue::Uuid(Uuid::parse_str(t).map_err(|_| err())?),
            Datatype::QualifiedName => match t.split_once(':') {
                Some((ns, name)) => match ns.parse::<u16>() {
                    Ok(ns) => TypedValue::QualifiedName(QualifiedName::new(ns, name)),
                    Err(_) => TypedValue::QualifiedName(QualifiedName::new(0, t)),
                },
                None => TypedValue::QualifiedName(QualifiedName::new(0, t)),
            },
        };
        Ok(value)
    }

    /// Canonical text form; arrays render as `[a, b, c]`.
    pub fn to_text(&self) -> String {
        match self {
            TypedValue::String(s) | TypedValue::AnyUri(s) => s.clone(),
            TypedValue::Boolean(v) => v.to_string(),
            TypedValue::Byte(v) => v.to_string(),
            TypedValue::Short(v) => v.to_string(),
            TypedValue::Int(v) => v.to_string(),
            TypedValue::Long(v) | TypedValue::Integer(v) => v.to_string(),
            TypedValue::UnsignedByte(v) => v.to_string(),
            TypedValue::UnsignedShort(v) => v.to_string(),
            TypedValue::UnsignedInt(v) => v.to_string(),
            TypedValue::UnsignedLong(v) => v.to_string(),
            TypedValue::Float(v) => v.to_string(),
            TypedValue::Double(v) => v.to_string(),
            TypedValue::DateTime(v) => v.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            TypedValue::Duration(v) => format_duration(*v),
            TypedValue::HexBinary(bytes) => bytes.iter().fold(String::new(), |mut out, b| {
                let _ = write!(out, "{b:02X}");
                out
            }),
            TypedValue::Base64Binary(bytes) => {
                base64::engine::general_purpose::STANDARD.encode(bytes)
            }
            TypedValue::LangString(s) => format!("{}@{}", s.text, s.language),
            TypedValue::Uuid(v) => v.to_string(),
            TypedValue::QualifiedName(q) => format!("{}:{}", q.namespace_index, q.name),
            TypedValue::Array(_, items) => {
                let inner: Vec<String> = items.iter().map(TypedValue::to_text).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<bool> for TypedValue {
    fn from(v: bool) -> Self {
        TypedValue::Boolean(v)
    }
}

impl From<i32> for TypedValue {
    fn from(v: i32) -> Self {
        TypedValue::Int(v)
    }
}

impl From<f64> for TypedValue {
    fn from(v: f64) -> Self {
        TypedValue::Double(v)
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::String(v.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(v: String) -> Self {
        TypedValue::String(v)
    }
}

/// The value held by one model element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Property(TypedValue),
    /// Either bound may be unset.
    Range {
        min: Option<TypedValue>,
        max: Option<TypedValue>,
    },
    MultiLanguage(LangStringSet),
    Reference(Reference),
}

impl ElementValue {
    /// Short name of the shape, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ElementValue::Property(_) => "Property",
            ElementValue::Range { .. } => "Range",
            ElementValue::MultiLanguage(_) => "MultiLanguageProperty",
            ElementValue::Reference(_) => "ReferenceElement",
        }
    }

    pub fn as_property(&self) -> Option<&TypedValue> {
        match self {
            ElementValue::Property(v) => Some(v),
            _ => None,
        }
    }
}

impl From<TypedValue> for ElementValue {
    fn from(v: TypedValue) -> Self {
        ElementValue::Property(v)
    }
}

macro_rules! property_from {
    ($($t:ty),*) => {
        $(impl From<$t> for ElementValue {
            fn from(v: $t) -> Self {
                ElementValue::Property(v.into())
            }
        })*
    };
}

property_from!(bool, i32, f64, &str, String);

// ── Duration text form ────────────────────────────────────────────────────────

fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let nanos = d.subsec_nanos();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::from("P");
    if days > 0 {
        let _ = write!(out, "{days}D");
    }
    let has_time = hours > 0 || minutes > 0 || seconds > 0 || nanos > 0;
    if has_time || days == 0 {
        out.push('T');
        if hours > 0 {
            let _ = write!(out, "{hours}H");
        }
        if minutes > 0 {
            let _ = write!(out, "{minutes}M");
        }
        if seconds > 0 || nanos > 0 || (hours == 0 && minutes == 0) {
            if nanos > 0 {
                let frac = format!("{nanos:09}");
                let _ = write!(out, "{seconds}.{}S", frac.trim_end_matches('0'));
            } else {
                let _ = write!(out, "{seconds}S");
            }
        }
    }
    out
}

/// Accepts `P[nD][T[nH][nM][n[.n]S]]`.  Years and months have no fixed length
/// and are rejected.
fn parse_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut total = Duration::ZERO;
    let mut any = false;

    if !date_part.is_empty() {
        let days: u64 = date_part.strip_suffix('D')?.parse().ok()?;
        total = total.checked_add(Duration::from_secs(days.checked_mul(86_400)?))?;
        any = true;
    }

    if let Some(time) = time_part {
        if time.is_empty() {
            return None;
        }
        let mut number = String::new();
        for c in time.chars() {
            match c {
                '0'..='9' | '.' => number.push(c),
                'H' | 'M' => {
                    let n: u64 = number.parse().ok()?;
                    let unit = if c == 'H' { 3_600 } else { 60 };
                    total = total.checked_add(Duration::from_secs(n.checked_mul(unit)?))?;
                    number.clear();
                    any = true;
                }
                'S' => {
                    let (whole, frac) = match number.split_once('.') {
                        Some((w, f)) => (w, f),
                        None => (number.as_str(), ""),
                    };
                    let secs: u64 = whole.parse().ok()?;
                    if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
                        return None;
                    }
                    let nanos: u32 = if frac.is_empty() {
                        0
                    } else {
                        format!("{frac:0<9}").parse().ok()?
                    };
                    total = total.checked_add(Duration::new(secs, nanos))?;
                    number.clear();
                    any = true;
                }
                _ => return None,
            }
        }
        if !number.is_empty() {
            return None;
        }
    }

    any.then_some(total)
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
