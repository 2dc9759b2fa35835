//! OPC UA wire model.
//!
//! Only the parts of the OPC UA type system this binding maps to and from:
//! node identifiers, the built-in scalar types carried in a [`Variant`],
//! status codes, and the descriptions of variables and methods that a
//! session hands back.  Binary encoding is the protocol stack's business and
//! does not appear here.
//!
//! # NodeId text form
//!
//! ```text
//! ns=2;s=HelloWorld/ScalarTypes/Double     string identifier
//! ns=2;i=1001                              numeric identifier
//! ns=1;g=0b1e4cf1-8f0b-4c6e-9d1e-1b2b3c4d5e6f
//! ns=3;b=AQID                              opaque (base64)
//! i=85                                     namespace 0 may be omitted
//! ```

use std::fmt;
use std::str::FromStr;

use assetlink_core::QualifiedName;
use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

// ── NodeId ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeIdParseError {
    #[error("namespace index '{0}' is not a number in 0..=65535")]
    Namespace(String),
    #[error("expected one of 'i=', 's=', 'g=', 'b=' but found '{0}'")]
    IdentifierKind(String),
    #[error("invalid identifier '{0}'")]
    Identifier(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u32),
    String(String),
    Guid(Uuid),
    Opaque(Vec<u8>),
}

/// Address of one node in a server's address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

impl NodeId {
    pub fn numeric(namespace: u16, id: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(id),
        }
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(id.into()),
        }
    }

    /// `<self>/<component>` for string identifiers; `None` otherwise.
    ///
    /// Composite values (the two bounds of a range) live in component nodes
    /// addressed this way.
    pub fn component(&self, name: &str) -> Option<NodeId> {
        match &self.identifier {
            Identifier::String(s) => Some(NodeId::string(self.namespace, format!("{s}/{name}"))),
            _ => None,
        }
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (namespace, rest) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, rest) = rest
                    .split_once(';')
                    .ok_or_else(|| NodeIdParseError::Namespace(rest.to_string()))?;
                let ns: u16 = ns
                    .parse()
                    .map_err(|_| NodeIdParseError::Namespace(ns.to_string()))?;
                (ns, rest)
            }
            None => (0, s),
        };

        let (kind, value) = rest
            .split_once('=')
            .ok_or_else(|| NodeIdParseError::IdentifierKind(rest.to_string()))?;
        let bad = || NodeIdParseError::Identifier(value.to_string());
        let identifier = match kind {
            "i" => Identifier::Numeric(value.parse().map_err(|_| bad())?),
            "s" if !value.is_empty() => Identifier::String(value.to_string()),
            "s" => return Err(bad()),
            "g" => Identifier::Guid(Uuid::parse_str(value).map_err(|_| bad())?),
            "b" => Identifier::Opaque(
                base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .map_err(|_| bad())?,
            ),
            other => return Err(NodeIdParseError::IdentifierKind(other.to_string())),
        };
        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(i) => write!(f, "i={i}"),
            Identifier::String(s) => write!(f, "s={s}"),
            Identifier::Guid(g) => write!(f, "g={g}"),
            Identifier::Opaque(b) => write!(
                f,
                "b={}",
                base64::engine::general_purpose::STANDARD.encode(b)
            ),
        }
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Built-in OPC UA scalar types this binding maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WireType {
    Boolean,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    DateTime,
    Guid,
    ByteString,
    LocalizedText,
    QualifiedName,
}

impl WireType {
    pub fn name(self) -> &'static str {
        match self {
            WireType::Boolean => "Boolean",
            WireType::SByte => "SByte",
            WireType::Byte => "Byte",
            WireType::Int16 => "Int16",
            WireType::UInt16 => "UInt16",
            WireType::Int32 => "Int32",
            WireType::UInt32 => "UInt32",
            WireType::Int64 => "Int64",
            WireType::UInt64 => "UInt64",
            WireType::Float => "Float",
            WireType::Double => "Double",
            WireType::String => "String",
            WireType::DateTime => "DateTime",
            WireType::Guid => "Guid",
            WireType::ByteString => "ByteString",
            WireType::LocalizedText => "LocalizedText",
            WireType::QualifiedName => "QualifiedName",
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Text with an optional locale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LocalizedText {
    pub locale: String,
    pub text: String,
}

impl LocalizedText {
    pub fn new(locale: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            text: text.into(),
        }
    }
}

/// A wire value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    ByteString(Vec<u8>),
    LocalizedText(LocalizedText),
    QualifiedName(QualifiedName),
    /// One-dimensional array; nested arrays represent higher dimensions.
    Array(WireType, Vec<Variant>),
}

impl Variant {
    /// Scalar type, or element type for arrays.  `None` for `Empty`.
    pub fn wire_type(&self) -> Option<WireType> {
        Some(match self {
            Variant::Empty => return None,
            Variant::Boolean(_) => WireType::Boolean,
            Variant::SByte(_) => WireType::SByte,
            Variant::Byte(_) => WireType::Byte,
            Variant::Int16(_) => WireType::Int16,
            Variant::UInt16(_) => WireType::UInt16,
            Variant::Int32(_) => WireType::Int32,
            Variant::UInt32(_) => WireType::UInt32,
            Variant::Int64(_) => WireType::Int64,
            Variant::UInt64(_) => WireType::UInt64,
            Variant::Float(_) => WireType::Float,
            Variant::Double(_) => WireType::Double,
            Variant::String(_) => WireType::String,
            Variant::DateTime(_) => WireType::DateTime,
            Variant::Guid(_) => WireType::Guid,
            Variant::ByteString(_) => WireType::ByteString,
            Variant::LocalizedText(_) => WireType::LocalizedText,
            Variant::QualifiedName(_) => WireType::QualifiedName,
            Variant::Array(t, _) => *t,
        })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Variant::Array(..))
    }

    /// Short description for error messages, e.g. `Double` or `Int32[]`.
    pub fn describe(&self) -> String {
        match (self.wire_type(), self.is_array()) {
            (None, _) => "Empty".to_string(),
            (Some(t), false) => t.to_string(),
            (Some(t), true) => format!("{t}[]"),
        }
    }
}

// ── Status codes ──────────────────────────────────────────────────────────────

/// OPC UA status code.  The top two bits carry the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_USER_ACCESS_DENIED: StatusCode = StatusCode(0x801F_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_INDEX_RANGE_INVALID: StatusCode = StatusCode(0x8036_0000);
    pub const BAD_NOT_READABLE: StatusCode = StatusCode(0x803A_0000);
    pub const BAD_NOT_WRITABLE: StatusCode = StatusCode(0x803B_0000);
    pub const BAD_OUT_OF_RANGE: StatusCode = StatusCode(0x803C_0000);
    pub const BAD_NOT_FOUND: StatusCode = StatusCode(0x803E_0000);
    pub const BAD_TYPE_MISMATCH: StatusCode = StatusCode(0x8074_0000);
    pub const BAD_METHOD_INVALID: StatusCode = StatusCode(0x8075_0000);
    pub const BAD_ARGUMENTS_MISSING: StatusCode = StatusCode(0x8076_0000);
    pub const BAD_NOT_CONNECTED: StatusCode = StatusCode(0x808A_0000);
    pub const BAD_INVALID_ARGUMENT: StatusCode = StatusCode(0x80AB_0000);
    pub const BAD_TOO_MANY_ARGUMENTS: StatusCode = StatusCode(0x80E5_0000);

    pub fn is_good(self) -> bool {
        self.0 >> 30 == 0
    }

    pub fn is_bad(self) -> bool {
        self.0 >> 30 == 2
    }

    /// Symbolic name, e.g. `BadTypeMismatch`.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::GOOD => "Good",
            StatusCode::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            StatusCode::BAD_INTERNAL_ERROR => "BadInternalError",
            StatusCode::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            StatusCode::BAD_TIMEOUT => "BadTimeout",
            StatusCode::BAD_USER_ACCESS_DENIED => "BadUserAccessDenied",
            StatusCode::BAD_SESSION_CLOSED => "BadSessionClosed",
            StatusCode::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            StatusCode::BAD_INDEX_RANGE_INVALID => "BadIndexRangeInvalid",
            StatusCode::BAD_NOT_READABLE => "BadNotReadable",
            StatusCode::BAD_NOT_WRITABLE => "BadNotWritable",
            StatusCode::BAD_OUT_OF_RANGE => "BadOutOfRange",
            StatusCode::BAD_NOT_FOUND => "BadNotFound",
            StatusCode::BAD_TYPE_MISMATCH => "BadTypeMismatch",
            StatusCode::BAD_METHOD_INVALID => "BadMethodInvalid",
            StatusCode::BAD_ARGUMENTS_MISSING => "BadArgumentsMissing",
            StatusCode::BAD_NOT_CONNECTED => "BadNotConnected",
            StatusCode::BAD_INVALID_ARGUMENT => "BadInvalidArgument",
            StatusCode::BAD_TOO_MANY_ARGUMENTS => "BadTooManyArguments",
            s if s.is_good() => "Good",
            s if s.is_bad() => "Bad",
            _ => "Uncertain",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

/// A value read from, or pushed by, the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    pub fn good(value: Variant) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: Some(Utc::now()),
        }
    }
}

// ── Node descriptions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    Object,
    Variable,
    Method,
}

/// What browsing a node reveals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_class: NodeClass,
    pub browse_name: String,
    /// Target of the inverse hierarchical reference, if any.
    pub parent: Option<NodeId>,
    /// Declared value type, for variables.
    pub data_type: Option<WireType>,
    pub array: bool,
}

/// One declared method argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub data_type: WireType,
    pub array: bool,
}

impl Argument {
    pub fn scalar(name: impl Into<String>, data_type: WireType) -> Self {
        Self {
            name: name.into(),
            data_type,
            array: false,
        }
    }
}

/// Declared input and output arguments of a method, in call order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodSignature {
    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
}
