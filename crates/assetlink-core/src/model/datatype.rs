//! The closed set of primitive value kinds.
//!
//! Names follow XML Schema (`xs:int`, `xs:dateTime`, ...) because that is how
//! digital-twin models declare them.  Two kinds without an XSD counterpart,
//! `uuid` and `qname`, exist so wire-native GUID and qualified-name values can
//! be carried without loss.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datatype {
    String,
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    UnsignedByte,
    UnsignedShort,
    UnsignedInt,
    UnsignedLong,
    /// Arbitrary-size integer; carried as `i64`.
    Integer,
    Float,
    Double,
    DateTime,
    Duration,
    AnyUri,
    HexBinary,
    Base64Binary,
    LangString,
    Uuid,
    QualifiedName,
}

impl Datatype {
    /// Every datatype, in declaration order.
    pub const ALL: [Datatype; 21] = [
        Datatype::String,
        Datatype::Boolean,
        Datatype::Byte,
        Datatype::Short,
        Datatype::Int,
        Datatype::Long,
        Datatype::UnsignedByte,
        Datatype::UnsignedShort,
        Datatype::UnsignedInt,
        Datatype::UnsignedLong,
        Datatype::Integer,
        Datatype::Float,
        Datatype::Double,
        Datatype::DateTime,
        Datatype::Duration,
        Datatype::AnyUri,
        Datatype::HexBinary,
        Datatype::Base64Binary,
        Datatype::LangString,
        Datatype::Uuid,
        Datatype::QualifiedName,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Datatype::String => "xs:string",
            Datatype::Boolean => "xs:boolean",
            Datatype::Byte => "xs:byte",
            Datatype::Short => "xs:short",
            Datatype::Int => "xs:int",
            Datatype::Long => "xs:long",
            Datatype::UnsignedByte => "xs:unsignedByte",
            Datatype::UnsignedShort => "xs:unsignedShort",
            Datatype::UnsignedInt => "xs:unsignedInt",
            Datatype::UnsignedLong => "xs:unsignedLong",
            Datatype::Integer => "xs:integer",
            Datatype::Float => "xs:float",
            Datatype::Double => "xs:double",
            Datatype::DateTime => "xs:dateTime",
            Datatype::Duration => "xs:duration",
            Datatype::AnyUri => "xs:anyURI",
            Datatype::HexBinary => "xs:hexBinary",
            Datatype::Base64Binary => "xs:base64Binary",
            Datatype::LangString => "rdf:langString",
            Datatype::Uuid => "uuid",
            Datatype::QualifiedName => "qname",
        }
    }

    /// Looks up a datatype by name.  The `xs:` prefix is optional.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|d| {
            let full = d.name();
            full == name || full.strip_prefix("xs:") == Some(name)
        })
    }

    /// `true` for the integer kinds, signed or unsigned.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Datatype::Byte
                | Datatype::Short
                | Datatype::Int
                | Datatype::Long
                | Datatype::UnsignedByte
                | Datatype::UnsignedShort
                | Datatype::UnsignedInt
                | Datatype::UnsignedLong
                | Datatype::Integer
        )
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Datatype {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Datatype {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Datatype::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown datatype '{name}'")))
    }
}
