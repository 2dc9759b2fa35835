//! Declared shape of the value at a reference.
//!
//! The runtime hands this out once per reference; providers cache it for
//! their whole lifetime.

use serde::{Deserialize, Serialize};

use super::datatype::Datatype;
use super::value::{ElementValue, TypedValue};

/// Shape plus primitive datatype of one model element.
///
/// In TOML:
///
/// ```toml
/// kind = "property"
/// datatype = "xs:double"
/// array = false
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeInfo {
    Property {
        datatype: Datatype,
        #[serde(default)]
        array: bool,
    },
    Range {
        datatype: Datatype,
    },
    MultiLanguageProperty,
    ReferenceElement,
}

impl TypeInfo {
    pub fn property(datatype: Datatype) -> Self {
        TypeInfo::Property {
            datatype,
            array: false,
        }
    }

    pub fn array(datatype: Datatype) -> Self {
        TypeInfo::Property {
            datatype,
            array: true,
        }
    }

    /// Primitive datatype, where the shape has one.
    pub fn datatype(&self) -> Option<Datatype> {
        match self {
            TypeInfo::Property { datatype, .. } | TypeInfo::Range { datatype } => Some(*datatype),
            TypeInfo::MultiLanguageProperty => Some(Datatype::LangString),
            TypeInfo::ReferenceElement => None,
        }
    }

    /// `true` when `value` has the shape (and, for properties and ranges, the
    /// datatype) this type info declares.
    pub fn accepts(&self, value: &ElementValue) -> bool {
        match (self, value) {
            (TypeInfo::Property { datatype, array }, ElementValue::Property(v)) => {
                v.datatype() == *datatype && v.is_array() == *array
            }
            (TypeInfo::Range { datatype }, ElementValue::Range { min, max }) => [min, max]
                .into_iter()
                .flatten()
                .all(|v: &TypedValue| v.datatype() == *datatype && !v.is_array()),
            (TypeInfo::MultiLanguageProperty, ElementValue::MultiLanguage(_)) => true,
            (TypeInfo::ReferenceElement, ElementValue::Reference(_)) => true,
            _ => false,
        }
    }
}
