//! Conversion between model values and OPC UA wire values.
//!
//! [`ValueConverter`] is pure: no I/O, no shared mutable state.  Every
//! (datatype, wire type) pair is handled by one exhaustive match, so a new
//! [`Datatype`] does not compile until it is mapped here.
//!
//! # Default mapping
//!
//! | Datatype                       | Wire type                 |
//! |--------------------------------|---------------------------|
//! | integer kinds                  | any integer type, range-checked; also Float/Double |
//! | `xs:float`, `xs:double`        | Float, Double             |
//! | `xs:boolean`                   | Boolean                   |
//! | `xs:string`, `xs:anyURI`       | String                    |
//! | `xs:dateTime`                  | DateTime                  |
//! | `xs:duration`                  | Double (milliseconds)     |
//! | `xs:hexBinary`, `xs:base64Binary` | ByteString             |
//! | `rdf:langString`               | LocalizedText             |
//! | `uuid`                         | Guid                      |
//! | `qname`                        | QualifiedName             |
//!
//! Two fallbacks apply to every datatype: a wire `String` is parsed with the
//! datatype's text form, and any value is written to a `String` node as its
//! text form.
//!
//! # Element layout
//!
//! | TypeInfo                 | Wire nodes                                 |
//! |--------------------------|--------------------------------------------|
//! | property                 | the node itself (scalar or array)          |
//! | range                    | `<node>/Min` and `<node>/Max`              |
//! | multi-language property  | the node itself, `LocalizedText[]`         |
//! | reference element        | the node itself, `String[]` of key texts   |
//!
//! # Custom conversions
//!
//! Deployments with unusual servers can register an explicit conversion for
//! one (datatype, wire type) pair.  Registered conversions take precedence
//! over the default mapping and are fixed once the converter is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use assetlink_core::{
    Datatype, ElementValue, LangString, LangStringSet, Reference, TypeInfo, TypedValue,
    ValueConversionError,
};

use crate::domain::types::{LocalizedText, NodeId, Variant, WireType};

/// Converts one wire value into a model value.
pub type ToModelFn = dyn Fn(&Variant) -> Result<TypedValue, ValueConversionError> + Send + Sync;

/// Converts one model value into a wire value.
pub type ToWireFn = dyn Fn(&TypedValue) -> Result<Variant, ValueConversionError> + Send + Sync;

/// Component names of a range's bounds.
pub const RANGE_MIN: &str = "Min";
pub const RANGE_MAX: &str = "Max";

#[derive(Clone, Default)]
pub struct ValueConverter {
    to_model: HashMap<(WireType, Datatype), Arc<ToModelFn>>,
    to_wire: HashMap<(Datatype, WireType), Arc<ToWireFn>>,
}

impl fmt::Debug for ValueConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueConverter")
            .field("to_model", &self.to_model.keys().collect::<Vec<_>>())
            .field("to_wire", &self.to_wire.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn mismatch(expected: impl fmt::Display, found: impl fmt::Display) -> ValueConversionError {
    ValueConversionError::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn out_of_range(value: impl fmt::Display, target: impl fmt::Display) -> ValueConversionError {
    ValueConversionError::OutOfRange {
        value: value.to_string(),
        target: target.to_string(),
    }
}

impl ValueConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wire → model conversion for one pair.
    pub fn with_to_model<F>(mut self, wire: WireType, datatype: Datatype, f: F) -> Self
    where
        F: Fn(&Variant) -> Result<TypedValue, ValueConversionError> + Send + Sync + 'static,
    {
        self.to_model.insert((wire, datatype), Arc::new(f));
        self
    }

    /// Registers a model → wire conversion for one pair.
    pub fn with_to_wire<F>(mut self, datatype: Datatype, wire: WireType, f: F) -> Self
    where
        F: Fn(&TypedValue) -> Result<Variant, ValueConversionError> + Send + Sync + 'static,
    {
        self.to_wire.insert((datatype, wire), Arc::new(f));
        self
    }

    // ── Scalars ───────────────────────────────────────────────────────────────

    /// Converts a scalar wire value into `datatype`.
    pub fn to_typed_value(
        &self,
        value: &Variant,
        datatype: Datatype,
    ) -> Result<TypedValue, ValueConversionError> {
        let Some(wire) = value.wire_type() else {
            return Err(mismatch(datatype, "Empty"));
        };
        if value.is_array() {
            return Err(mismatch(datatype, value.describe()));
        }
        if let Some(custom) = self.to_model.get(&(wire, datatype)) {
            return custom(value);
        }

        // Text fallbacks
        match (value, datatype) {
            (Variant::String(s), Datatype::String) => return Ok(TypedValue::String(s.clone())),
            (Variant::String(s), _) => return Ok(TypedValue::from_text(datatype, s)?),
            (_, Datatype::String) => return Ok(TypedValue::String(variant_text(value))),
            _ => {}
        }

        if datatype.is_integer() {
            let n = variant_integer(value).ok_or_else(|| mismatch(datatype, wire))?;
            return integer_typed(datatype, n);
        }

        let typed = match (datatype, value) {
            (Datatype::Boolean, Variant::Boolean(b)) => TypedValue::Boolean(*b),
            (Datatype::Float, v) => {
                let x = variant_float(v).ok_or_else(|| mismatch(datatype, wire))?;
                let narrowed = x as f32;
                if x.is_finite() && !narrowed.is_finite() {
                    return Err(out_of_range(x, datatype));
                }
                TypedValue::Float(narrowed)
            }
            (Datatype::Double, v) => {
                TypedValue::Double(variant_float(v).ok_or_else(|| mismatch(datatype, wire))?)
            }
            (Datatype::DateTime, Variant::DateTime(t)) => TypedValue::DateTime(*t),
            (Datatype::Duration, v) => {
                let ms = variant_float(v).ok_or_else(|| mismatch(datatype, wire))?;
                let duration = Duration::try_from_secs_f64(ms / 1000.0)
                    .map_err(|_| out_of_range(ms, datatype))?;
                TypedValue::Duration(duration)
            }
            (Datatype::HexBinary, Variant::ByteString(b)) => TypedValue::HexBinary(b.clone()),
            (Datatype::Base64Binary, Variant::ByteString(b)) => {
                TypedValue::Base64Binary(b.clone())
            }
            (Datatype::LangString, Variant::LocalizedText(t)) => {
                TypedValue::LangString(LangString::new(t.locale.clone(), t.text.clone()))
            }
            (Datatype::Uuid, Variant::Guid(g)) => TypedValue::Uuid(*g),
            (Datatype::QualifiedName, Variant::QualifiedName(q)) => {
                TypedValue::QualifiedName(q.clone())
            }
            (Datatype::AnyUri, _)
            | (Datatype::Boolean, _)
            | (Datatype::DateTime, _)
            | (Datatype::HexBinary, _)
            | (Datatype::Base64Binary, _)
            | (Datatype::LangString, _)
            | (Datatype::Uuid, _)
            | (Datatype::QualifiedName, _) => return Err(mismatch(datatype, wire)),
            // Handled above.
            (Datatype::String, _)
            | (Datatype::Byte, _)
            | (Datatype::Short, _)
            | (Datatype::Int, _)
            | (Datatype::Long, _)
            | (Datatype::UnsignedByte, _)
            | (Datatype::UnsignedShort, _)
            | (Datatype::UnsignedInt, _)
            | (Datatype::UnsignedLong, _)
            | (Datatype::Integer, _) => return Err(mismatch(datatype, wire)),
        };
        Ok(typed)
    }

    /// Converts a scalar model value into the wire type `hint`.
    pub fn to_variant(
        &self,
        value: &TypedValue,
        hint: WireType,
    ) -> Result<Variant, ValueConversionError> {
        if value.is_array() {
            return Err(mismatch(hint, format!("{}[]", value.datatype())));
        }
        let datatype = value.datatype();
        if let Some(custom) = self.to_wire.get(&(datatype, hint)) {
            return custom(value);
        }

        // Text fallbacks
        match (value, hint) {
            (_, WireType::String) => return Ok(Variant::String(value.to_text())),
            (TypedValue::String(s) | TypedValue::AnyUri(s), _) => {
                let parsed = TypedValue::from_text(canonical_datatype(hint), s)?;
                return self.to_variant(&parsed, hint);
            }
            _ => {}
        }

        if let Some(n) = typed_integer(value) {
            return match hint {
                WireType::Float => Ok(Variant::Float(n as f32)),
                WireType::Double => Ok(Variant::Double(n as f64)),
                _ => integer_variant(hint, n).ok_or_else(|| mismatch(hint, datatype)),
            }
            .and_then(|v| match v {
                Variant::Empty => Err(out_of_range(n, hint)),
                v => Ok(v),
            });
        }

        let variant = match (value, hint) {
            (TypedValue::Boolean(b), WireType::Boolean) => Variant::Boolean(*b),
            (TypedValue::Float(x), WireType::Float) => Variant::Float(*x),
            (TypedValue::Float(x), WireType::Double) => Variant::Double(f64::from(*x)),
            (TypedValue::Double(x), WireType::Double) => Variant::Double(*x),
            (TypedValue::Double(x), WireType::Float) => {
                let narrowed = *x as f32;
                if x.is_finite() && !narrowed.is_finite() {
                    return Err(out_of_range(x, hint));
                }
                Variant::Float(narrowed)
            }
            (TypedValue::DateTime(t), WireType::DateTime) => Variant::DateTime(*t),
            (TypedValue::Duration(d), WireType::Double) => Variant::Double(d.as_secs_f64() * 1000.0),
            (TypedValue::HexBinary(b) | TypedValue::Base64Binary(b), WireType::ByteString) => {
                Variant::ByteString(b.clone())
            }
            (TypedValue::LangString(s), WireType::LocalizedText) => {
                Variant::LocalizedText(LocalizedText::new(s.language.clone(), s.text.clone()))
            }
            (TypedValue::Uuid(g), WireType::Guid) => Variant::Guid(*g),
            (TypedValue::QualifiedName(q), WireType::QualifiedName) => {
                Variant::QualifiedName(q.clone())
            }
            _ => return Err(mismatch(hint, datatype)),
        };
        Ok(variant)
    }

    // ── Arrays ────────────────────────────────────────────────────────────────

    /// Converts a wire array (possibly nested) element-wise, preserving order.
    pub fn to_typed_array(
        &self,
        value: &Variant,
        datatype: Datatype,
    ) -> Result<TypedValue, ValueConversionError> {
        let Variant::Array(_, items) = value else {
            return Err(mismatch(format!("{datatype}[]"), value.describe()));
        };
        let converted = items
            .iter()
            .map(|item| match item {
                Variant::Array(..) => self.to_typed_array(item, datatype),
                scalar => self.to_typed_value(scalar, datatype),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TypedValue::Array(datatype, converted))
    }

    /// Converts a model array (possibly nested) element-wise, preserving order.
    pub fn to_variant_array(
        &self,
        value: &TypedValue,
        hint: WireType,
    ) -> Result<Variant, ValueConversionError> {
        let TypedValue::Array(datatype, items) = value else {
            return Err(mismatch(format!("{hint}[]"), value.datatype()));
        };
        let converted = items
            .iter()
            .map(|item| match item {
                TypedValue::Array(..) => self.to_variant_array(item, hint),
                scalar => self.to_variant(scalar, hint),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                ValueConversionError::TypeMismatch { .. } => mismatch(hint, format!("{datatype}[]")),
                other => other,
            })?;
        Ok(Variant::Array(hint, converted))
    }

    // ── Elements ──────────────────────────────────────────────────────────────

    /// Builds an element value from the wire values of its layout, in
    /// [`component_addresses`] order.
    pub fn to_element_value(
        &self,
        values: &[Variant],
        type_info: &TypeInfo,
    ) -> Result<ElementValue, ValueConversionError> {
        let expected = component_count(type_info);
        if values.len() != expected {
            return Err(ValueConversionError::Arity {
                expected,
                found: values.len(),
            });
        }

        match type_info {
            TypeInfo::Property {
                datatype,
                array: false,
            } => Ok(ElementValue::Property(
                self.to_typed_value(&values[0], *datatype)?,
            )),
            TypeInfo::Property {
                datatype,
                array: true,
            } => Ok(ElementValue::Property(
                self.to_typed_array(&values[0], *datatype)?,
            )),
            TypeInfo::Range { datatype } => {
                let bound = |v: &Variant| match v {
                    Variant::Empty => Ok(None),
                    v => self.to_typed_value(v, *datatype).map(Some),
                };
                Ok(ElementValue::Range {
                    min: bound(&values[0])?,
                    max: bound(&values[1])?,
                })
            }
            TypeInfo::MultiLanguageProperty => {
                let texts: Vec<&LocalizedText> = match &values[0] {
                    Variant::Empty => Vec::new(),
                    Variant::LocalizedText(t) => vec![t],
                    Variant::Array(WireType::LocalizedText, items) => items
                        .iter()
                        .map(|item| match item {
                            Variant::LocalizedText(t) => Ok(t),
                            other => Err(mismatch(WireType::LocalizedText, other.describe())),
                        })
                        .collect::<Result<_, _>>()?,
                    other => return Err(mismatch("LocalizedText[]", other.describe())),
                };
                Ok(ElementValue::MultiLanguage(
                    texts
                        .into_iter()
                        .map(|t| LangString::new(t.locale.clone(), t.text.clone()))
                        .collect::<LangStringSet>(),
                ))
            }
            TypeInfo::ReferenceElement => {
                let Variant::Array(WireType::String, items) = &values[0] else {
                    return Err(mismatch("String[]", values[0].describe()));
                };
                let mut keys = Vec::with_capacity(items.len());
                for item in items {
                    let Variant::String(text) = item else {
                        return Err(mismatch(WireType::String, item.describe()));
                    };
                    let single = Reference::parse(text).map_err(|e| {
                        mismatch("reference key", format!("'{text}' ({e})"))
                    })?;
                    let [key] = single.keys() else {
                        return Err(mismatch(
                            "one reference key per item",
                            format!("'{text}' holds {} keys", single.keys().len()),
                        ));
                    };
                    keys.push(key.clone());
                }
                let reference = Reference::new(keys)
                    .map_err(|e| mismatch("reference", e.to_string()))?;
                Ok(ElementValue::Reference(reference))
            }
        }
    }

    /// Turns an element value into the wire values of its layout.
    ///
    /// `hints` carries the declared wire type of each component node.  An
    /// unset range bound becomes [`Variant::Empty`], meaning "leave that node
    /// unchanged".
    pub fn to_wire_values(
        &self,
        value: &ElementValue,
        type_info: &TypeInfo,
        hints: &[WireType],
    ) -> Result<Vec<Variant>, ValueConversionError> {
        if !type_info.accepts(value) {
            return Err(ValueConversionError::ShapeMismatch {
                expected: describe_type_info(type_info),
                found: describe_element(value),
            });
        }
        let expected = component_count(type_info);
        if hints.len() != expected {
            return Err(ValueConversionError::Arity {
                expected,
                found: hints.len(),
            });
        }

        match value {
            ElementValue::Property(v @ TypedValue::Array(..)) => {
                Ok(vec![self.to_variant_array(v, hints[0])?])
            }
            ElementValue::Property(v) => Ok(vec![self.to_variant(v, hints[0])?]),
            ElementValue::Range { min, max } => {
                let bound = |v: &Option<TypedValue>, hint: WireType| match v {
                    Some(v) => self.to_variant(v, hint),
                    None => Ok(Variant::Empty),
                };
                Ok(vec![bound(min, hints[0])?, bound(max, hints[1])?])
            }
            ElementValue::MultiLanguage(set) => Ok(vec![Variant::Array(
                WireType::LocalizedText,
                set.iter()
                    .map(|s| Variant::LocalizedText(LocalizedText::new(s.language, s.text)))
                    .collect(),
            )]),
            ElementValue::Reference(r) => Ok(vec![Variant::Array(
                WireType::String,
                r.keys().iter().map(|k| Variant::String(k.to_string())).collect(),
            )]),
        }
    }
}

/// Number of wire nodes an element of this type spans.
pub fn component_count(type_info: &TypeInfo) -> usize {
    match type_info {
        TypeInfo::Range { .. } => 2,
        _ => 1,
    }
}

/// Wire nodes backing an element at `base`, in layout order.
///
/// `None` when the layout needs component nodes but `base` has no string
/// identifier to derive them from.
pub fn component_addresses(base: &NodeId, type_info: &TypeInfo) -> Option<Vec<NodeId>> {
    match type_info {
        TypeInfo::Range { .. } => Some(vec![base.component(RANGE_MIN)?, base.component(RANGE_MAX)?]),
        _ => Some(vec![base.clone()]),
    }
}

/// Datatype a text is parsed into before it is written to a `wire` node.
pub fn canonical_datatype(wire: WireType) -> Datatype {
    match wire {
        WireType::Boolean => Datatype::Boolean,
        WireType::SByte => Datatype::Byte,
        WireType::Byte => Datatype::UnsignedByte,
        WireType::Int16 => Datatype::Short,
        WireType::UInt16 => Datatype::UnsignedShort,
        WireType::Int32 => Datatype::Int,
        WireType::UInt32 => Datatype::UnsignedInt,
        WireType::Int64 => Datatype::Long,
        WireType::UInt64 => Datatype::UnsignedLong,
        WireType::Float => Datatype::Float,
        WireType::Double => Datatype::Double,
        WireType::String => Datatype::String,
        WireType::DateTime => Datatype::DateTime,
        WireType::Guid => Datatype::Uuid,
        WireType::ByteString => Datatype::Base64Binary,
        WireType::LocalizedText => Datatype::LangString,
        WireType::QualifiedName => Datatype::QualifiedName,
    }
}

fn describe_type_info(type_info: &TypeInfo) -> String {
    match type_info {
        TypeInfo::Property {
            datatype,
            array: false,
        } => format!("Property of {datatype}"),
        TypeInfo::Property {
            datatype,
            array: true,
        } => format!("Property of {datatype}[]"),
        TypeInfo::Range { datatype } => format!("Range of {datatype}"),
        TypeInfo::MultiLanguageProperty => "MultiLanguageProperty".to_string(),
        TypeInfo::ReferenceElement => "ReferenceElement".to_string(),
    }
}

fn describe_element(value: &ElementValue) -> String {
    match value {
        ElementValue::Property(v) if v.is_array() => format!("Property of {}[]", v.datatype()),
        ElementValue::Property(v) => format!("Property of {}", v.datatype()),
        other => other.kind().to_string(),
    }
}

/// Text form of a scalar wire value.
fn variant_text(value: &Variant) -> String {
    match value {
        Variant::Empty => String::new(),
        Variant::Boolean(v) => v.to_string(),
        Variant::SByte(v) => v.to_string(),
        Variant::Byte(v) => v.to_string(),
        Variant::Int16(v) => v.to_string(),
        Variant::UInt16(v) => v.to_string(),
        Variant::Int32(v) => v.to_string(),
        Variant::UInt32(v) => v.to_string(),
        Variant::Int64(v) => v.to_string(),
        Variant::UInt64(v) => v.to_string(),
        Variant::Float(v) => v.to_string(),
        Variant::Double(v) => v.to_string(),
        Variant::String(v) => v.clone(),
        Variant::DateTime(v) => TypedValue::DateTime(*v).to_text(),
        Variant::Guid(v) => v.to_string(),
        Variant::ByteString(v) => TypedValue::Base64Binary(v.clone()).to_text(),
        Variant::LocalizedText(t) => t.text.clone(),
        Variant::QualifiedName(q) => TypedValue::QualifiedName(q.clone()).to_text(),
        Variant::Array(..) => String::new(),
    }
}

fn variant_integer(value: &Variant) -> Option<i128> {
    Some(match value {
        Variant::SByte(v) => i128::from(*v),
        Variant::Byte(v) => i128::from(*v),
        Variant::Int16(v) => i128::from(*v),
        Variant::UInt16(v) => i128::from(*v),
        Variant::Int32(v) => i128::from(*v),
        Variant::UInt32(v) => i128::from(*v),
        Variant::Int64(v) => i128::from(*v),
        Variant::UInt64(v) => i128::from(*v),
        _ => return None,
    })
}

fn variant_float(value: &Variant) -> Option<f64> {
    match value {
        Variant::Float(v) => Some(f64::from(*v)),
        Variant::Double(v) => Some(*v),
        other => variant_integer(other).map(|n| n as f64),
    }
}

fn typed_integer(value: &TypedValue) -> Option<i128> {
    Some(match value {
        TypedValue::Byte(v) => i128::from(*v),
        TypedValue::Short(v) => i128::from(*v),
        TypedValue::Int(v) => i128::from(*v),
        TypedValue::Long(v) | TypedValue::Integer(v) => i128::from(*v),
        TypedValue::UnsignedByte(v) => i128::from(*v),
        TypedValue::UnsignedShort(v) => i128::from(*v),
        TypedValue::UnsignedInt(v) => i128::from(*v),
        TypedValue::UnsignedLong(v) => i128::from(*v),
        _ => return None,
    })
}

fn integer_typed(datatype: Datatype, n: i128) -> Result<TypedValue, ValueConversionError> {
    let err = || out_of_range(n, datatype);
    Ok(match datatype {
        Datatype::Byte => TypedValue::Byte(n.try_into().map_err(|_| err())?),
        Datatype::Short => TypedValue::Short(n.try_into().map_err(|_| err())?),
        Datatype::Int => TypedValue::Int(n.try_into().map_err(|_| err())?),
        Datatype::Long => TypedValue::Long(n.try_into().map_err(|_| err())?),
        Datatype::Integer => TypedValue::Integer(n.try_into().map_err(|_| err())?),
        Datatype::UnsignedByte => TypedValue::UnsignedByte(n.try_into().map_err(|_| err())?),
        Datatype::UnsignedShort => TypedValue::UnsignedShort(n.try_into().map_err(|_| err())?),
        Datatype::UnsignedInt => TypedValue::UnsignedInt(n.try_into().map_err(|_| err())?),
        Datatype::UnsignedLong => TypedValue::UnsignedLong(n.try_into().map_err(|_| err())?),
        other => return Err(mismatch(other, "integer")),
    })
}

/// `None` when `wire` is not an integer type; `Some(Variant::Empty)` when
/// `n` does not fit.
fn integer_variant(wire: WireType, n: i128) -> Option<Variant> {
    fn fit<T: TryFrom<i128>>(n: i128, f: impl FnOnce(T) -> Variant) -> Variant {
        T::try_from(n).map(f).unwrap_or(Variant::Empty)
    }
    Some(match wire {
        WireType::SByte => fit(n, Variant::SByte),
        WireType::Byte => fit(n, Variant::Byte),
        WireType::Int16 => fit(n, Variant::Int16),
        WireType::UInt16 => fit(n, Variant::UInt16),
        WireType::Int32 => fit(n, Variant::Int32),
        WireType::UInt32 => fit(n, Variant::UInt32),
        WireType::Int64 => fit(n, Variant::Int64),
        WireType::UInt64 => fit(n, Variant::UInt64),
        _ => return None,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
