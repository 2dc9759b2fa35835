//! Structural references into the digital-twin model.
//!
//! A [`Reference`] is an ordered path of typed keys, for example "the
//! `Temperature` property inside submodel `urn:example:sensors`".  It is an
//! immutable value key: two references are equal when their keys are equal,
//! regardless of where they were created.
//!
//! # Text form
//!
//! ```text
//! (Submodel)urn:example:sensors, (Property)Temperature
//! ```
//!
//! Each key is `(<KeyType>)<value>`; keys are separated by `", "`.  Values
//! must not contain a comma followed by `(`, which is the key separator.
//! The text form is also what configuration files use to key provider tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when a reference text cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceParseError {
    #[error("reference must contain at least one key")]
    Empty,
    #[error("malformed key '{0}': expected '(<KeyType>)<value>'")]
    MalformedKey(String),
    #[error("unknown key type '{0}'")]
    UnknownKeyType(String),
    #[error("key value '{0}' contains the key separator ', ('")]
    SeparatorInValue(String),
}

/// The kind of model element a [`Key`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyType {
    AssetAdministrationShell,
    Submodel,
    SubmodelElementCollection,
    SubmodelElementList,
    Property,
    Range,
    MultiLanguageProperty,
    ReferenceElement,
    Operation,
    GlobalReference,
}

impl KeyType {
    const ALL: [KeyType; 10] = [
        KeyType::AssetAdministrationShell,
        KeyType::Submodel,
        KeyType::SubmodelElementCollection,
        KeyType::SubmodelElementList,
        KeyType::Property,
        KeyType::Range,
        KeyType::MultiLanguageProperty,
        KeyType::ReferenceElement,
        KeyType::Operation,
        KeyType::GlobalReference,
    ];

    /// Name used in the text form.
    pub fn name(self) -> &'static str {
        match self {
            KeyType::AssetAdministrationShell => "AssetAdministrationShell",
            KeyType::Submodel => "Submodel",
            KeyType::SubmodelElementCollection => "SubmodelElementCollection",
            KeyType::SubmodelElementList => "SubmodelElementList",
            KeyType::Property => "Property",
            KeyType::Range => "Range",
            KeyType::MultiLanguageProperty => "MultiLanguageProperty",
            KeyType::ReferenceElement => "ReferenceElement",
            KeyType::Operation => "Operation",
            KeyType::GlobalReference => "GlobalReference",
        }
    }

    /// Looks up a key type by its text-form name (case-sensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of a [`Reference`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub key_type: KeyType,
    pub value: String,
}

impl Key {
    pub fn new(key_type: KeyType, value: impl Into<String>) -> Self {
        Self {
            key_type,
            value: value.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}){}", self.key_type, self.value)
    }
}

/// An immutable, structurally compared path to one model element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    keys: Vec<Key>,
}

impl Reference {
    /// Creates a reference from its keys.
    ///
    /// # Errors
    ///
    /// Returns [`ReferenceParseError::Empty`] when `keys` is empty and
    /// [`ReferenceParseError::SeparatorInValue`] when a value would not
    /// survive the text form.
    pub fn new(keys: Vec<Key>) -> Result<Self, ReferenceParseError> {
        if keys.is_empty() {
            return Err(ReferenceParseError::Empty);
        }
        for key in &keys {
            check_value(&key.value)?;
        }
        Ok(Self { keys })
    }

    /// Parses the text form, see the module documentation.
    ///
    /// # Errors
    ///
    /// Returns [`ReferenceParseError`] when the text is empty, a key is not of
    /// the form `(<KeyType>)<value>`, or the key type is unknown.
    pub fn parse(text: &str) -> Result<Self, ReferenceParseError> {
        text.parse()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Value of the last key, i.e. the idShort of the addressed element.
    pub fn id_short(&self) -> &str {
        self.keys.last().map(|k| k.value.as_str()).unwrap_or_default()
    }

    /// Returns a new reference with one more key appended.
    pub fn child(
        &self,
        key_type: KeyType,
        value: impl Into<String>,
    ) -> Result<Self, ReferenceParseError> {
        let key = Key::new(key_type, value);
        check_value(&key.value)?;
        let mut keys = self.keys.clone();
        keys.push(key);
        Ok(Self { keys })
    }

    /// `true` when `prefix`'s keys are a leading subsequence of this reference.
    pub fn starts_with(&self, prefix: &Reference) -> bool {
        self.keys.starts_with(&prefix.keys)
    }
}

impl FromStr for Reference {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ReferenceParseError::Empty);
        }

        let mut keys = Vec::new();
        for part in split_keys(trimmed) {
            let part = part.trim();
            let rest = part
                .strip_prefix('(')
                .ok_or_else(|| ReferenceParseError::MalformedKey(part.to_string()))?;
            let (type_name, value) = rest
                .split_once(')')
                .ok_or_else(|| ReferenceParseError::MalformedKey(part.to_string()))?;
            let key_type = KeyType::from_name(type_name.trim())
                .ok_or_else(|| ReferenceParseError::UnknownKeyType(type_name.to_string()))?;
            if value.is_empty() {
                return Err(ReferenceParseError::MalformedKey(part.to_string()));
            }
            keys.push(Key::new(key_type, value));
        }
        Self::new(keys)
    }
}

fn check_value(value: &str) -> Result<(), ReferenceParseError> {
    let splits = value
        .char_indices()
        .any(|(i, c)| c == ',' && value[i + 1..].trim_start().starts_with('('));
    if splits {
        return Err(ReferenceParseError::SeparatorInValue(value.to_string()));
    }
    Ok(())
}

/// Splits on commas that start a new key (a comma followed by optional
/// whitespace and `(`), so commas inside values survive.
fn split_keys(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == ',' && text[i + 1..].trim_start().starts_with('(') {
            parts.push(&text[start..i]);
            start = i + 1;
        }
    }
    parts.push(&text[start..]);
    parts
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
