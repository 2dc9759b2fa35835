//! Addressing one element of an array node.
//!
//! Written as one bracketed index per dimension: `[3]` for a plain array,
//! `[1][0]` for an array of arrays.  Reads pick the element out of the whole
//! array; writes read the array, replace the element and write it back.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::domain::types::Variant;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArrayIndexParseError {
    #[error("array index must not be empty")]
    Empty,
    #[error("malformed array index '{0}': expected '[<n>]' per dimension")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayIndex(Vec<usize>);

impl ArrayIndex {
    pub fn new(indices: Vec<usize>) -> Result<Self, ArrayIndexParseError> {
        if indices.is_empty() {
            return Err(ArrayIndexParseError::Empty);
        }
        Ok(Self(indices))
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// The addressed element, or `None` when `array` is not deep enough or
    /// an index is out of bounds.
    pub fn get<'a>(&self, array: &'a Variant) -> Option<&'a Variant> {
        let mut current = array;
        for &i in &self.0 {
            match current {
                Variant::Array(_, items) => current = items.get(i)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// A copy of `array` with the addressed element replaced by `element`.
    pub fn replace(&self, array: &Variant, element: Variant) -> Option<Variant> {
        fn go(current: &Variant, path: &[usize], element: Variant) -> Option<Variant> {
            let Some((&first, rest)) = path.split_first() else {
                return Some(element);
            };
            let Variant::Array(wire, items) = current else {
                return None;
            };
            let mut items = items.clone();
            let slot = items.get_mut(first)?;
            *slot = go(slot, rest, element)?;
            Some(Variant::Array(*wire, items))
        }
        go(array, &self.0, element)
    }
}

impl FromStr for ArrayIndex {
    type Err = ArrayIndexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ArrayIndexParseError::Empty);
        }
        let malformed = || ArrayIndexParseError::Malformed(s.to_string());

        let mut indices = Vec::new();
        let mut rest = s;
        while !rest.is_empty() {
            let inner = rest.strip_prefix('[').ok_or_else(malformed)?;
            let (number, tail) = inner.split_once(']').ok_or_else(malformed)?;
            indices.push(number.trim().parse().map_err(|_| malformed())?);
            rest = tail.trim_start();
        }
        Self::new(indices)
    }
}

impl fmt::Display for ArrayIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in &self.0 {
            write!(f, "[{i}]")?;
        }
        Ok(())
    }
}
