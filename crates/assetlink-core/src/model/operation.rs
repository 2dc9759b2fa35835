//! Operation arguments.

use super::type_info::TypeInfo;
use super::value::ElementValue;

/// One named argument passed to or returned from an operation.
///
/// The `id_short` is what binds a variable to a remote parameter; the
/// position in the caller's slice carries no meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationVariable {
    pub id_short: String,
    pub value: ElementValue,
}

impl OperationVariable {
    pub fn new(id_short: impl Into<String>, value: impl Into<ElementValue>) -> Self {
        Self {
            id_short: id_short.into(),
            value: value.into(),
        }
    }
}

/// Declared output argument of an operation, as the runtime describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentDescriptor {
    pub id_short: String,
    pub type_info: TypeInfo,
}

impl ArgumentDescriptor {
    pub fn new(id_short: impl Into<String>, type_info: TypeInfo) -> Self {
        Self {
            id_short: id_short.into(),
            type_info,
        }
    }
}
