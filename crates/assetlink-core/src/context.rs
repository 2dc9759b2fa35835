//! What the framework consumes from the surrounding runtime.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::model::operation::ArgumentDescriptor;
use crate::model::reference::Reference;
use crate::model::type_info::TypeInfo;

/// Lookups into the digital-twin runtime.
///
/// Called only during connection initialisation; results are cached by the
/// providers afterwards.
pub trait ServiceContext: Send + Sync {
    /// Declared type of the element at `reference`.
    fn type_info(&self, reference: &Reference) -> Result<TypeInfo, ContextError>;

    /// Declared output arguments of the operation at `reference`, in order.
    fn operation_output_variables(
        &self,
        reference: &Reference,
    ) -> Result<Vec<ArgumentDescriptor>, ContextError>;
}

/// A [`ServiceContext`] backed by fixed tables.
///
/// Used by the simulator and tests in place of a full runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceContext {
    types: HashMap<Reference, TypeInfo>,
    outputs: HashMap<Reference, Vec<ArgumentDescriptor>>,
}

impl StaticServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type_info(mut self, reference: Reference, type_info: TypeInfo) -> Self {
        self.types.insert(reference, type_info);
        self
    }

    /// Registers `reference` as an operation with the given outputs.
    pub fn with_outputs(mut self, reference: Reference, outputs: Vec<ArgumentDescriptor>) -> Self {
        self.outputs.insert(reference, outputs);
        self
    }
}

impl ServiceContext for StaticServiceContext {
    fn type_info(&self, reference: &Reference) -> Result<TypeInfo, ContextError> {
        self.types
            .get(reference)
            .copied()
            .ok_or_else(|| ContextError::NotFound(reference.clone()))
    }

    fn operation_output_variables(
        &self,
        reference: &Reference,
    ) -> Result<Vec<ArgumentDescriptor>, ContextError> {
        match self.outputs.get(reference) {
            Some(outputs) => Ok(outputs.clone()),
            None if self.types.contains_key(reference) => {
                Err(ContextError::NotAnOperation(reference.clone()))
            }
            None => Err(ContextError::NotFound(reference.clone())),
        }
    }
}

// ── Core configuration ────────────────────────────────────────────────────────

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

/// Runtime-wide settings shared by every asset connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Upper bound for opening a session.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for each read, write and call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::datatype::Datatype;

    fn reference(text: &str) -> Reference {
        Reference::parse(text).unwrap()
    }

    #[test]
    fn test_static_context_returns_registered_type() {
        // Arrange
        let r = reference("(Submodel)sm, (Property)Temp");
        let ctx = StaticServiceContext::new().with_type_info(r.clone(), TypeInfo::property(Datatype::Double));

        // Act / Assert
        assert_eq!(ctx.type_info(&r).unwrap(), TypeInfo::property(Datatype::Double));
        assert_eq!(
            ctx.type_info(&reference("(Property)Other")),
            Err(ContextError::NotFound(reference("(Property)Other")))
        );
    }

    #[test]
    fn test_outputs_distinguish_unknown_from_non_operation() {
        let prop = reference("(Property)Temp");
        let op = reference("(Operation)sqrt");
        let ctx = StaticServiceContext::new()
            .with_type_info(prop.clone(), TypeInfo::property(Datatype::Double))
            .with_outputs(
                op.clone(),
                vec![ArgumentDescriptor::new("x_sqrt", TypeInfo::property(Datatype::Double))],
            );

        assert_eq!(ctx.operation_output_variables(&op).unwrap().len(), 1);
        assert_eq!(
            ctx.operation_output_variables(&prop),
            Err(ContextError::NotAnOperation(prop.clone()))
        );
        assert!(matches!(
            ctx.operation_output_variables(&reference("(Operation)nope")),
            Err(ContextError::NotFound(_))
        ));
    }

    #[test]
    fn test_core_config_defaults_apply_to_missing_fields() {
        let config: CoreConfig = toml::from_str("request_timeout_ms = 500\n").unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(CoreConfig::default().request_timeout_ms, 3_000);
    }
}
