use std::sync::Arc;

use assetlink_core::{
    ArgumentDescriptor, AssetConnectionError, AssetOperationProvider, ConfigurationError,
    ElementValue, InitError, OperationVariable, Reference, TypeInfo, TypedValue,
};
use async_trait::async_trait;
use tracing::debug;

use super::browse;
use crate::application::session::Session;
use crate::domain::config::{parse_node_id, parse_parent_node_id, OpcUaOperationProviderConfig};
use crate::domain::conversion::ValueConverter;
use crate::domain::types::{Argument, MethodSignature, NodeClass, NodeId, Variant};

/// Calls one remote method.
///
/// Arguments are matched by name, never by position: each declared input
/// argument is looked up among the input variables, then among the inout
/// variables.  After the call every inout variable that has a matching
/// output argument is overwritten in place, and the result holds one entry
/// per declared output variable that the method returned.
#[derive(Debug)]
pub struct OpcUaOperationProvider {
    reference: Reference,
    session: Arc<Session>,
    converter: ValueConverter,
    config: OpcUaOperationProviderConfig,
    method: NodeId,
    object: NodeId,
    signature: MethodSignature,
    outputs: Vec<ArgumentDescriptor>,
}

impl OpcUaOperationProvider {
    pub async fn new(
        reference: Reference,
        config: &OpcUaOperationProviderConfig,
        outputs: Vec<ArgumentDescriptor>,
        session: Arc<Session>,
        converter: ValueConverter,
    ) -> Result<Self, InitError> {
        if let Some(bad) = outputs
            .iter()
            .find(|o| !matches!(o.type_info, TypeInfo::Property { .. }))
        {
            return Err(ConfigurationError::UnsupportedElement {
                reference,
                reason: format!("output variable '{}' must be a property", bad.id_short),
            }
            .into());
        }

        let method = parse_node_id(&reference, &config.node_id)?;
        let info = browse(&session, &reference, &method).await?;
        if info.node_class != NodeClass::Method {
            return Err(unresolvable(&reference, &method, format!("{:?} is not a method", info.node_class)).into());
        }
        let object = match parse_parent_node_id(&reference, config.parent_node_id.as_deref())? {
            Some(object) => object,
            None => info
                .parent
                .ok_or_else(|| unresolvable(&reference, &method, "method has no parent".to_string()))?,
        };
        let signature = match session.method_arguments(&method).await {
            Ok(signature) => signature,
            Err(AssetConnectionError::BadStatus(reason)) => {
                return Err(unresolvable(&reference, &method, reason).into())
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            %reference,
            %method,
            %object,
            inputs = signature.inputs.len(),
            outputs = signature.outputs.len(),
            "operation provider ready"
        );

        Ok(Self {
            reference,
            session,
            converter,
            config: config.clone(),
            method,
            object,
            signature,
            outputs,
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    fn input_arguments(
        &self,
        input: &[OperationVariable],
        inoutput: &[OperationVariable],
    ) -> Result<Vec<Variant>, AssetConnectionError> {
        self.signature
            .inputs
            .iter()
            .map(|argument| {
                let id_short = self.config.input_id_short(&argument.name);
                let variable = input
                    .iter()
                    .chain(inoutput)
                    .find(|v| v.id_short == id_short)
                    .ok_or_else(|| {
                        AssetConnectionError::ArgumentMismatch(format!(
                            "missing input argument '{}' (idShort '{id_short}')",
                            argument.name
                        ))
                    })?;
                let value = property(variable)?;
                self.to_wire(value, argument)
            })
            .collect()
    }

    fn to_wire(&self, value: &TypedValue, argument: &Argument) -> Result<Variant, AssetConnectionError> {
        let converted = if argument.array {
            self.converter.to_variant_array(value, argument.data_type)
        } else {
            self.converter.to_variant(value, argument.data_type)
        };
        converted.map_err(|e| {
            AssetConnectionError::ArgumentMismatch(format!("input argument '{}': {e}", argument.name))
        })
    }

    /// The returned value for output argument `name`.
    fn output<'a>(&self, results: &'a [Variant], name: &str) -> Option<&'a Variant> {
        self.signature
            .outputs
            .iter()
            .position(|a| a.name == name)
            .and_then(|i| results.get(i))
    }
}

fn unresolvable(reference: &Reference, method: &NodeId, reason: String) -> ConfigurationError {
    ConfigurationError::UnresolvableAddress {
        reference: reference.clone(),
        address: method.to_string(),
        reason,
    }
}

fn property(variable: &OperationVariable) -> Result<&TypedValue, AssetConnectionError> {
    variable.value.as_property().ok_or_else(|| {
        AssetConnectionError::UnsupportedValue(format!(
            "argument '{}' must be a property, found {}",
            variable.id_short,
            variable.value.kind()
        ))
    })
}

#[async_trait]
impl AssetOperationProvider for OpcUaOperationProvider {
    async fn invoke(
        &self,
        input: &[OperationVariable],
        inoutput: &mut [OperationVariable],
    ) -> Result<Vec<OperationVariable>, AssetConnectionError> {
        let arguments = self.input_arguments(input, inoutput)?;
        let results = self
            .session
            .call(&self.object, &self.method, arguments)
            .await?;
        if results.len() != self.signature.outputs.len() {
            return Err(AssetConnectionError::ArgumentMismatch(format!(
                "{} returned {} values, {} declared",
                self.method,
                results.len(),
                self.signature.outputs.len()
            )));
        }

        // Convert everything first so a failure leaves the inout values alone.
        let mut updates = Vec::new();
        for (i, variable) in inoutput.iter().enumerate() {
            let name = self.config.output_argument_name(&variable.id_short);
            let Some(result) = self.output(&results, name) else {
                continue;
            };
            let current = property(variable)?;
            let type_info = TypeInfo::Property {
                datatype: current.datatype(),
                array: current.is_array(),
            };
            let value = self
                .converter
                .to_element_value(std::slice::from_ref(result), &type_info)?;
            updates.push((i, value));
        }

        let mut output = Vec::with_capacity(self.outputs.len());
        for descriptor in &self.outputs {
            let name = self.config.output_argument_name(&descriptor.id_short);
            if let Some(result) = self.output(&results, name) {
                let value: ElementValue = self
                    .converter
                    .to_element_value(std::slice::from_ref(result), &descriptor.type_info)?;
                output.push(OperationVariable::new(descriptor.id_short.clone(), value));
            }
        }

        for (i, value) in updates {
            inoutput[i].value = value;
        }
        debug!(reference = %self.reference, outputs = output.len(), "operation invoked");
        Ok(output)
    }
}
