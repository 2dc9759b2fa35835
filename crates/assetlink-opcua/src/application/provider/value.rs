use std::sync::Arc;

use assetlink_core::{
    AssetConnectionError, AssetValueProvider, ElementValue, InitError, Reference, TypeInfo,
};
use async_trait::async_trait;
use tracing::debug;

use super::NodeBinding;
use crate::application::session::Session;
use crate::domain::config::OpcUaValueProviderConfig;
use crate::domain::conversion::ValueConverter;
use crate::domain::types::{StatusCode, Variant};

/// Reads and writes one element through its wire nodes.
#[derive(Debug)]
pub struct OpcUaValueProvider {
    reference: Reference,
    session: Arc<Session>,
    converter: ValueConverter,
    type_info: TypeInfo,
    binding: NodeBinding,
}

impl OpcUaValueProvider {
    pub async fn new(
        reference: Reference,
        config: &OpcUaValueProviderConfig,
        type_info: TypeInfo,
        session: Arc<Session>,
        converter: ValueConverter,
    ) -> Result<Self, InitError> {
        let binding = NodeBinding::resolve(
            &session,
            &reference,
            &config.node_id,
            config.array_index.as_deref(),
            &type_info,
        )
        .await?;
        debug!(%reference, node_id = %config.node_id, "value provider ready");
        Ok(Self {
            reference,
            session,
            converter,
            type_info,
            binding,
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    fn index_error(&self) -> AssetConnectionError {
        let index = self
            .binding
            .array_index
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        AssetConnectionError::BadStatus(format!(
            "{}{index}: {}",
            self.binding.nodes[0],
            StatusCode::BAD_INDEX_RANGE_INVALID
        ))
    }
}

#[async_trait]
impl AssetValueProvider for OpcUaValueProvider {
    async fn get_value(&self) -> Result<ElementValue, AssetConnectionError> {
        let mut values = Vec::with_capacity(self.binding.nodes.len());
        for node in &self.binding.nodes {
            values.push(self.session.read(node).await?);
        }
        if let Some(index) = &self.binding.array_index {
            let element = index.get(&values[0]).cloned().ok_or_else(|| self.index_error())?;
            values = vec![element];
        }
        Ok(self.converter.to_element_value(&values, &self.type_info)?)
    }

    async fn set_value(&self, value: &ElementValue) -> Result<(), AssetConnectionError> {
        let wire = self
            .converter
            .to_wire_values(value, &self.type_info, &self.binding.hints)?;

        if let Some(index) = &self.binding.array_index {
            let node = &self.binding.nodes[0];
            let element = wire.into_iter().next().unwrap_or_default();
            let current = self.session.read(node).await?;
            let updated = index
                .replace(&current, element)
                .ok_or_else(|| self.index_error())?;
            return self.session.write(node, updated).await;
        }

        for (node, variant) in self.binding.nodes.iter().zip(wire) {
            if matches!(variant, Variant::Empty) {
                continue;
            }
            self.session.write(node, variant).await?;
        }
        Ok(())
    }
}
