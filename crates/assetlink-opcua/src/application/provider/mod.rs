//! Providers backed by one OPC UA [`Session`].
//!
//! All three are built once during `OpcUaAssetConnection::init` and keep
//! nothing mutable except the subscription's listener set.  Construction
//! browses the configured nodes so that a typo in a node id fails `init`
//! instead of the first read.

mod operation;
mod subscription;
mod value;

pub use operation::OpcUaOperationProvider;
pub use subscription::OpcUaSubscriptionProvider;
pub use value::OpcUaValueProvider;

use assetlink_core::{AssetConnectionError, ConfigurationError, InitError, Reference, TypeInfo};

use crate::application::session::Session;
use crate::domain::array_index::ArrayIndex;
use crate::domain::config::{parse_array_index, parse_node_id};
use crate::domain::conversion::component_addresses;
use crate::domain::types::{NodeClass, NodeId, NodeInfo, WireType};

/// The wire nodes behind one element and the wire type each one declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeBinding {
    pub nodes: Vec<NodeId>,
    pub hints: Vec<WireType>,
    pub array_index: Option<ArrayIndex>,
}

impl NodeBinding {
    /// Resolves the layout of `type_info` at `node_id` against the server.
    pub async fn resolve(
        session: &Session,
        reference: &Reference,
        node_id: &str,
        array_index: Option<&str>,
        type_info: &TypeInfo,
    ) -> Result<Self, InitError> {
        let base = parse_node_id(reference, node_id)?;
        let array_index = parse_array_index(reference, array_index)?;

        if array_index.is_some() && !matches!(type_info, TypeInfo::Property { array: false, .. }) {
            return Err(ConfigurationError::UnsupportedElement {
                reference: reference.clone(),
                reason: "array_index requires a scalar property".to_string(),
            }
            .into());
        }

        let nodes = component_addresses(&base, type_info).ok_or_else(|| {
            ConfigurationError::UnsupportedElement {
                reference: reference.clone(),
                reason: format!("{base} has no string identifier to derive component nodes from"),
            }
        })?;

        let mut hints = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let info = browse(session, reference, node).await?;
            let data_type = match (info.node_class, info.data_type) {
                (NodeClass::Variable, Some(data_type)) => data_type,
                (class, _) => {
                    return Err(ConfigurationError::UnresolvableAddress {
                        reference: reference.clone(),
                        address: node.to_string(),
                        reason: format!("expected a variable node, found {class:?}"),
                    }
                    .into())
                }
            };
            if array_index.is_some() && !info.array {
                return Err(ConfigurationError::UnsupportedElement {
                    reference: reference.clone(),
                    reason: format!("array_index set but {node} is not an array"),
                }
                .into());
            }
            hints.push(data_type);
        }

        Ok(Self {
            nodes,
            hints,
            array_index,
        })
    }
}

/// Browses `node`, turning a status failure into a configuration error.
/// Transport failures stay connection errors.
pub(crate) async fn browse(
    session: &Session,
    reference: &Reference,
    node: &NodeId,
) -> Result<NodeInfo, InitError> {
    match session.browse(node).await {
        Ok(info) => Ok(info),
        Err(AssetConnectionError::BadStatus(reason)) => Err(ConfigurationError::UnresolvableAddress {
            reference: reference.clone(),
            address: node.to_string(),
            reason,
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}
