//! [`UaConnector`] on the `opcua` crate's client stack.
//!
//! The stack's API is blocking.  Every service call runs on Tokio's blocking
//! pool while holding a read lock on the stack session, so calls from
//! different providers proceed in parallel and are multiplexed on one secure
//! channel.  `disconnect` takes the write lock and waits for calls in flight.
//! Data change callbacks run on the stack's publish thread.
//!
//! Each monitored item gets a subscription of its own whose publishing
//! interval is the sampling interval; deleting the item deletes that
//! subscription.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opcua::client::prelude::{
    AttributeService, Client, ClientBuilder, DataChangeCallback as UaDataChangeCallback,
    IdentityToken, MethodService, MonitoredItemService, Session as UaSession, SessionCommand,
    SubscriptionService, ViewService,
};
use opcua::sync::RwLock;
use opcua::types as ua;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::session::{
    DataChangeCallback, MonitoredItemId, UaClient, UaConnector, UaError,
};
use crate::domain::config::{ClientSettings, OpcUaAssetConnectionConfig};
use crate::domain::endpoint::{Endpoint, Identity, MessageSecurityMode};
use crate::domain::types::{
    Argument, DataValue, Identifier, LocalizedText, MethodSignature, NodeClass, NodeId, NodeInfo,
    StatusCode, Variant, WireType,
};

const APPLICATION_NAME: &str = "AssetLink OPC UA Client";
const APPLICATION_URI: &str = "urn:assetlink:opcua:client";
const PRODUCT_URI: &str = "urn:assetlink:opcua";

/// Opens sessions on real OPC UA servers.
#[derive(Debug, Clone)]
pub struct OpcUaClientConnector {
    settings: ClientSettings,
}

impl OpcUaClientConnector {
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &OpcUaAssetConnectionConfig) -> Self {
        Self::new(config.client_settings())
    }

    fn build_client(&self) -> Result<Client, UaError> {
        ClientBuilder::new()
            .application_name(APPLICATION_NAME)
            .application_uri(APPLICATION_URI)
            .product_uri(PRODUCT_URI)
            .pki_dir(self.settings.pki_dir.clone())
            .certificate_path(self.settings.application_certificate.certificate.clone())
            .private_key_path(self.settings.application_certificate.private_key.clone())
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .session_retry_limit(0)
            .client()
            .ok_or_else(|| UaError::Rejected("invalid OPC UA client configuration".to_string()))
    }
}

#[async_trait]
impl UaConnector for OpcUaClientConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> Result<Arc<dyn UaClient>, UaError> {
        let connector = self.clone();
        let policy = endpoint.security_policy().uri();
        let description = (
            endpoint.as_str(),
            policy.as_str(),
            ua_security_mode(endpoint.security_mode()),
            ua::UserTokenPolicy::anonymous(),
        );
        let description: ua::EndpointDescription = description.into();
        let token = identity_token(identity);
        let url = endpoint.to_string();

        // Building the client reads or creates the application certificate.
        let handshake = tokio::task::spawn_blocking(move || {
            let mut client = connector.build_client()?;
            let session = client
                .connect_to_endpoint(description, token)
                .map_err(connect_error)?;
            let publisher = UaSession::run_async(Arc::clone(&session));
            Ok::<_, UaError>((session, publisher))
        });
        let (session, publisher) = tokio::time::timeout(self.settings.acknowledge_timeout, handshake)
            .await
            .map_err(|_| UaError::EndpointUnreachable(format!("{url}: handshake timed out")))?
            .map_err(|e| UaError::ConnectionLost(format!("stack task failed: {e}")))??;

        info!(endpoint = %url, security = %endpoint.security_policy(), "stack session opened");
        Ok(Arc::new(StackSession {
            session,
            publisher: Mutex::new(Some(publisher)),
        }))
    }
}

/// One session of the `opcua` client stack.
struct StackSession {
    session: Arc<RwLock<UaSession>>,
    publisher: Mutex<Option<oneshot::Sender<SessionCommand>>>,
}

impl StackSession {
    /// Runs `f` against the stack session on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, UaError>
    where
        F: FnOnce(&UaSession) -> Result<T, UaError> + Send + 'static,
        T: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let session = session.read();
            f(&session)
        })
        .await
        .map_err(|e| UaError::ConnectionLost(format!("stack task failed: {e}")))?
    }
}

#[async_trait]
impl UaClient for StackSession {
    async fn browse(&self, node: &NodeId) -> Result<NodeInfo, UaError> {
        let node = node.clone();
        self.blocking(move |session| {
            let ua_node = ua_node_id(&node);
            let attributes = [
                ua::AttributeId::NodeClass,
                ua::AttributeId::BrowseName,
                ua::AttributeId::DataType,
                ua::AttributeId::ValueRank,
            ]
            .map(|attribute| read_value_id(&ua_node, attribute));
            let values = AttributeService::read(session, &attributes, ua::TimestampsToReturn::Neither, 0.0)
                .map_err(request_error)?;
            let [node_class, browse_name, data_type, value_rank] = <[ua::DataValue; 4]>::try_from(values)
                .map_err(|_| UaError::Status(StatusCode::BAD_UNEXPECTED_ERROR))?;

            let node_class = match good_value(&node_class)? {
                ua::Variant::Int32(1) => NodeClass::Object,
                ua::Variant::Int32(2) => NodeClass::Variable,
                ua::Variant::Int32(4) => NodeClass::Method,
                _ => return Err(UaError::Status(StatusCode::BAD_NODE_ID_UNKNOWN)),
            };
            let browse_name = match good_value(&browse_name)? {
                ua::Variant::QualifiedName(name) => name.name.as_ref().to_string(),
                _ => String::new(),
            };
            let data_type = match data_type.value {
                Some(ua::Variant::NodeId(id)) => wire_type_of(&id),
                _ => None,
            };
            let array = matches!(value_rank.value, Some(ua::Variant::Int32(rank)) if rank >= 0);

            Ok(NodeInfo {
                node_id: node.clone(),
                node_class,
                browse_name,
                parent: parent_of(session, &ua_node)?,
                data_type,
                array,
            })
        })
        .await
    }

    async fn read(&self, node: &NodeId) -> Result<DataValue, UaError> {
        let node = read_value_id(&ua_node_id(node), ua::AttributeId::Value);
        self.blocking(move |session| {
            let values = AttributeService::read(session, &[node], ua::TimestampsToReturn::Source, 0.0)
                .map_err(request_error)?;
            let value = values
                .into_iter()
                .next()
                .ok_or(UaError::Status(StatusCode::BAD_UNEXPECTED_ERROR))?;
            let value = data_value(&value);
            if value.status.is_bad() {
                return Err(UaError::Status(value.status));
            }
            Ok(value)
        })
        .await
    }

    async fn write(&self, node: &NodeId, value: Variant) -> Result<(), UaError> {
        let write = ua::WriteValue {
            node_id: ua_node_id(node),
            attribute_id: ua::AttributeId::Value as u32,
            index_range: ua::UAString::null(),
            value: ua::DataValue::value_only(ua_variant(&value)?),
        };
        self.blocking(move |session| {
            let results = AttributeService::write(session, &[write]).map_err(request_error)?;
            match results.first() {
                Some(status) if status.is_bad() => Err(UaError::Status(status_code(*status))),
                Some(_) => Ok(()),
                None => Err(UaError::Status(StatusCode::BAD_UNEXPECTED_ERROR)),
            }
        })
        .await
    }

    async fn method_arguments(&self, method: &NodeId) -> Result<MethodSignature, UaError> {
        let method = ua_node_id(method);
        self.blocking(move |session| {
            let description = ua::BrowseDescription {
                node_id: method,
                browse_direction: ua::BrowseDirection::Forward,
                reference_type_id: ua::ReferenceTypeId::HasProperty.into(),
                include_subtypes: true,
                node_class_mask: 0,
                result_mask: ua::BrowseResultMask::All as u32,
            };
            let mut signature = MethodSignature::default();
            for reference in references(session, description)? {
                let target = match reference.browse_name.name.as_ref() {
                    "InputArguments" => &mut signature.inputs,
                    "OutputArguments" => &mut signature.outputs,
                    _ => continue,
                };
                let id = read_value_id(&reference.node_id.node_id, ua::AttributeId::Value);
                let values = AttributeService::read(session, &[id], ua::TimestampsToReturn::Neither, 0.0)
                    .map_err(request_error)?;
                if let Some(value) = values.first() {
                    *target = arguments(good_value(value)?)?;
                }
            }
            Ok(signature)
        })
        .await
    }

    async fn call(
        &self,
        object: &NodeId,
        method: &NodeId,
        inputs: Vec<Variant>,
    ) -> Result<Vec<Variant>, UaError> {
        let request = ua::CallMethodRequest {
            object_id: ua_node_id(object),
            method_id: ua_node_id(method),
            input_arguments: Some(inputs.iter().map(ua_variant).collect::<Result<_, _>>()?),
        };
        self.blocking(move |session| {
            let result = MethodService::call(session, request).map_err(request_error)?;
            if result.status_code.is_bad() {
                return Err(UaError::Status(status_code(result.status_code)));
            }
            result
                .output_arguments
                .unwrap_or_default()
                .iter()
                .map(variant)
                .collect()
        })
        .await
    }

    async fn create_monitored_item(
        &self,
        node: &NodeId,
        interval: Duration,
        callback: DataChangeCallback,
    ) -> Result<MonitoredItemId, UaError> {
        let node = ua_node_id(node);
        let interval_ms = interval.as_secs_f64() * 1000.0;
        self.blocking(move |session| {
            let on_change = UaDataChangeCallback::new(move |items| {
                for item in items.iter() {
                    callback(data_value(item.last_value()));
                }
            });
            let subscription = SubscriptionService::create_subscription(
                session, interval_ms, 10, 30, 0, 0, true, on_change,
            )
            .map_err(request_error)?;
            let request: ua::MonitoredItemCreateRequest = node.into();
            let results = MonitoredItemService::create_monitored_items(
                session,
                subscription,
                ua::TimestampsToReturn::Source,
                &[request],
            )
            .map_err(request_error)?;
            match results.first() {
                Some(result) if !result.status_code.is_bad() => Ok(subscription),
                other => {
                    let status = other.map_or(StatusCode::BAD_UNEXPECTED_ERROR, |r| status_code(r.status_code));
                    if let Err(e) = SubscriptionService::delete_subscription(session, subscription) {
                        warn!(subscription, error = %e, "failed to delete subscription");
                    }
                    Err(UaError::Status(status))
                }
            }
        })
        .await
    }

    async fn delete_monitored_item(&self, id: MonitoredItemId) -> Result<(), UaError> {
        self.blocking(move |session| {
            SubscriptionService::delete_subscription(session, id).map_err(request_error)?;
            Ok(())
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), UaError> {
        let publisher = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(publisher) = publisher else {
            return Ok(());
        };
        if publisher.send(SessionCommand::Stop).is_err() {
            debug!("stack publish loop already stopped");
        }
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || session.write().disconnect())
            .await
            .map_err(|e| UaError::ConnectionLost(format!("stack task failed: {e}")))?;
        info!("stack session closed");
        Ok(())
    }
}

// ── Services ──────────────────────────────────────────────────────────────────

fn read_value_id(node: &ua::NodeId, attribute: ua::AttributeId) -> ua::ReadValueId {
    ua::ReadValueId {
        node_id: node.clone(),
        attribute_id: attribute as u32,
        index_range: ua::UAString::null(),
        data_encoding: ua::QualifiedName::null(),
    }
}

fn references(
    session: &UaSession,
    description: ua::BrowseDescription,
) -> Result<Vec<ua::ReferenceDescription>, UaError> {
    let results = ViewService::browse(session, &[description]).map_err(request_error)?;
    Ok(results
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|r| r.references)
        .unwrap_or_default())
}

fn parent_of(session: &UaSession, node: &ua::NodeId) -> Result<Option<NodeId>, UaError> {
    let description = ua::BrowseDescription {
        node_id: node.clone(),
        browse_direction: ua::BrowseDirection::Inverse,
        reference_type_id: ua::ReferenceTypeId::HierarchicalReferences.into(),
        include_subtypes: true,
        node_class_mask: 0,
        result_mask: ua::BrowseResultMask::All as u32,
    };
    Ok(references(session, description)?
        .first()
        .map(|r| node_id(&r.node_id.node_id)))
}

fn good_value(value: &ua::DataValue) -> Result<&ua::Variant, UaError> {
    if let Some(status) = value.status.filter(|s| s.is_bad()) {
        return Err(UaError::Status(status_code(status)));
    }
    value
        .value
        .as_ref()
        .ok_or(UaError::Status(StatusCode::BAD_UNEXPECTED_ERROR))
}

fn arguments(value: &ua::Variant) -> Result<Vec<Argument>, UaError> {
    let ua::Variant::Array(array) = value else {
        return Err(UaError::Status(StatusCode::BAD_TYPE_MISMATCH));
    };
    let options = ua::DecodingOptions::default();
    array
        .values
        .iter()
        .map(|item| {
            let ua::Variant::ExtensionObject(object) = item else {
                return Err(UaError::Status(StatusCode::BAD_TYPE_MISMATCH));
            };
            let argument: ua::Argument = object.decode_inner(&options).map_err(|s| UaError::Status(status_code(s)))?;
            let data_type =
                wire_type_of(&argument.data_type).ok_or(UaError::Status(StatusCode::BAD_TYPE_MISMATCH))?;
            Ok(Argument {
                name: argument.name.as_ref().to_string(),
                data_type,
                array: argument.value_rank >= 0,
            })
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────────────────────

const BAD_TCP_ENDPOINT_URL_INVALID: u32 = 0x8083_0000;
const BAD_CONNECTION_REJECTED: u32 = 0x80AC_0000;
const BAD_CONNECTION_CLOSED: u32 = 0x80AE_0000;

fn status_code(status: ua::StatusCode) -> StatusCode {
    StatusCode(status.bits() & 0xFFFF_0000)
}

fn connect_error(status: ua::StatusCode) -> UaError {
    let code = status_code(status);
    match code.0 {
        BAD_TCP_ENDPOINT_URL_INVALID => UaError::NoMatchingEndpoint(status.to_string()),
        BAD_CONNECTION_REJECTED | BAD_CONNECTION_CLOSED => UaError::EndpointUnreachable(status.to_string()),
        _ if code == StatusCode::BAD_NOT_CONNECTED || code == StatusCode::BAD_COMMUNICATION_ERROR => {
            UaError::EndpointUnreachable(status.to_string())
        }
        _ => UaError::Status(code),
    }
}

fn request_error(status: ua::StatusCode) -> UaError {
    let code = status_code(status);
    if code.0 == BAD_CONNECTION_CLOSED || code == StatusCode::BAD_NOT_CONNECTED {
        return UaError::ConnectionLost(status.to_string());
    }
    UaError::Status(code)
}

// ── Identity and security ─────────────────────────────────────────────────────

fn identity_token(identity: &Identity) -> IdentityToken {
    match identity {
        Identity::Anonymous => IdentityToken::Anonymous,
        Identity::UserName { username, password } => {
            IdentityToken::UserName(username.clone(), password.clone())
        }
        Identity::Certificate {
            certificate,
            private_key,
        } => IdentityToken::X509(certificate.clone(), private_key.clone()),
    }
}

fn ua_security_mode(mode: MessageSecurityMode) -> ua::MessageSecurityMode {
    match mode {
        MessageSecurityMode::None => ua::MessageSecurityMode::None,
        MessageSecurityMode::Sign => ua::MessageSecurityMode::Sign,
        MessageSecurityMode::SignAndEncrypt => ua::MessageSecurityMode::SignAndEncrypt,
    }
}

// ── Wire model mapping ────────────────────────────────────────────────────────

fn ua_node_id(node: &NodeId) -> ua::NodeId {
    match &node.identifier {
        Identifier::Numeric(id) => ua::NodeId::new(node.namespace, *id),
        Identifier::String(id) => ua::NodeId::new(node.namespace, ua::UAString::from(id.as_str())),
        Identifier::Guid(id) => ua::NodeId::new(node.namespace, ua::Guid::from_bytes(*id.as_bytes())),
        Identifier::Opaque(bytes) => ua::NodeId::new(node.namespace, ua::ByteString::from(bytes.clone())),
    }
}

fn node_id(node: &ua::NodeId) -> NodeId {
    let identifier = match &node.identifier {
        ua::Identifier::Numeric(id) => Identifier::Numeric(*id),
        ua::Identifier::String(id) => Identifier::String(id.as_ref().to_string()),
        ua::Identifier::Guid(id) => Identifier::Guid(Uuid::from_bytes(*id.as_bytes())),
        ua::Identifier::ByteString(bytes) => {
            Identifier::Opaque(bytes.value.clone().unwrap_or_default())
        }
    };
    NodeId {
        namespace: node.namespace,
        identifier,
    }
}

/// Built-in data types live in namespace 0 under fixed numeric ids.
fn wire_type_of(data_type: &ua::NodeId) -> Option<WireType> {
    if data_type.namespace != 0 {
        return None;
    }
    let ua::Identifier::Numeric(id) = data_type.identifier else {
        return None;
    };
    Some(match id {
        1 => WireType::Boolean,
        2 => WireType::SByte,
        3 => WireType::Byte,
        4 => WireType::Int16,
        5 => WireType::UInt16,
        6 => WireType::Int32,
        7 => WireType::UInt32,
        8 => WireType::Int64,
        9 => WireType::UInt64,
        10 => WireType::Float,
        11 => WireType::Double,
        12 => WireType::String,
        13 => WireType::DateTime,
        14 => WireType::Guid,
        15 => WireType::ByteString,
        20 => WireType::QualifiedName,
        21 => WireType::LocalizedText,
        _ => return None,
    })
}

fn variant_type_id(wire: WireType) -> ua::VariantTypeId {
    match wire {
        WireType::Boolean => ua::VariantTypeId::Boolean,
        WireType::SByte => ua::VariantTypeId::SByte,
        WireType::Byte => ua::VariantTypeId::Byte,
        WireType::Int16 => ua::VariantTypeId::Int16,
        WireType::UInt16 => ua::VariantTypeId::UInt16,
        WireType::Int32 => ua::VariantTypeId::Int32,
        WireType::UInt32 => ua::VariantTypeId::UInt32,
        WireType::Int64 => ua::VariantTypeId::Int64,
        WireType::UInt64 => ua::VariantTypeId::UInt64,
        WireType::Float => ua::VariantTypeId::Float,
        WireType::Double => ua::VariantTypeId::Double,
        WireType::String => ua::VariantTypeId::String,
        WireType::DateTime => ua::VariantTypeId::DateTime,
        WireType::Guid => ua::VariantTypeId::Guid,
        WireType::ByteString => ua::VariantTypeId::ByteString,
        WireType::LocalizedText => ua::VariantTypeId::LocalizedText,
        WireType::QualifiedName => ua::VariantTypeId::QualifiedName,
    }
}

fn ua_variant(value: &Variant) -> Result<ua::Variant, UaError> {
    Ok(match value {
        Variant::Empty => ua::Variant::Empty,
        Variant::Boolean(v) => ua::Variant::Boolean(*v),
        Variant::SByte(v) => ua::Variant::SByte(*v),
        Variant::Byte(v) => ua::Variant::Byte(*v),
        Variant::Int16(v) => ua::Variant::Int16(*v),
        Variant::UInt16(v) => ua::Variant::UInt16(*v),
        Variant::Int32(v) => ua::Variant::Int32(*v),
        Variant::UInt32(v) => ua::Variant::UInt32(*v),
        Variant::Int64(v) => ua::Variant::Int64(*v),
        Variant::UInt64(v) => ua::Variant::UInt64(*v),
        Variant::Float(v) => ua::Variant::Float(*v),
        Variant::Double(v) => ua::Variant::Double(*v),
        Variant::String(v) => ua::Variant::String(ua::UAString::from(v.as_str())),
        Variant::DateTime(v) => ua::Variant::DateTime(Box::new(ua::DateTime::from(*v))),
        Variant::Guid(v) => ua::Variant::Guid(Box::new(ua::Guid::from_bytes(*v.as_bytes()))),
        Variant::ByteString(v) => ua::Variant::ByteString(ua::ByteString::from(v.clone())),
        Variant::LocalizedText(v) => ua::Variant::LocalizedText(Box::new(ua::LocalizedText::new(
            v.locale.as_str(),
            v.text.as_str(),
        ))),
        Variant::QualifiedName(v) => ua::Variant::QualifiedName(Box::new(ua::QualifiedName::new(
            v.namespace_index,
            v.name.as_str(),
        ))),
        Variant::Array(wire, items) => {
            let values = items.iter().map(ua_variant).collect::<Result<Vec<_>, _>>()?;
            let array = ua::Array::new(variant_type_id(*wire), values)
                .map_err(|s| UaError::Status(status_code(s)))?;
            ua::Variant::Array(Box::new(array))
        }
    })
}

fn variant(value: &ua::Variant) -> Result<Variant, UaError> {
    Ok(match value {
        ua::Variant::Empty => Variant::Empty,
        ua::Variant::Boolean(v) => Variant::Boolean(*v),
        ua::Variant::SByte(v) => Variant::SByte(*v),
        ua::Variant::Byte(v) => Variant::Byte(*v),
        ua::Variant::Int16(v) => Variant::Int16(*v),
        ua::Variant::UInt16(v) => Variant::UInt16(*v),
        ua::Variant::Int32(v) => Variant::Int32(*v),
        ua::Variant::UInt32(v) => Variant::UInt32(*v),
        ua::Variant::Int64(v) => Variant::Int64(*v),
        ua::Variant::UInt64(v) => Variant::UInt64(*v),
        ua::Variant::Float(v) => Variant::Float(*v),
        ua::Variant::Double(v) => Variant::Double(*v),
        ua::Variant::String(v) => Variant::String(v.as_ref().to_string()),
        ua::Variant::DateTime(v) => Variant::DateTime(timestamp(v)),
        ua::Variant::Guid(v) => Variant::Guid(Uuid::from_bytes(*v.as_bytes())),
        ua::Variant::ByteString(v) => Variant::ByteString(v.value.clone().unwrap_or_default()),
        ua::Variant::LocalizedText(v) => {
            Variant::LocalizedText(LocalizedText::new(v.locale.as_ref(), v.text.as_ref()))
        }
        ua::Variant::QualifiedName(v) => Variant::QualifiedName(assetlink_core::QualifiedName::new(
            v.namespace_index,
            v.name.as_ref(),
        )),
        ua::Variant::Array(array) => {
            let items = array.values.iter().map(variant).collect::<Result<Vec<_>, _>>()?;
            let wire = items
                .iter()
                .find_map(Variant::wire_type)
                .ok_or(UaError::Status(StatusCode::BAD_TYPE_MISMATCH))?;
            Variant::Array(wire, items)
        }
        _ => return Err(UaError::Status(StatusCode::BAD_TYPE_MISMATCH)),
    })
}

fn timestamp(value: &ua::DateTime) -> DateTime<Utc> {
    value.as_chrono()
}

fn data_value(value: &ua::DataValue) -> DataValue {
    let status = value.status.map_or(StatusCode::GOOD, status_code);
    let converted = match &value.value {
        Some(v) => variant(v),
        None => Ok(Variant::Empty),
    };
    match converted {
        Ok(v) => DataValue {
            value: v,
            status,
            source_timestamp: value.source_timestamp.as_ref().map(timestamp),
        },
        Err(UaError::Status(code)) => DataValue {
            value: Variant::Empty,
            status: code,
            source_timestamp: None,
        },
        Err(_) => DataValue {
            value: Variant::Empty,
            status: StatusCode::BAD_UNEXPECTED_ERROR,
            source_timestamp: None,
        },
    }
}
