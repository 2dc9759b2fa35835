//! In-process OPC UA address space.
//!
//! [`EmbeddedServer`] implements [`UaConnector`], and the sessions it opens
//! implement [`UaClient`], entirely in memory.  It stands in for a real PLC
//! or OPC UA server in tests and in the simulator binary, and keeps the same
//! observable contract:
//!
//! - Typed variables reject writes of the wrong type (`BadTypeMismatch`) and
//!   read-only variables reject writes (`BadNotWritable`).
//! - Methods check argument count and types before the handler runs.
//! - Monitored items sample their node at the requested interval on
//!   runtime-owned tasks and report only when value or status changed.  The
//!   first sample is always reported.
//! - [`set_online(false)`](EmbeddedServer::set_online) makes every session
//!   fail with a lost connection until it is switched back on;
//!   [`set_response_delay`](EmbeddedServer::set_response_delay) slows every
//!   request down, for timeout tests.
//!
//! The address space is guarded by one `RwLock`, so sessions are safe for
//! concurrent use.
//!
//! # Example namespace
//!
//! [`EmbeddedServer::with_example_namespace`] builds namespace 2 with the
//! following nodes (string identifiers, all below `HelloWorld`):
//!
//! ```text
//! HelloWorld/ScalarTypes/<WireType>    one writable variable per scalar type
//! HelloWorld/ArrayTypes/Int32          Int32[]  = [1, 2, 3, 4]
//! HelloWorld/ArrayTypes/Double         Double[] = [0.5, 1.5]
//! HelloWorld/ArrayTypes/String         String[] = ["a", "b"]
//! HelloWorld/Dynamic/Double            counter advanced by spawn_dynamic_updates
//! HelloWorld/Range/Min, Range/Max      Double bounds
//! HelloWorld/Labels                    LocalizedText[] (en, de)
//! HelloWorld/Link                      String[] of reference key texts
//! HelloWorld/ReadOnly                  Int32, not writable
//! HelloWorld/sqrt(x)                   method: x: Double -> x_sqrt: Double
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use assetlink_core::QualifiedName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::session::{
    DataChangeCallback, MonitoredItemId, UaClient, UaConnector, UaError,
};
use crate::domain::endpoint::{Endpoint, Identity, MessageSecurityMode, SecurityPolicy};
use crate::domain::types::{
    Argument, DataValue, LocalizedText, MethodSignature, NodeClass, NodeId, NodeInfo, StatusCode,
    Variant, WireType,
};

/// Namespace index of the example nodes.
pub const EXAMPLE_NAMESPACE: u16 = 2;

/// Objects folder of namespace 0.
pub const OBJECTS_FOLDER: u32 = 85;

/// Node id of an example node, e.g. `example_node("ScalarTypes/Double")`.
pub fn example_node(path: &str) -> NodeId {
    NodeId::string(EXAMPLE_NAMESPACE, format!("HelloWorld/{path}"))
}

/// Implementation of a method: receives type-checked inputs in declared
/// order and returns outputs in declared order.
pub type MethodHandler = Arc<dyn Fn(&[Variant]) -> Result<Vec<Variant>, StatusCode> + Send + Sync>;

/// Data-described method: ordered parameters plus one call function.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
    pub handler: MethodHandler,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

enum NodeKind {
    Object,
    Variable {
        data_type: WireType,
        array: bool,
        value: Variant,
        writable: bool,
        timestamp: DateTime<Utc>,
    },
    Method(MethodDescriptor),
}

struct Node {
    browse_name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

struct Inner {
    nodes: RwLock<HashMap<NodeId, Node>>,
    online: AtomicBool,
    response_delay_ms: AtomicU64,
    credentials: Mutex<Option<(String, String)>>,
    trusted_certificates: Mutex<Vec<PathBuf>>,
    security: Mutex<Vec<(SecurityPolicy, MessageSecurityMode)>>,
    next_item: AtomicU32,
    connection_attempts: AtomicUsize,
    open_sessions: AtomicUsize,
    active_items: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn type_matches(data_type: WireType, array: bool, value: &Variant) -> bool {
    value.wire_type() == Some(data_type) && value.is_array() == array
}

impl Inner {
    fn read_value(&self, node: &NodeId) -> DataValue {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let bad = |status| DataValue {
            value: Variant::Empty,
            status,
            source_timestamp: None,
        };
        match nodes.get(node).map(|n| &n.kind) {
            Some(NodeKind::Variable {
                value, timestamp, ..
            }) => DataValue {
                value: value.clone(),
                status: StatusCode::GOOD,
                source_timestamp: Some(*timestamp),
            },
            Some(_) => bad(StatusCode::BAD_NOT_READABLE),
            None => bad(StatusCode::BAD_NODE_ID_UNKNOWN),
        }
    }

    fn write_value(&self, node: &NodeId, new: Variant, enforce_access: bool) -> Result<(), StatusCode> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(node).map(|n| &mut n.kind) {
            Some(NodeKind::Variable {
                data_type,
                array,
                value,
                writable,
                timestamp,
            }) => {
                if enforce_access && !*writable {
                    return Err(StatusCode::BAD_NOT_WRITABLE);
                }
                if !type_matches(*data_type, *array, &new) {
                    return Err(StatusCode::BAD_TYPE_MISMATCH);
                }
                *value = new;
                *timestamp = Utc::now();
                Ok(())
            }
            Some(_) => Err(StatusCode::BAD_NOT_WRITABLE),
            None => Err(StatusCode::BAD_NODE_ID_UNKNOWN),
        }
    }

    fn insert(&self, node_id: NodeId, parent: Option<NodeId>, browse_name: &str, kind: NodeKind) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                node_id,
                Node {
                    browse_name: browse_name.to_string(),
                    parent,
                    kind,
                },
            );
    }
}

/// An in-memory OPC UA server.  Cloning shares the address space.
#[derive(Clone)]
pub struct EmbeddedServer {
    inner: Arc<Inner>,
}

impl Default for EmbeddedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EmbeddedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedServer")
            .field("online", &self.is_online())
            .field("open_sessions", &self.open_sessions())
            .field("active_monitored_items", &self.active_monitored_items())
            .finish_non_exhaustive()
    }
}

impl EmbeddedServer {
    /// A server holding only the Objects folder.
    pub fn new() -> Self {
        let server = Self {
            inner: Arc::new(Inner {
                nodes: RwLock::new(HashMap::new()),
                online: AtomicBool::new(true),
                response_delay_ms: AtomicU64::new(0),
                credentials: Mutex::new(None),
                trusted_certificates: Mutex::new(Vec::new()),
                security: Mutex::new(vec![(SecurityPolicy::None, MessageSecurityMode::None)]),
                next_item: AtomicU32::new(1),
                connection_attempts: AtomicUsize::new(0),
                open_sessions: AtomicUsize::new(0),
                active_items: AtomicUsize::new(0),
            }),
        };
        server
            .inner
            .insert(NodeId::numeric(0, OBJECTS_FOLDER), None, "Objects", NodeKind::Object);
        server
    }

    /// Requires an authenticated identity from every session: this
    /// username/password, or a trusted certificate.
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        *lock(&self.inner.credentials) = Some((username.into(), password.into()));
        self
    }

    /// Accepts certificate identities presenting `certificate`.
    pub fn with_trusted_certificate(self, certificate: impl Into<PathBuf>) -> Self {
        lock(&self.inner.trusted_certificates).push(certificate.into());
        self
    }

    /// Replaces the offered endpoints, `None`/`None` by default, with
    /// exactly these security settings.
    pub fn with_security(self, offered: &[(SecurityPolicy, MessageSecurityMode)]) -> Self {
        *lock(&self.inner.security) = offered.to_vec();
        self
    }

    // ── Address space ─────────────────────────────────────────────────────────

    pub fn add_folder(&self, node_id: NodeId, parent: &NodeId, browse_name: &str) {
        self.inner
            .insert(node_id, Some(parent.clone()), browse_name, NodeKind::Object);
    }

    /// Adds a variable.  `value` must match `data_type` (as an array when
    /// `value` is one).
    pub fn add_variable(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        browse_name: &str,
        data_type: WireType,
        value: Variant,
        writable: bool,
    ) {
        let array = value.is_array();
        self.inner.insert(
            node_id,
            Some(parent.clone()),
            browse_name,
            NodeKind::Variable {
                data_type,
                array,
                value,
                writable,
                timestamp: Utc::now(),
            },
        );
    }

    pub fn add_method(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        browse_name: &str,
        method: MethodDescriptor,
    ) {
        self.inner
            .insert(node_id, Some(parent.clone()), browse_name, NodeKind::Method(method));
    }

    /// Server-side update; ignores the writable flag but not the type.
    pub fn set_value(&self, node: &NodeId, value: Variant) -> Result<(), StatusCode> {
        self.inner.write_value(node, value, false)
    }

    /// Current value of a variable.
    pub fn value(&self, node: &NodeId) -> Option<Variant> {
        let data = self.inner.read_value(node);
        data.status.is_good().then_some(data.value)
    }

    // ── Failure injection ─────────────────────────────────────────────────────

    pub fn set_online(&self, online: bool) {
        info!(online, "embedded server availability changed");
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Delay applied before every request and connection attempt.
    pub fn set_response_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.response_delay_ms.store(ms, Ordering::SeqCst);
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Every call to `connect`, successful or not.
    pub fn connection_attempts(&self) -> usize {
        self.inner.connection_attempts.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn active_monitored_items(&self) -> usize {
        self.inner.active_items.load(Ordering::SeqCst)
    }

    // ── Example namespace ─────────────────────────────────────────────────────

    /// A server populated with the example namespace (see module docs).
    pub fn with_example_namespace() -> Self {
        let server = Self::new();
        let objects = NodeId::numeric(0, OBJECTS_FOLDER);
        let root = NodeId::string(EXAMPLE_NAMESPACE, "HelloWorld");
        server.add_folder(root.clone(), &objects, "HelloWorld");

        let scalars = example_node("ScalarTypes");
        server.add_folder(scalars.clone(), &root, "ScalarTypes");
        let scalar_defaults = [
            (WireType::Boolean, Variant::Boolean(false)),
            (WireType::SByte, Variant::SByte(0)),
            (WireType::Byte, Variant::Byte(0)),
            (WireType::Int16, Variant::Int16(0)),
            (WireType::UInt16, Variant::UInt16(0)),
            (WireType::Int32, Variant::Int32(0)),
            (WireType::UInt32, Variant::UInt32(0)),
            (WireType::Int64, Variant::Int64(0)),
            (WireType::UInt64, Variant::UInt64(0)),
            (WireType::Float, Variant::Float(0.0)),
            (WireType::Double, Variant::Double(0.0)),
            (WireType::String, Variant::String(String::new())),
            (WireType::DateTime, Variant::DateTime(DateTime::<Utc>::default())),
            (WireType::Guid, Variant::Guid(Uuid::nil())),
            (WireType::ByteString, Variant::ByteString(Vec::new())),
            (WireType::LocalizedText, Variant::LocalizedText(LocalizedText::default())),
            (
                WireType::QualifiedName,
                Variant::QualifiedName(QualifiedName::new(0, "")),
            ),
        ];
        for (wire, value) in scalar_defaults {
            server.add_variable(
                example_node(&format!("ScalarTypes/{}", wire.name())),
                &scalars,
                wire.name(),
                wire,
                value,
                true,
            );
        }

        let arrays = example_node("ArrayTypes");
        server.add_folder(arrays.clone(), &root, "ArrayTypes");
        server.add_variable(
            example_node("ArrayTypes/Int32"),
            &arrays,
            "Int32",
            WireType::Int32,
            Variant::Array(WireType::Int32, (1..=4).map(Variant::Int32).collect()),
            true,
        );
        server.add_variable(
            example_node("ArrayTypes/Double"),
            &arrays,
            "Double",
            WireType::Double,
            Variant::Array(WireType::Double, vec![Variant::Double(0.5), Variant::Double(1.5)]),
            true,
        );
        server.add_variable(
            example_node("ArrayTypes/String"),
            &arrays,
            "String",
            WireType::String,
            Variant::Array(
                WireType::String,
                vec![Variant::String("a".into()), Variant::String("b".into())],
            ),
            true,
        );

        let dynamic = example_node("Dynamic");
        server.add_folder(dynamic.clone(), &root, "Dynamic");
        server.add_variable(
            example_node("Dynamic/Double"),
            &dynamic,
            "Double",
            WireType::Double,
            Variant::Double(0.0),
            true,
        );

        let range = example_node("Range");
        server.add_folder(range.clone(), &root, "Range");
        server.add_variable(example_node("Range/Min"), &range, "Min", WireType::Double, Variant::Double(0.0), true);
        server.add_variable(example_node("Range/Max"), &range, "Max", WireType::Double, Variant::Double(100.0), true);

        server.add_variable(
            example_node("Labels"),
            &root,
            "Labels",
            WireType::LocalizedText,
            Variant::Array(
                WireType::LocalizedText,
                vec![
                    Variant::LocalizedText(LocalizedText::new("en", "Speed")),
                    Variant::LocalizedText(LocalizedText::new("de", "Drehzahl")),
                ],
            ),
            true,
        );
        server.add_variable(
            example_node("Link"),
            &root,
            "Link",
            WireType::String,
            Variant::Array(
                WireType::String,
                vec![
                    Variant::String("(Submodel)urn:example:sensors".into()),
                    Variant::String("(Property)Temperature".into()),
                ],
            ),
            true,
        );
        server.add_variable(
            example_node("ReadOnly"),
            &root,
            "ReadOnly",
            WireType::Int32,
            Variant::Int32(42),
            false,
        );

        server.add_method(
            example_node("sqrt(x)"),
            &root,
            "sqrt(x)",
            MethodDescriptor {
                inputs: vec![Argument::scalar("x", WireType::Double)],
                outputs: vec![Argument::scalar("x_sqrt", WireType::Double)],
                handler: Arc::new(|inputs: &[Variant]| match inputs {
                    [Variant::Double(x)] if *x >= 0.0 => Ok(vec![Variant::Double(x.sqrt())]),
                    [Variant::Double(_)] => Err(StatusCode::BAD_OUT_OF_RANGE),
                    _ => Err(StatusCode::BAD_INVALID_ARGUMENT),
                }),
            },
        );

        server
    }

    /// Advances `HelloWorld/Dynamic/Double` by one every `period`.  Needs a
    /// Tokio runtime; abort the handle to stop.
    pub fn spawn_dynamic_updates(&self, period: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let node = example_node("Dynamic/Double");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let next = match inner.read_value(&node).value {
                    Variant::Double(v) => v + 1.0,
                    _ => 0.0,
                };
                if inner.write_value(&node, Variant::Double(next), false).is_err() {
                    return;
                }
            }
        })
    }
}

#[async_trait]
impl UaConnector for EmbeddedServer {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> Result<Arc<dyn UaClient>, UaError> {
        self.inner.connection_attempts.fetch_add(1, Ordering::SeqCst);
        delay(&self.inner).await;
        if !self.is_online() {
            return Err(UaError::EndpointUnreachable(endpoint.to_string()));
        }
        let requested = (endpoint.security_policy(), endpoint.security_mode());
        if !lock(&self.inner.security).contains(&requested) {
            return Err(UaError::NoMatchingEndpoint(endpoint.to_string()));
        }
        let required = lock(&self.inner.credentials).clone();
        if let Some((user, pass)) = required {
            let accepted = match identity {
                Identity::Anonymous => false,
                Identity::UserName { username, password } => *username == user && *password == pass,
                Identity::Certificate { certificate, .. } => {
                    lock(&self.inner.trusted_certificates).contains(certificate)
                }
            };
            if !accepted {
                return Err(UaError::Status(StatusCode::BAD_USER_ACCESS_DENIED));
            }
        }
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(%endpoint, ?identity, "embedded session opened");
        Ok(Arc::new(EmbeddedSession {
            inner: Arc::clone(&self.inner),
            connected: AtomicBool::new(true),
            items: Mutex::new(HashMap::new()),
        }))
    }
}

async fn delay(inner: &Inner) {
    let ms = inner.response_delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// One session opened on an [`EmbeddedServer`].
struct EmbeddedSession {
    inner: Arc<Inner>,
    connected: AtomicBool,
    items: Mutex<HashMap<MonitoredItemId, JoinHandle<()>>>,
}

impl EmbeddedSession {
    async fn enter(&self) -> Result<(), UaError> {
        delay(&self.inner).await;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(UaError::Status(StatusCode::BAD_SESSION_CLOSED));
        }
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(UaError::ConnectionLost("server offline".to_string()));
        }
        Ok(())
    }

    async fn stop_item(&self, handle: JoinHandle<()>) {
        handle.abort();
        // Waits for a callback that is running right now.
        let _ = handle.await;
        self.inner.active_items.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UaClient for EmbeddedSession {
    async fn browse(&self, node: &NodeId) -> Result<NodeInfo, UaError> {
        self.enter().await?;
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let found = nodes
            .get(node)
            .ok_or(UaError::Status(StatusCode::BAD_NODE_ID_UNKNOWN))?;
        let (node_class, data_type, array) = match &found.kind {
            NodeKind::Object => (NodeClass::Object, None, false),
            NodeKind::Variable {
                data_type, array, ..
            } => (NodeClass::Variable, Some(*data_type), *array),
            NodeKind::Method(_) => (NodeClass::Method, None, false),
        };
        Ok(NodeInfo {
            node_id: node.clone(),
            node_class,
            browse_name: found.browse_name.clone(),
            parent: found.parent.clone(),
            data_type,
            array,
        })
    }

    async fn read(&self, node: &NodeId) -> Result<DataValue, UaError> {
        self.enter().await?;
        Ok(self.inner.read_value(node))
    }

    async fn write(&self, node: &NodeId, value: Variant) -> Result<(), UaError> {
        self.enter().await?;
        self.inner
            .write_value(node, value, true)
            .map_err(UaError::Status)
    }

    async fn method_arguments(&self, method: &NodeId) -> Result<MethodSignature, UaError> {
        self.enter().await?;
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        match nodes.get(method).map(|n| &n.kind) {
            Some(NodeKind::Method(m)) => Ok(MethodSignature {
                inputs: m.inputs.clone(),
                outputs: m.outputs.clone(),
            }),
            Some(_) => Err(UaError::Status(StatusCode::BAD_METHOD_INVALID)),
            None => Err(UaError::Status(StatusCode::BAD_NODE_ID_UNKNOWN)),
        }
    }

    async fn call(
        &self,
        object: &NodeId,
        method: &NodeId,
        inputs: Vec<Variant>,
    ) -> Result<Vec<Variant>, UaError> {
        self.enter().await?;
        let descriptor = {
            let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
            let node = nodes
                .get(method)
                .ok_or(UaError::Status(StatusCode::BAD_METHOD_INVALID))?;
            let NodeKind::Method(descriptor) = &node.kind else {
                return Err(UaError::Status(StatusCode::BAD_METHOD_INVALID));
            };
            if node.parent.as_ref() != Some(object) {
                return Err(UaError::Status(StatusCode::BAD_METHOD_INVALID));
            }
            descriptor.clone()
        };

        if inputs.len() < descriptor.inputs.len() {
            return Err(UaError::Status(StatusCode::BAD_ARGUMENTS_MISSING));
        }
        if inputs.len() > descriptor.inputs.len() {
            return Err(UaError::Status(StatusCode::BAD_TOO_MANY_ARGUMENTS));
        }
        let types_ok = descriptor
            .inputs
            .iter()
            .zip(&inputs)
            .all(|(arg, value)| type_matches(arg.data_type, arg.array, value));
        if !types_ok {
            return Err(UaError::Status(StatusCode::BAD_TYPE_MISMATCH));
        }

        (descriptor.handler)(&inputs).map_err(UaError::Status)
    }

    async fn create_monitored_item(
        &self,
        node: &NodeId,
        interval: Duration,
        callback: DataChangeCallback,
    ) -> Result<MonitoredItemId, UaError> {
        self.enter().await?;
        if self.inner.read_value(node).status == StatusCode::BAD_NODE_ID_UNKNOWN {
            return Err(UaError::Status(StatusCode::BAD_NODE_ID_UNKNOWN));
        }

        let id = self.inner.next_item.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let node = node.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<(Variant, StatusCode)> = None;
            loop {
                ticker.tick().await;
                if !inner.online.load(Ordering::SeqCst) {
                    continue;
                }
                let sample = inner.read_value(&node);
                let key = (sample.value.clone(), sample.status);
                if last.as_ref() != Some(&key) {
                    last = Some(key);
                    callback(sample);
                }
            }
        });
        self.inner.active_items.fetch_add(1, Ordering::SeqCst);
        lock(&self.items).insert(id, handle);
        debug!(item = id, ?interval, "monitored item created");
        Ok(id)
    }

    async fn delete_monitored_item(&self, id: MonitoredItemId) -> Result<(), UaError> {
        let handle = lock(&self.items).remove(&id);
        match handle {
            Some(handle) => {
                self.stop_item(handle).await;
                debug!(item = id, "monitored item deleted");
                Ok(())
            }
            None => Err(UaError::Status(StatusCode::BAD_NOT_FOUND)),
        }
    }

    async fn disconnect(&self) -> Result<(), UaError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handles: Vec<JoinHandle<()>> = lock(&self.items).drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.stop_item(handle).await;
        }
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
        debug!("embedded session closed");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(server: &EmbeddedServer) -> Arc<dyn UaClient> {
        let endpoint = Endpoint::parse("opc.tcp://localhost:4840").unwrap();
        server.connect(&endpoint, &Identity::Anonymous).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_scalar() {
        // Arrange
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let node = example_node("ScalarTypes/Double");

        // Act
        client.write(&node, Variant::Double(3.3)).await.unwrap();
        let data = client.read(&node).await.unwrap();

        // Assert
        assert_eq!(data.value, Variant::Double(3.3));
        assert!(data.status.is_good());
    }

    #[tokio::test]
    async fn test_write_checks_type_and_access() {
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;

        assert_eq!(
            client
                .write(&example_node("ScalarTypes/Double"), Variant::Int32(1))
                .await,
            Err(UaError::Status(StatusCode::BAD_TYPE_MISMATCH))
        );
        assert_eq!(
            client.write(&example_node("ReadOnly"), Variant::Int32(1)).await,
            Err(UaError::Status(StatusCode::BAD_NOT_WRITABLE))
        );
        assert_eq!(
            client.write(&example_node("Nope"), Variant::Int32(1)).await,
            Err(UaError::Status(StatusCode::BAD_NODE_ID_UNKNOWN))
        );
    }

    #[tokio::test]
    async fn test_read_unknown_node_reports_status() {
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let data = client.read(&example_node("Nope")).await.unwrap();
        assert_eq!(data.status, StatusCode::BAD_NODE_ID_UNKNOWN);
    }

    #[tokio::test]
    async fn test_call_sqrt() {
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let parent = client.browse(&example_node("sqrt(x)")).await.unwrap().parent.unwrap();

        let out = client
            .call(&parent, &example_node("sqrt(x)"), vec![Variant::Double(4.0)])
            .await
            .unwrap();

        assert_eq!(out, vec![Variant::Double(2.0)]);
    }

    #[tokio::test]
    async fn test_call_checks_arguments() {
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let root = NodeId::string(EXAMPLE_NAMESPACE, "HelloWorld");
        let method = example_node("sqrt(x)");

        assert_eq!(
            client.call(&root, &method, vec![]).await,
            Err(UaError::Status(StatusCode::BAD_ARGUMENTS_MISSING))
        );
        assert_eq!(
            client
                .call(&root, &method, vec![Variant::Double(1.0), Variant::Double(2.0)])
                .await,
            Err(UaError::Status(StatusCode::BAD_TOO_MANY_ARGUMENTS))
        );
        assert_eq!(
            client.call(&root, &method, vec![Variant::Int32(4)]).await,
            Err(UaError::Status(StatusCode::BAD_TYPE_MISMATCH))
        );
        assert_eq!(
            client
                .call(&example_node("Range"), &method, vec![Variant::Double(4.0)])
                .await,
            Err(UaError::Status(StatusCode::BAD_METHOD_INVALID))
        );
    }

    #[tokio::test]
    async fn test_monitored_item_reports_initial_value_and_changes() {
        // Arrange
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let node = example_node("ScalarTypes/Int32");
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let callback: DataChangeCallback = Arc::new(move |dv: DataValue| {
            sink.lock().unwrap().push(dv.value);
        });

        // Act
        let id = client
            .create_monitored_item(&node, Duration::from_millis(10), callback)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.set_value(&node, Variant::Int32(7)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.delete_monitored_item(id).await.unwrap();
        server.set_value(&node, Variant::Int32(8)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert
        assert_eq!(
            *samples.lock().unwrap(),
            vec![Variant::Int32(0), Variant::Int32(7)]
        );
        assert_eq!(server.active_monitored_items(), 0);
    }

    #[tokio::test]
    async fn test_offline_server_fails_requests_until_back_online() {
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let node = example_node("ScalarTypes/Double");

        server.set_online(false);
        assert!(matches!(
            client.read(&node).await,
            Err(UaError::ConnectionLost(_))
        ));

        server.set_online(true);
        assert!(client.read(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_credentials_are_enforced() {
        let server = EmbeddedServer::with_example_namespace().with_credentials("operator", "pw");
        let endpoint = Endpoint::parse("opc.tcp://localhost:4840").unwrap();

        assert!(matches!(
            server.connect(&endpoint, &Identity::Anonymous).await,
            Err(UaError::Status(StatusCode::BAD_USER_ACCESS_DENIED))
        ));
        let identity = Identity::UserName {
            username: "operator".into(),
            password: "pw".into(),
        };
        assert!(server.connect(&endpoint, &identity).await.is_ok());
        assert_eq!(server.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_trusted_certificate_identity_is_accepted() {
        let server = EmbeddedServer::with_example_namespace()
            .with_credentials("operator", "pw")
            .with_trusted_certificate("pki/user.der");
        let endpoint = Endpoint::parse("opc.tcp://localhost:4840").unwrap();
        let identity = |path: &str| Identity::Certificate {
            certificate: path.into(),
            private_key: "pki/user.pem".into(),
        };

        assert!(server.connect(&endpoint, &identity("pki/user.der")).await.is_ok());
        assert!(matches!(
            server.connect(&endpoint, &identity("pki/other.der")).await,
            Err(UaError::Status(StatusCode::BAD_USER_ACCESS_DENIED))
        ));
    }

    #[tokio::test]
    async fn test_only_offered_security_is_accepted() {
        // Arrange
        let server = EmbeddedServer::with_example_namespace().with_security(&[(
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
        )]);
        let plain = Endpoint::parse("opc.tcp://localhost:4840").unwrap();
        let secured = plain
            .clone()
            .with_security(SecurityPolicy::Basic256Sha256, MessageSecurityMode::SignAndEncrypt)
            .unwrap();

        // Act
        let refused = server.connect(&plain, &Identity::Anonymous).await;
        let accepted = server.connect(&secured, &Identity::Anonymous).await;

        // Assert
        assert!(matches!(refused, Err(UaError::NoMatchingEndpoint(_))));
        assert!(accepted.is_ok());
        assert_eq!(server.connection_attempts(), 2);
        assert_eq!(server.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_stops_items_and_rejects_requests() {
        let server = EmbeddedServer::with_example_namespace();
        let client = connect(&server).await;
        let callback: DataChangeCallback = Arc::new(|_: DataValue| {});
        client
            .create_monitored_item(&example_node("Dynamic/Double"), Duration::from_millis(10), callback)
            .await
            .unwrap();
        assert_eq!(server.active_monitored_items(), 1);

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();

        assert_eq!(server.active_monitored_items(), 0);
        assert_eq!(server.open_sessions(), 0);
        assert_eq!(
            client.read(&example_node("Dynamic/Double")).await,
            Err(UaError::Status(StatusCode::BAD_SESSION_CLOSED))
        );
    }
}
