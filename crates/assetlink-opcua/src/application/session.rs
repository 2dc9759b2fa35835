//! The protocol session: one live connection to an OPC UA server.
//!
//! Two layers live here:
//!
//! - [`UaClient`] / [`UaConnector`] – the seam to the underlying OPC UA
//!   stack.  Everything below it (framing, security handshake, binary
//!   encoding) belongs to the stack.  Implementations must be safe for
//!   concurrent use on one session; [`EmbeddedServer`](crate::EmbeddedServer)
//!   is one.
//!
//! - [`Session`] – wraps a connected client for the providers.  Every
//!   request is bounded by the request timeout and raced against the
//!   connection's lifecycle state, so `close()` makes in-flight requests fail
//!   fast with [`AssetConnectionError::Closed`] instead of leaving them
//!   hanging.  Stack errors become [`AssetConnectionError`]s with the
//!   symbolic status name.
//!
//! # Link state
//!
//! A lost transport marks the session's link down; this is the
//! `Disconnected` sub-state of a connected asset connection.  It is logged
//! once, surfaces as [`AssetConnectionError::Disconnected`] from the failing
//! calls, and clears on the next successful request.  The session never
//! reconnects on its own.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assetlink_core::{AssetConnectionError, ConnectionState};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::endpoint::{Endpoint, Identity};
use crate::domain::types::{DataValue, MethodSignature, NodeId, NodeInfo, StatusCode, Variant};

/// Failure reported by the OPC UA stack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UaError {
    /// The server answered with a bad status code.
    #[error("{0}")]
    Status(StatusCode),

    /// The transport dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No server answered at the endpoint.
    #[error("endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    /// The server refused the session, e.g. bad credentials.
    #[error("session rejected: {0}")]
    Rejected(String),

    /// The server offers no endpoint with the requested security.
    #[error("no matching endpoint: {0}")]
    NoMatchingEndpoint(String),
}

impl UaError {
    /// `true` for failures another connection attempt may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            UaError::ConnectionLost(_) | UaError::EndpointUnreachable(_) => true,
            UaError::Status(status) => matches!(
                *status,
                StatusCode::BAD_TIMEOUT | StatusCode::BAD_COMMUNICATION_ERROR | StatusCode::BAD_NOT_CONNECTED
            ),
            UaError::Rejected(_) | UaError::NoMatchingEndpoint(_) => false,
        }
    }
}

/// Handle of a server-side monitored item.
pub type MonitoredItemId = u32;

/// Called by the stack for every sample of a monitored item.
pub type DataChangeCallback = Arc<dyn Fn(DataValue) + Send + Sync>;

/// One connected session of the OPC UA stack.
#[async_trait]
pub trait UaClient: Send + Sync {
    async fn browse(&self, node: &NodeId) -> Result<NodeInfo, UaError>;

    async fn read(&self, node: &NodeId) -> Result<DataValue, UaError>;

    async fn write(&self, node: &NodeId, value: Variant) -> Result<(), UaError>;

    async fn method_arguments(&self, method: &NodeId) -> Result<MethodSignature, UaError>;

    async fn call(
        &self,
        object: &NodeId,
        method: &NodeId,
        inputs: Vec<Variant>,
    ) -> Result<Vec<Variant>, UaError>;

    /// Starts sampling `node` every `interval`.  `callback` runs on a thread
    /// owned by the stack.
    async fn create_monitored_item(
        &self,
        node: &NodeId,
        interval: Duration,
        callback: DataChangeCallback,
    ) -> Result<MonitoredItemId, UaError>;

    /// Stops a monitored item.  Once this returns, its callback is not
    /// called again.
    async fn delete_monitored_item(&self, id: MonitoredItemId) -> Result<(), UaError>;

    async fn disconnect(&self) -> Result<(), UaError>;
}

/// Opens sessions.
#[async_trait]
pub trait UaConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> Result<Arc<dyn UaClient>, UaError>;
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A connected session shared by every provider of one asset connection.
pub struct Session {
    client: Arc<dyn UaClient>,
    endpoint: Endpoint,
    request_timeout: Duration,
    state: watch::Receiver<ConnectionState>,
    link_up: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint.as_str())
            .field("request_timeout", &self.request_timeout)
            .field("link_up", &self.is_link_up())
            .finish()
    }
}

impl Session {
    pub fn new(
        client: Arc<dyn UaClient>,
        endpoint: Endpoint,
        request_timeout: Duration,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            client,
            endpoint,
            request_timeout,
            state,
            link_up: AtomicBool::new(true),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// `false` while the transport is known to be down.
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    pub async fn browse(&self, node: &NodeId) -> Result<NodeInfo, AssetConnectionError> {
        debug!(node_id = %node, "browse");
        self.request("browse", self.client.browse(node)).await
    }

    /// Reads one node and checks the value's status.
    pub async fn read(&self, node: &NodeId) -> Result<Variant, AssetConnectionError> {
        debug!(node_id = %node, "read");
        let data = self.request("read", self.client.read(node)).await?;
        if data.status.is_bad() {
            return Err(AssetConnectionError::BadStatus(format!(
                "reading {node}: {}",
                data.status
            )));
        }
        Ok(data.value)
    }

    pub async fn write(&self, node: &NodeId, value: Variant) -> Result<(), AssetConnectionError> {
        debug!(node_id = %node, "write");
        self.request("write", self.client.write(node, value)).await
    }

    pub async fn method_arguments(
        &self,
        method: &NodeId,
    ) -> Result<MethodSignature, AssetConnectionError> {
        self.request("method_arguments", self.client.method_arguments(method))
            .await
    }

    pub async fn call(
        &self,
        object: &NodeId,
        method: &NodeId,
        inputs: Vec<Variant>,
    ) -> Result<Vec<Variant>, AssetConnectionError> {
        debug!(object = %object, method = %method, inputs = inputs.len(), "call");
        self.request("call", self.client.call(object, method, inputs))
            .await
    }

    pub async fn subscribe(
        &self,
        node: &NodeId,
        interval: Duration,
        callback: DataChangeCallback,
    ) -> Result<MonitoredItemId, AssetConnectionError> {
        debug!(node_id = %node, ?interval, "create monitored item");
        self.request(
            "subscribe",
            self.client.create_monitored_item(node, interval, callback),
        )
        .await
    }

    /// Deletes a monitored item.  Bounded by the request timeout only, so it
    /// also works while the connection is closing.
    pub async fn unsubscribe(&self, id: MonitoredItemId) -> Result<(), AssetConnectionError> {
        self.bounded("unsubscribe", self.client.delete_monitored_item(id))
            .await
    }

    /// Closes the session on the server.  Bounded by the request timeout only.
    pub async fn disconnect(&self) -> Result<(), AssetConnectionError> {
        info!(endpoint = %self.endpoint, "disconnecting session");
        self.bounded("disconnect", self.client.disconnect()).await
    }

    /// Runs one request against the timeout and the closing signal.
    async fn request<T, F>(&self, operation: &'static str, fut: F) -> Result<T, AssetConnectionError>
    where
        F: Future<Output = Result<T, UaError>>,
    {
        let mut state = self.state.clone();
        let shutting_down = state.borrow_and_update().is_shutting_down();
        if shutting_down {
            return Err(AssetConnectionError::Closed);
        }

        let closing = async move {
            loop {
                if state.changed().await.is_err() {
                    return;
                }
                let shutting_down = state.borrow_and_update().is_shutting_down();
                if shutting_down {
                    return;
                }
            }
        };

        tokio::select! {
            biased;
            _ = closing => Err(AssetConnectionError::Closed),
            result = tokio::time::timeout(self.request_timeout, fut) => match result {
                Err(_) => Err(AssetConnectionError::Timeout {
                    operation,
                    timeout: self.request_timeout,
                }),
                Ok(Ok(value)) => {
                    self.mark_link_up();
                    Ok(value)
                }
                Ok(Err(e)) => Err(self.map_error(operation, e)),
            },
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, AssetConnectionError>
    where
        F: Future<Output = Result<T, UaError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Err(_) => Err(AssetConnectionError::Timeout {
                operation,
                timeout: self.request_timeout,
            }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.map_error(operation, e)),
        }
    }

    fn map_error(&self, operation: &'static str, error: UaError) -> AssetConnectionError {
        match error {
            UaError::Status(
                code @ (StatusCode::BAD_NOT_CONNECTED
                | StatusCode::BAD_SESSION_CLOSED
                | StatusCode::BAD_COMMUNICATION_ERROR),
            ) => {
                self.mark_link_down(&code.to_string());
                AssetConnectionError::Disconnected(format!("{operation}: {code}"))
            }
            UaError::Status(code) => AssetConnectionError::BadStatus(format!("{operation}: {code}")),
            UaError::ConnectionLost(reason) | UaError::EndpointUnreachable(reason) => {
                self.mark_link_down(&reason);
                AssetConnectionError::Disconnected(reason)
            }
            UaError::Rejected(reason) | UaError::NoMatchingEndpoint(reason) => {
                AssetConnectionError::BadStatus(format!("{operation}: {reason}"))
            }
        }
    }

    fn mark_link_down(&self, reason: &str) {
        if self.link_up.swap(false, Ordering::SeqCst) {
            warn!(endpoint = %self.endpoint, %reason, "session to asset lost");
        }
    }

    fn mark_link_up(&self) {
        if !self.link_up.swap(true, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "session to asset recovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{NodeClass, Variant};
    use std::sync::Mutex;

    /// Scripted client: every read returns the next queued result.
    #[derive(Default)]
    struct ScriptedClient {
        reads: Mutex<Vec<Result<DataValue, UaError>>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl UaClient for ScriptedClient {
        async fn browse(&self, node: &NodeId) -> Result<NodeInfo, UaError> {
            Ok(NodeInfo {
                node_id: node.clone(),
                node_class: NodeClass::Variable,
                browse_name: "x".into(),
                parent: None,
                data_type: None,
                array: false,
            })
        }

        async fn read(&self, _node: &NodeId) -> Result<DataValue, UaError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reads.lock().unwrap().remove(0)
        }

        async fn write(&self, _node: &NodeId, _value: Variant) -> Result<(), UaError> {
            Ok(())
        }

        async fn method_arguments(&self, _method: &NodeId) -> Result<MethodSignature, UaError> {
            Ok(MethodSignature::default())
        }

        async fn call(
            &self,
            _object: &NodeId,
            _method: &NodeId,
            _inputs: Vec<Variant>,
        ) -> Result<Vec<Variant>, UaError> {
            Ok(Vec::new())
        }

        async fn create_monitored_item(
            &self,
            _node: &NodeId,
            _interval: Duration,
            _callback: DataChangeCallback,
        ) -> Result<MonitoredItemId, UaError> {
            Ok(1)
        }

        async fn delete_monitored_item(&self, _id: MonitoredItemId) -> Result<(), UaError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), UaError> {
            Ok(())
        }
    }

    fn session(
        client: ScriptedClient,
        timeout: Duration,
    ) -> (Session, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let endpoint = Endpoint::parse("opc.tcp://localhost:4840").unwrap();
        (Session::new(Arc::new(client), endpoint, timeout, rx), tx)
    }

    fn node() -> NodeId {
        NodeId::string(2, "HelloWorld/ScalarTypes/Double")
    }

    #[test]
    fn test_only_transport_failures_are_transient() {
        assert!(UaError::EndpointUnreachable("h".into()).is_transient());
        assert!(UaError::Status(StatusCode::BAD_TIMEOUT).is_transient());
        assert!(!UaError::Status(StatusCode::BAD_USER_ACCESS_DENIED).is_transient());
        assert!(!UaError::Rejected("bad token".into()).is_transient());
        assert!(!UaError::NoMatchingEndpoint("h".into()).is_transient());
    }

    #[tokio::test]
    async fn test_read_reports_bad_status_by_name() {
        // Arrange
        let client = ScriptedClient {
            reads: Mutex::new(vec![Ok(DataValue {
                value: Variant::Empty,
                status: StatusCode::BAD_NOT_READABLE,
                source_timestamp: None,
            })]),
            ..Default::default()
        };
        let (session, _tx) = session(client, Duration::from_secs(1));

        // Act
        let err = session.read(&node()).await.unwrap_err();

        // Assert
        assert!(err.to_string().contains("BadNotReadable"), "{err}");
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let client = ScriptedClient {
            reads: Mutex::new(vec![Ok(DataValue::good(Variant::Double(1.0)))]),
            delay: Some(Duration::from_secs(5)),
        };
        let (session, _tx) = session(client, Duration::from_millis(20));

        let err = session.read(&node()).await.unwrap_err();

        assert!(matches!(err, AssetConnectionError::Timeout { operation: "read", .. }));
    }

    #[tokio::test]
    async fn test_closing_fails_in_flight_request_fast() {
        // Arrange
        let client = ScriptedClient {
            reads: Mutex::new(vec![Ok(DataValue::good(Variant::Double(1.0)))]),
            delay: Some(Duration::from_secs(5)),
        };
        let (session, tx) = session(client, Duration::from_secs(10));

        // Act
        let node_id = node();
        let read = session.read(&node_id);
        let close = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(ConnectionState::Closing);
        };
        let (result, ()) = tokio::join!(read, close);

        // Assert
        assert!(matches!(result, Err(AssetConnectionError::Closed)));
        assert!(matches!(
            session.read(&node()).await,
            Err(AssetConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_link_goes_down_and_recovers() {
        let client = ScriptedClient {
            reads: Mutex::new(vec![
                Err(UaError::ConnectionLost("socket reset".into())),
                Ok(DataValue::good(Variant::Double(2.0))),
            ]),
            ..Default::default()
        };
        let (session, _tx) = session(client, Duration::from_secs(1));

        let first = session.read(&node()).await;
        assert!(matches!(first, Err(AssetConnectionError::Disconnected(_))));
        assert!(!session.is_link_up());

        let second = session.read(&node()).await.unwrap();
        assert_eq!(second, Variant::Double(2.0));
        assert!(session.is_link_up());
    }
}
