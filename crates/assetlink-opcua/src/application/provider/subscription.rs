use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use assetlink_core::{
    AssetConnectionError, AssetSubscriptionProvider, ConfigurationError, InitError, ListenerSet,
    NewDataListener, Reference, TypeInfo,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::NodeBinding;
use crate::application::session::{DataChangeCallback, MonitoredItemId, Session};
use crate::domain::config::OpcUaSubscriptionProviderConfig;
use crate::domain::conversion::ValueConverter;
use crate::domain::types::DataValue;

/// Pushes every reported sample of one node to the registered listeners.
///
/// The monitored item is created in [`new`](Self::new) and lives until
/// [`unsubscribe`](AssetSubscriptionProvider::unsubscribe).  Samples arrive
/// on a task owned by the stack; conversion and fan-out happen right there.
#[derive(Debug)]
pub struct OpcUaSubscriptionProvider {
    reference: Reference,
    session: Arc<Session>,
    listeners: Arc<ListenerSet>,
    item: Mutex<Option<MonitoredItemId>>,
}

impl OpcUaSubscriptionProvider {
    pub async fn new(
        reference: Reference,
        config: &OpcUaSubscriptionProviderConfig,
        type_info: TypeInfo,
        session: Arc<Session>,
        converter: ValueConverter,
    ) -> Result<Self, InitError> {
        if matches!(type_info, TypeInfo::Range { .. }) {
            return Err(ConfigurationError::UnsupportedElement {
                reference,
                reason: "a range spans two nodes and cannot be monitored as one".to_string(),
            }
            .into());
        }
        let binding = NodeBinding::resolve(
            &session,
            &reference,
            &config.node_id,
            config.array_index.as_deref(),
            &type_info,
        )
        .await?;

        let listeners = Arc::new(ListenerSet::new());
        let callback = sample_handler(
            reference.clone(),
            binding.clone(),
            type_info,
            converter,
            Arc::clone(&listeners),
        );
        let item = session
            .subscribe(&binding.nodes[0], config.interval(), callback)
            .await?;
        debug!(%reference, node_id = %config.node_id, item, interval_ms = config.interval_ms, "subscription created");

        Ok(Self {
            reference,
            session,
            listeners,
            item: Mutex::new(Some(item)),
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// `false` once unsubscribed.
    pub fn is_active(&self) -> bool {
        self.item
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Converts each sample and delivers it.  Bad samples are logged and dropped.
fn sample_handler(
    reference: Reference,
    binding: NodeBinding,
    type_info: TypeInfo,
    converter: ValueConverter,
    listeners: Arc<ListenerSet>,
) -> DataChangeCallback {
    Arc::new(move |sample: DataValue| {
        if sample.status.is_bad() {
            warn!(%reference, status = %sample.status, "dropping sample with bad status");
            return;
        }
        let wire = match &binding.array_index {
            Some(index) => match index.get(&sample.value) {
                Some(element) => element.clone(),
                None => {
                    warn!(%reference, %index, "dropping sample: array index out of bounds");
                    return;
                }
            },
            None => sample.value,
        };
        // A panicking custom conversion must not take the monitored item down.
        let converted = panic::catch_unwind(AssertUnwindSafe(|| {
            converter.to_element_value(std::slice::from_ref(&wire), &type_info)
        }));
        match converted {
            Ok(Ok(value)) => {
                let delivered = listeners.deliver(&value);
                debug!(%reference, delivered, "sample delivered");
            }
            Ok(Err(e)) => warn!(%reference, error = %e, "dropping sample that does not convert"),
            Err(_) => warn!(%reference, "dropping sample: conversion panicked"),
        }
    })
}

#[async_trait]
impl AssetSubscriptionProvider for OpcUaSubscriptionProvider {
    fn add_new_data_listener(&self, listener: Arc<dyn NewDataListener>) {
        self.listeners.add(listener);
    }

    fn remove_new_data_listener(&self, listener: &Arc<dyn NewDataListener>) {
        self.listeners.remove(listener);
    }

    /// Stops delivery, then deletes the monitored item.  Once this returns no
    /// listener runs again.  Calling it twice is a no-op.
    async fn unsubscribe(&self) -> Result<(), AssetConnectionError> {
        let item = self
            .item
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.listeners.close();
        match item {
            Some(id) => {
                debug!(reference = %self.reference, item = id, "unsubscribing");
                self.session.unsubscribe(id).await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session::UaConnector;
    use crate::domain::endpoint::{Endpoint, Identity};
    use crate::domain::types::Variant;
    use crate::infrastructure::server::{example_node, EmbeddedServer};
    use assetlink_core::{ConnectionState, Datatype, ElementValue, TypedValue};
    use std::time::Duration;
    use tokio::sync::watch;

    async fn provider(
        server: &EmbeddedServer,
        node: &str,
        type_info: TypeInfo,
    ) -> Result<(OpcUaSubscriptionProvider, watch::Sender<ConnectionState>), InitError> {
        let endpoint = Endpoint::parse("opc.tcp://localhost:4840").unwrap();
        let client = server.connect(&endpoint, &Identity::Anonymous).await.unwrap();
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let session = Arc::new(Session::new(client, endpoint, Duration::from_secs(1), rx));
        let config = OpcUaSubscriptionProviderConfig {
            node_id: example_node(node).to_string(),
            interval_ms: 10,
            array_index: None,
        };
        let provider = OpcUaSubscriptionProvider::new(
            Reference::parse("(Property)x").unwrap(),
            &config,
            type_info,
            session,
            ValueConverter::new(),
        )
        .await?;
        Ok((provider, tx))
    }

    #[tokio::test]
    async fn test_changes_reach_listener_until_unsubscribed() {
        // Arrange
        let server = EmbeddedServer::with_example_namespace();
        let node = example_node("ScalarTypes/Int32");
        let (provider, _state) = provider(&server, "ScalarTypes/Int32", TypeInfo::property(Datatype::Int))
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.add_new_data_listener(Arc::new(move |v: &ElementValue| {
            sink.lock().unwrap().push(v.clone());
        }));

        // Act
        server.set_value(&node, Variant::Int32(7)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        provider.unsubscribe().await.unwrap();
        server.set_value(&node, Variant::Int32(8)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&ElementValue::Property(TypedValue::Int(7))));
        assert!(!seen.contains(&ElementValue::Property(TypedValue::Int(8))));
        assert!(!provider.is_active());
        assert_eq!(server.active_monitored_items(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_a_no_op() {
        let server = EmbeddedServer::with_example_namespace();
        let (provider, _state) = provider(&server, "ScalarTypes/Double", TypeInfo::property(Datatype::Double))
            .await
            .unwrap();
        assert!(provider.unsubscribe().await.is_ok());
        assert!(provider.unsubscribe().await.is_ok());
    }

    #[tokio::test]
    async fn test_range_cannot_be_subscribed() {
        let server = EmbeddedServer::with_example_namespace();
        let result = provider(
            &server,
            "Range",
            TypeInfo::Range {
                datatype: Datatype::Double,
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(InitError::Configuration(ConfigurationError::UnsupportedElement { .. }))
        ));
    }

    #[test]
    fn test_unconvertible_sample_is_dropped() {
        // Arrange
        let listeners = Arc::new(ListenerSet::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        listeners.add(Arc::new(move |_: &ElementValue| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        let binding = NodeBinding {
            nodes: vec![example_node("ScalarTypes/Boolean")],
            hints: vec![crate::domain::types::WireType::Boolean],
            array_index: None,
        };
        let handler = sample_handler(
            Reference::parse("(Property)x").unwrap(),
            binding,
            TypeInfo::property(Datatype::Boolean),
            ValueConverter::new(),
            listeners,
        );

        // Act
        handler(DataValue::good(Variant::Guid(uuid::Uuid::nil())));
        handler(DataValue {
            value: Variant::Boolean(true),
            status: crate::domain::types::StatusCode::BAD_NOT_READABLE,
            source_timestamp: None,
        });
        handler(DataValue::good(Variant::Boolean(true)));

        // Assert
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_conversion_drops_only_that_sample() {
        // Arrange
        let listeners = Arc::new(ListenerSet::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.add(Arc::new(move |v: &ElementValue| {
            sink.lock().unwrap().push(v.clone());
        }));
        let converter = ValueConverter::new().with_to_model(
            crate::domain::types::WireType::Int32,
            Datatype::Int,
            |v| match v {
                Variant::Int32(0) => panic!("vendor conversion failure"),
                Variant::Int32(n) => Ok(TypedValue::Int(*n)),
                _ => Ok(TypedValue::Int(0)),
            },
        );
        let handler = sample_handler(
            Reference::parse("(Property)x").unwrap(),
            NodeBinding {
                nodes: vec![example_node("ScalarTypes/Int32")],
                hints: vec![crate::domain::types::WireType::Int32],
                array_index: None,
            },
            TypeInfo::property(Datatype::Int),
            converter,
            listeners,
        );

        // Act
        handler(DataValue::good(Variant::Int32(0)));
        handler(DataValue::good(Variant::Int32(5)));

        // Assert
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ElementValue::Property(TypedValue::Int(5))]
        );
    }
}
