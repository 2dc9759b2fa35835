//! [`OpcUaAssetConnection`]: one OPC UA session plus its providers.
//!
//! `init` runs in three phases and is all-or-nothing:
//!
//! 1. Resolve the type info (or output variables, for operations) of every
//!    configured reference from the [`ServiceContext`].  Nothing has touched
//!    the network yet, so an unknown reference costs nothing to reject.
//! 2. Connect within the connect timeout.
//! 3. Build the providers.  Each one browses its nodes; subscriptions also
//!    create their monitored item.  If any provider fails, the ones already
//!    built are unsubscribed, the session is closed and the connection goes
//!    back to `Uninitialized` with empty registries.
//!
//! The lifecycle state lives in a `watch` channel shared with the
//! [`Session`], which is how `close()` reaches requests already in flight.

use std::collections::HashMap;
use std::sync::Arc;

use assetlink_core::{
    ArgumentDescriptor, AssetConnection, AssetConnectionError, AssetOperationProvider,
    AssetSubscriptionProvider, AssetValueProvider, ConfigurationError, ConnectionState,
    CoreConfig, InitError, ProviderRegistry, Reference, ServiceContext, TypeInfo,
};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::provider::{OpcUaOperationProvider, OpcUaSubscriptionProvider, OpcUaValueProvider};
use crate::application::session::{Session, UaClient, UaConnector};
use crate::domain::config::OpcUaAssetConnectionConfig;
use crate::domain::conversion::ValueConverter;
use crate::domain::endpoint::Endpoint;

/// An asset connection over OPC UA.
pub struct OpcUaAssetConnection {
    config: OpcUaAssetConnectionConfig,
    converter: ValueConverter,
    state: watch::Sender<ConnectionState>,
    session: Option<Arc<Session>>,
    registry: ProviderRegistry,
}

impl std::fmt::Debug for OpcUaAssetConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcUaAssetConnection")
            .field("host", &self.config.host)
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Everything phase 1 resolves.
struct Resolved {
    types: HashMap<Reference, TypeInfo>,
    outputs: HashMap<Reference, Vec<ArgumentDescriptor>>,
}

impl OpcUaAssetConnection {
    /// Validates `config`; does not connect.
    pub fn new(config: OpcUaAssetConnectionConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Ok(Self {
            config,
            converter: ValueConverter::new(),
            state,
            session: None,
            registry: ProviderRegistry::new(),
        })
    }

    /// Replaces the default converter, e.g. with custom conversions.
    pub fn with_converter(mut self, converter: ValueConverter) -> Self {
        self.converter = converter;
        self
    }

    pub fn config(&self) -> &OpcUaAssetConnectionConfig {
        &self.config
    }

    /// `false` while the session's transport is known to be down.
    pub fn is_link_up(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_link_up())
    }

    /// Opens the session and builds every configured provider.
    pub async fn init(
        &mut self,
        core: &CoreConfig,
        context: &dyn ServiceContext,
        connector: &dyn UaConnector,
    ) -> Result<(), InitError> {
        let current = self.state();
        if current != ConnectionState::Uninitialized {
            return Err(AssetConnectionError::InvalidState(current).into());
        }

        let resolved = self.resolve(context)?;
        let endpoint = self.config.endpoint()?;

        self.state.send_replace(ConnectionState::Connecting);
        info!(%endpoint, "connecting to asset");
        let client = match self.connect(core, &endpoint, connector).await {
            Ok(client) => client,
            Err(e) => {
                self.state.send_replace(ConnectionState::Uninitialized);
                return Err(e.into());
            }
        };

        let session = Arc::new(Session::new(
            client,
            endpoint,
            self.config.request_timeout(core),
            self.state.subscribe(),
        ));

        let mut registry = ProviderRegistry::new();
        if let Err(e) = self.build(&session, &resolved, &mut registry).await {
            warn!(error = %e, "asset connection init failed, releasing partial state");
            release(&registry, &session).await;
            self.state.send_replace(ConnectionState::Uninitialized);
            return Err(e);
        }

        info!(
            endpoint = %session.endpoint(),
            value = registry.value.len(),
            subscription = registry.subscription.len(),
            operation = registry.operation.len(),
            "asset connection ready"
        );
        self.session = Some(session);
        self.registry = registry;
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    /// Up to `retries + 1` attempts, each bounded by the connect timeout.
    /// Only transient failures are retried.
    async fn connect(
        &self,
        core: &CoreConfig,
        endpoint: &Endpoint,
        connector: &dyn UaConnector,
    ) -> Result<Arc<dyn UaClient>, AssetConnectionError> {
        let connect_timeout = self.config.connect_timeout(core);
        let identity = self.config.identity();
        let attempts = self.config.retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match tokio::time::timeout(connect_timeout, connector.connect(endpoint, &identity)).await {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(e)) if e.is_transient() => AssetConnectionError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                },
                Ok(Err(e)) => {
                    return Err(AssetConnectionError::ConnectFailed {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => AssetConnectionError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    timeout: connect_timeout,
                },
            };
            if attempt >= attempts {
                return Err(error);
            }
            debug!(%endpoint, attempt, attempts, error = %error, "connect attempt failed, retrying");
        }
    }

    fn resolve(&self, context: &dyn ServiceContext) -> Result<Resolved, ConfigurationError> {
        let unresolved = |reference: &Reference, e: assetlink_core::ContextError| {
            ConfigurationError::UnresolvedType {
                reference: reference.clone(),
                reason: e.to_string(),
            }
        };

        let mut types = HashMap::new();
        for reference in self
            .config
            .value_providers
            .keys()
            .chain(self.config.subscription_providers.keys())
        {
            if types.contains_key(reference) {
                continue;
            }
            let type_info = context
                .type_info(reference)
                .map_err(|e| unresolved(reference, e))?;
            types.insert(reference.clone(), type_info);
        }

        let mut outputs = HashMap::new();
        for reference in self.config.operation_providers.keys() {
            let descriptors = context
                .operation_output_variables(reference)
                .map_err(|e| unresolved(reference, e))?;
            outputs.insert(reference.clone(), descriptors);
        }
        Ok(Resolved { types, outputs })
    }

    async fn build(
        &self,
        session: &Arc<Session>,
        resolved: &Resolved,
        registry: &mut ProviderRegistry,
    ) -> Result<(), InitError> {
        for (reference, config) in &self.config.value_providers {
            let provider = OpcUaValueProvider::new(
                reference.clone(),
                config,
                resolved.types[reference],
                Arc::clone(session),
                self.converter.clone(),
            )
            .await?;
            registry
                .value
                .insert(reference.clone(), Arc::new(provider) as Arc<dyn AssetValueProvider>);
        }

        for (reference, config) in &self.config.subscription_providers {
            let provider = OpcUaSubscriptionProvider::new(
                reference.clone(),
                config,
                resolved.types[reference],
                Arc::clone(session),
                self.converter.clone(),
            )
            .await?;
            registry.subscription.insert(
                reference.clone(),
                Arc::new(provider) as Arc<dyn AssetSubscriptionProvider>,
            );
        }

        for (reference, config) in &self.config.operation_providers {
            let provider = OpcUaOperationProvider::new(
                reference.clone(),
                config,
                resolved.outputs[reference].clone(),
                Arc::clone(session),
                self.converter.clone(),
            )
            .await?;
            registry.operation.insert(
                reference.clone(),
                Arc::new(provider) as Arc<dyn AssetOperationProvider>,
            );
        }
        Ok(())
    }
}

/// Unsubscribes everything in `registry` and closes `session`.  Failures are
/// logged; teardown always runs to the end.
async fn release(registry: &ProviderRegistry, session: &Session) {
    for (reference, provider) in &registry.subscription {
        if let Err(e) = provider.unsubscribe().await {
            warn!(%reference, error = %e, "unsubscribe failed");
        }
    }
    if let Err(e) = session.disconnect().await {
        warn!(endpoint = %session.endpoint(), error = %e, "disconnect failed");
    }
}

#[async_trait]
impl AssetConnection for OpcUaAssetConnection {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn value_providers(&self) -> &HashMap<Reference, Arc<dyn AssetValueProvider>> {
        &self.registry.value
    }

    fn subscription_providers(&self) -> &HashMap<Reference, Arc<dyn AssetSubscriptionProvider>> {
        &self.registry.subscription
    }

    fn operation_providers(&self) -> &HashMap<Reference, Arc<dyn AssetOperationProvider>> {
        &self.registry.operation
    }

    async fn close(&self) -> Result<(), AssetConnectionError> {
        let started = self.state.send_if_modified(|state| {
            if state.is_shutting_down() {
                return false;
            }
            *state = ConnectionState::Closing;
            true
        });
        if !started {
            // Another caller is tearing down; wait for it to finish.
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
            debug!(host = %self.config.host, "close already done");
            return Ok(());
        }

        info!(host = %self.config.host, "closing asset connection");
        if let Some(session) = &self.session {
            release(&self.registry, session).await;
        }
        self.state.send_replace(ConnectionState::Closed);
        info!(host = %self.config.host, "asset connection closed");
        Ok(())
    }
}
