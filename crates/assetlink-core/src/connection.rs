//! The asset connection contract and its provider registry.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──init──▶ Connecting ──▶ Connected ──close──▶ Closing ──▶ Closed
//!        ▲                    │
//!        └──── init failed ───┘
//! ```
//!
//! While `Connected`, a lost transport is not a separate state: it shows up
//! as [`AssetConnectionError::Disconnected`] from provider calls until the
//! session recovers or the connection is closed.  There is no reconnect
//! loop; to recover from a dropped session for good, recreate the
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AssetConnectionError;
use crate::model::reference::Reference;
use crate::provider::{AssetOperationProvider, AssetSubscriptionProvider, AssetValueProvider};

/// Public lifecycle state of an asset connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// `true` once `close` has started.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// The three provider maps of one connection.
///
/// Built once during initialisation and read-only afterwards.  A reference
/// may appear in any number of the maps.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    pub value: HashMap<Reference, Arc<dyn AssetValueProvider>>,
    pub subscription: HashMap<Reference, Arc<dyn AssetSubscriptionProvider>>,
    pub operation: HashMap<Reference, Arc<dyn AssetOperationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of providers across all three maps.
    pub fn len(&self) -> usize {
        self.value.len() + self.subscription.len() + self.operation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = |m: Vec<&Reference>| {
            let mut v: Vec<String> = m.into_iter().map(ToString::to_string).collect();
            v.sort();
            v
        };
        f.debug_struct("ProviderRegistry")
            .field("value", &keys(self.value.keys().collect()))
            .field("subscription", &keys(self.subscription.keys().collect()))
            .field("operation", &keys(self.operation.keys().collect()))
            .finish()
    }
}

/// One live session to an asset plus the providers bound to it.
///
/// Lookups return an empty map until initialisation has succeeded.  A
/// reference that is absent from a map is not configured for this
/// connection; that is different from a configured provider whose calls
/// currently fail.
#[async_trait]
pub trait AssetConnection: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn value_providers(&self) -> &HashMap<Reference, Arc<dyn AssetValueProvider>>;

    fn subscription_providers(&self) -> &HashMap<Reference, Arc<dyn AssetSubscriptionProvider>>;

    fn operation_providers(&self) -> &HashMap<Reference, Arc<dyn AssetOperationProvider>>;

    /// Cancels every subscription, then closes the session.
    ///
    /// Idempotent and safe to call while other calls are in flight; those
    /// fail with [`AssetConnectionError::Closed`] instead of blocking.
    async fn close(&self) -> Result<(), AssetConnectionError>;
}
