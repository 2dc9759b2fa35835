//! The three interaction contracts with a remote asset.
//!
//! Each provider is bound to one address on the asset and to the session of
//! the connection that created it.  Providers hold no mutable state beyond
//! their cached type information and (for subscriptions) their listener set,
//! so they are shared as `Arc<dyn ...>` and may be called concurrently.
//!
//! Protocol bindings implement these traits; callers only ever see the
//! traits, obtained from an [`AssetConnection`](crate::AssetConnection)'s
//! registries.

pub mod listeners;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AssetConnectionError;
use crate::model::operation::OperationVariable;
use crate::model::value::ElementValue;
use listeners::NewDataListener;

/// Synchronous get/set of one addressed data point.
#[async_trait]
pub trait AssetValueProvider: Send + Sync {
    /// Reads the current value.
    ///
    /// Bounded by the connection's request timeout.  Reading does not change
    /// remote state, so two reads with no write in between return equal
    /// values.
    async fn get_value(&self) -> Result<ElementValue, AssetConnectionError>;

    /// Writes `value`.
    ///
    /// Returns once the remote has acknowledged the write.  This does not
    /// guarantee the asset has physically applied it; read back or
    /// subscribe when that matters.
    async fn set_value(&self, value: &ElementValue) -> Result<(), AssetConnectionError>;
}

/// Push notification for one addressed data point.
///
/// The remote subscription is registered when the provider is created.
/// Every sample the remote delivers is converted and handed, in arrival
/// order, to every listener registered at that moment.
#[async_trait]
pub trait AssetSubscriptionProvider: Send + Sync {
    /// Registers `listener`.  Adding the same `Arc` twice has no effect.
    fn add_new_data_listener(&self, listener: Arc<dyn NewDataListener>);

    /// Removes `listener`, matched by identity.
    fn remove_new_data_listener(&self, listener: &Arc<dyn NewDataListener>);

    /// Cancels the remote subscription.
    ///
    /// No listener is called after this returns.  Calling it again is a
    /// no-op.
    async fn unsubscribe(&self) -> Result<(), AssetConnectionError>;
}

/// Blocking remote call with named arguments.
#[async_trait]
pub trait AssetOperationProvider: Send + Sync {
    /// Calls the remote operation.
    ///
    /// `input` and `inoutput` are matched to the remote parameters by
    /// `id_short`, not by position.  After the call every entry of
    /// `inoutput` holds the value the remote returned for it; the returned
    /// vector holds the declared output arguments.
    async fn invoke(
        &self,
        input: &[OperationVariable],
        inoutput: &mut [OperationVariable],
    ) -> Result<Vec<OperationVariable>, AssetConnectionError>;
}
