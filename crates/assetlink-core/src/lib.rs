//! # assetlink-core
//!
//! Protocol-agnostic foundation of the asset connection framework.
//!
//! An *asset connection* bridges the digital-twin value model (elements
//! identified by a [`Reference`], carrying an [`ElementValue`]) to a live
//! automation asset that is reachable only through a wire protocol.  This
//! crate holds everything that does not depend on the protocol:
//!
//! - **`model`** – references, the closed [`Datatype`] set, typed values,
//!   element values and the type information the runtime hands out.
//!
//! - **`provider`** – the three interaction contracts with a remote asset:
//!   synchronous get/set ([`AssetValueProvider`]), push notification
//!   ([`AssetSubscriptionProvider`]) and blocking remote calls
//!   ([`AssetOperationProvider`]), plus the listener fan-out used by
//!   subscriptions.
//!
//! - **`connection`** – the [`AssetConnection`] contract, its lifecycle
//!   states and the read-only provider registry.
//!
//! - **`context`** – what the framework consumes from the runtime
//!   ([`ServiceContext`]) and the runtime-wide [`CoreConfig`].
//!
//! It has no dependencies on sockets or an async runtime; protocol bindings
//! (such as `assetlink-opcua`) supply both.

pub mod connection;
pub mod context;
pub mod error;
pub mod model;
pub mod provider;

pub use connection::{AssetConnection, ConnectionState, ProviderRegistry};
pub use context::{CoreConfig, ServiceContext, StaticServiceContext};
pub use error::{
    AssetConnectionError, ConfigurationError, ContextError, InitError, ValueConversionError,
};
pub use model::datatype::Datatype;
pub use model::operation::{ArgumentDescriptor, OperationVariable};
pub use model::reference::{Key, KeyType, Reference, ReferenceParseError};
pub use model::type_info::TypeInfo;
pub use model::value::{ElementValue, LangString, LangStringSet, QualifiedName, TypedValue, ValueFormatError};
pub use provider::listeners::{ListenerSet, NewDataListener};
pub use provider::{AssetOperationProvider, AssetSubscriptionProvider, AssetValueProvider};
