//! # assetlink-opcua
//!
//! OPC UA binding of the asset connection framework.
//!
//! # Crate layout
//!
//! - **`domain`** – the wire model ([`NodeId`], [`Variant`], [`StatusCode`]),
//!   [`ValueConverter`], array indices, [`Endpoint`] and the TOML
//!   configuration.
//!
//! - **`application`** – the seam to the OPC UA stack ([`UaClient`],
//!   [`UaConnector`]), [`Session`], the providers and
//!   [`OpcUaAssetConnection`].
//!
//! - **`infrastructure`** – stacks behind the seam: [`EmbeddedServer`], an
//!   in-process address space used by the tests and the simulator, and,
//!   with the `client` feature, `OpcUaClientConnector` for real servers.
//!
//! # Example
//!
//! ```no_run
//! use assetlink_core::{AssetConnection, CoreConfig, StaticServiceContext};
//! use assetlink_opcua::{EmbeddedServer, OpcUaAssetConnection, OpcUaAssetConnectionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = EmbeddedServer::with_example_namespace();
//! let config = OpcUaAssetConnectionConfig::new("opc.tcp://localhost:4840");
//! let mut connection = OpcUaAssetConnection::new(config)?;
//! connection
//!     .init(&CoreConfig::default(), &StaticServiceContext::new(), &server)
//!     .await?;
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::connection::OpcUaAssetConnection;
pub use application::provider::{
    OpcUaOperationProvider, OpcUaSubscriptionProvider, OpcUaValueProvider,
};
pub use application::session::{Session, UaClient, UaConnector, UaError};
pub use domain::array_index::{ArrayIndex, ArrayIndexParseError};
pub use domain::config::{
    ArgumentMapping, CertificateConfig, ClientSettings, OpcUaAssetConnectionConfig,
    OpcUaOperationProviderConfig, OpcUaSubscriptionProviderConfig, OpcUaValueProviderConfig,
};
pub use domain::conversion::ValueConverter;
pub use domain::endpoint::{Endpoint, Identity, MessageSecurityMode, SecurityPolicy, UserTokenType};
pub use domain::types::{
    Argument, DataValue, LocalizedText, MethodSignature, NodeClass, NodeId, NodeInfo, StatusCode,
    Variant, WireType,
};
#[cfg(feature = "client")]
pub use infrastructure::client::OpcUaClientConnector;
pub use infrastructure::server::{example_node, EmbeddedServer, MethodDescriptor, MethodHandler};
