//! Error taxonomy of the asset connection framework.
//!
//! Two families matter to callers:
//!
//! - [`ConfigurationError`] – something about the configuration is wrong.
//!   Only raised while a connection is being initialised, and always aborts
//!   the initialisation as a whole.
//! - [`AssetConnectionError`] – a call against a live asset failed: transport
//!   failure, timeout, bad remote status, or a value that does not fit.
//!   Raised to the caller of `get_value`, `set_value` and `invoke`.
//!
//! [`InitError`] wraps either of them for `init`, which can fail both ways.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::model::datatype::Datatype;
use crate::model::reference::Reference;

/// A pure value conversion failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueConversionError {
    /// The wire value's type cannot be turned into the expected datatype.
    #[error("cannot convert {found} to {expected}")]
    TypeMismatch { expected: String, found: String },

    /// Numeric value does not fit into the target type.
    #[error("value {value} is out of range for {target}")]
    OutOfRange { value: String, target: String },

    /// A text fallback failed to parse.
    #[error(transparent)]
    Format(#[from] crate::model::value::ValueFormatError),

    /// The number of wire values does not match the element's layout.
    #[error("expected {expected} wire value(s), got {found}")]
    Arity { expected: usize, found: usize },

    /// The element value's shape does not match its declared type.
    #[error("a {found} value cannot be stored in a {expected}")]
    ShapeMismatch { expected: String, found: String },

    /// An explicitly registered conversion rejected the value.
    #[error("custom conversion for {datatype} failed: {message}")]
    Custom { datatype: Datatype, message: String },
}

/// Malformed or unresolvable provider configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The remote address text could not be parsed.
    #[error("malformed address '{address}' for {reference}: {reason}")]
    MalformedAddress {
        reference: Reference,
        address: String,
        reason: String,
    },

    /// The runtime does not know the reference, or its type.
    #[error("type info for {reference} could not be resolved: {reason}")]
    UnresolvedType { reference: Reference, reason: String },

    /// The element kind cannot be served by this provider kind.
    #[error("{reference}: {reason}")]
    UnsupportedElement { reference: Reference, reason: String },

    /// The address is well-formed but does not exist on the asset.
    #[error("address '{address}' for {reference} is unknown to the asset: {reason}")]
    UnresolvableAddress {
        reference: Reference,
        address: String,
        reason: String,
    },

    /// A provider option has an invalid value.
    #[error("invalid provider options for {reference}: {reason}")]
    InvalidProvider { reference: Reference, reason: String },

    /// The endpoint URI is not usable.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The configuration text could not be parsed.
    #[error("failed to parse connection configuration: {0}")]
    Parse(String),
}

/// A call against a live asset failed.
#[derive(Debug, Error)]
pub enum AssetConnectionError {
    #[error("could not connect to {endpoint} within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("could not connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The remote did not answer within the request timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The connection has been closed, or is closing.
    #[error("asset connection is closed")]
    Closed,

    /// The transport to the remote was lost.
    #[error("connection to asset lost: {0}")]
    Disconnected(String),

    /// The remote answered with a bad status code.
    #[error("remote returned bad status: {0}")]
    BadStatus(String),

    #[error("value conversion failed: {0}")]
    Conversion(#[from] ValueConversionError),

    /// Operation arguments do not match the remote method's parameters.
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// The value cannot be written through this provider.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// The connection is not in a state that permits the request.
    #[error("connection is {0:?}")]
    InvalidState(ConnectionState),
}

/// Why `init` failed.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] AssetConnectionError),
}

/// A runtime lookup failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("no element found for {0}")]
    NotFound(Reference),

    #[error("{0} is not an operation")]
    NotAnOperation(Reference),
}
