//! TOML configuration of an OPC UA asset connection.
//!
//! ```toml
//! host = "opc.tcp://localhost:4840"
//! request_timeout_ms = 3000
//!
//! [value_providers."(Submodel)urn:example:sensors, (Property)Temperature"]
//! node_id = "ns=2;s=HelloWorld/ScalarTypes/Double"
//!
//! [subscription_providers."(Submodel)urn:example:sensors, (Property)Temperature"]
//! node_id = "ns=2;s=HelloWorld/ScalarTypes/Double"
//! interval_ms = 100
//!
//! [operation_providers."(Submodel)urn:example:ops, (Operation)SquareRoot"]
//! node_id = "ns=2;s=HelloWorld/sqrt(x)"
//! output_argument_mapping = [{ id_short = "result", argument_name = "x_sqrt" }]
//! ```
//!
//! # Connection settings
//!
//! | key                          | default                              |
//! |------------------------------|--------------------------------------|
//! | `retries`                    | `1` (so up to two connect attempts)  |
//! | `acknowledge_timeout_ms`     | `10000`                              |
//! | `security_base_dir`          | `.`                                  |
//! | `security_policy`            | `None`                               |
//! | `security_mode`              | `None`                               |
//! | `application_certificate`    | `application.der` / `application.pem`|
//! | `authentication_certificate` | `authentication.der` / `authentication.pem` |
//! | `user_token_type`            | `UserName` with a username, else `Anonymous` |
//!
//! Relative certificate paths resolve against `security_base_dir`.
//!
//! Provider tables are keyed by the text form of a model reference.  The
//! structs are plain data: they are deserialised once, checked by
//! [`OpcUaAssetConnectionConfig::validate`], and never mutated afterwards.
//!
//! # Argument mapping
//!
//! Operation arguments are matched by name.  Where the remote method's
//! argument names differ from the model's idShorts, a mapping entry links
//! the two:
//!
//! - `input_argument_mapping`: remote input argument `argument_name` is
//!   supplied by the input (or inout) variable `id_short`.
//! - `output_argument_mapping`: output (or inout) variable `id_short` is
//!   filled from remote output argument `argument_name`.
//!
//! Names without an entry match one-to-one.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use assetlink_core::{ConfigurationError, CoreConfig, Reference};
use serde::{Deserialize, Serialize};

use crate::domain::array_index::ArrayIndex;
use crate::domain::endpoint::{Endpoint, Identity, MessageSecurityMode, SecurityPolicy, UserTokenType};
use crate::domain::types::NodeId;

fn default_interval_ms() -> u64 {
    1_000
}

fn default_retries() -> u32 {
    1
}

fn default_acknowledge_timeout_ms() -> u64 {
    10_000
}

fn default_security_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_application_certificate() -> CertificateConfig {
    CertificateConfig::new("application.der", "application.pem")
}

fn default_authentication_certificate() -> CertificateConfig {
    CertificateConfig::new("authentication.der", "authentication.pem")
}

/// An X.509 certificate (DER) and its private key (PEM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl CertificateConfig {
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }
}

/// What a protocol stack client needs beyond endpoint and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Bound on the transport handshake (hello/acknowledge).
    pub acknowledge_timeout: Duration,
    /// Trust lists and rejected server certificates live below this.
    pub pki_dir: PathBuf,
    pub application_certificate: CertificateConfig,
}

/// Links a model idShort to a remote argument name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentMapping {
    pub id_short: String,
    pub argument_name: String,
}

impl ArgumentMapping {
    pub fn new(id_short: impl Into<String>, argument_name: impl Into<String>) -> Self {
        Self {
            id_short: id_short.into(),
            argument_name: argument_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcUaValueProviderConfig {
    pub node_id: String,
    /// `[i]` or `[i][j]`; addresses one element of an array node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcUaSubscriptionProviderConfig {
    pub node_id: String,
    /// Sampling interval requested from the server.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<String>,
}

impl OpcUaSubscriptionProviderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcUaOperationProviderConfig {
    pub node_id: String,
    /// Object the method is called on.  Empty or absent means: browse for
    /// the method's parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    #[serde(default)]
    pub input_argument_mapping: Vec<ArgumentMapping>,
    #[serde(default)]
    pub output_argument_mapping: Vec<ArgumentMapping>,
}

impl OpcUaOperationProviderConfig {
    /// idShort supplying remote input argument `argument_name`.
    pub fn input_id_short<'a>(&'a self, argument_name: &'a str) -> &'a str {
        self.input_argument_mapping
            .iter()
            .find(|m| m.argument_name == argument_name)
            .map_or(argument_name, |m| m.id_short.as_str())
    }

    /// Remote output argument filling variable `id_short`.
    pub fn output_argument_name<'a>(&'a self, id_short: &'a str) -> &'a str {
        self.output_argument_mapping
            .iter()
            .find(|m| m.id_short == id_short)
            .map_or(id_short, |m| m.argument_name.as_str())
    }
}

/// Everything needed to open one OPC UA asset connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcUaAssetConnectionConfig {
    /// Endpoint URL, `opc.tcp://host[:port]`.
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Overrides [`CoreConfig::request_timeout_ms`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Overrides [`CoreConfig::connect_timeout_ms`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// Extra connect attempts after a transient failure.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_acknowledge_timeout_ms")]
    pub acknowledge_timeout_ms: u64,
    #[serde(default = "default_security_base_dir")]
    pub security_base_dir: PathBuf,
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    #[serde(default)]
    pub security_mode: MessageSecurityMode,
    /// Identifies this client on secured channels.
    #[serde(default = "default_application_certificate")]
    pub application_certificate: CertificateConfig,
    /// Presented as the user identity when `user_token_type` is `Certificate`.
    #[serde(default = "default_authentication_certificate")]
    pub authentication_certificate: CertificateConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token_type: Option<UserTokenType>,
    #[serde(default)]
    pub value_providers: HashMap<Reference, OpcUaValueProviderConfig>,
    #[serde(default)]
    pub subscription_providers: HashMap<Reference, OpcUaSubscriptionProviderConfig>,
    #[serde(default)]
    pub operation_providers: HashMap<Reference, OpcUaOperationProviderConfig>,
}

impl OpcUaAssetConnectionConfig {
    /// A config with no providers.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            request_timeout_ms: None,
            connect_timeout_ms: None,
            retries: default_retries(),
            acknowledge_timeout_ms: default_acknowledge_timeout_ms(),
            security_base_dir: default_security_base_dir(),
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            application_certificate: default_application_certificate(),
            authentication_certificate: default_authentication_certificate(),
            user_token_type: None,
            value_providers: HashMap::new(),
            subscription_providers: HashMap::new(),
            operation_providers: HashMap::new(),
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked without talking to the server:
    /// endpoint and security, identity, timeouts, node id and array index
    /// syntax, and argument mappings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.endpoint()?;
        let invalid = |reason: String| ConfigurationError::InvalidEndpoint {
            endpoint: self.host.clone(),
            reason,
        };

        if self.username.is_some() != self.password.is_some() {
            return Err(invalid("username and password must be set together".to_string()));
        }
        match self.user_token_type() {
            UserTokenType::Anonymous if self.username.is_some() => {
                return Err(invalid("username given but user_token_type is Anonymous".to_string()))
            }
            UserTokenType::UserName if self.username.is_none() => {
                return Err(invalid("user_token_type UserName needs username and password".to_string()))
            }
            UserTokenType::IssuedToken => {
                return Err(invalid("user_token_type IssuedToken is not supported".to_string()))
            }
            _ => {}
        }
        for (name, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("acknowledge_timeout_ms", Some(self.acknowledge_timeout_ms)),
        ] {
            if value == Some(0) {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }

        for (reference, provider) in &self.value_providers {
            parse_node_id(reference, &provider.node_id)?;
            parse_array_index(reference, provider.array_index.as_deref())?;
        }

        for (reference, provider) in &self.subscription_providers {
            parse_node_id(reference, &provider.node_id)?;
            parse_array_index(reference, provider.array_index.as_deref())?;
            if provider.interval_ms == 0 {
                return Err(ConfigurationError::InvalidProvider {
                    reference: reference.clone(),
                    reason: "interval_ms must be greater than zero".to_string(),
                });
            }
        }

        for (reference, provider) in &self.operation_providers {
            parse_node_id(reference, &provider.node_id)?;
            parse_parent_node_id(reference, provider.parent_node_id.as_deref())?;
            check_mapping(reference, "input_argument_mapping", &provider.input_argument_mapping, |m| {
                &m.argument_name
            })?;
            check_mapping(reference, "output_argument_mapping", &provider.output_argument_mapping, |m| {
                &m.id_short
            })?;
        }
        Ok(())
    }

    /// The endpoint URL with the configured security.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigurationError> {
        Endpoint::parse(&self.host)?.with_security(self.security_policy, self.security_mode)
    }

    /// The configured token type, or the one implied by the credentials.
    pub fn user_token_type(&self) -> UserTokenType {
        self.user_token_type.unwrap_or(if self.username.is_some() {
            UserTokenType::UserName
        } else {
            UserTokenType::Anonymous
        })
    }

    pub fn identity(&self) -> Identity {
        match (self.user_token_type(), &self.username, &self.password) {
            (UserTokenType::UserName, Some(username), Some(password)) => Identity::UserName {
                username: username.clone(),
                password: password.clone(),
            },
            (UserTokenType::Certificate, ..) => Identity::Certificate {
                certificate: self.security_path(&self.authentication_certificate.certificate),
                private_key: self.security_path(&self.authentication_certificate.private_key),
            },
            _ => Identity::Anonymous,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            acknowledge_timeout: Duration::from_millis(self.acknowledge_timeout_ms),
            pki_dir: self.security_base_dir.join("pki"),
            application_certificate: CertificateConfig {
                certificate: self.security_path(&self.application_certificate.certificate),
                private_key: self.security_path(&self.application_certificate.private_key),
            },
        }
    }

    /// `path` itself when absolute, else below `security_base_dir`.
    fn security_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.security_base_dir.join(path)
        }
    }

    pub fn request_timeout(&self, core: &CoreConfig) -> Duration {
        self.request_timeout_ms
            .map_or_else(|| core.request_timeout(), Duration::from_millis)
    }

    pub fn connect_timeout(&self, core: &CoreConfig) -> Duration {
        self.connect_timeout_ms
            .map_or_else(|| core.connect_timeout(), Duration::from_millis)
    }

    /// Every reference the configuration mentions, in no particular order.
    pub fn references(&self) -> HashSet<&Reference> {
        self.value_providers
            .keys()
            .chain(self.subscription_providers.keys())
            .chain(self.operation_providers.keys())
            .collect()
    }
}

pub(crate) fn parse_node_id(reference: &Reference, text: &str) -> Result<NodeId, ConfigurationError> {
    text.parse().map_err(|e: crate::domain::types::NodeIdParseError| {
        ConfigurationError::MalformedAddress {
            reference: reference.clone(),
            address: text.to_string(),
            reason: e.to_string(),
        }
    })
}

pub(crate) fn parse_parent_node_id(
    reference: &Reference,
    text: Option<&str>,
) -> Result<Option<NodeId>, ConfigurationError> {
    match text.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_node_id(reference, text).map(Some),
    }
}

pub(crate) fn parse_array_index(
    reference: &Reference,
    text: Option<&str>,
) -> Result<Option<ArrayIndex>, ConfigurationError> {
    match text.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text.parse().map(Some).map_err(|e: crate::domain::array_index::ArrayIndexParseError| {
            ConfigurationError::InvalidProvider {
                reference: reference.clone(),
                reason: format!("array_index: {e}"),
            }
        }),
    }
}

/// Mapping entries must be non-empty and unique on the looked-up side.
fn check_mapping(
    reference: &Reference,
    field: &str,
    mapping: &[ArgumentMapping],
    key: impl Fn(&ArgumentMapping) -> &String,
) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::new();
    for entry in mapping {
        if entry.id_short.trim().is_empty() || entry.argument_name.trim().is_empty() {
            return Err(ConfigurationError::InvalidProvider {
                reference: reference.clone(),
                reason: format!("{field}: id_short and argument_name must not be empty"),
            });
        }
        if !seen.insert(key(entry)) {
            return Err(ConfigurationError::InvalidProvider {
                reference: reference.clone(),
                reason: format!("{field}: '{}' is mapped more than once", key(entry)),
            });
        }
    }
    Ok(())
}
