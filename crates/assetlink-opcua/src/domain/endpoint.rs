//! Where to connect and who to connect as.
//!
//! An OPC UA server publishes one endpoint per combination of URL, security
//! policy and message security mode.  [`Endpoint`] names exactly one of them;
//! a connector that finds no matching endpoint on the server fails instead of
//! falling back to a weaker one.

use std::fmt;
use std::path::PathBuf;

use assetlink_core::ConfigurationError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Default OPC UA TCP port.
pub const DEFAULT_PORT: u16 = 4840;

/// Algorithm suite of the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    #[serde(rename = "Aes128_Sha256_RsaOaep")]
    Aes128Sha256RsaOaep,
    #[serde(rename = "Aes256_Sha256_RsaPss")]
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    pub fn name(self) -> &'static str {
        match self {
            SecurityPolicy::None => "None",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::Basic256 => "Basic256",
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
            SecurityPolicy::Aes128Sha256RsaOaep => "Aes128_Sha256_RsaOaep",
            SecurityPolicy::Aes256Sha256RsaPss => "Aes256_Sha256_RsaPss",
        }
    }

    /// Policy URI as advertised in endpoint descriptions.
    pub fn uri(self) -> String {
        format!("http://opcfoundation.org/UA/SecurityPolicy#{}", self.name())
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protection applied to each message on the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageSecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageSecurityMode::None => "None",
            MessageSecurityMode::Sign => "Sign",
            MessageSecurityMode::SignAndEncrypt => "SignAndEncrypt",
        })
    }
}

/// Kind of user identity token presented when activating a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserTokenType {
    Anonymous,
    UserName,
    Certificate,
    IssuedToken,
}

/// A validated `opc.tcp://host[:port][/path]` endpoint URL plus the
/// security it is reached with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    security_policy: SecurityPolicy,
    security_mode: MessageSecurityMode,
}

impl Endpoint {
    /// Parses the URL.  Security starts out as `None`/`None`.
    pub fn parse(text: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidEndpoint {
            endpoint: text.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(text.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "opc.tcp" {
            return Err(invalid("scheme must be 'opc.tcp'"));
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(invalid("missing host")),
        }
        Ok(Self {
            url,
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
        })
    }

    /// Selects the secured endpoint.  A policy of `None` only goes with a
    /// mode of `None`, and the other way round.
    pub fn with_security(
        mut self,
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
    ) -> Result<Self, ConfigurationError> {
        if (policy == SecurityPolicy::None) != (mode == MessageSecurityMode::None) {
            return Err(ConfigurationError::InvalidEndpoint {
                endpoint: self.url.to_string(),
                reason: format!("security policy {policy} cannot be used with security mode {mode}"),
            });
        }
        self.security_policy = policy;
        self.security_mode = mode;
        Ok(self)
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_PORT)
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())?;
        if self.security_policy != SecurityPolicy::None {
            write!(f, " [{}, {}]", self.security_policy, self.security_mode)?;
        }
        Ok(())
    }
}

/// How the client identifies itself to the server.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    UserName {
        username: String,
        password: String,
    },
    /// X.509 user certificate (DER) and its private key (PEM).
    Certificate {
        certificate: PathBuf,
        private_key: PathBuf,
    },
}

impl Identity {
    pub fn token_type(&self) -> UserTokenType {
        match self {
            Identity::Anonymous => UserTokenType::Anonymous,
            Identity::UserName { .. } => UserTokenType::UserName,
            Identity::Certificate { .. } => UserTokenType::Certificate,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => f.write_str("Anonymous"),
            Identity::UserName { username, .. } => f
                .debug_struct("UserName")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Identity::Certificate { certificate, .. } => f
                .debug_struct("Certificate")
                .field("certificate", certificate)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_validation() {
        let ep = Endpoint::parse("opc.tcp://plc.local:4841/ua").unwrap();
        assert_eq!(ep.host(), "plc.local");
        assert_eq!(ep.port(), 4841);
        assert_eq!(Endpoint::parse("opc.tcp://plc.local").unwrap().port(), DEFAULT_PORT);

        assert!(matches!(
            Endpoint::parse("http://plc.local"),
            Err(ConfigurationError::InvalidEndpoint { .. })
        ));
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_security_policy_and_mode_must_agree() {
        // Arrange
        let plain = Endpoint::parse("opc.tcp://plc.local").unwrap();

        // Act
        let secured = plain
            .clone()
            .with_security(SecurityPolicy::Basic256Sha256, MessageSecurityMode::SignAndEncrypt)
            .unwrap();

        // Assert
        assert_eq!(secured.security_policy(), SecurityPolicy::Basic256Sha256);
        assert!(secured.to_string().contains("Basic256Sha256, SignAndEncrypt"));
        assert_eq!(plain.to_string(), "opc.tcp://plc.local");
        assert!(plain
            .clone()
            .with_security(SecurityPolicy::None, MessageSecurityMode::Sign)
            .is_err());
        assert!(plain
            .with_security(SecurityPolicy::Basic256, MessageSecurityMode::None)
            .is_err());
    }

    #[test]
    fn test_policy_uri_uses_advertised_name() {
        assert_eq!(
            SecurityPolicy::Aes128Sha256RsaOaep.uri(),
            "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
        );
    }

    #[test]
    fn test_identity_debug_hides_secrets() {
        let id = Identity::UserName {
            username: "operator".into(),
            password: "secret".into(),
        };
        let text = format!("{id:?}");
        assert!(text.contains("operator"));
        assert!(!text.contains("secret"));

        let cert = Identity::Certificate {
            certificate: "user.der".into(),
            private_key: "user-key.pem".into(),
        };
        assert!(!format!("{cert:?}").contains("user-key.pem"));
        assert_eq!(cert.token_type(), UserTokenType::Certificate);
    }
}
