use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_SSH_PORT;
use crate::error::{K3sError, K3sResult};

/// The secret used to authenticate an SSH session. Exactly one is ever used.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// OpenSSH or PEM encoded private key material
    PrivateKey(String),
    Password(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::PrivateKey(_) => write!(f, "PrivateKey(***)"),
            Credential::Password(_) => write!(f, "Password(***)"),
        }
    }
}

/// Connection descriptor for one target node.
///
/// Built fresh for every operation and never persisted by the engine.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAuth {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl std::fmt::Debug for NodeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAuth")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl NodeAuth {
    pub fn with_private_key(host: impl Into<String>, user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            private_key: Some(key.into()),
            password: None,
        }
    }

    pub fn with_password(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            private_key: None,
            password: Some(password.into()),
        }
    }

    /// Check the descriptor is usable: a host, and exactly one credential.
    pub fn validate(&self) -> K3sResult<()> {
        if self.host.trim().is_empty() {
            return Err(K3sError::InvalidInput {
                field: "host".to_string(),
                message: "host must not be empty".to_string(),
            });
        }
        match (&self.private_key, &self.password) {
            (None, None) => Err(K3sError::InvalidCredential {
                message: format!("neither password nor private key was passed for {}", self.host),
            }),
            (Some(_), Some(_)) => Err(K3sError::InvalidCredential {
                message: format!(
                    "both password and private key were passed for {}, only pass one",
                    self.host
                ),
            }),
            _ => Ok(()),
        }
    }

    pub fn credential(&self) -> K3sResult<Credential> {
        self.validate()?;
        if let Some(key) = &self.private_key {
            return Ok(Credential::PrivateKey(key.clone()));
        }
        self.password
            .clone()
            .map(Credential::Password)
            .ok_or_else(|| K3sError::InvalidCredential {
                message: format!("no credential for {}", self.host),
            })
    }

    /// `host:port` for diagnostics.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_credential() {
        let mut auth = NodeAuth::with_password("10.0.0.1", "ubuntu", "secret");
        assert_eq!(auth.credential().unwrap(), Credential::Password("secret".to_string()));

        auth.private_key = Some("key".to_string());
        let err = auth.validate().unwrap_err();
        assert!(err.to_string().contains("only pass one"));

        auth.private_key = None;
        auth.password = None;
        let err = auth.validate().unwrap_err();
        assert!(err.to_string().contains("neither password nor private key"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let auth = NodeAuth::with_private_key("10.0.0.1", "ubuntu", "-----BEGIN KEY-----");
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("BEGIN"));
        assert!(printed.contains("10.0.0.1"));
    }

    #[test]
    fn test_port_defaults_when_missing() {
        let auth: NodeAuth = toml::from_str(
            r#"
host = "node-1"
user = "root"
password = "pw"
"#,
        )
        .unwrap();
        assert_eq!(auth.port, 22);
        assert_eq!(auth.address(), "node-1:22");
    }
}
