//! Kubeconfig parsing and endpoint rewriting
//!
//! k3s seeds its kubeconfig with exactly one cluster, user and context, each
//! named `default`, pointing at the loopback address. [`ClusterAuth`] pulls
//! the credentials out of that document and lets the endpoint host be
//! rewritten to an externally reachable address. The rest of the document is
//! kept as-is so serialization round-trips.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use url::Url;

use crate::error::{K3sError, K3sResult};
use crate::paths::API_PORT;

const DEFAULT_ENTRY: &str = "default";
const WHAT: &str = "kubeconfig";

/// Credentials and endpoint of the `default` cluster in a kubeconfig.
///
/// Certificate and key fields are already base64 decoded (PEM text).
#[derive(Clone, Serialize, PartialEq)]
pub struct ClusterAuth {
    pub certificate_authority_data: String,
    pub client_certificate_data: String,
    pub client_key_data: String,
    pub server: String,
    #[serde(skip)]
    document: Value,
}

impl std::fmt::Debug for ClusterAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAuth")
            .field("server", &self.server)
            .field("client_key_data", &"***")
            .finish()
    }
}

impl ClusterAuth {
    pub fn parse(kubeconfig: &str) -> K3sResult<Self> {
        let document: Value =
            serde_yaml::from_str(kubeconfig).map_err(|e| K3sError::parse(WHAT, e))?;

        let cluster = default_entry(&document, "clusters", "cluster")?;
        let user = default_entry(&document, "users", "user")?;

        Ok(Self {
            certificate_authority_data: decoded_field(cluster, "certificate-authority-data")?,
            client_certificate_data: decoded_field(user, "client-certificate-data")?,
            client_key_data: decoded_field(user, "client-key-data")?,
            server: string_field(cluster, "server")?.to_string(),
            document,
        })
    }

    /// Point the default cluster at `host`, keeping scheme and API port.
    pub fn update_host(&mut self, host: &str) -> K3sResult<()> {
        let server = rewrite_host(&self.server, host)?;
        default_entry_mut(&mut self.document, "clusters", "cluster")?
            .insert(Value::from("server"), Value::from(server.clone()));
        self.server = server;
        Ok(())
    }

    /// Serialize the (possibly rewritten) document.
    pub fn to_kubeconfig(&self) -> K3sResult<String> {
        Ok(serde_yaml::to_string(&self.document)?)
    }
}

fn rewrite_host(current: &str, host: &str) -> K3sResult<String> {
    let parsed = Url::parse(current).map_err(|e| K3sError::parse("kubeconfig server", e))?;
    let port = parsed.port().unwrap_or(API_PORT);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    Ok(format!("{}://{}:{}", parsed.scheme(), host, port))
}

fn missing(details: impl Into<String>) -> K3sError {
    K3sError::parse(WHAT, details.into())
}

fn find_default<'a>(document: &'a Value, list: &str) -> K3sResult<&'a Value> {
    document
        .get(list)
        .and_then(Value::as_sequence)
        .ok_or_else(|| missing(format!("no '{}' list", list)))?
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(DEFAULT_ENTRY))
        .ok_or_else(|| missing(format!("no '{}' entry in '{}'", DEFAULT_ENTRY, list)))
}

fn default_entry<'a>(document: &'a Value, list: &str, body: &str) -> K3sResult<&'a Mapping> {
    find_default(document, list)?
        .get(body)
        .and_then(Value::as_mapping)
        .ok_or_else(|| missing(format!("'{}' entry in '{}' has no {}", DEFAULT_ENTRY, list, body)))
}

fn default_entry_mut<'a>(
    document: &'a mut Value,
    list: &str,
    body: &str,
) -> K3sResult<&'a mut Mapping> {
    document
        .get_mut(list)
        .and_then(Value::as_sequence_mut)
        .and_then(|entries| {
            entries
                .iter_mut()
                .find(|entry| entry.get("name").and_then(Value::as_str) == Some(DEFAULT_ENTRY))
        })
        .and_then(|entry| entry.get_mut(body))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| missing(format!("no '{}' {}", DEFAULT_ENTRY, body)))
}

fn string_field<'a>(entry: &'a Mapping, key: &str) -> K3sResult<&'a str> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(format!("missing '{}'", key)))
}

fn decoded_field(entry: &Mapping, key: &str) -> K3sResult<String> {
    let raw = STANDARD
        .decode(string_field(entry, key)?.trim())
        .map_err(|e| missing(format!("'{}' is not base64: {}", key, e)))?;
    String::from_utf8(raw).map_err(|e| missing(format!("'{}' is not UTF-8: {}", key, e)))
}
