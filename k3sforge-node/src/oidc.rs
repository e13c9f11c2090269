//! Service-account OIDC issuer support for servers
//!
//! Writes the service-account signing key pair onto the node and points the
//! API server at it so workloads receive tokens an external OIDC consumer can
//! verify. The resulting JWKS document is read back from the live server.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::debug;

use k3sforge_core::error::{K3sError, K3sResult};
use k3sforge_core::paths::{self, shell_quote};
use k3sforge_core::transport::RemoteShell;

const APISERVER_ARG_KEY: &str = "kube-apiserver-arg";

pub fn oidc_dir() -> String {
    format!("{}/oidc", paths::CONFIG_DIR)
}

pub fn signing_key_file() -> String {
    format!("{}/sa-signer.key", oidc_dir())
}

pub fn public_key_file() -> String {
    format!("{}/sa-signer.pub", oidc_dir())
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OidcConfig {
    pub audience: String,
    /// Issuer URL placed in service-account tokens
    pub issuer: String,
    /// PEM private key used to sign service-account tokens
    pub signing_key: String,
    /// PKCS#8 PEM public key matching `signing_key`
    pub public_key: String,
}

impl std::fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcConfig")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl OidcConfig {
    pub fn validate(&self) -> K3sResult<()> {
        for (field, value) in [
            ("audience", &self.audience),
            ("issuer", &self.issuer),
            ("signing_key", &self.signing_key),
            ("public_key", &self.public_key),
        ] {
            if value.trim().is_empty() {
                return Err(K3sError::InvalidInput {
                    field: format!("oidc.{}", field),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    fn apiserver_args(&self) -> Vec<String> {
        vec![
            format!("service-account-issuer={}", self.issuer),
            format!("service-account-key-file={}", public_key_file()),
            format!("service-account-signing-key-file={}", signing_key_file()),
            format!("api-audiences={}", self.audience),
        ]
    }

    /// Add the API server flags to `config`, replacing earlier values of the
    /// same flags and keeping unrelated ones.
    pub fn apply(&self, config: &mut Mapping) {
        let ours = self.apiserver_args();
        let flag = |arg: &str| arg.split('=').next().unwrap_or_default().to_string();
        let owned: Vec<String> = ours.iter().map(|a| flag(a)).collect();

        let existing: Vec<Value> = match config.get(APISERVER_ARG_KEY) {
            Some(Value::Sequence(args)) => args.clone(),
            Some(Value::String(arg)) => vec![Value::from(arg.as_str())],
            _ => Vec::new(),
        };

        let mut args: Vec<Value> = existing
            .into_iter()
            .filter(|arg| {
                arg.as_str()
                    .map(|a| !owned.contains(&flag(a)))
                    .unwrap_or(true)
            })
            .collect();
        args.extend(ours.into_iter().map(Value::from));

        config.insert(Value::from(APISERVER_ARG_KEY), Value::Sequence(args));
    }

    /// Key material to write onto the node
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (signing_key_file(), self.signing_key.clone().into_bytes()),
            (public_key_file(), self.public_key.clone().into_bytes()),
        ])
    }
}

/// Fetch the cluster's JWKS document through the node-local kubectl.
pub async fn fetch_jwks(shell: &dyn RemoteShell, bin_dir: &str) -> K3sResult<String> {
    let kubectl = format!("{}/k3s", bin_dir.trim_end_matches('/'));
    let raw = shell
        .run_combined(&format!(
            "sudo {} kubectl get --raw /openid/v1/jwks",
            shell_quote(&kubectl)
        ))
        .await?;

    let document: serde_json::Value =
        serde_json::from_str(raw.trim()).map_err(|e| K3sError::parse("jwks", e))?;
    if !document.get("keys").map(|k| k.is_array()).unwrap_or(false) {
        return Err(K3sError::parse("jwks", "document has no 'keys' array"));
    }
    debug!("Fetched JWKS from {}", shell.host());
    Ok(raw.trim().to_string())
}
