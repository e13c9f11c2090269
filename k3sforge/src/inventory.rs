//! HA inventory files
//!
//! An inventory describes a control plane in TOML: cluster-wide defaults, an
//! optional OIDC issuer, and one `[[nodes]]` table per server. The first node
//! initializes the cluster. Relative file paths are resolved against the
//! inventory's own directory.
//!
//! ```toml
//! [cluster]
//! user = "ubuntu"
//! private_key_file = "id_ed25519"
//! config_files = ["config.yaml"]
//!
//! [[nodes]]
//! host = "10.0.0.1"
//! tls_san = "k3s.example.com"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use k3sforge_core::error::{K3sError, K3sResult};
use k3sforge_core::{EngineConfig, NodeAuth};
use k3sforge_node::{HaNode, HaSession, OidcConfig};

use crate::args::{read_text, read_yaml_layers};

/// Smallest control plane that tolerates a node failure
pub const MIN_HA_NODES: usize = 3;

const DEFAULT_USER: &str = "root";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Inventory {
    pub cluster: ClusterDefaults,
    pub oidc: Option<OidcFiles>,
    pub nodes: Vec<InventoryNode>,

    #[serde(skip)]
    base_dir: PathBuf,
}

/// Values every node inherits unless it sets its own
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterDefaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub private_key_file: Option<PathBuf>,
    pub password: Option<String>,
    pub bin_dir: Option<String>,
    pub version: Option<String>,
    pub config_files: Vec<PathBuf>,
    pub registry_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryNode {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub private_key_file: Option<PathBuf>,
    pub password: Option<String>,
    pub bin_dir: Option<String>,
    pub tls_san: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcFiles {
    pub issuer: String,
    pub audience: String,
    pub signing_key_file: PathBuf,
    pub public_key_file: PathBuf,
}

impl Inventory {
    pub fn from_file<P: AsRef<Path>>(path: P) -> K3sResult<Self> {
        let path = path.as_ref();
        let contents = read_text(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::from_toml(&contents, base_dir)
    }

    pub fn from_toml(contents: &str, base_dir: impl Into<PathBuf>) -> K3sResult<Self> {
        let mut inventory: Self = toml::from_str(contents)
            .map_err(|e| K3sError::ConfigError(format!("Failed to parse inventory: {}", e)))?;
        inventory.base_dir = base_dir.into();
        Ok(inventory)
    }

    /// Check the node set without touching the filesystem.
    pub fn validate(&self) -> K3sResult<()> {
        let count = self.nodes.len();
        if count < MIN_HA_NODES || count % 2 == 0 {
            return Err(K3sError::InvalidInput {
                field: "nodes".to_string(),
                message: format!(
                    "an HA control plane needs an odd number of at least {} nodes, got {}",
                    MIN_HA_NODES, count
                ),
            });
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if node.host.trim().is_empty() {
                return Err(K3sError::InvalidInput {
                    field: format!("nodes[{}].host", index),
                    message: "host must not be empty".to_string(),
                });
            }
            let (key, password) = self.credential_source(node);
            if key.is_none() && password.is_none() {
                return Err(K3sError::InvalidCredential {
                    message: format!(
                        "no password or private key for {} and no cluster default",
                        node.host
                    ),
                });
            }
        }

        let mut hosts: Vec<&str> = self.nodes.iter().map(|n| n.host.as_str()).collect();
        hosts.sort_unstable();
        if let Some(pair) = hosts.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(K3sError::InvalidInput {
                field: "nodes".to_string(),
                message: format!("host {} is listed twice", pair[0]),
            });
        }
        Ok(())
    }

    /// A node's own credentials when it sets any, the cluster's otherwise.
    /// Credentials are never mixed across the two levels.
    fn credential_source<'a>(&'a self, node: &'a InventoryNode) -> (Option<&'a PathBuf>, Option<&'a String>) {
        if node.private_key_file.is_some() || node.password.is_some() {
            (node.private_key_file.as_ref(), node.password.as_ref())
        } else {
            (
                self.cluster.private_key_file.as_ref(),
                self.cluster.password.as_ref(),
            )
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn resolve_all(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn node_auth(&self, node: &InventoryNode, engine: &EngineConfig) -> K3sResult<NodeAuth> {
        let (key_file, password) = self.credential_source(node);
        let auth = NodeAuth {
            host: node.host.clone(),
            port: node.port.or(self.cluster.port).unwrap_or(engine.ssh.port),
            user: node
                .user
                .clone()
                .or_else(|| self.cluster.user.clone())
                .unwrap_or_else(|| DEFAULT_USER.to_string()),
            private_key: key_file.map(|f| read_text(&self.resolve(f))).transpose()?,
            password: password.cloned(),
        };
        auth.validate()?;
        Ok(auth)
    }

    fn oidc_config(&self) -> K3sResult<Option<OidcConfig>> {
        let Some(files) = &self.oidc else {
            return Ok(None);
        };
        let oidc = OidcConfig {
            audience: files.audience.clone(),
            issuer: files.issuer.clone(),
            signing_key: read_text(&self.resolve(&files.signing_key_file))?,
            public_key: read_text(&self.resolve(&files.public_key_file))?,
        };
        oidc.validate()?;
        Ok(Some(oidc))
    }

    /// Validate, read every referenced file, and build the bootstrap session.
    pub fn session(&self, engine: &EngineConfig) -> K3sResult<HaSession> {
        self.validate()?;

        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                Ok(HaNode {
                    auth: self.node_auth(node, engine)?,
                    bin_dir: node.bin_dir.clone(),
                    tls_san: node.tls_san.clone(),
                })
            })
            .collect::<K3sResult<Vec<_>>>()?;

        Ok(HaSession {
            nodes,
            config: read_yaml_layers("config.yaml", &self.resolve_all(&self.cluster.config_files))?,
            registry: read_yaml_layers(
                "registries.yaml",
                &self.resolve_all(&self.cluster.registry_files),
            )?,
            bin_dir: self
                .cluster
                .bin_dir
                .clone()
                .unwrap_or_else(|| engine.paths.bin_dir.clone()),
            version: self.cluster.version.clone(),
            oidc: self.oidc_config()?,
            journal_lines: engine.diagnostics.journal_lines,
        })
    }
}
