//! Command-line argument groups shared by the server and agent commands

use clap::Args;
use serde_yaml::Mapping;
use std::fs;
use std::path::{Path, PathBuf};

use k3sforge_core::error::{K3sError, K3sResult};
use k3sforge_core::yaml_merge::merge_documents;
use k3sforge_core::{EngineConfig, NodeAuth};
use k3sforge_node::component::Assets;
use k3sforge_node::{Agent, ComponentConfig, HaJoin, OidcConfig, Server};

/// How to reach a single node
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Address of the node
    #[arg(long)]
    pub host: String,

    /// SSH port (defaults to the engine config)
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value = "root")]
    pub user: String,

    /// PEM private key used for authentication
    #[arg(long, env = "K3SFORGE_SSH_KEY_FILE")]
    pub private_key_file: Option<PathBuf>,

    #[arg(long, env = "K3SFORGE_SSH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl ConnectionArgs {
    pub fn node_auth(&self, engine: &EngineConfig) -> K3sResult<NodeAuth> {
        let auth = NodeAuth {
            host: self.host.clone(),
            port: self.port.unwrap_or(engine.ssh.port),
            user: self.user.clone(),
            private_key: self.private_key_file.as_deref().map(read_text).transpose()?,
            password: self.password.clone(),
        };
        auth.validate()?;
        Ok(auth)
    }
}

/// Settings common to servers and agents
#[derive(Debug, Clone, Default, Args)]
pub struct ComponentArgs {
    /// config.yaml layer; repeat to merge several, later files win
    #[arg(long = "config", value_name = "FILE")]
    pub config_files: Vec<PathBuf>,

    /// registries.yaml layer; repeat to merge several, later files win
    #[arg(long = "registry", value_name = "FILE")]
    pub registry_files: Vec<PathBuf>,

    /// Directory holding the k3s binary and scripts (defaults to the engine config)
    #[arg(long)]
    pub bin_dir: Option<String>,

    /// k3s release to install, e.g. v1.31.2+k3s1
    #[arg(long = "k3s-version")]
    pub k3s_version: Option<String>,
}

impl ComponentArgs {
    pub fn component_config(&self, engine: &EngineConfig) -> K3sResult<ComponentConfig> {
        let config = read_yaml_layers("config.yaml", &self.config_files)?;
        let registry = read_yaml_layers("registries.yaml", &self.registry_files)?;
        Ok(ComponentConfig::new(config, registry)
            .with_bin_dir(
                self.bin_dir
                    .clone()
                    .unwrap_or_else(|| engine.paths.bin_dir.clone()),
            )
            .with_version(self.k3s_version.clone())
            .with_journal_lines(engine.diagnostics.journal_lines))
    }
}

/// Service-account issuer settings; all four or none
#[derive(Debug, Clone, Default, Args)]
pub struct OidcArgs {
    #[arg(long, requires_all = ["oidc_audience", "oidc_signing_key_file", "oidc_public_key_file"])]
    pub oidc_issuer: Option<String>,

    #[arg(long, requires = "oidc_issuer")]
    pub oidc_audience: Option<String>,

    #[arg(long, requires = "oidc_issuer")]
    pub oidc_signing_key_file: Option<PathBuf>,

    #[arg(long, requires = "oidc_issuer")]
    pub oidc_public_key_file: Option<PathBuf>,
}

impl OidcArgs {
    pub fn oidc_config(&self) -> K3sResult<Option<OidcConfig>> {
        let (Some(issuer), Some(audience), Some(signing_key), Some(public_key)) = (
            &self.oidc_issuer,
            &self.oidc_audience,
            &self.oidc_signing_key_file,
            &self.oidc_public_key_file,
        ) else {
            return Ok(None);
        };
        let oidc = OidcConfig {
            audience: audience.clone(),
            issuer: issuer.clone(),
            signing_key: read_text(signing_key)?,
            public_key: read_text(public_key)?,
        };
        oidc.validate()?;
        Ok(Some(oidc))
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub component: ComponentArgs,

    /// Start a new embedded-etcd cluster on this node
    #[arg(long, conflicts_with = "join_server")]
    pub cluster_init: bool,

    /// API URL of an existing server to join
    #[arg(long, requires = "join_token")]
    pub join_server: Option<String>,

    #[arg(long, env = "K3SFORGE_JOIN_TOKEN", hide_env_values = true)]
    pub join_token: Option<String>,

    #[command(flatten)]
    pub oidc: OidcArgs,
}

impl ServerArgs {
    pub fn server(&self, engine: &EngineConfig, assets: Assets) -> K3sResult<Server> {
        let mut server = Server::new(self.component.component_config(engine)?, assets);
        if self.cluster_init {
            server = server.with_cluster_init();
        }
        if let (Some(url), Some(token)) = (&self.join_server, &self.join_token) {
            server = server.with_ha_join(HaJoin {
                server: url.clone(),
                token: token.clone(),
            });
        }
        if let Some(oidc) = self.oidc.oidc_config()? {
            server = server.with_oidc(oidc);
        }
        Ok(server)
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct AgentArgs {
    #[command(flatten)]
    pub component: ComponentArgs,

    /// API URL of the server to join, e.g. https://10.0.0.1:6443
    #[arg(long)]
    pub server: Option<String>,

    #[arg(long, env = "K3SFORGE_AGENT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl AgentArgs {
    /// Build the agent. With `require_join`, a missing server URL or token is
    /// an input error; otherwise they are filled in by a later resync.
    pub fn agent(&self, engine: &EngineConfig, assets: Assets, require_join: bool) -> K3sResult<Agent> {
        let server = self.server.clone().unwrap_or_default();
        let token = self.token.clone().unwrap_or_default();
        if require_join {
            for (field, value) in [("server", &server), ("token", &token)] {
                if value.trim().is_empty() {
                    return Err(K3sError::InvalidInput {
                        field: field.to_string(),
                        message: "required to join an agent".to_string(),
                    });
                }
            }
        }
        Ok(Agent::new(
            self.component.component_config(engine)?,
            assets,
            server,
            token,
        ))
    }
}

pub(crate) fn read_text(path: &Path) -> K3sResult<String> {
    fs::read_to_string(path).map_err(|e| {
        K3sError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })
}

/// Read YAML files and deep-merge them in order.
pub fn read_yaml_layers(what: &str, files: &[PathBuf]) -> K3sResult<Mapping> {
    let documents = files
        .iter()
        .map(|file| read_text(file))
        .collect::<K3sResult<Vec<String>>>()?;
    let documents: Vec<&str> = documents.iter().map(String::as_str).collect();
    merge_documents(what, &documents)
}
