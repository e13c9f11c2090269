//! End-to-end flows built from component lifecycle steps
//!
//! These are what a caller (the CLI, an HA coordinator) runs: create is
//! preinstall + install + status, read is resync + status, update skips all
//! remote work when nothing changed.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use k3sforge_core::cluster_auth::ClusterAuth;
use k3sforge_core::error::K3sResult;
use k3sforge_core::paths;
use k3sforge_core::transport::RemoteShell;

use crate::agent::Agent;
use crate::component::{read_config_files, Component, Role};
use crate::server::Server;
use crate::systemd::NodeStatus;

#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub id: String,
    /// Externally reachable API URL
    pub server: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    pub token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_auth: Option<ClusterAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<String>,
}

impl ServerReport {
    pub fn new(host: &str, server: &Server, status: NodeStatus) -> K3sResult<Self> {
        let cluster_auth = if server.kubeconfig().is_empty() {
            None
        } else {
            Some(server.cluster_auth()?)
        };
        Ok(Self {
            id: Role::Server.id(host),
            server: cluster_auth
                .as_ref()
                .map(|auth| auth.server.clone())
                .unwrap_or_else(|| paths::api_url(host)),
            active: status.active,
            diagnostics: status.diagnostics,
            token: server.token().to_string(),
            kubeconfig: server.kubeconfig().to_string(),
            cluster_auth,
            jwks: server.jwks().map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub id: String,
    /// API URL the agent joined
    pub server: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    pub token: String,
}

impl AgentReport {
    pub fn new(host: &str, agent: &Agent, status: NodeStatus) -> Self {
        Self {
            id: Role::Agent.id(host),
            server: agent.server().to_string(),
            active: status.active,
            diagnostics: status.diagnostics,
            token: agent.token().to_string(),
        }
    }
}

/// Result of an update request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum UpdateOutcome {
    /// Remote config already matched; nothing was touched
    Unchanged,
    Applied { status: NodeStatus },
}

/// Preinstall and install a server, then report its health.
pub async fn create_server(shell: &dyn RemoteShell, server: &mut Server) -> K3sResult<ServerReport> {
    server.preinstall(shell).await?;
    server.install(shell).await?;
    let status = server.status(shell).await?;
    if status.active {
        server.refresh_jwks(shell).await?;
    }
    ServerReport::new(shell.host(), server, status)
}

pub async fn read_server(shell: &dyn RemoteShell, server: &mut Server) -> K3sResult<ServerReport> {
    server.resync(shell).await?;
    let status = server.status(shell).await?;
    if status.active {
        server.refresh_jwks(shell).await?;
    }
    ServerReport::new(shell.host(), server, status)
}

/// Apply new config, registry or OIDC material to a running server.
pub async fn update_server(shell: &dyn RemoteShell, server: &mut Server) -> K3sResult<UpdateOutcome> {
    let (config, registry) = read_config_files(shell).await?;
    let unchanged = config == server.rendered_config()
        && registry == server.attrs().registry
        && remote_files_match(shell, &server.attrs().extra_files).await?;
    if unchanged {
        info!("Server on {} already up to date", shell.host());
        return Ok(UpdateOutcome::Unchanged);
    }

    server.preinstall(shell).await?;
    server.update(shell).await?;
    let status = server.status(shell).await?;
    if status.active {
        server.refresh_jwks(shell).await?;
    }
    Ok(UpdateOutcome::Applied { status })
}

pub async fn create_agent(shell: &dyn RemoteShell, agent: &mut Agent) -> K3sResult<AgentReport> {
    agent.preinstall(shell).await?;
    agent.install(shell).await?;
    let status = agent.status(shell).await?;
    Ok(AgentReport::new(shell.host(), agent, status))
}

pub async fn read_agent(shell: &dyn RemoteShell, agent: &mut Agent) -> K3sResult<AgentReport> {
    agent.resync(shell).await?;
    let status = agent.status(shell).await?;
    Ok(AgentReport::new(shell.host(), agent, status))
}

/// Apply new config or registry to a running agent.
pub async fn update_agent(shell: &dyn RemoteShell, agent: &mut Agent) -> K3sResult<UpdateOutcome> {
    let (config, registry) = read_config_files(shell).await?;
    if config == agent.attrs().config && registry == agent.attrs().registry {
        info!("Agent on {} already up to date", shell.host());
        return Ok(UpdateOutcome::Unchanged);
    }

    agent.preinstall(shell).await?;
    agent.update(shell).await?;
    let status = agent.status(shell).await?;
    Ok(UpdateOutcome::Applied { status })
}

/// Kubeconfig of a running server
#[derive(Debug, Clone, Serialize)]
pub struct KubeconfigReport {
    pub kubeconfig: String,
    pub cluster_auth: ClusterAuth,
}

/// Resync a server and return its kubeconfig, optionally pointed at
/// `hostname` instead of the SSH host. With `allow_empty`, a node that
/// cannot be resynced yields `None` instead of an error.
pub async fn read_kubeconfig(
    shell: &dyn RemoteShell,
    server: &mut Server,
    hostname: Option<&str>,
    allow_empty: bool,
) -> K3sResult<Option<KubeconfigReport>> {
    if let Err(e) = server.resync(shell).await {
        if allow_empty {
            info!("Allowing empty kubeconfig for {}: {}", shell.host(), e);
            return Ok(None);
        }
        return Err(e);
    }

    let mut cluster_auth = server.cluster_auth()?;
    if let Some(hostname) = hostname {
        cluster_auth.update_host(hostname)?;
    }
    Ok(Some(KubeconfigReport {
        kubeconfig: cluster_auth.to_kubeconfig()?,
        cluster_auth,
    }))
}

async fn remote_files_match(shell: &dyn RemoteShell, files: &BTreeMap<String, Vec<u8>>) -> K3sResult<bool> {
    for (path, content) in files {
        let remote = shell.read_remote_file(path, true, true).await?;
        if remote.as_bytes() != content.as_slice() {
            debug!("{} differs on {}", path, shell.host());
            return Ok(false);
        }
    }
    Ok(true)
}
