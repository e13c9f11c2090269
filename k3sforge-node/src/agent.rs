//! k3s agent (worker) component

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use k3sforge_core::error::{K3sError, K3sResult};
use k3sforge_core::paths;
use k3sforge_core::transport::RemoteShell;

use crate::component::{
    parse_env_file, read_config_files, require_env, run_install, run_uninstall_script,
    write_config_files, write_node_files, Assets, Component, ComponentConfig, Role,
    UninstallOptions,
};
use crate::node_remover::{KubeNodeRemover, NodeIdentity, NodeRemover};
use crate::systemd;

pub struct Agent {
    attrs: ComponentConfig,
    assets: Assets,
    token: String,
    server: String,
    remover: Arc<dyn NodeRemover>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("attrs", &self.attrs)
            .field("server", &self.server)
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// `server` is the API URL to join, `token` the cluster join token.
    pub fn new(
        attrs: ComponentConfig,
        assets: Assets,
        server: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            attrs,
            assets,
            token: token.into(),
            server: server.into(),
            remover: Arc::new(KubeNodeRemover),
        }
    }

    pub fn with_node_remover(mut self, remover: Arc<dyn NodeRemover>) -> Self {
        self.remover = remover;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn identity(&self, shell: &dyn RemoteShell) -> NodeIdentity {
        let hostname = match shell.run_combined("hostname").await {
            Ok(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not read hostname of {}: {}", shell.host(), e);
                None
            }
        };
        NodeIdentity {
            address: shell.host().to_string(),
            hostname,
        }
    }

    async fn remove_from_cluster(&self, shell: &dyn RemoteShell, kubeconfig: Option<&str>) -> K3sResult<()> {
        let kubeconfig = kubeconfig
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| K3sError::NodeRemoval {
                host: shell.host().to_string(),
                details: "no kubeconfig provided".to_string(),
            })?;
        let identity = self.identity(shell).await;
        self.remover.remove(kubeconfig, &identity).await.map(|_| ())
    }
}

#[async_trait]
impl Component for Agent {
    fn role(&self) -> Role {
        Role::Agent
    }

    fn attrs(&self) -> &ComponentConfig {
        &self.attrs
    }

    async fn preinstall(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        write_node_files(shell, &self.attrs, &self.attrs.config, self.assets.as_ref()).await
    }

    async fn install(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        run_install(shell, Role::Agent, &self.attrs, Some((self.server.as_str(), self.token.as_str()))).await?;
        info!("k3s agent installed on {}", shell.host());
        Ok(())
    }

    async fn update(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        shell.wait_until_reachable().await?;
        write_config_files(shell, &self.attrs.config, None).await?;
        systemd::restart_or_diagnose(shell, Role::Agent.unit(), self.attrs.journal_lines).await
    }

    async fn uninstall(&self, shell: &dyn RemoteShell, options: &UninstallOptions) -> K3sResult<()> {
        if let Err(e) = self
            .remove_from_cluster(shell, options.kubeconfig.as_deref())
            .await
        {
            if !options.allow_node_delete_err {
                return Err(e);
            }
            warn!("Continuing uninstall of {} after node removal failed: {}", shell.host(), e);
        }
        run_uninstall_script(shell, Role::Agent, &self.attrs.bin_dir).await
    }

    async fn resync(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        let (config, registry) = read_config_files(shell).await?;

        let env_path = paths::unit_env_file(Role::Agent.unit());
        let env = parse_env_file(&shell.read_remote_file(&env_path, true, true).await?);
        let token = require_env(&env, "K3S_TOKEN", &env_path)?;
        let server = require_env(&env, "K3S_URL", &env_path)?;

        self.attrs.config = config;
        self.attrs.registry = registry;
        self.token = token;
        self.server = server;
        Ok(())
    }
}
