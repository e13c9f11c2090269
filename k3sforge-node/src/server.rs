//! k3s server (control-plane) component

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use k3sforge_core::cluster_auth::ClusterAuth;
use k3sforge_core::error::{K3sError, K3sResult};
use k3sforge_core::paths;
use k3sforge_core::transport::RemoteShell;

use crate::component::{
    self, parse_env_file, read_config_files, require_env, run_install, run_uninstall_script,
    write_config_files, write_node_files, Assets, Component, ComponentConfig, Role,
    UninstallOptions,
};
use crate::oidc::{self, OidcConfig};
use crate::systemd;

pub const CLUSTER_INIT_KEY: &str = "cluster-init";
pub const SERVER_KEY: &str = "server";
pub const TOKEN_KEY: &str = "token";

/// Where a joining server finds the existing control plane
#[derive(Clone, PartialEq, Eq)]
pub struct HaJoin {
    /// API URL of the initializing server
    pub server: String,
    pub token: String,
}

impl std::fmt::Debug for HaJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaJoin")
            .field("server", &self.server)
            .field("token", &"***")
            .finish()
    }
}

pub struct Server {
    attrs: ComponentConfig,
    assets: Assets,
    cluster_init: bool,
    join: Option<HaJoin>,
    oidc: Option<OidcConfig>,
    token: String,
    kubeconfig: String,
    jwks: Option<String>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("attrs", &self.attrs)
            .field("cluster_init", &self.cluster_init)
            .field("join", &self.join)
            .field("oidc", &self.oidc)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(attrs: ComponentConfig, assets: Assets) -> Self {
        Self {
            attrs,
            assets,
            cluster_init: false,
            join: None,
            oidc: None,
            token: String::new(),
            kubeconfig: String::new(),
            jwks: None,
        }
    }

    /// Bootstrap a new embedded-etcd cluster from this node.
    pub fn with_cluster_init(mut self) -> Self {
        self.cluster_init = true;
        self
    }

    /// Join an existing control plane instead of minting a new token.
    pub fn with_ha_join(mut self, join: HaJoin) -> Self {
        self.join = Some(join);
        self
    }

    pub fn with_oidc(mut self, oidc: OidcConfig) -> Self {
        self.attrs.extra_files.extend(oidc.files());
        self.oidc = Some(oidc);
        self
    }

    /// Join token issued by (or shared with) this server
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Kubeconfig with the endpoint rewritten to the node's SSH host
    pub fn kubeconfig(&self) -> &str {
        &self.kubeconfig
    }

    pub fn cluster_auth(&self) -> K3sResult<ClusterAuth> {
        ClusterAuth::parse(&self.kubeconfig)
    }

    pub fn is_cluster_init(&self) -> bool {
        self.cluster_init
    }

    pub fn ha_join(&self) -> Option<&HaJoin> {
        self.join.as_ref()
    }

    pub fn oidc(&self) -> Option<&OidcConfig> {
        self.oidc.as_ref()
    }

    pub fn jwks(&self) -> Option<&str> {
        self.jwks.as_deref()
    }

    /// The config.yaml actually written: caller config plus HA and OIDC keys.
    pub fn rendered_config(&self) -> Mapping {
        let mut config = self.attrs.config.clone();
        if self.cluster_init {
            config.insert(Value::from(CLUSTER_INIT_KEY), Value::Bool(true));
        }
        if let Some(join) = &self.join {
            config.insert(Value::from(SERVER_KEY), Value::from(join.server.as_str()));
            config.insert(Value::from(TOKEN_KEY), Value::from(join.token.as_str()));
        }
        if let Some(oidc) = &self.oidc {
            oidc.apply(&mut config);
        }
        config
    }

    /// Read the JWKS document from the running server.
    pub async fn refresh_jwks(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        if self.oidc.is_some() {
            self.jwks = Some(oidc::fetch_jwks(shell, &self.attrs.bin_dir).await?);
        }
        Ok(())
    }

    async fn harvest(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        let token_path = paths::server_token_file(&self.attrs.data_dir());
        let token = shell.read_remote_file(&token_path, false, true).await?;
        let token = token.trim();
        if token.is_empty() {
            return Err(K3sError::MissingSecret {
                key: "token".to_string(),
                path: token_path,
            });
        }
        self.token = token.to_string();
        self.kubeconfig = fetch_kubeconfig(shell).await?;
        debug!("Harvested token and kubeconfig from {}", shell.host());
        Ok(())
    }

    async fn resync_token(&self, shell: &dyn RemoteShell) -> K3sResult<String> {
        let token_path = paths::server_token_file(&self.attrs.data_dir());
        let token = shell.read_remote_file(&token_path, true, true).await?;
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }

        debug!("No token file on {}, falling back to unit environment", shell.host());
        let env_path = paths::unit_env_file(Role::Server.unit());
        let env = parse_env_file(&shell.read_remote_file(&env_path, true, true).await?);
        require_env(&env, "K3S_TOKEN", &env_path)
    }
}

/// Read the node's kubeconfig and point it at the SSH host.
async fn fetch_kubeconfig(shell: &dyn RemoteShell) -> K3sResult<String> {
    let raw = shell
        .read_remote_file(&paths::kubeconfig_file(), false, true)
        .await?;
    let mut auth = ClusterAuth::parse(&raw)?;
    auth.update_host(shell.host())?;
    auth.to_kubeconfig()
}

#[async_trait]
impl Component for Server {
    fn role(&self) -> Role {
        Role::Server
    }

    fn attrs(&self) -> &ComponentConfig {
        &self.attrs
    }

    async fn preinstall(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        let config = self.rendered_config();
        write_node_files(shell, &self.attrs, &config, self.assets.as_ref()).await
    }

    async fn install(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        run_install(shell, Role::Server, &self.attrs, None).await?;

        match &self.join {
            None => self.harvest(shell).await?,
            Some(join) => self.token = join.token.clone(),
        }
        info!("k3s server installed on {}", shell.host());
        Ok(())
    }

    async fn update(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        shell.wait_until_reachable().await?;
        write_config_files(shell, &self.rendered_config(), Some(&self.attrs.registry)).await?;
        k3sforge_core::file_sync::sync_files(shell, &self.attrs.extra_files).await?;
        systemd::restart_or_diagnose(shell, Role::Server.unit(), self.attrs.journal_lines).await
    }

    async fn uninstall(&self, shell: &dyn RemoteShell, _options: &UninstallOptions) -> K3sResult<()> {
        // Control-plane members are not drained from the cluster here; doing
        // that safely needs quorum-aware tooling.
        run_uninstall_script(shell, Role::Server, &self.attrs.bin_dir).await
    }

    async fn resync(&mut self, shell: &dyn RemoteShell) -> K3sResult<()> {
        let (config, registry) = read_config_files(shell).await?;
        self.attrs.config = config;
        self.attrs.registry = registry;

        self.cluster_init = self
            .attrs
            .config
            .get(CLUSTER_INIT_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let joined = |key: &str| {
            self.attrs
                .config
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        self.join = match (joined(SERVER_KEY), joined(TOKEN_KEY)) {
            (Some(server), Some(token)) => Some(HaJoin { server, token }),
            _ => None,
        };

        self.token = self.resync_token(shell).await?;
        self.kubeconfig = fetch_kubeconfig(shell).await?;
        debug!(
            "Resynced server on {} (data dir {})",
            shell.host(),
            component::data_dir_of(&self.attrs.config)
        );
        Ok(())
    }
}
