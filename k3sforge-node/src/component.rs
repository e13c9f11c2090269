//! Shared lifecycle contract for k3s server and agent components
//!
//! A component is created fresh for every operation. Its attributes come
//! either from the caller (install, update) or from the node itself (resync).
//! Role-specific state such as join tokens or the kubeconfig lives on the
//! concrete [`crate::Server`] and [`crate::Agent`] types, not on this trait.

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use k3sforge_core::assets::{AssetProvider, INSTALL_SCRIPT};
use k3sforge_core::error::{K3sError, K3sResult};
use k3sforge_core::file_sync::{sync_file, sync_files};
use k3sforge_core::paths::{self, shell_quote};
use k3sforge_core::transport::RemoteShell;
use k3sforge_core::yaml_merge::{parse_mapping, to_yaml};

use crate::systemd::{self, NodeStatus};

/// Config key k3s reads its data directory from
pub const DATA_DIR_KEY: &str = "data-dir";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Agent,
}

impl Role {
    /// systemd unit installed for this role
    pub fn unit(self) -> &'static str {
        match self {
            Role::Server => "k3s",
            Role::Agent => "k3s-agent",
        }
    }

    /// `INSTALL_K3S_EXEC` value
    pub fn exec(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Agent => "agent",
        }
    }

    pub fn uninstall_script(self) -> &'static str {
        match self {
            Role::Server => paths::SERVER_UNINSTALL_SCRIPT,
            Role::Agent => paths::AGENT_UNINSTALL_SCRIPT,
        }
    }

    /// Stable identifier reported for a node, e.g. `server,10.0.0.1`
    pub fn id(self, host: &str) -> String {
        format!("{},{}", self.exec(), host)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.exec())
    }
}

/// Attributes every component carries
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentConfig {
    /// Merged `config.yaml` content
    pub config: Mapping,
    /// Merged `registries.yaml` content, written only when non-empty
    pub registry: Mapping,
    pub bin_dir: String,
    /// Pinned k3s version; the install script picks the latest when unset
    pub version: Option<String>,
    /// Additional files to write, absolute path to content
    pub extra_files: BTreeMap<String, Vec<u8>>,
    /// Journal lines fetched when a unit is not active
    pub journal_lines: u32,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            config: Mapping::new(),
            registry: Mapping::new(),
            bin_dir: paths::DEFAULT_BIN_DIR.to_string(),
            version: None,
            extra_files: BTreeMap::new(),
            journal_lines: k3sforge_core::config::DEFAULT_JOURNAL_LINES,
        }
    }
}

impl ComponentConfig {
    pub fn new(config: Mapping, registry: Mapping) -> Self {
        Self {
            config,
            registry,
            ..Default::default()
        }
    }

    pub fn with_bin_dir(mut self, bin_dir: impl Into<String>) -> Self {
        self.bin_dir = bin_dir.into();
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn with_journal_lines(mut self, lines: u32) -> Self {
        self.journal_lines = lines;
        self
    }

    /// `data-dir` from the config, falling back to the k3s default.
    pub fn data_dir(&self) -> String {
        data_dir_of(&self.config)
    }
}

pub(crate) fn data_dir_of(config: &Mapping) -> String {
    config
        .get(DATA_DIR_KEY)
        .and_then(Value::as_str)
        .filter(|dir| !dir.is_empty())
        .unwrap_or(paths::DATA_DIR)
        .to_string()
}

/// Options for tearing a component down
#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    /// Cluster kubeconfig used for cooperative node removal (agents only)
    pub kubeconfig: Option<String>,
    /// Continue with the uninstall script when node removal fails
    pub allow_node_delete_err: bool,
}

/// Lifecycle operations against one node
#[async_trait]
pub trait Component: Send + Sync {
    fn role(&self) -> Role;

    fn attrs(&self) -> &ComponentConfig;

    /// Wait for the node, then write the install script, config, registry
    /// and extra files. Safe to re-run.
    async fn preinstall(&mut self, shell: &dyn RemoteShell) -> K3sResult<()>;

    /// Run the install script and start the unit.
    async fn install(&mut self, shell: &dyn RemoteShell) -> K3sResult<()>;

    /// Rewrite config files and restart the unit.
    async fn update(&mut self, shell: &dyn RemoteShell) -> K3sResult<()>;

    async fn uninstall(&self, shell: &dyn RemoteShell, options: &UninstallOptions) -> K3sResult<()>;

    async fn status(&self, shell: &dyn RemoteShell) -> K3sResult<NodeStatus> {
        systemd::status(shell, self.role().unit(), self.attrs().journal_lines).await
    }

    /// Rebuild attributes from files and services already on the node.
    async fn resync(&mut self, shell: &dyn RemoteShell) -> K3sResult<()>;
}

/// Directory creation plus every file a component needs before install.
pub(crate) async fn write_node_files(
    shell: &dyn RemoteShell,
    attrs: &ComponentConfig,
    config: &Mapping,
    assets: &dyn AssetProvider,
) -> K3sResult<()> {
    shell.wait_until_reachable().await?;

    shell
        .run_streamed(&[
            format!("sudo mkdir -p {}", shell_quote(&data_dir_of(config))),
            format!("sudo mkdir -p {}", shell_quote(paths::CONFIG_DIR)),
        ])
        .await?;

    let script = assets.get(INSTALL_SCRIPT)?;
    sync_file(shell, &paths::install_script(&attrs.bin_dir), &script).await?;

    write_config_files(shell, config, Some(&attrs.registry)).await?;
    sync_files(shell, &attrs.extra_files).await?;

    info!("Node files written to {}", shell.host());
    Ok(())
}

/// Write `config.yaml` and, when given, `registries.yaml`. An empty
/// registry removes any file left by an earlier install.
pub(crate) async fn write_config_files(
    shell: &dyn RemoteShell,
    config: &Mapping,
    registry: Option<&Mapping>,
) -> K3sResult<()> {
    sync_file(shell, &paths::config_file(), to_yaml(config)?.as_bytes()).await?;
    match registry {
        Some(registry) if registry.is_empty() => {
            shell
                .run_streamed(&[format!("sudo rm -f {}", shell_quote(&paths::registry_file()))])
                .await?;
        }
        Some(registry) => {
            sync_file(shell, &paths::registry_file(), to_yaml(registry)?.as_bytes()).await?;
        }
        None => {}
    }
    Ok(())
}

/// Command running the synced install script for `role`.
///
/// `join` carries `(K3S_URL, K3S_TOKEN)` for nodes joining through the
/// install script environment.
pub(crate) fn install_command(role: Role, attrs: &ComponentConfig, join: Option<(&str, &str)>) -> String {
    let bin_dir = shell_quote(&attrs.bin_dir);
    let mut env = vec![
        format!("BIN_DIR={}", bin_dir),
        format!("INSTALL_K3S_BIN_DIR={}", bin_dir),
        "INSTALL_K3S_SKIP_START=true".to_string(),
        format!("INSTALL_K3S_EXEC={}", role.exec()),
    ];
    if let Some(version) = &attrs.version {
        env.push(format!("INSTALL_K3S_VERSION={}", shell_quote(version)));
    }
    if let Some((url, token)) = join {
        env.push(format!("K3S_URL={}", shell_quote(url)));
        env.push(format!("K3S_TOKEN={}", shell_quote(token)));
    }
    format!(
        "sudo {} bash {}",
        env.join(" "),
        shell_quote(&paths::install_script(&attrs.bin_dir))
    )
}

/// Install script, daemon reload, then start with diagnostics on failure.
pub(crate) async fn run_install(
    shell: &dyn RemoteShell,
    role: Role,
    attrs: &ComponentConfig,
    join: Option<(&str, &str)>,
) -> K3sResult<()> {
    info!("Installing k3s {} on {}", role, shell.host());
    shell
        .run_streamed(&[install_command(role, attrs, join), systemd::daemon_reload()])
        .await?;
    systemd::start_or_diagnose(shell, role.unit(), attrs.journal_lines).await
}

pub(crate) async fn run_uninstall_script(shell: &dyn RemoteShell, role: Role, bin_dir: &str) -> K3sResult<()> {
    info!("Uninstalling k3s {} from {}", role, shell.host());
    let script = format!("{}/{}", bin_dir.trim_end_matches('/'), role.uninstall_script());
    shell
        .run_streamed(&[format!("sudo bash {}", shell_quote(&script))])
        .await
}

/// Read config.yaml and registries.yaml; absent files are empty maps.
pub(crate) async fn read_config_files(shell: &dyn RemoteShell) -> K3sResult<(Mapping, Mapping)> {
    let config = shell.read_remote_file(&paths::config_file(), true, true).await?;
    let registry = shell.read_remote_file(&paths::registry_file(), true, true).await?;
    debug!(
        "Read {} config bytes and {} registry bytes from {}",
        config.len(),
        registry.len(),
        shell.host()
    );
    Ok((
        parse_mapping("config.yaml", &config)?,
        parse_mapping("registries.yaml", &registry)?,
    ))
}

/// Parse a systemd environment file (`KEY=value`, optionally quoted).
pub(crate) fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .unwrap_or(value);
            (key.trim().to_string(), unquoted.to_string())
        })
        .collect()
}

/// Fetch a required key from a unit environment file.
pub(crate) fn require_env(env: &BTreeMap<String, String>, key: &str, path: &str) -> K3sResult<String> {
    env.get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| K3sError::MissingSecret {
            key: key.to_string(),
            path: path.to_string(),
        })
}

/// Shared asset provider handle
pub type Assets = Arc<dyn AssetProvider>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_install_command_for_joining_agent() {
        let attrs = ComponentConfig::default().with_version(Some("v1.31.2+k3s1".to_string()));
        let cmd = install_command(Role::Agent, &attrs, Some(("https://10.0.0.1:6443", "K10tok")));
        assert_eq!(
            cmd,
            "sudo BIN_DIR='/usr/local/bin' INSTALL_K3S_BIN_DIR='/usr/local/bin' \
             INSTALL_K3S_SKIP_START=true INSTALL_K3S_EXEC=agent \
             INSTALL_K3S_VERSION='v1.31.2+k3s1' K3S_URL='https://10.0.0.1:6443' K3S_TOKEN='K10tok' \
             bash '/usr/local/bin/k3s-install.sh'"
        );
    }

    #[test]
    fn test_install_command_without_version() {
        let attrs = ComponentConfig::default()
            .with_bin_dir("/opt/bin")
            .with_version(Some(" ".to_string()));
        let cmd = install_command(Role::Server, &attrs, None);
        assert!(!cmd.contains("INSTALL_K3S_VERSION"));
        assert!(cmd.contains("INSTALL_K3S_EXEC=server"));
        assert!(cmd.contains("INSTALL_K3S_BIN_DIR='/opt/bin'"));
        assert!(cmd.ends_with("bash '/opt/bin/k3s-install.sh'"));
    }

    #[test]
    fn test_data_dir_override() {
        let mut attrs = ComponentConfig::default();
        assert_eq!(attrs.data_dir(), "/var/lib/rancher/k3s");
        attrs
            .config
            .insert(Value::from(DATA_DIR_KEY), Value::from("/data/k3s"));
        assert_eq!(attrs.data_dir(), "/data/k3s");
    }

    #[test]
    fn test_parse_env_file() {
        let env = parse_env_file(
            "# written by the installer\nK3S_TOKEN='K10abc::server:def'\nK3S_URL=\"https://10.0.0.1:6443\"\nNO_PROXY=\n",
        );
        assert_eq!(env.get("K3S_TOKEN").map(String::as_str), Some("K10abc::server:def"));
        assert_eq!(env.get("K3S_URL").map(String::as_str), Some("https://10.0.0.1:6443"));
        assert!(require_env(&env, "NO_PROXY", "/etc/x").is_err());
        assert!(matches!(
            require_env(&env, "K3S_AGENT_TOKEN", "/etc/x"),
            Err(K3sError::MissingSecret { .. })
        ));
    }

    #[test]
    fn test_role_ids() {
        assert_eq!(Role::Server.id("10.0.0.1"), "server,10.0.0.1");
        assert_eq!(Role::Agent.unit(), "k3s-agent");
        assert_eq!(Role::Agent.uninstall_script(), "k3s-agent-uninstall.sh");
    }
}
