//! Highly available control-plane bootstrap
//!
//! Node 0 initializes the embedded etcd cluster and mints the join token.
//! Once it is active, every other node joins concurrently, each with its own
//! copy of the base config. A failing joiner never stops its siblings and
//! never rolls back the initializer; all outcomes are collected and reported
//! together.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::{error, info, warn};

use k3sforge_core::auth::NodeAuth;
use k3sforge_core::config::EngineConfig;
use k3sforge_core::error::{K3sError, K3sResult, NodeFailure};
use k3sforge_core::paths;
use k3sforge_core::transport::{RemoteShell, SshTransport};

use crate::component::{Assets, Component, ComponentConfig, Role, UninstallOptions};
use crate::oidc::OidcConfig;
use crate::operations::create_server;
use crate::server::{HaJoin, Server};

pub const EMBEDDED_REGISTRY_KEY: &str = "embedded-registry";
pub const TLS_SAN_KEY: &str = "tls-san";

/// Builds the shell for one node. Construction must not touch the node.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, node: &NodeAuth) -> K3sResult<Box<dyn RemoteShell>>;
}

/// [`ShellConnector`] producing SSH transports
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: EngineConfig,
}

impl SshConnector {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, node: &NodeAuth) -> K3sResult<Box<dyn RemoteShell>> {
        Ok(Box::new(SshTransport::new(node, &self.config)?))
    }
}

/// One control-plane node
#[derive(Debug, Clone)]
pub struct HaNode {
    pub auth: NodeAuth,
    /// Overrides the session's binary directory
    pub bin_dir: Option<String>,
    /// Extra SAN placed in this node's serving certificate
    pub tls_san: Option<String>,
}

/// Everything needed to bootstrap or inspect an HA control plane.
/// Index 0 of `nodes` is the initializer.
#[derive(Debug, Clone)]
pub struct HaSession {
    pub nodes: Vec<HaNode>,
    pub config: Mapping,
    pub registry: Mapping,
    pub bin_dir: String,
    pub version: Option<String>,
    pub oidc: Option<OidcConfig>,
    pub journal_lines: u32,
}

impl HaSession {
    fn bin_dir_of(&self, node: &HaNode) -> String {
        node.bin_dir.clone().unwrap_or_else(|| self.bin_dir.clone())
    }

    /// Base config shared by every node, before per-node keys.
    fn base_config(&self) -> Mapping {
        let mut config = self.config.clone();
        config.insert(
            Value::from(EMBEDDED_REGISTRY_KEY),
            Value::Bool(!self.registry.is_empty()),
        );
        config
    }

    fn server_for(&self, node: &HaNode, base: &Mapping, assets: &Assets) -> Server {
        let mut config = base.clone();
        if let Some(san) = &node.tls_san {
            config.insert(Value::from(TLS_SAN_KEY), Value::from(san.as_str()));
        }
        let attrs = ComponentConfig::new(config, self.registry.clone())
            .with_bin_dir(self.bin_dir_of(node))
            .with_version(self.version.clone())
            .with_journal_lines(self.journal_lines);
        let server = Server::new(attrs, assets.clone());
        match &self.oidc {
            Some(oidc) => server.with_oidc(oidc.clone()),
            None => server,
        }
    }
}

/// Final state of one node in a fan-out
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub id: String,
    pub host: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl NodeOutcome {
    fn ok(host: &str, active: bool, diagnostics: Option<String>) -> Self {
        Self {
            id: Role::Server.id(host),
            host: host.to_string(),
            active,
            error: None,
            diagnostics,
        }
    }

    fn failed(host: &str, err: &K3sError) -> Self {
        let diagnostics = match err {
            K3sError::ServiceStart { diagnostics, .. } => Some(diagnostics.clone()),
            _ => None,
        };
        Self {
            id: Role::Server.id(host),
            host: host.to_string(),
            active: false,
            error: Some(err.to_string()),
            diagnostics,
        }
    }
}

/// Failure of an HA operation
#[derive(Debug, thiserror::Error)]
pub enum HaError {
    /// Stopped before the fan-out; no joiner was touched
    #[error(transparent)]
    Aborted(#[from] K3sError),

    /// At least one node failed. `report` holds every node's outcome.
    #[error("{source}")]
    Partial {
        report: Box<HaReport>,
        source: K3sError,
    },
}

pub type HaResult = Result<HaReport, HaError>;

impl HaError {
    /// Per-node outcomes, when the fan-out ran
    pub fn report(&self) -> Option<&HaReport> {
        match self {
            HaError::Aborted(_) => None,
            HaError::Partial { report, .. } => Some(report),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, HaError::Aborted(e) if e.is_connection())
    }
}

/// Per-node results of an HA operation, in node order
#[derive(Debug, Clone, Serialize)]
pub struct HaReport {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    pub nodes: Vec<NodeOutcome>,
}

impl HaReport {
    fn from_nodes(nodes: Vec<NodeOutcome>) -> Self {
        Self {
            token: String::new(),
            server: String::new(),
            kubeconfig: String::new(),
            nodes,
        }
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.nodes
            .iter()
            .filter_map(|node| {
                node.error.as_ref().map(|message| NodeFailure {
                    host: node.host.clone(),
                    message: message.clone(),
                })
            })
            .collect()
    }

    /// One aggregated error naming every failing node, if any failed.
    pub fn check(&self) -> K3sResult<()> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(K3sError::PartialFailure {
                total: self.nodes.len(),
                failures,
            })
        }
    }

    /// `Ok(self)` when every node succeeded, `HaError::Partial` otherwise.
    pub fn into_result(self) -> HaResult {
        match self.check() {
            Ok(()) => Ok(self),
            Err(source) => Err(HaError::Partial {
                report: Box::new(self),
                source,
            }),
        }
    }

    /// Activity of each node keyed by host
    pub fn active(&self) -> std::collections::BTreeMap<String, bool> {
        self.nodes
            .iter()
            .map(|node| (node.host.clone(), node.active))
            .collect()
    }
}

/// Place `(index, outcome)` pairs into one slot per node.
fn into_slots(count: usize, results: Vec<(usize, NodeOutcome)>) -> Vec<NodeOutcome> {
    let mut slots: Vec<Option<NodeOutcome>> = vec![None; count];
    for (index, outcome) in results {
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }
    slots.into_iter().flatten().collect()
}

pub struct HaCoordinator {
    connector: Box<dyn ShellConnector>,
    assets: Assets,
}

impl HaCoordinator {
    pub fn new(connector: Box<dyn ShellConnector>, assets: Assets) -> Self {
        Self { connector, assets }
    }

    /// Build every node's shell up front so a bad descriptor aborts before
    /// any node is touched.
    async fn connect_all(&self, session: &HaSession) -> K3sResult<Vec<Box<dyn RemoteShell>>> {
        if session.nodes.is_empty() {
            return Err(K3sError::InvalidInput {
                field: "nodes".to_string(),
                message: "at least one node is required".to_string(),
            });
        }
        let mut shells = Vec::with_capacity(session.nodes.len());
        for node in &session.nodes {
            node.auth.validate()?;
            shells.push(self.connector.connect(&node.auth).await?);
        }
        Ok(shells)
    }

    pub async fn bootstrap(&self, session: &HaSession) -> HaResult {
        let shells = self.connect_all(session).await?;
        let base = session.base_config();

        // Initializer: fully active with a token before anyone joins.
        let first = &session.nodes[0];
        let first_shell = &*shells[0];
        info!("Initializing HA cluster on {}", first.auth.host);
        let mut initializer = session
            .server_for(first, &base, &self.assets)
            .with_cluster_init();
        let first_report = create_server(first_shell, &mut initializer).await?;
        if !first_report.active {
            return Err(HaError::Aborted(K3sError::ServiceStart {
                unit: Role::Server.unit().to_string(),
                host: first.auth.host.clone(),
                diagnostics: first_report.diagnostics.unwrap_or_default(),
            }));
        }

        let join = HaJoin {
            server: paths::api_url(&first.auth.host),
            token: initializer.token().to_string(),
        };

        let joiners = session
            .nodes
            .iter()
            .zip(shells.iter())
            .enumerate()
            .skip(1)
            .map(|(index, (node, shell))| {
                let mut server = session
                    .server_for(node, &base, &self.assets)
                    .with_ha_join(join.clone());
                async move {
                    let host = node.auth.host.as_str();
                    info!("Joining {} to the HA cluster", host);
                    let outcome = match create_server(&**shell, &mut server).await {
                        Ok(report) if report.active => NodeOutcome::ok(host, true, None),
                        Ok(report) => {
                            let err = K3sError::ServiceStart {
                                unit: Role::Server.unit().to_string(),
                                host: host.to_string(),
                                diagnostics: report.diagnostics.unwrap_or_default(),
                            };
                            warn!("{}", err);
                            NodeOutcome::failed(host, &err)
                        }
                        Err(e) => {
                            error!("Joining {} failed: {}", host, e);
                            NodeOutcome::failed(host, &e)
                        }
                    };
                    (index, outcome)
                }
            });

        let mut results = vec![(0, NodeOutcome::ok(&first.auth.host, true, None))];
        results.extend(join_all(joiners).await);

        let mut report = HaReport::from_nodes(into_slots(session.nodes.len(), results));
        report.token = initializer.token().to_string();
        report.server = first_report.server;
        report.kubeconfig = first_report.kubeconfig;
        report.into_result()
    }

    /// Unit health of every node, checked concurrently.
    pub async fn status(&self, session: &HaSession) -> HaResult {
        let shells = self.connect_all(session).await?;
        let base = session.base_config();

        let checks = session
            .nodes
            .iter()
            .zip(shells.iter())
            .enumerate()
            .map(|(index, (node, shell))| {
                let server = session.server_for(node, &base, &self.assets);
                async move {
                    let host = node.auth.host.as_str();
                    let outcome = match server.status(&**shell).await {
                        Ok(status) => NodeOutcome::ok(host, status.active, status.diagnostics),
                        Err(e) => NodeOutcome::failed(host, &e),
                    };
                    (index, outcome)
                }
            });

        let results = join_all(checks).await;
        HaReport::from_nodes(into_slots(session.nodes.len(), results)).into_result()
    }

    /// Run the uninstall script on every node concurrently.
    pub async fn uninstall(&self, session: &HaSession) -> HaResult {
        let shells = self.connect_all(session).await?;
        let base = session.base_config();
        let options = UninstallOptions::default();

        let removals = session
            .nodes
            .iter()
            .zip(shells.iter())
            .enumerate()
            .map(|(index, (node, shell))| {
                let server = session.server_for(node, &base, &self.assets);
                let options = &options;
                async move {
                    let host = node.auth.host.as_str();
                    let outcome = match server.uninstall(&**shell, options).await {
                        Ok(()) => NodeOutcome::ok(host, false, None),
                        Err(e) => NodeOutcome::failed(host, &e),
                    };
                    (index, outcome)
                }
            });

        let results = join_all(removals).await;
        HaReport::from_nodes(into_slots(session.nodes.len(), results)).into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(host: &str, error: Option<&str>) -> NodeOutcome {
        NodeOutcome {
            id: Role::Server.id(host),
            host: host.to_string(),
            active: error.is_none(),
            error: error.map(str::to_string),
            diagnostics: None,
        }
    }

    #[test]
    fn test_slots_follow_node_index() {
        let slots = into_slots(
            3,
            vec![(2, outcome("c", None)), (0, outcome("a", None)), (1, outcome("b", Some("x")))],
        );
        let hosts: Vec<&str> = slots.iter().map(|o| o.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_check_aggregates_failures() {
        let report = HaReport::from_nodes(vec![
            outcome("10.0.0.1", None),
            outcome("10.0.0.2", Some("install failed")),
            outcome("10.0.0.3", Some("unit inactive")),
        ]);
        let err = report.check().unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("2 of 3 nodes failed"));
        assert!(text.contains("10.0.0.2: install failed"));
        assert_eq!(report.active().get("10.0.0.1"), Some(&true));
    }

    #[test]
    fn test_into_result_keeps_report_with_error() {
        let clean = HaReport::from_nodes(vec![outcome("10.0.0.1", None)]);
        assert!(clean.into_result().is_ok());

        let err = HaReport::from_nodes(vec![
            outcome("10.0.0.1", None),
            outcome("10.0.0.2", Some("install failed")),
        ])
        .into_result()
        .unwrap_err();
        assert!(err.to_string().starts_with("1 of 2 nodes failed"));
        let report = err.report().unwrap();
        assert_eq!(report.nodes.len(), 2);
        assert_eq!(report.active().get("10.0.0.1"), Some(&true));
    }

    #[test]
    fn test_base_config_flags_embedded_registry() {
        let mut session = HaSession {
            nodes: Vec::new(),
            config: Mapping::new(),
            registry: Mapping::new(),
            bin_dir: paths::DEFAULT_BIN_DIR.to_string(),
            version: None,
            oidc: None,
            journal_lines: 10,
        };
        assert_eq!(
            session.base_config().get(EMBEDDED_REGISTRY_KEY),
            Some(&Value::Bool(false))
        );
        session
            .registry
            .insert(Value::from("mirrors"), Value::Mapping(Mapping::new()));
        assert_eq!(
            session.base_config().get(EMBEDDED_REGISTRY_KEY),
            Some(&Value::Bool(true))
        );
    }
}
