pub mod agent;
pub mod component;
pub mod ha;
pub mod node_remover;
pub mod oidc;
pub mod operations;
pub mod server;
pub mod systemd;

pub use agent::Agent;
pub use component::{Component, ComponentConfig, Role, UninstallOptions};
pub use ha::{HaCoordinator, HaError, HaNode, HaReport, HaResult, HaSession, NodeOutcome, ShellConnector, SshConnector};
pub use node_remover::{KubeNodeRemover, NodeIdentity, NodeRemover};
pub use oidc::OidcConfig;
pub use operations::{AgentReport, KubeconfigReport, ServerReport, UpdateOutcome};
pub use server::{HaJoin, Server};
pub use systemd::NodeStatus;

// Re-export core types for convenience
pub use k3sforge_core::{
    error::{K3sError, K3sResult},
    transport::RemoteShell,
    NodeAuth,
};
