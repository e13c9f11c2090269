//! Core building blocks for driving k3s nodes over SSH.
//!
//! Everything here is role-agnostic: the remote shell transport, the base64
//! file-sync primitive, layered YAML merging, kubeconfig rewriting and the
//! install-script asset providers. The server/agent lifecycle built on top of
//! these lives in `k3sforge-node`.

pub mod assets;
pub mod auth;
pub mod cluster_auth;
pub mod config;
pub mod error;
pub mod file_sync;
pub mod paths;
pub mod retry;
pub mod transport;
pub mod yaml_merge;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use assets::{AssetProvider, DirectoryAssets, EmbeddedAssets, INSTALL_SCRIPT};
pub use auth::{Credential, NodeAuth};
pub use cluster_auth::ClusterAuth;
pub use config::EngineConfig;
pub use error::{K3sError, K3sResult};
pub use transport::{RemoteShell, SshTransport};
