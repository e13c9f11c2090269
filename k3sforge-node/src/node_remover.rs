//! Cooperative removal of an agent's Node object from a live cluster

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, Config};
use tracing::{debug, info};

use k3sforge_core::error::{K3sError, K3sResult};

/// Annotations k3s records the node's addresses under
pub const IP_ANNOTATIONS: &[&str] = &["k3s.io/internal-ip", "alpha.kubernetes.io/provided-node-ip"];

/// How a node is recognised in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// SSH target, usually the node's IP
    pub address: String,
    /// Output of `hostname` on the node, if known
    pub hostname: Option<String>,
}

#[async_trait]
pub trait NodeRemover: Send + Sync {
    /// Delete the matching Node object and return its name.
    async fn remove(&self, kubeconfig: &str, node: &NodeIdentity) -> K3sResult<String>;
}

/// [`NodeRemover`] talking to the Kubernetes API with `kube`
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeNodeRemover;

fn removal_error(node: &NodeIdentity, details: impl std::fmt::Display) -> K3sError {
    K3sError::NodeRemoval {
        host: node.address.clone(),
        details: details.to_string(),
    }
}

#[async_trait]
impl NodeRemover for KubeNodeRemover {
    async fn remove(&self, kubeconfig: &str, node: &NodeIdentity) -> K3sResult<String> {
        let parsed: kube::config::Kubeconfig = serde_yaml::from_str(kubeconfig)
            .map_err(|e| removal_error(node, format!("invalid kubeconfig: {}", e)))?;
        let config = Config::from_custom_kubeconfig(parsed, &Default::default())
            .await
            .map_err(|e| removal_error(node, format!("failed to build config: {}", e)))?;
        let client = Client::try_from(config)
            .map_err(|e| removal_error(node, format!("failed to create client: {}", e)))?;

        let api: Api<Node> = Api::all(client);
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| removal_error(node, format!("listing nodes: {}", e)))?;

        let name = select_node(&nodes.items, node)
            .ok_or_else(|| removal_error(node, "no node in the cluster matches this host"))?;
        debug!("Host {} is cluster node '{}'", node.address, name);

        api.delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| removal_error(node, format!("deleting node '{}': {}", name, e)))?;
        info!("Deleted node '{}' from the cluster", name);
        Ok(name)
    }
}

/// Name of the node whose recorded IP annotation contains the SSH address,
/// falling back to a hostname match.
pub fn select_node(nodes: &[Node], identity: &NodeIdentity) -> Option<String> {
    let by_annotation = nodes.iter().find(|node| {
        node.metadata
            .annotations
            .as_ref()
            .map(|annotations| {
                IP_ANNOTATIONS.iter().any(|key| {
                    annotations
                        .get(*key)
                        .map(|ips| ips.split(',').any(|ip| ip.trim() == identity.address))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    });

    by_annotation
        .or_else(|| {
            let hostname = identity.hostname.as_deref()?;
            nodes
                .iter()
                .find(|node| node.metadata.name.as_deref() == Some(hostname))
        })
        .and_then(|node| node.metadata.name.clone())
}
