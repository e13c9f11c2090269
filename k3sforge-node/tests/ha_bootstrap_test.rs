//! HA control-plane bootstrap across scripted nodes

mod common;

use pretty_assertions::assert_eq;
use serde_yaml::{Mapping, Value};

use k3sforge_core::error::K3sError;
use k3sforge_core::paths;
use k3sforge_core::test_helpers::ScriptedShell;
use k3sforge_node::{HaCoordinator, HaError, HaNode, HaSession};

use common::*;

const HOSTS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

fn session(registry: Mapping) -> HaSession {
    HaSession {
        nodes: HOSTS
            .iter()
            .map(|host| HaNode {
                auth: auth(host),
                bin_dir: None,
                tls_san: Some(format!("{}.nip.io", host)),
            })
            .collect(),
        config: serde_yaml::from_str("write-kubeconfig-mode: \"0644\"\n").unwrap(),
        registry,
        bin_dir: paths::DEFAULT_BIN_DIR.to_string(),
        version: Some("v1.31.2+k3s1".to_string()),
        oidc: None,
        journal_lines: 20,
    }
}

fn cluster() -> (Vec<ScriptedShell>, HaCoordinator) {
    let shells = vec![
        healthy_server(HOSTS[0]),
        healthy_node(HOSTS[1]),
        healthy_node(HOSTS[2]),
    ];
    let coordinator = HaCoordinator::new(Box::new(ScriptedConnector::new(&shells)), assets());
    (shells, coordinator)
}

fn mirrors() -> Mapping {
    serde_yaml::from_str("mirrors:\n  docker.io:\n    endpoint:\n    - https://mirror.local\n").unwrap()
}

#[tokio::test]
async fn test_bootstrap_initializes_once_and_joins_the_rest() {
    let (shells, coordinator) = cluster();

    let report = coordinator.bootstrap(&session(mirrors())).await.unwrap();

    assert_eq!(report.token, TOKEN);
    assert_eq!(report.server, "https://10.0.0.1:6443");
    assert!(report.kubeconfig.contains("https://10.0.0.1:6443"));
    assert!(report.active().values().all(|active| *active));
    let ids: Vec<&str> = report.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["server,10.0.0.1", "server,10.0.0.2", "server,10.0.0.3"]);

    let configs: Vec<Mapping> = shells.iter().map(|s| yaml_file(s, CONFIG_FILE)).collect();
    let initializers = configs
        .iter()
        .filter(|c| c.get("cluster-init") == Some(&Value::Bool(true)))
        .count();
    assert_eq!(initializers, 1);
    assert!(configs[0].get("server").is_none());

    for (config, host) in configs.iter().zip(HOSTS).skip(1) {
        assert_eq!(config.get("server"), Some(&Value::from("https://10.0.0.1:6443")));
        assert_eq!(config.get("token"), Some(&Value::from(TOKEN)));
        assert_eq!(config.get("tls-san"), Some(&Value::from(format!("{}.nip.io", host))));
    }
    for config in &configs {
        assert_eq!(config.get("embedded-registry"), Some(&Value::Bool(true)));
        assert_eq!(config.get("write-kubeconfig-mode"), Some(&Value::from("0644")));
    }
    for shell in &shells {
        assert!(shell.file(REGISTRY_FILE).is_some());
        assert_eq!(shell.count("INSTALL_K3S_VERSION='v1.31.2+k3s1'"), 1);
    }
}

#[tokio::test]
async fn test_failing_joiner_does_not_stop_siblings() {
    let (shells, coordinator) = cluster();
    shells[1]
        .fail_on("systemctl start", "Job for k3s.service failed")
        .respond("journalctl", "etcd cluster join failed");

    let err = coordinator.bootstrap(&session(Mapping::new())).await.unwrap_err();
    let HaError::Partial { report, source } = err else {
        panic!("expected a partial failure");
    };

    let active = report.active();
    assert_eq!(active.get("10.0.0.1"), Some(&true));
    assert_eq!(active.get("10.0.0.2"), Some(&false));
    assert_eq!(active.get("10.0.0.3"), Some(&true));
    assert!(report.nodes[1]
        .diagnostics
        .as_deref()
        .unwrap()
        .contains("etcd cluster join failed"));

    assert!(matches!(source, K3sError::PartialFailure { total: 3, .. }));
    assert_eq!(report.token, TOKEN);
    let text = source.to_string();
    assert!(text.starts_with("1 of 3 nodes failed"));
    assert!(text.contains("10.0.0.2"));
    assert!(!text.contains("10.0.0.3"));

    // The initializer is left in place.
    assert_eq!(shells[0].count("uninstall"), 0);
    assert_eq!(shells[2].count("sudo systemctl start k3s"), 1);
    assert_eq!(
        yaml_file(&shells[0], CONFIG_FILE).get("embedded-registry"),
        Some(&Value::Bool(false))
    );
}

#[tokio::test]
async fn test_inactive_joiner_counts_as_failure() {
    let (shells, coordinator) = cluster();
    shells[2].respond("is-active", "activating\n");

    let err = coordinator.bootstrap(&session(Mapping::new())).await.unwrap_err();
    let report = err.report().unwrap();
    assert_eq!(report.active().get("10.0.0.3"), Some(&false));
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].host, "10.0.0.3");
}

#[tokio::test]
async fn test_initializer_failure_touches_no_other_node() {
    let (shells, coordinator) = cluster();
    shells[0].fail_on("systemctl start", "Job for k3s.service failed");

    let err = coordinator.bootstrap(&session(Mapping::new())).await.unwrap_err();
    assert!(err.report().is_none());
    assert!(
        matches!(err, HaError::Aborted(K3sError::ServiceStart { ref host, .. }) if host == "10.0.0.1")
    );
    assert!(shells[1].commands().is_empty());
    assert!(shells[2].commands().is_empty());
}

#[tokio::test]
async fn test_inactive_initializer_aborts() {
    let (shells, coordinator) = cluster();
    shells[0].respond("is-active", "failed\n");

    let err = coordinator.bootstrap(&session(Mapping::new())).await.unwrap_err();
    assert!(matches!(err, HaError::Aborted(K3sError::ServiceStart { .. })));
    assert!(shells[1].commands().is_empty());
}

#[tokio::test]
async fn test_connection_failure_aborts_before_any_command() {
    let shells = vec![
        healthy_server(HOSTS[0]),
        healthy_node(HOSTS[1]),
        healthy_node(HOSTS[2]),
    ];
    let connector = ScriptedConnector::new(&shells).refuse(HOSTS[2]);
    let coordinator = HaCoordinator::new(Box::new(connector), assets());

    let err = coordinator.bootstrap(&session(Mapping::new())).await.unwrap_err();
    assert!(err.is_connection());
    for shell in &shells {
        assert!(shell.commands().is_empty());
        assert_eq!(shell.probes(), 0);
    }
}

#[tokio::test]
async fn test_invalid_credentials_abort_before_connecting() {
    let (shells, coordinator) = cluster();
    let mut session = session(Mapping::new());
    session.nodes[1].auth.password = None;

    let err = coordinator.bootstrap(&session).await.unwrap_err();
    assert!(matches!(err, HaError::Aborted(K3sError::InvalidCredential { .. })));
    assert!(shells[0].commands().is_empty());
}

#[tokio::test]
async fn test_empty_inventory_is_rejected() {
    let (_, coordinator) = cluster();
    let mut session = session(Mapping::new());
    session.nodes.clear();

    let err = coordinator.bootstrap(&session).await.unwrap_err();
    assert!(matches!(err, HaError::Aborted(K3sError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_status_fans_out_to_every_node() {
    let (shells, coordinator) = cluster();
    shells[1]
        .respond("is-active", "failed\n")
        .respond("journalctl", "level=fatal");

    // An inactive unit is reported, not an error.
    let report = coordinator.status(&session(Mapping::new())).await.unwrap();
    let active = report.active();
    assert_eq!(active.get("10.0.0.1"), Some(&true));
    assert_eq!(active.get("10.0.0.2"), Some(&false));
    assert!(report.nodes[1].diagnostics.as_deref().unwrap().contains("level=fatal"));
    for shell in &shells {
        assert_eq!(shell.count("systemctl start"), 0);
    }
}

#[tokio::test]
async fn test_uninstall_continues_past_failures() {
    let (shells, coordinator) = cluster();
    shells[0].fail_on("k3s-uninstall.sh", "permission denied");

    let err = coordinator.uninstall(&session(Mapping::new())).await.unwrap_err();
    let failures = err.report().unwrap().failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].host, "10.0.0.1");
    for shell in &shells[1..] {
        assert_eq!(shell.count("sudo bash '/usr/local/bin/k3s-uninstall.sh'"), 1);
    }
}
