//! systemd unit control and health checks over the remote shell

use serde::Serialize;
use tracing::{debug, trace, warn};

use k3sforge_core::error::K3sResult;
use k3sforge_core::transport::RemoteShell;
use k3sforge_core::K3sError;

/// Health of one node's k3s unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub active: bool,
    /// `systemctl status` and journal tail, only gathered when inactive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl NodeStatus {
    pub fn active() -> Self {
        Self {
            active: true,
            diagnostics: None,
        }
    }
}

pub fn daemon_reload() -> String {
    "sudo systemctl daemon-reload".to_string()
}

pub fn start(unit: &str) -> String {
    format!("sudo systemctl start {}", unit)
}

pub fn restart(unit: &str) -> String {
    format!("sudo systemctl restart {}", unit)
}

/// Whether the unit is in the `active` state. Any other state, including
/// `activating` and `failed`, counts as inactive.
pub async fn is_active(shell: &dyn RemoteShell, unit: &str) -> K3sResult<bool> {
    // is-active exits non-zero for inactive units; that is an answer, not a failure
    let output = shell
        .run_combined(&format!("sudo systemctl is-active {} || true", unit))
        .await?;
    let state = output.lines().last().unwrap_or_default().trim();
    debug!("Unit {} on {} is '{}'", unit, shell.host(), state);
    Ok(state == "active")
}

/// Best-effort status dump plus journal tail. Failures to fetch either part
/// end up in the returned text instead of an error.
pub async fn diagnostics(shell: &dyn RemoteShell, unit: &str, journal_lines: u32) -> String {
    let status = shell
        .run_combined(&format!("sudo systemctl status {} --no-pager || true", unit))
        .await
        .unwrap_or_else(|e| format!("<systemctl status unavailable: {}>", e));
    let journal = shell
        .run_combined(&format!(
            "sudo journalctl -xeu {} --no-pager -n {} || true",
            unit, journal_lines
        ))
        .await
        .unwrap_or_else(|e| format!("<journal unavailable: {}>", e));

    debug!("systemctl status {} on {}:\n{}", unit, shell.host(), status);
    trace!("journalctl {} on {}:\n{}", unit, shell.host(), journal);

    format!("{}\n--- journal ---\n{}", status.trim_end(), journal.trim_end())
}

/// Report unit health, attaching diagnostics when it is not active.
pub async fn status(shell: &dyn RemoteShell, unit: &str, journal_lines: u32) -> K3sResult<NodeStatus> {
    if is_active(shell, unit).await? {
        return Ok(NodeStatus::active());
    }
    warn!("Unit {} on {} is not active", unit, shell.host());
    Ok(NodeStatus {
        active: false,
        diagnostics: Some(diagnostics(shell, unit, journal_lines).await),
    })
}

/// Start `unit`; on failure gather diagnostics and report a start failure.
pub async fn start_or_diagnose(shell: &dyn RemoteShell, unit: &str, journal_lines: u32) -> K3sResult<()> {
    activate(shell, start(unit), unit, journal_lines).await
}

pub async fn restart_or_diagnose(shell: &dyn RemoteShell, unit: &str, journal_lines: u32) -> K3sResult<()> {
    activate(shell, restart(unit), unit, journal_lines).await
}

async fn activate(shell: &dyn RemoteShell, command: String, unit: &str, journal_lines: u32) -> K3sResult<()> {
    if let Err(e) = shell.run_streamed(&[command]).await {
        warn!("Activating {} on {} failed: {}", unit, shell.host(), e);
        return Err(K3sError::ServiceStart {
            unit: unit.to_string(),
            host: shell.host().to_string(),
            diagnostics: diagnostics(shell, unit, journal_lines).await,
        });
    }
    Ok(())
}
