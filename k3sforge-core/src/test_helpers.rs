//! In-memory remote shell for tests
//!
//! [`ScriptedShell`] records every command it receives, answers from canned
//! responses keyed by command substring, and keeps a small virtual filesystem
//! fed by the file-sync command sequence so that reads see earlier writes.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{K3sError, K3sResult};
use crate::transport::RemoteShell;

#[derive(Debug, Clone)]
enum Reply {
    Output(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct State {
    commands: Vec<String>,
    rules: Vec<(String, Reply)>,
    files: BTreeMap<String, Vec<u8>>,
    unreachable: bool,
    probes: u32,
}

/// Scripted [`RemoteShell`]. Clones share state, so a test can keep a handle
/// after passing the shell to the code under test.
#[derive(Debug, Clone)]
pub struct ScriptedShell {
    host: String,
    state: Arc<Mutex<State>>,
}

impl ScriptedShell {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer commands containing `pattern` with `output`. Later rules win.
    pub fn respond(&self, pattern: impl Into<String>, output: impl Into<String>) -> &Self {
        self.state()
            .rules
            .push((pattern.into(), Reply::Output(output.into())));
        self
    }

    /// Fail commands containing `pattern`. Later rules win.
    pub fn fail_on(&self, pattern: impl Into<String>, details: impl Into<String>) -> &Self {
        self.state()
            .rules
            .push((pattern.into(), Reply::Fail(details.into())));
        self
    }

    /// Seed a file in the virtual filesystem.
    pub fn with_file(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> &Self {
        self.state().files.insert(path.into(), content.into());
        self
    }

    /// Make the readiness probe fail.
    pub fn set_unreachable(&self, unreachable: bool) -> &Self {
        self.state().unreachable = unreachable;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Number of recorded commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn file_string(&self, path: &str) -> Option<String> {
        self.file(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.state().files.clone()
    }

    pub fn probes(&self) -> u32 {
        self.state().probes
    }

    fn execute(&self, command: &str) -> K3sResult<String> {
        let mut state = self.state();
        state.commands.push(command.to_string());

        let reply = state
            .rules
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(Reply::Fail(details)) => Err(K3sError::command(&self.host, command, details)),
            Some(Reply::Output(output)) => Ok(output),
            None => {
                apply_file_command(&mut state.files, command);
                Ok(String::new())
            }
        }
    }
}

/// Single-quoted arguments of a command, in order.
fn quoted_args(command: &str) -> Vec<String> {
    command
        .split('\'')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, arg)| arg.to_string())
        .collect()
}

/// Mirror the side effects of the file-sync sequence.
fn apply_file_command(files: &mut BTreeMap<String, Vec<u8>>, command: &str) {
    let args = quoted_args(command);
    if command.starts_with("echo '") && args.len() == 2 {
        files.insert(args[1].clone(), args[0].as_bytes().to_vec());
    } else if command.starts_with("sudo base64 -d ") && args.len() == 2 {
        if let Some(decoded) = files
            .get(&args[0])
            .and_then(|staged| STANDARD.decode(staged).ok())
        {
            files.insert(args[1].clone(), decoded);
        }
    } else if command.starts_with("sudo rm -f ") && args.len() == 1 {
        files.remove(&args[0]);
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run_combined(&self, command: &str) -> K3sResult<String> {
        self.execute(command)
    }

    async fn run_streamed(&self, commands: &[String]) -> K3sResult<()> {
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }

    async fn wait_until_reachable(&self) -> K3sResult<()> {
        let mut state = self.state();
        state.probes += 1;
        if state.unreachable {
            return Err(K3sError::Unreachable {
                address: format!("{}:22", self.host),
                attempts: 1,
                details: "scripted".to_string(),
            });
        }
        Ok(())
    }

    async fn read_remote_file(&self, path: &str, missing_ok: bool, elevate: bool) -> K3sResult<String> {
        let command = crate::transport::read_file_command(path, missing_ok, elevate);
        let has_rule = {
            let state = self.state();
            state.rules.iter().any(|(pattern, _)| command.contains(pattern.as_str()))
        };
        if has_rule {
            return self.execute(&command);
        }

        let mut state = self.state();
        state.commands.push(command.clone());
        match state.files.get(path) {
            Some(content) => Ok(String::from_utf8_lossy(content).into_owned()),
            None if missing_ok => Ok(String::new()),
            None => Err(K3sError::command(
                &self.host,
                &command,
                format!("cat: {}: No such file or directory", path),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_sync::sync_file;

    #[tokio::test]
    async fn test_file_sync_lands_in_virtual_fs() {
        let shell = ScriptedShell::new("10.0.0.1");
        sync_file(&shell, "/etc/rancher/k3s/config.yaml", b"cluster-init: true\n")
            .await
            .unwrap();

        assert_eq!(
            shell.file_string("/etc/rancher/k3s/config.yaml").as_deref(),
            Some("cluster-init: true\n")
        );
        assert!(shell.file("/etc/rancher/k3s/config.yaml.tmp").is_none());
        assert_eq!(
            shell
                .read_remote_file("/etc/rancher/k3s/config.yaml", false, true)
                .await
                .unwrap(),
            "cluster-init: true\n"
        );
    }

    #[tokio::test]
    async fn test_rules_and_missing_files() {
        let shell = ScriptedShell::new("10.0.0.1");
        shell
            .respond("is-active", "active\n")
            .fail_on("systemctl start", "Job failed");

        assert_eq!(shell.run_combined("systemctl is-active k3s").await.unwrap(), "active\n");
        assert!(shell
            .run_streamed(&["sudo systemctl start k3s".to_string()])
            .await
            .is_err());
        assert_eq!(shell.read_remote_file("/nope", true, true).await.unwrap(), "");
        assert!(shell.read_remote_file("/nope", false, true).await.is_err());
        assert_eq!(shell.count("systemctl"), 2);
    }
}
