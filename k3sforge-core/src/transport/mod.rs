//! Remote command transport
//!
//! Every mutation of a target node happens through shell commands sent over
//! an authenticated session. [`RemoteShell`] is the seam the lifecycle code
//! is written against; [`SshTransport`] is the production implementation and
//! `test_helpers::ScriptedShell` the in-memory one.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::K3sResult;
use crate::paths::shell_quote;

pub mod ssh;

pub use ssh::SshTransport;

/// Which output stream a streamed line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives every line of streamed command output: `(host, stream, line)`.
pub type LineHandler = Arc<dyn Fn(&str, StreamKind, &str) + Send + Sync>;

/// Default line handler forwarding output to `tracing`.
pub fn tracing_line_handler() -> LineHandler {
    Arc::new(|host, stream, line| {
        debug!(host = %host, stream = %stream, "{}", line);
    })
}

/// Command execution against one remote node
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Host this shell talks to, used for error and log context
    fn host(&self) -> &str;

    /// Run one command in its own session and return stdout and stderr
    /// combined. Non-zero exit is an error.
    async fn run_combined(&self, command: &str) -> K3sResult<String>;

    /// Run commands in order, one session each, forwarding output line by
    /// line. The first failing command aborts the rest.
    async fn run_streamed(&self, commands: &[String]) -> K3sResult<()>;

    /// Probe the node until a connection succeeds or attempts run out.
    async fn wait_until_reachable(&self) -> K3sResult<()>;

    /// Read a remote file. With `missing_ok` an absent file yields an empty
    /// string instead of an error. Stderr is discarded so sudo warnings never
    /// end up in the content.
    async fn read_remote_file(&self, path: &str, missing_ok: bool, elevate: bool) -> K3sResult<String> {
        self.run_combined(&read_file_command(path, missing_ok, elevate))
            .await
    }
}

pub(crate) fn read_file_command(path: &str, missing_ok: bool, elevate: bool) -> String {
    let sudo = if elevate { "sudo " } else { "" };
    let quoted = shell_quote(path);
    if missing_ok {
        format!(
            "if {sudo}test -e {quoted} 2>/dev/null; then {sudo}cat {quoted} 2>/dev/null; fi",
            sudo = sudo,
            quoted = quoted
        )
    } else {
        format!("{}cat {} 2>/dev/null", sudo, quoted)
    }
}
