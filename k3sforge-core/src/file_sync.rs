//! Remote file sync via a base64 encode/decode command sequence
//!
//! Content is base64 encoded locally, written to `<path>.tmp`, decoded into
//! `<path>`, chowned to root, and the temporary file removed. The final path
//! never holds partially decoded content, and arbitrary bytes never meet
//! shell quoting.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::K3sResult;
use crate::paths::shell_quote;
use crate::transport::RemoteShell;

/// Suffix of the staging file written before decoding
pub const TMP_SUFFIX: &str = ".tmp";

/// Commands that write `content` to `path` on the remote node.
pub fn sync_commands(path: &str, content: &[u8]) -> Vec<String> {
    let mut commands = Vec::with_capacity(5);

    if let Some(parent) = Path::new(path).parent() {
        let parent = parent.to_string_lossy();
        if !parent.is_empty() && parent != "/" {
            commands.push(format!("sudo mkdir -p {}", shell_quote(&parent)));
        }
    }

    let target = shell_quote(path);
    let staging = shell_quote(&format!("{}{}", path, TMP_SUFFIX));
    let encoded = STANDARD.encode(content);

    commands.push(format!(
        "echo '{}' | sudo tee {} > /dev/null",
        encoded, staging
    ));
    commands.push(format!(
        "sudo base64 -d {} | sudo tee {} > /dev/null",
        staging, target
    ));
    commands.push(format!("sudo chown root:root {}", target));
    commands.push(format!("sudo rm -f {}", staging));
    commands
}

/// Write one file on the remote node.
pub async fn sync_file(shell: &dyn RemoteShell, path: &str, content: &[u8]) -> K3sResult<()> {
    debug!("Syncing {} ({} bytes) to {}", path, content.len(), shell.host());
    shell.run_streamed(&sync_commands(path, content)).await
}

/// Write several files in path order, stopping at the first failure.
pub async fn sync_files(shell: &dyn RemoteShell, files: &BTreeMap<String, Vec<u8>>) -> K3sResult<()> {
    for (path, content) in files {
        sync_file(shell, path, content).await?;
    }
    Ok(())
}
