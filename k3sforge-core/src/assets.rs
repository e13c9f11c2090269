//! Read-only assets shipped to nodes (the install script)
//!
//! Assets are looked up by name through an injected [`AssetProvider`] and are
//! never modified at runtime.

use std::path::{Path, PathBuf};

use crate::error::{K3sError, K3sResult};
use crate::paths::INSTALL_SCRIPT_NAME;

/// Name of the install script asset
pub const INSTALL_SCRIPT: &str = INSTALL_SCRIPT_NAME;

/// Source of named, read-only payloads
pub trait AssetProvider: Send + Sync {
    fn get(&self, name: &str) -> K3sResult<Vec<u8>>;
}

/// Assets compiled into the binary.
///
/// The bundled install script fetches and runs the upstream installer,
/// passing the caller's environment through.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedAssets;

const EMBEDDED_INSTALL_SCRIPT: &[u8] = include_bytes!("../assets/k3s-install.sh");

impl AssetProvider for EmbeddedAssets {
    fn get(&self, name: &str) -> K3sResult<Vec<u8>> {
        match name {
            INSTALL_SCRIPT => Ok(EMBEDDED_INSTALL_SCRIPT.to_vec()),
            other => Err(K3sError::Asset {
                name: other.to_string(),
                details: "not embedded".to_string(),
            }),
        }
    }
}

/// Assets read from a local directory, e.g. a pinned copy of the upstream
/// install script.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetProvider for DirectoryAssets {
    fn get(&self, name: &str) -> K3sResult<Vec<u8>> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(K3sError::Asset {
                name: name.to_string(),
                details: "asset names must be plain file names".to_string(),
            });
        }
        let path = self.root.join(name);
        std::fs::read(&path).map_err(|e| K3sError::Asset {
            name: name.to_string(),
            details: format!("{}: {}", path.display(), e),
        })
    }
}
