//! Idempotent get-or-create of the cluster SSH key pair.
//!
//! The provider hands out private key material only when a pair is created.
//! A discovered pair therefore has no material, and anything that needs it
//! fails with [`KeyPairError::MissingKeyMaterial`] until a key file is
//! loaded with [`load_private_key`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::BaseDirs;
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::{ComputeProvider, ProviderError};

/// Mode of private key files.
pub const PRIVATE_KEY_MODE: u32 = 0o600;

/// Mode of public key files.
pub const PUBLIC_KEY_MODE: u32 = 0o644;

/// Key pair errors.
#[derive(Debug, Error)]
pub enum KeyPairError {
    #[error("key pair {name} has no private key material; it was discovered, not created, so load its key file")]
    MissingKeyMaterial { name: String },

    #[error("load_private_key: neither {path:?} nor {fallback:?} exists")]
    KeyFileNotFound {
        path: PathBuf,
        fallback: Option<PathBuf>,
    },

    #[error("{operation} {path:?}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// An SSH key pair known to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub name: String,
    /// Present only when this process created the pair or loaded its file.
    pub private_key_material: Option<String>,
    pub local_file_path: Option<PathBuf>,
}

impl KeyPair {
    /// The private key, or a descriptive error when it is unknown.
    pub fn private_key(&self) -> Result<&str, KeyPairError> {
        self.private_key_material
            .as_deref()
            .ok_or_else(|| KeyPairError::MissingKeyMaterial {
                name: self.name.clone(),
            })
    }

    /// Attach material loaded from a local key file.
    pub fn with_key_file(mut self, path: PathBuf, material: String) -> Self {
        self.private_key_material = Some(material);
        self.local_file_path = Some(path);
        self
    }
}

/// Default key pair name for a cluster.
pub fn default_key_pair_name(group_uuid: &str) -> String {
    format!("os-key-pair-{group_uuid}")
}

/// Get-or-create for the cluster key pair.
pub struct KeyPairManager {
    provider: Arc<dyn ComputeProvider>,
}

impl KeyPairManager {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    /// Return the pair named `name` (or the group default), creating it if
    /// the provider has none.
    pub async fn ensure_key_pair(
        &self,
        name: Option<&str>,
        group_uuid: &str,
    ) -> Result<KeyPair, KeyPairError> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| default_key_pair_name(group_uuid));

        if !self.provider.describe_key_pairs(&name).await?.is_empty() {
            info!(key_pair = %name, "Reusing existing key pair; private key must be loaded separately");
            return Ok(KeyPair {
                name,
                private_key_material: None,
                local_file_path: None,
            });
        }

        let created = self.provider.create_key_pair(&name).await?;
        info!(key_pair = %created.name, "Created key pair");
        Ok(KeyPair {
            name: created.name,
            private_key_material: Some(created.private_key_material),
            local_file_path: None,
        })
    }

    /// Delete the provider-side pair.
    pub async fn delete_key_pair(&self, name: &str) -> Result<(), KeyPairError> {
        self.provider.delete_key_pair(name).await?;
        info!(key_pair = %name, "Deleted key pair");
        Ok(())
    }
}

/// Read a private key file, falling back to the user's `~/.ssh` directory
/// when `path` does not exist.
pub fn load_private_key(path: &Path) -> Result<(PathBuf, String), KeyPairError> {
    let ssh_dir = BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh"));
    load_private_key_from(path, ssh_dir.as_deref())
}

fn load_private_key_from(
    path: &Path,
    ssh_dir: Option<&Path>,
) -> Result<(PathBuf, String), KeyPairError> {
    let fallback = match (ssh_dir, path.file_name()) {
        (Some(dir), Some(file)) => Some(dir.join(file)),
        _ => None,
    };

    let resolved = if path.exists() {
        path.to_path_buf()
    } else {
        match fallback {
            Some(candidate) if candidate.exists() => candidate,
            fallback => {
                return Err(KeyPairError::KeyFileNotFound {
                    path: path.to_path_buf(),
                    fallback,
                })
            }
        }
    };

    debug!(path = %resolved.display(), "Loading private key");
    let material = fs::read_to_string(&resolved).map_err(|source| KeyPairError::Io {
        operation: "read",
        path: resolved.clone(),
        source,
    })?;
    Ok((resolved, material))
}

/// Write a key file with the given permission bits, replacing any
/// existing file.
pub fn write_key_file(path: &Path, contents: &str, mode: u32) -> Result<(), KeyPairError> {
    let io_err = |operation| {
        move |source| KeyPairError::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err("create_dir"))?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        // mode() only applies when the file is created, so an existing file
        // is narrowed before its old contents are dropped and the key lands
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(mode)
            .open(path)
            .map_err(io_err("open"))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(io_err("chmod"))?;
        file.set_len(0).map_err(io_err("truncate"))?;
        file.write_all(contents.as_bytes())
            .map_err(io_err("write"))?;
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::write(path, contents).map_err(io_err("write"))?;
    }

    Ok(())
}
