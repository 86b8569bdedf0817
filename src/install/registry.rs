//! Package registry seam for adaptor resolution and installation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::InstallError;

/// What an install attempt found once the package was on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The package lacks the metadata-generation hook; cached so later
    /// calls skip the subprocess entirely.
    Unsupported,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a dist-tag (`latest`, `next`) to a concrete version.
    async fn resolve(&self, name: &str, tag: &str) -> Result<String, InstallError>;

    /// Install `name@version` into `dest` and probe its capability.
    async fn install(
        &self,
        name: &str,
        version: &str,
        dest: &Path,
    ) -> Result<InstallOutcome, InstallError>;
}

/// Registry backed by the package-manager CLI.
pub struct CliRegistry {
    command: String,
}

impl CliRegistry {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Registry for CliRegistry {
    async fn resolve(&self, name: &str, tag: &str) -> Result<String, InstallError> {
        let output = Command::new(&self.command)
            .args(["view", &format!("{name}@{tag}"), "version", "--json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| InstallError::Resolve {
                name: name.to_string(),
                tag: tag.to_string(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(InstallError::Resolve {
                name: name.to_string(),
                tag: tag.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let version: String =
            serde_json::from_slice(&output.stdout).map_err(|err| InstallError::Resolve {
                name: name.to_string(),
                tag: tag.to_string(),
                message: format!("unparseable registry reply: {err}"),
            })?;
        debug!(%name, %tag, %version, "resolved dist-tag");
        Ok(version)
    }

    async fn install(
        &self,
        name: &str,
        version: &str,
        dest: &Path,
    ) -> Result<InstallOutcome, InstallError> {
        let specifier = format!("{name}@{version}");
        let output = Command::new(&self.command)
            .args(["install", &specifier, "--no-audit", "--no-fund", "--prefix"])
            .arg(dest)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| InstallError::Install {
                specifier: specifier.clone(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(InstallError::Install {
                specifier,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Capability probe: the adaptor manifest must declare the metadata
        // hook for the worker's introspection service to use it.
        let manifest = dest.join("node_modules").join(name).join("package.json");
        match tokio::fs::read(&manifest).await {
            Ok(bytes) => {
                let parsed: serde_json::Value =
                    serde_json::from_slice(&bytes).unwrap_or_default();
                if parsed.get("metadata").is_some() {
                    Ok(InstallOutcome::Installed)
                } else {
                    Ok(InstallOutcome::Unsupported)
                }
            }
            Err(_) => Ok(InstallOutcome::Installed),
        }
    }
}

/// In-memory registry for tests: fixed tag table, per-call counters, and an
/// optional artificial install delay.
#[derive(Default)]
pub struct StaticRegistry {
    tags: HashMap<(String, String), String>,
    unsupported: Vec<String>,
    install_delay: Option<Duration>,
    resolve_calls: AtomicUsize,
    install_calls: AtomicUsize,
}

impl StaticRegistry {
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn with_tag(mut self, name: &str, tag: &str, version: &str) -> Self {
        self.tags
            .insert((name.to_string(), tag.to_string()), version.to_string());
        self
    }

    pub fn with_unsupported(mut self, specifier: &str) -> Self {
        self.unsupported.push(specifier.to_string());
        self
    }

    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = Some(delay);
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn resolve(&self, name: &str, tag: &str) -> Result<String, InstallError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.tags
            .get(&(name.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| InstallError::Resolve {
                name: name.to_string(),
                tag: tag.to_string(),
                message: "unknown dist-tag".to_string(),
            })
    }

    async fn install(
        &self,
        name: &str,
        version: &str,
        dest: &Path,
    ) -> Result<InstallOutcome, InstallError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.install_delay {
            tokio::time::sleep(delay).await;
        }
        let specifier = format!("{name}@{version}");
        if name == "missing" {
            return Err(InstallError::Install {
                specifier,
                message: "package not found".to_string(),
            });
        }
        tokio::fs::write(dest.join("package.json"), b"{}").await?;
        if self.unsupported.contains(&specifier) {
            Ok(InstallOutcome::Unsupported)
        } else {
            Ok(InstallOutcome::Installed)
        }
    }
}
