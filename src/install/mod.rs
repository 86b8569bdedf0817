//! Adaptor autoinstall cache.
//!
//! Adaptor packages are provisioned on demand into a shared repo directory
//! (`<repo>/<name>@<version>/`) with a JSON index recording installed and
//! unsupported specifiers. Concurrent calls for the same resolved specifier
//! collapse into one install subprocess through a specifier-keyed map of
//! in-flight watch channels; different specifiers install fully in
//! parallel. Dist-tags resolve against the registry on every call and are
//! never used as cache keys.

mod registry;

pub use registry::{CliRegistry, InstallOutcome, Registry, StaticRegistry};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Dist-tags resolved at call time rather than pinned versions.
const DIST_TAGS: &[&str] = &["latest", "next"];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AdaptorVersion {
    Exact(String),
    Tag(String),
}

/// A versioned adaptor reference, e.g. `@openfn/language-common@1.7.7` or
/// `@openfn/language-common@latest`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AdaptorSpecifier {
    pub name: String,
    pub version: AdaptorVersion,
}

impl AdaptorSpecifier {
    pub fn exact(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: AdaptorVersion::Exact(version.into()),
        }
    }

    pub fn tag(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: AdaptorVersion::Tag(tag.into()),
        }
    }
}

impl fmt::Display for AdaptorSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            AdaptorVersion::Exact(version) | AdaptorVersion::Tag(version) => {
                write!(f, "{}@{}", self.name, version)
            }
        }
    }
}

impl FromStr for AdaptorSpecifier {
    type Err = InstallError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() {
            return Err(InstallError::Specifier("empty adaptor specifier".into()));
        }
        // Scoped names start with '@'; only an '@' past position zero
        // separates name from version.
        match raw[1..].rfind('@') {
            Some(offset) => {
                let split = offset + 1;
                let (name, version) = (&raw[..split], &raw[split + 1..]);
                if version.is_empty() {
                    return Err(InstallError::Specifier(format!(
                        "adaptor specifier `{raw}` has an empty version"
                    )));
                }
                if DIST_TAGS.contains(&version) {
                    Ok(Self::tag(name, version))
                } else {
                    Ok(Self::exact(name, version))
                }
            }
            // Bare name: resolve `latest` at call time.
            None => Ok(Self::tag(raw, "latest")),
        }
    }
}

impl Serialize for AdaptorSpecifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AdaptorSpecifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Installed,
    Unsupported,
}

/// Cache entry for one resolved `name@version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallRecord {
    pub specifier: String,
    pub status: InstallStatus,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid adaptor specifier: {0}")]
    Specifier(String),
    #[error("failed to resolve {name}@{tag}: {message}")]
    Resolve {
        name: String,
        tag: String,
        message: String,
    },
    #[error("install failed for {specifier}: {message}")]
    Install { specifier: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The persisted index, `<repo>/index.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Index {
    #[serde(default)]
    installed: BTreeSet<String>,
    #[serde(default)]
    unsupported: BTreeSet<String>,
}

type InstallWait = watch::Receiver<Option<Result<InstallStatus, String>>>;

/// The shared on-disk adaptor repository.
pub struct Repo {
    root: PathBuf,
    registry: Arc<dyn Registry>,
    keep_unsupported: bool,
    index: Mutex<Index>,
    // Plain mutex: only ever held for a map lookup, never across an await,
    // and [`InflightGuard`] must be able to clear its slot from `Drop`.
    inflight: StdMutex<HashMap<String, InstallWait>>,
}

impl Repo {
    pub async fn open(
        root: impl Into<PathBuf>,
        registry: Arc<dyn Registry>,
        keep_unsupported: bool,
    ) -> Result<Self, InstallError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let index = load_index(&root).await?;
        info!(
            repo = %root.display(),
            installed = index.installed.len(),
            unsupported = index.unsupported.len(),
            "opened adaptor repo"
        );
        Ok(Self {
            root,
            registry,
            keep_unsupported,
            index: Mutex::new(index),
            inflight: StdMutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an installed specifier lives in.
    pub fn install_dir(&self, specifier: &str) -> PathBuf {
        self.root.join(specifier.replace('/', "_"))
    }

    pub async fn ensure_installed(
        &self,
        spec: &AdaptorSpecifier,
    ) -> Result<InstallRecord, InstallError> {
        self.ensure_installed_with(spec, false).await
    }

    /// Provision an adaptor, de-duplicating concurrent identical requests.
    /// `force` re-attempts specifiers previously recorded unsupported.
    pub async fn ensure_installed_with(
        &self,
        spec: &AdaptorSpecifier,
        force: bool,
    ) -> Result<InstallRecord, InstallError> {
        let version = match &spec.version {
            AdaptorVersion::Exact(version) => version.clone(),
            AdaptorVersion::Tag(tag) => self.registry.resolve(&spec.name, tag).await?,
        };
        let specifier = format!("{}@{}", spec.name, version);

        // Cached outcomes short-circuit without a subprocess.
        {
            let index = self.index.lock().await;
            if index.installed.contains(&specifier) {
                debug!(%specifier, "adaptor already installed");
                return Ok(InstallRecord {
                    specifier,
                    status: InstallStatus::Installed,
                });
            }
            if !force && index.unsupported.contains(&specifier) {
                debug!(%specifier, "adaptor cached as unsupported");
                return Ok(InstallRecord {
                    specifier,
                    status: InstallStatus::Unsupported,
                });
            }
        }

        let (tx, started) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&specifier) {
                Some(rx) => (None, rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(specifier.clone(), rx.clone());
                    (Some(tx), rx)
                }
            }
        };

        match tx {
            Some(tx) => self.run_install(&spec.name, &version, specifier, tx).await,
            None => wait_for_install(specifier, started).await,
        }
    }

    async fn run_install(
        &self,
        name: &str,
        version: &str,
        specifier: String,
        tx: watch::Sender<Option<Result<InstallStatus, String>>>,
    ) -> Result<InstallRecord, InstallError> {
        // The guard clears the slot even when this future is dropped
        // mid-install, so the next caller retries instead of waiting on a
        // dead channel.
        let guard = InflightGuard {
            repo: self,
            specifier: specifier.clone(),
        };
        let dest = self.install_dir(&specifier);
        let result = self.install_once(name, version, &specifier, &dest).await;

        // Clear the in-flight slot before broadcasting so a failed install
        // can be retried by the next caller.
        drop(guard);
        match &result {
            Ok(record) => {
                let _ = tx.send(Some(Ok(record.status)));
            }
            Err(err) => {
                metrics::counter!("filament_install_errors_total").increment(1);
                let _ = tx.send(Some(Err(err.to_string())));
            }
        }
        result
    }

    async fn install_once(
        &self,
        name: &str,
        version: &str,
        specifier: &str,
        dest: &Path,
    ) -> Result<InstallRecord, InstallError> {
        info!(%specifier, "installing adaptor");
        tokio::fs::create_dir_all(dest).await?;
        let outcome = self.registry.install(name, version, dest).await?;

        let mut index = self.index.lock().await;
        let status = match outcome {
            InstallOutcome::Installed => {
                index.installed.insert(specifier.to_string());
                InstallStatus::Installed
            }
            InstallOutcome::Unsupported => {
                index.unsupported.insert(specifier.to_string());
                if self.keep_unsupported {
                    warn!(%specifier, "adaptor unsupported; keeping files on disk");
                } else {
                    warn!(%specifier, "adaptor unsupported; removing from disk");
                    if let Err(err) = tokio::fs::remove_dir_all(dest).await {
                        warn!(%err, %specifier, "failed to remove unsupported adaptor");
                    }
                }
                InstallStatus::Unsupported
            }
        };
        save_index(&self.root, &index).await?;

        Ok(InstallRecord {
            specifier: specifier.to_string(),
            status,
        })
    }
}

/// Removes the installing caller's in-flight slot when dropped.
struct InflightGuard<'a> {
    repo: &'a Repo,
    specifier: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.repo
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.specifier);
    }
}

async fn wait_for_install(
    specifier: String,
    mut rx: InstallWait,
) -> Result<InstallRecord, InstallError> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return match result {
                Ok(status) => Ok(InstallRecord { specifier, status }),
                Err(message) => Err(InstallError::Install { specifier, message }),
            };
        }
        if rx.changed().await.is_err() {
            return Err(InstallError::Install {
                specifier,
                message: "install task dropped without a result".to_string(),
            });
        }
    }
}

async fn load_index(root: &Path) -> Result<Index, InstallError> {
    let path = root.join("index.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            InstallError::Install {
                specifier: path.display().to_string(),
                message: format!("corrupt repo index: {err}"),
            }
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
        Err(err) => Err(err.into()),
    }
}

/// Write temp + rename so concurrent readers never observe a torn index.
async fn save_index(root: &Path, index: &Index) -> Result<(), InstallError> {
    let body = serde_json::to_vec_pretty(index).map_err(|err| InstallError::Install {
        specifier: "index.json".to_string(),
        message: err.to_string(),
    })?;
    let tmp = root.join("index.json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, root.join("index.json")).await?;
    Ok(())
}
