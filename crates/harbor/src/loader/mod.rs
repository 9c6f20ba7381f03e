//! Plugin Loader - discovers archives and turns them into running instances
//!
//! ```text
//! plugins/
//! ├── plugin-a.jar      <- candidate "plugin-a"
//! ├── resize.zip        <- candidate "resize"
//! ├── notes.txt         (ignored)
//! └── .harbor/          (default work dir, ignored)
//!     ├── plugin-a-g1/  <- extraction root of generation 1
//!     └── resize-g2/
//! ```

pub mod archive;
pub mod manifest;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

pub use archive::ArchiveCandidate;
pub use manifest::{InvocationPolicy, PluginManifest, MANIFEST_FILE};

use crate::registry::PluginInstance;
use crate::sandbox::{LaunchSpec, ResourceTracker, SandboxLauncher};
use crate::types::LifecycleState;

/// Errors raised while validating or loading an archive
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("malformed archive {}: {reason}", .path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    #[error("archive {} has no plugin.toml", .0.display())]
    MissingManifest(PathBuf),

    #[error("capability conflict: {0}")]
    CapabilityConflict(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl LoadError {
    pub(crate) fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        LoadError::MalformedArchive {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        LoadError::Io(format!("{}: {err}", path.display()))
    }

    /// Stable upper-case error kind
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::MalformedArchive { .. } => "MALFORMED_ARCHIVE",
            LoadError::MissingManifest(_) => "MISSING_MANIFEST",
            LoadError::CapabilityConflict(_) => "CAPABILITY_CONFLICT",
            LoadError::Io(_) => "IO_FAILURE",
        }
    }
}

/// Validated, immutable description of one archive revision
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub archive: PathBuf,
    pub capabilities: Vec<String>,
    pub fingerprint: String,
    pub entry: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub invocation: InvocationPolicy,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

impl PluginDescriptor {
    fn new(candidate: &ArchiveCandidate, manifest: PluginManifest) -> Self {
        Self {
            id: candidate.id.clone(),
            name: manifest.name,
            version: manifest.version,
            description: manifest.description,
            archive: candidate.path.clone(),
            capabilities: manifest.capabilities,
            fingerprint: candidate.fingerprint.clone(),
            entry: manifest.entry,
            args: manifest.args,
            invocation: manifest.invocation,
            config: manifest.config,
        }
    }

    pub fn declares(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Discovers archives, extracts them and launches their sandboxes
pub struct PluginLoader {
    plugins_dir: PathBuf,
    work_dir: PathBuf,
    launcher: Arc<dyn SandboxLauncher>,
    resources: ResourceTracker,
    next_generation: AtomicU64,
    stop_grace: Duration,
}

impl PluginLoader {
    pub fn new(
        plugins_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        launcher: Arc<dyn SandboxLauncher>,
    ) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            work_dir: work_dir.into(),
            launcher,
            resources: ResourceTracker::new(),
            next_generation: AtomicU64::new(1),
            stop_grace: Duration::from_secs(5),
        }
    }

    /// How long a stopping sandbox may take to exit before it is killed
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Live sandbox counter shared with every loaded instance
    pub fn resources(&self) -> &ResourceTracker {
        &self.resources
    }

    /// Create the plugin and work directories and clear extraction roots left
    /// behind by a previous host process
    pub async fn prepare(&self) -> Result<(), LoadError> {
        let plugins_dir = self.plugins_dir.clone();
        let work_dir = self.work_dir.clone();

        blocking(move || {
            std::fs::create_dir_all(&plugins_dir).map_err(|e| LoadError::io(&plugins_dir, e))?;
            std::fs::create_dir_all(&work_dir).map_err(|e| LoadError::io(&work_dir, e))?;

            let entries = std::fs::read_dir(&work_dir).map_err(|e| LoadError::io(&work_dir, e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                let stale = path.is_dir()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(is_generation_dir)
                        .unwrap_or(false);
                if stale {
                    tracing::debug!("Removing stale extraction root {}", path.display());
                    if let Err(e) = std::fs::remove_dir_all(&path) {
                        tracing::warn!("Failed to remove {}: {}", path.display(), e);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Scan the plugins directory for archives
    ///
    /// Non-archive files and directories are skipped. A missing directory
    /// yields no candidates.
    pub async fn discover(&self) -> Result<Vec<ArchiveCandidate>, LoadError> {
        let plugins_dir = self.plugins_dir.clone();

        blocking(move || {
            let mut discovered = Vec::new();

            if !plugins_dir.exists() {
                tracing::debug!("Plugins directory does not exist: {}", plugins_dir.display());
                return Ok(discovered);
            }

            let entries =
                std::fs::read_dir(&plugins_dir).map_err(|e| LoadError::io(&plugins_dir, e))?;

            for entry in entries {
                let path = entry.map_err(|e| LoadError::io(&plugins_dir, e))?.path();

                if !path.is_file() || !archive::is_archive(&path) {
                    continue;
                }

                match archive::inspect(&path) {
                    Ok(candidate) => {
                        tracing::debug!("Discovered archive: {} at {}", candidate.id, path.display());
                        discovered.push(candidate);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping archive {}: {}", path.display(), e);
                    }
                }
            }

            discovered.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(discovered)
        })
        .await
    }

    /// Inspect a single archive path
    pub async fn candidate(&self, path: &Path) -> Result<ArchiveCandidate, LoadError> {
        let path = path.to_path_buf();
        blocking(move || archive::inspect(&path)).await
    }

    /// Store an uploaded archive as `<plugins_dir>/<file_name>`
    ///
    /// The upload is validated under a temporary name first, so a broken
    /// archive never becomes visible to discovery.
    pub async fn install(
        &self,
        file_name: &str,
        contents: Bytes,
    ) -> Result<ArchiveCandidate, LoadError> {
        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| LoadError::malformed(Path::new(file_name), "invalid file name"))?;

        let target = self.plugins_dir.join(&name);
        if !archive::is_archive(&target) || archive::plugin_id(&target).is_none() {
            return Err(LoadError::malformed(
                &target,
                "expected a .zip or .jar file named after the plugin id",
            ));
        }
        let partial = self.plugins_dir.join(format!(".{name}.part"));

        blocking(move || {
            std::fs::write(&partial, &contents).map_err(|e| LoadError::io(&partial, e))?;
            if let Err(e) = archive::read_manifest(&partial) {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
            std::fs::rename(&partial, &target).map_err(|e| LoadError::io(&target, e))?;
            tracing::info!("Installed archive {}", target.display());
            archive::inspect(&target)
        })
        .await
    }

    /// Open the archive behind `candidate` and validate its manifest
    pub async fn read_descriptor(
        &self,
        candidate: &ArchiveCandidate,
    ) -> Result<PluginDescriptor, LoadError> {
        let candidate = candidate.clone();
        blocking(move || {
            let manifest = archive::read_manifest(&candidate.path)?;
            Ok(PluginDescriptor::new(&candidate, manifest))
        })
        .await
    }

    /// Extract the archive and start a new generation of the plugin
    ///
    /// The returned instance is in LOADING. On error nothing is left behind:
    /// no process, no extraction directory, no resource slot.
    pub async fn load(
        &self,
        descriptor: Arc<PluginDescriptor>,
    ) -> Result<Arc<PluginInstance>, LoadError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let root = self.work_dir.join(format!("{}-g{}", descriptor.id, generation));
        let guard = self.resources.acquire();

        let extracted = {
            let archive_path = descriptor.archive.clone();
            let root = root.clone();
            let entry = root.join(&descriptor.entry);
            blocking(move || {
                if root.exists() {
                    std::fs::remove_dir_all(&root).map_err(|e| LoadError::io(&root, e))?;
                }
                archive::extract(&archive_path, &root)?;
                archive::ensure_executable(&entry)
            })
            .await
        };

        let launched = match extracted {
            Ok(()) => {
                self.launcher
                    .launch(LaunchSpec {
                        descriptor: descriptor.clone(),
                        generation,
                        root: root.clone(),
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match launched {
            Ok(sandbox) => {
                tracing::info!(
                    plugin = %descriptor.id,
                    generation,
                    version = %descriptor.version,
                    "Plugin loaded"
                );
                Ok(Arc::new(PluginInstance::new(
                    descriptor, generation, sandbox, root, guard,
                )))
            }
            Err(e) => {
                if let Err(io) = tokio::fs::remove_dir_all(&root).await {
                    if io.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {}: {}", root.display(), io);
                    }
                }
                drop(guard);
                tracing::warn!(plugin = %descriptor.id, generation, "Plugin load failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the instance and release everything it owns
    ///
    /// Safe to call while invocations are in flight: they complete or fail
    /// with ABORTED_DURING_UNLOAD once the sandbox goes away.
    pub async fn unload(&self, instance: &PluginInstance) {
        if instance.state() == LifecycleState::Active {
            let _ = instance.transition_to(LifecycleState::Stopping);
        }

        self.release(instance).await;

        if instance.transition_to(LifecycleState::Unloaded).is_ok() {
            tracing::info!(
                plugin = %instance.id(),
                generation = instance.generation(),
                "Plugin unloaded"
            );
        }
    }

    /// Release sandbox, extraction directory and resource slot without
    /// touching the lifecycle state
    pub(crate) async fn release(&self, instance: &PluginInstance) {
        instance.release(self.stop_grace).await;
    }
}

/// `<id>-g<digits>`
fn is_generation_dir(name: &str) -> bool {
    name.rsplit_once("-g")
        .map(|(id, generation)| {
            !id.is_empty()
                && !generation.is_empty()
                && generation.chars().all(|c| c.is_ascii_digit())
        })
        .unwrap_or(false)
}

async fn blocking<T, F>(f: F) -> Result<T, LoadError>
where
    F: FnOnce() -> Result<T, LoadError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LoadError::Io(format!("blocking task failed: {e}")))?
}
