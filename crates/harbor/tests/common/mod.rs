#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::watch;

use harbor::loader::{LoadError, PluginLoader};
use harbor::registry::{Registry, RegistryConfig};
use harbor::sandbox::{LaunchSpec, Sandbox, SandboxError, SandboxLauncher};

/// Write `<dir>/<id>.zip` with a manifest declaring `capabilities`
pub fn write_archive(dir: &Path, id: &str, version: &str, capabilities: &[&str]) -> PathBuf {
    let caps = capabilities
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let manifest = format!(
        "name = \"{id}\"\nversion = \"{version}\"\nentry = \"bin/run\"\ncapabilities = [{caps}]\n\n[invocation]\nmode = \"parallel\"\nmax_concurrency = 4\n"
    );
    write_zip(
        &dir.join(format!("{id}.zip")),
        &[
            ("plugin.toml", manifest.as_bytes()),
            ("bin/run", b"#!/bin/sh\n"),
        ],
    )
}

pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) -> PathBuf {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().unix_permissions(0o755);
    for (name, contents) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();
    path.to_path_buf()
}

/// In-memory archive bytes, for uploads
pub fn archive_bytes(id: &str, version: &str, capabilities: &[&str]) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = write_archive(dir.path(), id, version, capabilities);
    std::fs::read(path).unwrap()
}

/// Launcher whose sandboxes run in-process
///
/// Capabilities behave by prefix:
/// - `slow*`: sleeps for the payload's number of milliseconds, aborted on shutdown
/// - `boom*`: fails with a plugin error
/// - `crash*`: the sandbox dies
/// - `version*`: replies with the plugin version
/// - anything else echoes the payload
#[derive(Default)]
pub struct FakeLauncher {
    pub launched: AtomicUsize,
    pub shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn Sandbox>, LoadError> {
        assert!(spec.root.join(&spec.descriptor.entry).exists());
        self.launched.fetch_add(1, Ordering::SeqCst);
        let (stopping, _) = watch::channel(false);
        Ok(Box::new(FakeSandbox {
            version: spec.descriptor.version.clone(),
            alive: AtomicBool::new(true),
            stopping,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

pub struct FakeSandbox {
    version: String,
    alive: AtomicBool,
    stopping: watch::Sender<bool>,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn invoke(&self, capability: &str, payload: Bytes) -> Result<Bytes, SandboxError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SandboxError::Exited);
        }
        if capability.starts_with("slow") {
            let ms: u64 = std::str::from_utf8(&payload)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(100);
            let mut stopping = self.stopping.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(payload),
                _ = stopping.wait_for(|s| *s) => Err(SandboxError::Aborted),
            }
        } else if capability.starts_with("boom") {
            Err(SandboxError::Plugin("boom".into()))
        } else if capability.starts_with("crash") {
            self.alive.store(false, Ordering::SeqCst);
            Err(SandboxError::Exited)
        } else if capability.starts_with("version") {
            Ok(Bytes::from(self.version.clone()))
        } else {
            Ok(payload)
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self, _grace: Duration) {
        if !self.stopping.send_replace(true) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub launcher: Arc<FakeLauncher>,
    pub registry: Arc<Registry>,
}

impl Harness {
    pub fn plugins_dir(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    /// Number of generation directories left in the work directory
    pub fn extracted(&self) -> usize {
        std::fs::read_dir(self.work_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub async fn harness() -> Harness {
    harness_with(RegistryConfig {
        drain_grace: Duration::from_millis(300),
        max_abandoned: 2,
    })
    .await
}

pub async fn harness_with(config: RegistryConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let loader = PluginLoader::new(
        dir.path().join("plugins"),
        dir.path().join("work"),
        launcher.clone(),
    )
    .with_stop_grace(Duration::from_millis(100));
    let registry = Arc::new(Registry::new(loader, config));
    registry.initialize().await.unwrap();

    Harness {
        dir,
        launcher,
        registry,
    }
}
