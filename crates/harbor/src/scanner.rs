//! Plugin directory scanner
//!
//! Re-runs discovery on a fixed interval and whenever the file system reports
//! a change to an archive in the plugins directory. Discovery only registers
//! archives; nothing is loaded or activated from here. The scanner also
//! reaps instances whose process died on its own.

use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::loader::archive::is_archive;
use crate::registry::Registry;

/// File events arrive in bursts while an archive is being written
const DEBOUNCE: Duration = Duration::from_millis(250);

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Background discovery task
pub struct PluginScanner {
    registry: Arc<Registry>,
    interval: Duration,
    /// Coalesced change notifications from the watcher
    rx: Option<mpsc::Receiver<()>>,
    /// The underlying watcher (kept alive)
    _watcher: Option<RecommendedWatcher>,
}

impl PluginScanner {
    /// Scanner that only polls every `interval`
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            rx: None,
            _watcher: None,
        }
    }

    /// Also rescan as soon as an archive changes on disk
    pub fn watch(mut self) -> Result<Self, notify::Error> {
        let plugins_dir = self.registry.loader().plugins_dir();
        let plugins_dir = plugins_dir
            .canonicalize()
            .unwrap_or_else(|_| plugins_dir.to_path_buf());
        let (tx, rx) = mpsc::channel(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if is_relevant(&event) {
                        // A full channel already carries a pending rescan
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            }
        })?;

        watcher.watch(&plugins_dir, RecursiveMode::NonRecursive)?;
        info!("Watching plugins directory: {}", plugins_dir.display());

        self.rx = Some(rx);
        self._watcher = Some(watcher);
        Ok(self)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the scanner loop
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            watching = self._watcher.is_some(),
            "Starting plugin scanner"
        );

        let mut scan = tokio::time::interval(self.interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Both intervals fire immediately; the registry was just scanned
        scan.tick().await;
        reap.tick().await;

        loop {
            tokio::select! {
                _ = scan.tick() => self.scan_once().await,
                _ = reap.tick() => self.reap().await,
                _ = changed(&mut self.rx) => {
                    tokio::time::sleep(DEBOUNCE).await;
                    if let Some(rx) = self.rx.as_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                    debug!("Plugins directory changed");
                    self.scan_once().await;
                }
            }
        }
    }

    /// One discovery pass followed by a reap
    pub async fn scan_once(&self) {
        if let Err(e) = self.registry.rescan().await {
            warn!("Plugin rescan failed: {}", e);
        }
        self.reap().await;
    }

    async fn reap(&self) {
        let failed = self.registry.reap_faulted().await;
        if !failed.is_empty() {
            warn!(plugins = ?failed, "Reaped plugins whose process exited");
        }
    }
}

async fn changed(rx: &mut Option<mpsc::Receiver<()>>) {
    match rx {
        Some(receiver) => {
            if receiver.recv().await.is_none() {
                *rx = None;
            }
        }
        None => std::future::pending().await,
    }
}

/// Creations, modifications and removals of archive files
fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| is_archive(p))
}
