//! Plugin Registry - the authoritative table of known plugins
//!
//! Every lifecycle transition goes through here. Two kinds of locks are
//! involved:
//!
//! - each plugin slot has an async `transitions` mutex, so load, activate,
//!   deactivate and unload of one plugin never interleave while different
//!   plugins proceed independently;
//! - the capability table sits behind one `RwLock`. `resolve` takes it for
//!   reading, capability ownership changes and drain-start take it for
//!   writing. It is never held across an await.
//!
//! Because a lease is only granted under the read lock and only on an ACTIVE
//! instance, no invocation can reach an instance after it began draining.

mod instance;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub use instance::{InvocationCounters, InvocationError, InvocationLease, PluginInstance};

use crate::loader::{ArchiveCandidate, LoadError, PluginDescriptor, PluginLoader};
use crate::types::LifecycleState;

/// Errors surfaced synchronously to the control plane
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("capability '{capability}' is already served by '{holder}'")]
    AlreadyActive { capability: String, holder: String },

    #[error("capability '{0}' has no active plugin")]
    CapabilityInactive(String),

    #[error("capability '{0}' not found")]
    CapabilityNotFound(String),

    #[error("plugin '{id}' cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::AlreadyActive { .. } => "ALREADY_ACTIVE",
            RegistryError::CapabilityInactive(_) => "CAPABILITY_INACTIVE",
            RegistryError::CapabilityNotFound(_) => "CAPABILITY_NOT_FOUND",
            RegistryError::InvalidTransition { .. } => "INVALID_TRANSITION",
            RegistryError::Load(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a draining instance may finish in-flight work before its
    /// sandbox is stopped anyway
    pub drain_grace: Duration,
    /// Timed-out invocations an instance may accumulate before it is failed
    pub max_abandoned: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(5),
            max_abandoned: 8,
        }
    }
}

/// Outcome of [`Registry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Registration {
    Added,
    Updated,
    Unchanged,
}

/// Outcome of a discovery pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Point-in-time view of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub id: String,
    pub state: LifecycleState,
    pub generation: Option<u64>,
    pub staged_generation: Option<u64>,
    pub archive: PathBuf,
    pub fingerprint: String,
    pub descriptor: Option<PluginDescriptor>,
    pub registered_at: DateTime<Utc>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub counters: InvocationCounters,
    pub last_error: Option<String>,
}

/// Health report of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    pub id: String,
    pub state: LifecycleState,
    pub generation: Option<u64>,
    pub alive: bool,
    pub pid: Option<u32>,
    pub activated_at: Option<DateTime<Utc>>,
    pub uptime_ms: Option<u64>,
    pub in_flight: usize,
    pub counters: InvocationCounters,
    pub last_error: Option<String>,
}

/// Which instance currently serves a capability
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRoute {
    pub capability: String,
    pub plugin: String,
    pub generation: u64,
}

struct PluginSlot {
    id: String,
    transitions: tokio::sync::Mutex<()>,
    data: Mutex<SlotData>,
}

struct SlotData {
    archive: ArchiveCandidate,
    descriptor: Option<Arc<PluginDescriptor>>,
    /// Generation serving (or about to serve) the plugin
    current: Option<Arc<PluginInstance>>,
    /// Replacement generation waiting for `activate`
    staged: Option<Arc<PluginInstance>>,
    /// Reported while there is no current instance
    idle_state: LifecycleState,
    last_error: Option<String>,
    registered_at: DateTime<Utc>,
    removed: bool,
}

impl SlotData {
    fn state(&self) -> LifecycleState {
        self.current
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(self.idle_state)
    }

    fn instances(&self) -> impl Iterator<Item = &Arc<PluginInstance>> {
        self.current.iter().chain(self.staged.iter())
    }
}

impl PluginSlot {
    fn new(archive: ArchiveCandidate) -> Self {
        Self {
            id: archive.id.clone(),
            transitions: tokio::sync::Mutex::new(()),
            data: Mutex::new(SlotData {
                archive,
                descriptor: None,
                current: None,
                staged: None,
                idle_state: LifecycleState::Discovered,
                last_error: None,
                registered_at: Utc::now(),
                removed: false,
            }),
        }
    }

    /// Fails once the slot was purged while the caller waited for it
    fn ensure_present(&self) -> Result<()> {
        if self.data.lock().removed {
            return Err(RegistryError::NotFound(self.id.clone()));
        }
        Ok(())
    }

    fn record_error(&self, message: impl Into<String>) {
        self.data.lock().last_error = Some(message.into());
    }

    fn snapshot(&self) -> PluginSnapshot {
        let data = self.data.lock();
        let current = data.current.as_ref();

        PluginSnapshot {
            id: self.id.clone(),
            state: data.state(),
            generation: current.map(|c| c.generation()),
            staged_generation: data.staged.as_ref().map(|s| s.generation()),
            archive: data.archive.path.clone(),
            fingerprint: data.archive.fingerprint.clone(),
            descriptor: data.descriptor.as_deref().cloned(),
            registered_at: data.registered_at,
            loaded_at: current.map(|c| c.loaded_at()),
            activated_at: current.and_then(|c| c.activated_at()),
            in_flight: current.map(|c| c.in_flight()).unwrap_or(0),
            counters: current.map(|c| c.counters()).unwrap_or_default(),
            last_error: data.last_error.clone(),
        }
    }
}

#[derive(Default)]
struct CapabilityTable {
    /// Capability name to the one ACTIVE instance serving it
    active: HashMap<String, Arc<PluginInstance>>,
    /// Capability name to every loaded plugin declaring it
    declared: HashMap<String, BTreeSet<String>>,
}

impl CapabilityTable {
    fn release(&mut self, instance: &Arc<PluginInstance>) {
        self.active.retain(|_, held| !Arc::ptr_eq(held, instance));
    }

    fn declare(&mut self, id: &str, capabilities: &[String]) {
        self.undeclare(id);
        for capability in capabilities {
            self.declared
                .entry(capability.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn undeclare(&mut self, id: &str) {
        self.declared.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }
}

/// Authoritative in-memory table of plugins and capability ownership
pub struct Registry {
    loader: PluginLoader,
    config: RegistryConfig,
    slots: DashMap<String, Arc<PluginSlot>>,
    capabilities: RwLock<CapabilityTable>,
}

impl Registry {
    pub fn new(loader: PluginLoader, config: RegistryConfig) -> Self {
        Self {
            loader,
            config,
            slots: DashMap::new(),
            capabilities: RwLock::new(CapabilityTable::default()),
        }
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of sandboxes currently holding host resources
    pub fn live_sandboxes(&self) -> usize {
        self.loader.resources().live()
    }

    /// Prepare directories and run the first discovery pass
    pub async fn initialize(&self) -> Result<ScanReport> {
        self.loader.prepare().await?;
        self.rescan().await
    }

    fn slot(&self, id: &str) -> Result<Arc<PluginSlot>> {
        self.slots
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Add a DISCOVERED slot for `candidate`, or refresh the archive of an
    /// existing slot
    pub fn register(&self, candidate: ArchiveCandidate) -> Registration {
        match self.slots.entry(candidate.id.clone()) {
            Entry::Occupied(entry) => {
                let mut data = entry.get().data.lock();
                if data.archive.fingerprint == candidate.fingerprint
                    && data.archive.path == candidate.path
                {
                    return Registration::Unchanged;
                }
                tracing::info!(plugin = %candidate.id, "Archive changed: {}", candidate.path.display());
                data.archive = candidate;
                Registration::Updated
            }
            Entry::Vacant(entry) => {
                tracing::info!(plugin = %candidate.id, "Discovered plugin: {}", candidate.path.display());
                entry.insert(Arc::new(PluginSlot::new(candidate)));
                Registration::Added
            }
        }
    }

    /// Run discovery and reconcile the slots with the plugins directory
    ///
    /// Slots whose archive disappeared are forgotten unless they still have a
    /// loaded generation.
    pub async fn rescan(&self) -> Result<ScanReport> {
        let candidates = self.loader.discover().await?;
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();

        for candidate in candidates {
            let id = candidate.id.clone();
            match self.register(candidate) {
                Registration::Added => report.added.push(id.clone()),
                Registration::Updated => report.updated.push(id.clone()),
                Registration::Unchanged => report.unchanged += 1,
            }
            seen.insert(id);
        }

        let vanished: Vec<Arc<PluginSlot>> = self
            .slots
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        for slot in vanished {
            let Ok(_op) = slot.transitions.try_lock() else {
                continue;
            };
            {
                let mut data = slot.data.lock();
                if data.instances().next().is_some() {
                    tracing::debug!(plugin = %slot.id, "Archive removed but plugin still loaded");
                    continue;
                }
                data.removed = true;
            }
            self.forget(&slot.id);
            report.removed.push(slot.id.clone());
        }

        if !report.is_empty() {
            tracing::info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "Plugin directory rescanned"
            );
        }

        Ok(report)
    }

    fn forget(&self, id: &str) {
        self.slots.remove(id);
        self.capabilities.write().undeclare(id);
        tracing::info!(plugin = %id, "Plugin forgotten");
    }

    /// Store an uploaded archive in the plugins directory and register it
    pub async fn install(&self, file_name: &str, contents: bytes::Bytes) -> Result<ArchiveCandidate> {
        let candidate = self.loader.install(file_name, contents).await?;
        self.register(candidate.clone());
        Ok(candidate)
    }

    /// Validate the archive and start a new generation in LOADING
    ///
    /// Without `replace`, a plugin that already has a LOADING or ACTIVE
    /// generation is rejected with CAPABILITY_CONFLICT. With `replace`, a
    /// LOADING generation is discarded and an ACTIVE one keeps serving while
    /// the new generation is staged for [`activate`](Self::activate).
    pub async fn load(&self, id: &str, replace: bool) -> Result<PluginSnapshot> {
        let slot = self.slot(id)?;
        let _op = slot.transitions.lock().await;
        slot.ensure_present()?;

        let (archive, live) = {
            let data = slot.data.lock();
            let live = data
                .instances()
                .find(|i| matches!(i.state(), LifecycleState::Loading | LifecycleState::Active))
                .cloned();
            (data.archive.path.clone(), live)
        };

        if let (Some(live), false) = (&live, replace) {
            return Err(LoadError::CapabilityConflict(format!(
                "plugin '{id}' already has generation {} in {}; load with replace to swap it",
                live.generation(),
                live.state()
            ))
            .into());
        }

        let candidate = match self.loader.candidate(&archive).await {
            Ok(candidate) => candidate,
            Err(e) => {
                slot.record_error(e.to_string());
                return Err(e.into());
            }
        };
        slot.data.lock().archive = candidate.clone();

        let descriptor = match self.loader.read_descriptor(&candidate).await {
            Ok(descriptor) => Arc::new(descriptor),
            Err(e) => {
                slot.record_error(e.to_string());
                return Err(e.into());
            }
        };

        let instance = match self.loader.load(descriptor.clone()).await {
            Ok(instance) => instance,
            Err(e) => {
                let mut data = slot.data.lock();
                data.last_error = Some(e.to_string());
                if data.current.is_none() {
                    data.idle_state = LifecycleState::Failed;
                }
                return Err(e.into());
            }
        };

        let discarded = {
            let mut data = slot.data.lock();
            data.descriptor = Some(descriptor.clone());
            data.last_error = None;

            let serving = data
                .current
                .as_ref()
                .map(|c| c.state() == LifecycleState::Active)
                .unwrap_or(false);

            if serving {
                data.staged.replace(instance.clone())
            } else {
                data.current.replace(instance.clone())
            }
        };

        self.capabilities
            .write()
            .declare(id, &descriptor.capabilities);

        if let Some(old) = discarded {
            tracing::info!(
                plugin = %id,
                generation = old.generation(),
                "Discarding superseded generation"
            );
            self.capabilities.write().release(&old);
            self.loader.unload(&old).await;
        }

        Ok(slot.snapshot())
    }

    /// LOADING -> ACTIVE
    ///
    /// With a staged generation, ownership of the capabilities moves from the
    /// serving generation to the staged one in a single table update; the old
    /// generation is then drained and unloaded.
    pub async fn activate(&self, id: &str) -> Result<PluginSnapshot> {
        let slot = self.slot(id)?;
        let _op = slot.transitions.lock().await;
        slot.ensure_present()?;

        let (incoming, retiring) = {
            let data = slot.data.lock();
            match (&data.current, &data.staged) {
                (current, Some(staged)) => (
                    staged.clone(),
                    current
                        .as_ref()
                        .filter(|c| c.state() == LifecycleState::Active)
                        .cloned(),
                ),
                (Some(current), None) if current.state() == LifecycleState::Loading => {
                    (current.clone(), None)
                }
                (Some(current), None) if current.state() == LifecycleState::Active => {
                    return Err(RegistryError::AlreadyActive {
                        capability: current
                            .descriptor()
                            .capabilities
                            .first()
                            .cloned()
                            .unwrap_or_default(),
                        holder: id.to_string(),
                    });
                }
                _ => {
                    return Err(RegistryError::InvalidTransition {
                        id: id.to_string(),
                        from: data.state(),
                        to: LifecycleState::Active,
                    })
                }
            }
        };

        self.claim(&incoming, retiring.as_ref())?;

        {
            let mut data = slot.data.lock();
            data.current = Some(incoming.clone());
            data.staged = None;
            data.last_error = None;
        }

        tracing::info!(
            plugin = %id,
            generation = incoming.generation(),
            capabilities = ?incoming.descriptor().capabilities,
            "Plugin activated"
        );

        if let Some(old) = retiring {
            self.drain(&old).await;
        }

        Ok(slot.snapshot())
    }

    /// Hand every capability of `incoming` to it, taking them away from
    /// `retiring` in the same critical section
    fn claim(
        &self,
        incoming: &Arc<PluginInstance>,
        retiring: Option<&Arc<PluginInstance>>,
    ) -> Result<()> {
        let mut table = self.capabilities.write();
        let capabilities = &incoming.descriptor().capabilities;

        for capability in capabilities {
            if let Some(holder) = table.active.get(capability) {
                let handing_over = retiring.map(|r| Arc::ptr_eq(r, holder)).unwrap_or(false);
                if !handing_over {
                    return Err(RegistryError::AlreadyActive {
                        capability: capability.clone(),
                        holder: holder.id().to_string(),
                    });
                }
            }
        }

        incoming
            .transition_to(LifecycleState::Active)
            .map_err(|from| RegistryError::InvalidTransition {
                id: incoming.id().to_string(),
                from,
                to: LifecycleState::Active,
            })?;

        if let Some(old) = retiring {
            let _ = old.transition_to(LifecycleState::Stopping);
            table.release(old);
        }
        for capability in capabilities {
            table.active.insert(capability.clone(), incoming.clone());
        }

        Ok(())
    }

    /// ACTIVE -> STOPPING under the table lock, so no lease is granted from
    /// here on
    fn begin_drain(&self, instance: &Arc<PluginInstance>) -> Result<()> {
        let mut table = self.capabilities.write();
        instance
            .transition_to(LifecycleState::Stopping)
            .map_err(|from| RegistryError::InvalidTransition {
                id: instance.id().to_string(),
                from,
                to: LifecycleState::Stopping,
            })?;
        table.release(instance);
        Ok(())
    }

    /// Wait for in-flight invocations of a STOPPING instance, then unload it
    async fn drain(&self, instance: &Arc<PluginInstance>) {
        if !instance.wait_idle(self.config.drain_grace).await {
            tracing::warn!(
                plugin = %instance.id(),
                generation = instance.generation(),
                in_flight = instance.in_flight(),
                "Drain grace period expired, aborting in-flight invocations"
            );
        }
        self.loader.unload(instance).await;
    }

    /// ACTIVE -> STOPPING -> UNLOADED
    ///
    /// A staged generation, if any, becomes the current LOADING one.
    pub async fn deactivate(&self, id: &str) -> Result<PluginSnapshot> {
        let slot = self.slot(id)?;
        let _op = slot.transitions.lock().await;
        slot.ensure_present()?;

        let instance = {
            let data = slot.data.lock();
            match &data.current {
                Some(current) if current.state() == LifecycleState::Active => current.clone(),
                _ => {
                    return Err(RegistryError::InvalidTransition {
                        id: id.to_string(),
                        from: data.state(),
                        to: LifecycleState::Stopping,
                    })
                }
            }
        };

        self.begin_drain(&instance)?;
        tracing::info!(plugin = %id, generation = instance.generation(), "Deactivating plugin");
        self.drain(&instance).await;

        {
            let mut data = slot.data.lock();
            if data
                .current
                .as_ref()
                .map(|c| Arc::ptr_eq(c, &instance))
                .unwrap_or(false)
            {
                data.idle_state = instance.state();
                data.current = data.staged.take();
            }
        }

        Ok(slot.snapshot())
    }

    /// Stop and release every generation of the plugin
    ///
    /// With `purge` the archive is deleted and the slot forgotten.
    pub async fn unload(&self, id: &str, purge: bool) -> Result<PluginSnapshot> {
        let slot = self.slot(id)?;
        let _op = slot.transitions.lock().await;
        slot.ensure_present()?;

        let (current, staged) = {
            let data = slot.data.lock();
            (data.current.clone(), data.staged.clone())
        };

        let mut final_state = None;
        for instance in [current, staged].into_iter().flatten() {
            if instance.state() == LifecycleState::Active && self.begin_drain(&instance).is_ok() {
                self.drain(&instance).await;
            } else {
                self.capabilities.write().release(&instance);
                self.loader.unload(&instance).await;
            }
            final_state.get_or_insert(instance.state());
        }

        {
            let mut data = slot.data.lock();
            data.current = None;
            data.staged = None;
            if let Some(state) = final_state {
                data.idle_state = state;
            }
            if purge {
                data.removed = true;
            }
        }
        let snapshot = slot.snapshot();

        if purge {
            self.forget(id);
            if let Err(e) = tokio::fs::remove_file(&snapshot.archive).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(LoadError::io(&snapshot.archive, e).into());
                }
            }
            tracing::info!(plugin = %id, "Plugin purged: {}", snapshot.archive.display());
        }

        Ok(snapshot)
    }

    /// Load with replace, then activate
    pub async fn reload(&self, id: &str) -> Result<PluginSnapshot> {
        self.load(id, true).await?;
        self.activate(id).await
    }

    /// Resolve a capability to a lease on its ACTIVE instance
    pub fn resolve(&self, capability: &str) -> Result<InvocationLease> {
        let table = self.capabilities.read();

        if let Some(instance) = table.active.get(capability) {
            if instance.state() == LifecycleState::Active {
                return Ok(InvocationLease::new(instance.clone(), capability));
            }
        }

        if table.declared.contains_key(capability) {
            Err(RegistryError::CapabilityInactive(capability.to_string()))
        } else {
            Err(RegistryError::CapabilityNotFound(capability.to_string()))
        }
    }

    /// Snapshot of every known plugin, ordered by id
    pub fn list(&self) -> Vec<PluginSnapshot> {
        let mut slots: Vec<Arc<PluginSlot>> =
            self.slots.iter().map(|entry| entry.value().clone()).collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        slots.iter().map(|slot| slot.snapshot()).collect()
    }

    pub fn snapshot(&self, id: &str) -> Result<PluginSnapshot> {
        Ok(self.slot(id)?.snapshot())
    }

    pub fn health(&self, id: &str) -> Result<PluginHealth> {
        let slot = self.slot(id)?;
        let data = slot.data.lock();
        let current = data.current.as_ref();

        Ok(PluginHealth {
            id: slot.id.clone(),
            state: data.state(),
            generation: current.map(|c| c.generation()),
            alive: current.map(|c| c.is_alive()).unwrap_or(false),
            pid: current.and_then(|c| c.pid()),
            activated_at: current.and_then(|c| c.activated_at()),
            uptime_ms: current
                .and_then(|c| c.uptime())
                .map(|d| d.as_millis() as u64),
            in_flight: current.map(|c| c.in_flight()).unwrap_or(0),
            counters: current.map(|c| c.counters()).unwrap_or_default(),
            last_error: data.last_error.clone(),
        })
    }

    /// Capabilities with an ACTIVE instance, ordered by name
    pub fn routes(&self) -> Vec<CapabilityRoute> {
        let table = self.capabilities.read();
        let mut routes: Vec<CapabilityRoute> = table
            .active
            .iter()
            .map(|(capability, instance)| CapabilityRoute {
                capability: capability.clone(),
                plugin: instance.id().to_string(),
                generation: instance.generation(),
            })
            .collect();
        routes.sort_by(|a, b| a.capability.cmp(&b.capability));
        routes
    }

    /// Move one generation to FAILED and release it
    ///
    /// Does not wait for the plugin's transition lock, so a hung drain cannot
    /// delay it. Returns false when the generation is unknown or already
    /// terminal.
    pub async fn fail(&self, id: &str, generation: u64, reason: &str) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let instance = {
            let data = slot.data.lock();
            let found = data
                .instances()
                .find(|i| i.generation() == generation)
                .cloned();
            found
        };
        let Some(instance) = instance else {
            return false;
        };

        {
            let mut table = self.capabilities.write();
            if instance.transition_to(LifecycleState::Failed).is_err() {
                return false;
            }
            table.release(&instance);
        }

        tracing::error!(plugin = %id, generation, "Plugin failed: {}", reason);

        {
            let mut data = slot.data.lock();
            data.last_error = Some(reason.to_string());
            if data
                .current
                .as_ref()
                .map(|c| Arc::ptr_eq(c, &instance))
                .unwrap_or(false)
            {
                data.current = None;
                data.idle_state = LifecycleState::Failed;
            } else if data
                .staged
                .as_ref()
                .map(|s| Arc::ptr_eq(s, &instance))
                .unwrap_or(false)
            {
                data.staged = None;
            }
        }

        self.loader.release(&instance).await;
        true
    }

    /// Fail every LOADING or ACTIVE instance whose sandbox died on its own
    pub async fn reap_faulted(&self) -> Vec<String> {
        let dead: Vec<(String, u64)> = self
            .slots
            .iter()
            .flat_map(|entry| {
                let data = entry.value().data.lock();
                let dead: Vec<_> = data
                    .instances()
                    .filter(|i| {
                        matches!(i.state(), LifecycleState::Loading | LifecycleState::Active)
                            && !i.is_alive()
                    })
                    .map(|i| (i.id().to_string(), i.generation()))
                    .collect();
                dead
            })
            .collect();

        let mut failed = Vec::new();
        for (id, generation) in dead {
            if self
                .fail(&id, generation, "plugin process exited unexpectedly")
                .await
            {
                failed.push(id);
            }
        }
        failed
    }

    /// Account for a failed invocation
    ///
    /// Fatal failures fail the instance right away. Timeouts fail it once
    /// more than `max_abandoned` invocations were abandoned.
    pub async fn report_failure(&self, instance: &Arc<PluginInstance>, error: &InvocationError) {
        let timeouts = instance.counters().timeouts;
        let reason = match error {
            e if e.is_fatal() => Some(e.to_string()),
            InvocationError::Timeout(_) if timeouts > self.config.max_abandoned => Some(format!(
                "{timeouts} invocations abandoned after timing out"
            )),
            _ => None,
        };

        match reason {
            Some(reason) => {
                self.fail(instance.id(), instance.generation(), &reason).await;
            }
            None => {
                if let Ok(slot) = self.slot(instance.id()) {
                    slot.record_error(error.to_string());
                }
            }
        }
    }

    /// Load and activate every plugin that is not running yet
    pub async fn autoload(&self) {
        for snapshot in self.list() {
            if !matches!(
                snapshot.state,
                LifecycleState::Discovered | LifecycleState::Unloaded
            ) {
                continue;
            }
            if let Err(e) = self.load(&snapshot.id, false).await {
                tracing::warn!(plugin = %snapshot.id, "Autoload failed: {}", e);
                continue;
            }
            if let Err(e) = self.activate(&snapshot.id).await {
                tracing::warn!(plugin = %snapshot.id, "Autoload activation failed: {}", e);
            }
        }
    }

    /// Unload every plugin; used at process exit
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        tracing::info!("Unloading {} plugin(s)", ids.len());

        let unloads = ids.iter().map(|id| self.unload(id, false));
        for (id, result) in ids.iter().zip(futures::future::join_all(unloads).await) {
            if let Err(e) = result {
                tracing::warn!(plugin = %id, "Unload during shutdown failed: {}", e);
            }
        }
    }
}
