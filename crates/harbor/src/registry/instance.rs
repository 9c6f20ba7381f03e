use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};

use crate::loader::PluginDescriptor;
use crate::sandbox::{ResourceGuard, Sandbox, SandboxError};
use crate::types::LifecycleState;

/// Failure of a routed invocation
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvocationError {
    #[error("invocation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("invocation failed: {message}")]
    Failed { message: String, fatal: bool },

    #[error("plugin was unloaded while the invocation was in flight")]
    AbortedDuringUnload,
}

impl InvocationError {
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::Timeout(_) => "INVOCATION_TIMEOUT",
            InvocationError::Failed { .. } => "INVOCATION_FAILED",
            InvocationError::AbortedDuringUnload => "ABORTED_DURING_UNLOAD",
        }
    }

    /// Whether the failure means the instance itself is broken
    pub fn is_fatal(&self) -> bool {
        matches!(self, InvocationError::Failed { fatal: true, .. })
    }
}

impl From<SandboxError> for InvocationError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Aborted => InvocationError::AbortedDuringUnload,
            other => InvocationError::Failed {
                fatal: other.is_fatal(),
                message: other.to_string(),
            },
        }
    }
}

/// Per-instance invocation counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InvocationCounters {
    pub invocations: u64,
    pub failures: u64,
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct Stats {
    invocations: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// What an instance owns on the host besides its sandbox
struct Resources {
    root: PathBuf,
    _guard: ResourceGuard,
}

/// One generation of a plugin, bound to its sandbox
pub struct PluginInstance {
    descriptor: Arc<PluginDescriptor>,
    generation: u64,
    state: AtomicU8,
    sandbox: Box<dyn Sandbox>,
    resources: tokio::sync::Mutex<Option<Resources>>,
    limiter: Semaphore,
    in_flight: AtomicUsize,
    idle: Notify,
    stats: Stats,
    loaded_at: DateTime<Utc>,
    activated: Mutex<Option<(DateTime<Utc>, std::time::Instant)>>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.descriptor.id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl PluginInstance {
    pub(crate) fn new(
        descriptor: Arc<PluginDescriptor>,
        generation: u64,
        sandbox: Box<dyn Sandbox>,
        root: PathBuf,
        guard: ResourceGuard,
    ) -> Self {
        let permits = descriptor.invocation.permits().min(Semaphore::MAX_PERMITS);
        Self {
            descriptor,
            generation,
            state: AtomicU8::new(LifecycleState::Loading as u8),
            sandbox,
            resources: tokio::sync::Mutex::new(Some(Resources {
                root,
                _guard: guard,
            })),
            limiter: Semaphore::new(permits),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            stats: Stats::default(),
            loaded_at: Utc::now(),
            activated: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` if the state machine allows it from the current state
    ///
    /// Returns the previous state, or the current one on refusal.
    pub(crate) fn transition_to(
        &self,
        next: LifecycleState,
    ) -> Result<LifecycleState, LifecycleState> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = LifecycleState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(from);
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if next == LifecycleState::Active {
                        *self.activated.lock() = Some((Utc::now(), std::time::Instant::now()));
                    }
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.activated.lock().map(|(at, _)| at)
    }

    /// Time since activation, while the instance is ACTIVE
    pub fn uptime(&self) -> Option<Duration> {
        if self.state() != LifecycleState::Active {
            return None;
        }
        self.activated.lock().map(|(_, since)| since.elapsed())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> InvocationCounters {
        InvocationCounters {
            invocations: self.stats.invocations.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.sandbox.is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.sandbox.pid()
    }

    /// Whether the sandbox or extraction directory are still held
    pub fn has_live_resources(&self) -> bool {
        self.resources
            .try_lock()
            .map(|resources| resources.is_some())
            .unwrap_or(true)
    }

    /// Wait until no invocation is in flight, at most `grace`
    ///
    /// Returns false when the grace period ran out first.
    pub(crate) async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Stop the sandbox and free the extraction directory and resource slot
    ///
    /// Concurrent callers wait for the first one to finish.
    pub(crate) async fn release(&self, grace: Duration) {
        let mut resources = self.resources.lock().await;
        let Some(owned) = resources.take() else {
            return;
        };

        // Invocations still queued for a permit fail instead of reaching a
        // sandbox that is going away
        self.limiter.close();
        self.sandbox.shutdown(grace).await;

        if let Err(e) = tokio::fs::remove_dir_all(&owned.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    plugin = %self.descriptor.id,
                    generation = self.generation,
                    "Failed to remove {}: {}",
                    owned.root.display(),
                    e
                );
            }
        }
        drop(owned);

        tracing::debug!(
            plugin = %self.descriptor.id,
            generation = self.generation,
            "Instance resources released"
        );
    }
}

/// Permission to run invocations on one ACTIVE instance
///
/// Leases are handed out by the registry only while the instance is ACTIVE.
/// A draining instance waits for all of them to be dropped.
pub struct InvocationLease {
    instance: Arc<PluginInstance>,
    capability: String,
}

impl InvocationLease {
    pub(crate) fn new(instance: Arc<PluginInstance>, capability: &str) -> Self {
        instance.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            instance,
            capability: capability.to_string(),
        }
    }

    pub fn instance(&self) -> &Arc<PluginInstance> {
        &self.instance
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Forward `payload` to the sandbox, bounded by `timeout`
    ///
    /// The timeout covers waiting for an invocation permit as well.
    pub async fn invoke(&self, payload: Bytes, timeout: Duration) -> Result<Bytes, InvocationError> {
        let instance = &self.instance;
        instance.stats.invocations.fetch_add(1, Ordering::Relaxed);

        let call = async {
            let _permit = instance
                .limiter
                .acquire()
                .await
                .map_err(|_| InvocationError::AbortedDuringUnload)?;
            instance
                .sandbox
                .invoke(&self.capability, payload)
                .await
                .map_err(InvocationError::from)
        };

        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                instance.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(InvocationError::Timeout(timeout))
            }
        };

        if let Err(InvocationError::Failed { .. }) = &result {
            instance.stats.failures.fetch_add(1, Ordering::Relaxed);
        }

        result
    }
}

impl Drop for InvocationLease {
    fn drop(&mut self) {
        if self.instance.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.instance.idle.notify_waiters();
        }
    }
}
