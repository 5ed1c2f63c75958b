//! Resource handle registry - locally known sandboxes and their cached state.
//!
//! The registry is a cache; the backend is the final arbiter of truth. Each
//! sandbox ID maps to its own async mutex so that state-changing calls for
//! one sandbox (extend timeout, kill) are serialized end to end, while
//! calls against different sandboxes proceed independently.
//!
//! Dead handles are remembered for a retention window so repeated calls on
//! them are answered locally. After that they are swept, and the backend
//! answers for them again.

use crate::context::{CodeContext, ContextId};
use crate::error::CoreError;
use crate::sandbox::{Sandbox, SandboxId, SandboxState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Why a handle is no longer usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tombstone {
    /// Killed through this client.
    Killed,
    /// The backend reported the sandbox as missing or stopped.
    Gone,
    /// The cached expiry passed without an extension.
    Expired,
}

/// Cached record for one sandbox.
#[derive(Debug, Default)]
pub(crate) struct Entry {
    pub sandbox: Option<Sandbox>,
    pub tombstone: Option<Tombstone>,
    pub contexts: HashMap<ContextId, CodeContext>,
    context_locks: HashMap<ContextId, Arc<Mutex<()>>>,
    buried_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// Execution lock for a context, created on first use.
    pub fn context_lock(&mut self, id: &ContextId) -> Arc<Mutex<()>> {
        Arc::clone(self.context_locks.entry(id.clone()).or_default())
    }

    /// Drop a context and its lock.
    pub fn forget_context(&mut self, id: &ContextId) {
        self.contexts.remove(id);
        self.context_locks.remove(id);
    }

    /// Record a fresh snapshot from the backend.
    ///
    /// Tombstones are final; a stale snapshot never revives a handle.
    pub fn observe(&mut self, sandbox: Sandbox) {
        if self.tombstone.is_some() {
            return;
        }
        let terminal = sandbox.state.is_terminal();
        self.sandbox = Some(sandbox);
        if terminal {
            self.bury(Tombstone::Gone);
        }
    }

    /// Mark the handle unusable and drop its contexts.
    pub fn bury(&mut self, reason: Tombstone) {
        if self.tombstone != Some(Tombstone::Killed) {
            self.tombstone = Some(reason);
        }
        self.buried_at.get_or_insert_with(Utc::now);
        self.contexts.clear();
        self.context_locks.clear();
        if let Some(sandbox) = self.sandbox.as_mut() {
            if !sandbox.state.is_terminal() {
                sandbox.state = SandboxState::Stopped;
            }
            if sandbox.ended_at.is_none() {
                sandbox.ended_at = Some(Utc::now());
            }
        }
    }

    /// Apply the cached expiry, burying the handle if it has passed.
    fn refresh_expiry(&mut self, now: DateTime<Utc>) {
        let expired = self.tombstone.is_none()
            && self.sandbox.as_ref().is_some_and(|s| s.is_expired_at(now));
        if expired {
            self.bury(Tombstone::Expired);
        }
    }

    /// Whether the entry carries nothing worth keeping.
    fn is_stale(&self, now: DateTime<Utc>, retention: ChronoDuration) -> bool {
        match self.buried_at {
            Some(at) => now - at >= retention,
            None => {
                self.sandbox.is_none()
                    && self.tombstone.is_none()
                    && self.contexts.is_empty()
                    && self.context_locks.is_empty()
            }
        }
    }

    /// Fail if the handle is known to be unusable for execution calls.
    ///
    /// An entry with no snapshot is not known to be dead; the backend
    /// decides.
    pub fn check_usable(&mut self, id: &SandboxId, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.refresh_expiry(now);
        match self.tombstone {
            Some(Tombstone::Expired) => Err(CoreError::Expired(id.clone())),
            Some(Tombstone::Killed | Tombstone::Gone) => Err(CoreError::SandboxNotFound(id.clone())),
            None => Ok(()),
        }
    }

    /// Fail with `InvalidState` unless the handle may still be running.
    pub fn check_running(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.refresh_expiry(now);
        if self.tombstone.is_some() {
            let actual = self
                .sandbox
                .as_ref()
                .map(|s| s.state)
                .unwrap_or(SandboxState::Stopped);
            return Err(CoreError::invalid_state("Running", actual));
        }
        match self.sandbox.as_ref().map(|s| s.state) {
            Some(SandboxState::Running) | None => Ok(()),
            Some(other) => Err(CoreError::invalid_state("Running", other)),
        }
    }
}

/// How long a dead handle is remembered before it is swept.
pub const DEFAULT_TOMBSTONE_RETENTION_SECS: i64 = 600;

/// Registry of sandbox handles known to this client.
#[derive(Debug)]
pub struct Registry {
    entries: RwLock<HashMap<SandboxId, Arc<Mutex<Entry>>>>,
    retention: ChronoDuration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_retention(ChronoDuration::seconds(DEFAULT_TOMBSTONE_RETENTION_SECS))
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that forgets dead handles after `retention`.
    pub fn with_retention(retention: ChronoDuration) -> Self {
        Self {
            entries: RwLock::default(),
            retention,
        }
    }

    /// Lock the entry for `id`, creating an empty one if needed.
    ///
    /// The guard serializes all local updates for this sandbox.
    pub(crate) async fn lock(&self, id: &SandboxId) -> OwnedMutexGuard<Entry> {
        let existing = self.entries.read().await.get(id).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut entries = self.entries.write().await;
                self.sweep(&mut entries);
                Arc::clone(entries.entry(id.clone()).or_default())
            }
        };
        tracing::trace!(sandbox_id = %id, "Locking registry entry");
        entry.lock_owned().await
    }

    /// Drop entries nobody holds that are empty or past retention.
    fn sweep(&self, entries: &mut HashMap<SandboxId, Arc<Mutex<Entry>>>) {
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, entry| {
            // Anyone holding a clone may still write to the entry.
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.try_lock() {
                Ok(mut guard) => {
                    guard.refresh_expiry(now);
                    !guard.is_stale(now, self.retention)
                }
                Err(_) => true,
            }
        });
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, "Swept stale sandbox handles");
        }
    }

    /// Record a snapshot from the backend.
    pub(crate) async fn observe(&self, sandbox: Sandbox) {
        let id = sandbox.id.clone();
        self.lock(&id).await.observe(sandbox);
    }

    /// Mark a handle unusable.
    pub(crate) async fn bury(&self, id: &SandboxId, reason: Tombstone) {
        tracing::debug!(sandbox_id = %id, reason = ?reason, "Burying sandbox handle");
        self.lock(id).await.bury(reason);
    }

    /// Fail if the handle is known to be dead or expired.
    pub(crate) async fn check_usable(&self, id: &SandboxId) -> Result<(), CoreError> {
        self.lock(id).await.check_usable(id, Utc::now())
    }

    /// Last cached snapshot of a sandbox, if any.
    pub async fn cached(&self, id: &SandboxId) -> Option<Sandbox> {
        let entry = self.entries.read().await.get(id).cloned()?;
        let guard = entry.lock().await;
        guard.sandbox.clone()
    }

    /// Why a handle is unusable, if it is.
    pub async fn tombstone(&self, id: &SandboxId) -> Option<Tombstone> {
        let entry = self.entries.read().await.get(id).cloned()?;
        let mut guard = entry.lock().await;
        guard.refresh_expiry(Utc::now());
        guard.tombstone
    }

    /// IDs of every sandbox this client has seen.
    pub async fn known_ids(&self) -> Vec<SandboxId> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Contexts currently tracked for a sandbox.
    pub async fn contexts(&self, id: &SandboxId) -> Vec<CodeContext> {
        match self.entries.read().await.get(id).cloned() {
            Some(entry) => entry.lock().await.contexts.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Forget every handle that is no longer usable.
    pub async fn prune(&self) -> usize {
        let now = Utc::now();
        let entries: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut dead = Vec::new();
        for (id, entry) in entries {
            let mut guard = entry.lock().await;
            guard.refresh_expiry(now);
            if guard.tombstone.is_some() {
                dead.push(id);
            }
        }

        let mut map = self.entries.write().await;
        for id in &dead {
            map.remove(id);
        }
        tracing::debug!(pruned = dead.len(), "Pruned dead sandbox handles");
        dead.len()
    }
}
