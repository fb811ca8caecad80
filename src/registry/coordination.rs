//! Shared registry of task ownership, workspace location and status.
//!
//! Every operation on a single task is linearizable: the task's slot lock
//! is held across read, modify and durable write. Operations on different
//! tasks only contend for the short slot-map lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use crate::core::{TaskId, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use crate::registry::store::{JournalStore, MemoryStore, RegistryStore};
use crate::registry::{EntryUpdate, RegistryEntry};
use crate::{glog, glog_debug};

/// All attempts for one task, oldest first.
type Slot = Arc<Mutex<Vec<RegistryEntry>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Vec<RegistryEntry>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Filter for [`CoordinationRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub statuses: Vec<TaskStatus>,
    pub owner: Option<WorkerId>,
    pub include_archived: bool,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_owner(mut self, owner: WorkerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn including_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    fn matches(&self, entry: &RegistryEntry) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&entry.status))
            && self.owner.map_or(true, |owner| entry.owner == Some(owner))
    }
}

pub struct CoordinationRegistry {
    slots: RwLock<HashMap<TaskId, Slot>>,
    store: Box<dyn RegistryStore>,
    /// Writers hold this shared; compaction holds it exclusively so no
    /// append lands between its snapshot and the rewrite.
    compaction: RwLock<()>,
}

impl CoordinationRegistry {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: &Path) -> Result<Self> {
        glog!("Opening registry at {}", path.display());
        Self::with_store(Box::new(JournalStore::new(path)?))
    }

    /// Registry without durable storage.
    pub fn in_memory() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store: Box::new(MemoryStore::new()),
            compaction: RwLock::new(()),
        }
    }

    pub fn with_store(store: Box<dyn RegistryStore>) -> Result<Self> {
        let mut slots: HashMap<TaskId, Vec<RegistryEntry>> = HashMap::new();
        for entry in store.load()? {
            slots.entry(entry.task_id.clone()).or_default().push(entry);
        }
        for history in slots.values_mut() {
            history.sort_by_key(|e| e.attempt);
        }
        glog_debug!("Registry loaded {} tasks", slots.len());
        Ok(Self {
            slots: RwLock::new(
                slots
                    .into_iter()
                    .map(|(id, history)| (id, Arc::new(Mutex::new(history))))
                    .collect(),
            ),
            store,
            compaction: RwLock::new(()),
        })
    }

    fn slot(&self, task_id: &TaskId) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    fn slot_or_insert(&self, task_id: &TaskId) -> Slot {
        if let Some(slot) = self.slot(task_id) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id.clone())
            .or_default()
            .clone()
    }

    /// Record a new attempt. Fails with `Duplicate` while the task still
    /// has an active (non-archived) entry.
    pub fn register(&self, mut entry: RegistryEntry) -> Result<()> {
        let _shared = self.compaction.read().unwrap_or_else(|e| e.into_inner());
        let slot = self.slot_or_insert(&entry.task_id);
        let mut history = lock(&slot);

        if let Some(last) = history.last() {
            if last.is_active() {
                return Err(Error::Duplicate(format!(
                    "task {} is already registered (status {})",
                    entry.task_id, last.status
                )));
            }
            entry.attempt = entry.attempt.max(last.attempt + 1);
        }
        entry.archived = false;
        let now = Utc::now();
        entry.created_at = now;
        entry.updated_at = now;

        self.store.append(&entry)?;
        glog_debug!(
            "Registered {} attempt={} status={}",
            entry.task_id,
            entry.attempt,
            entry.status
        );
        history.push(entry);
        Ok(())
    }

    /// Atomically apply `update` to the task's active entry.
    pub fn update(&self, task_id: &TaskId, update: EntryUpdate) -> Result<RegistryEntry> {
        let _shared = self.compaction.read().unwrap_or_else(|e| e.into_inner());
        let slot = self
            .slot(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {} is not registered", task_id)))?;
        let mut history = lock(&slot);

        let current = history
            .last_mut()
            .filter(|e| e.is_active())
            .ok_or_else(|| Error::NotFound(format!("task {} has no active entry", task_id)))?;
        let next = update.apply_to(current)?;

        self.store.append(&next)?;
        if next.status != current.status {
            glog_debug!("Registry {}: {} -> {}", task_id, current.status, next.status);
        }
        *current = next.clone();
        Ok(next)
    }

    /// Latest entry for the task, archived or not.
    pub fn query(&self, task_id: &TaskId) -> Result<RegistryEntry> {
        self.slot(task_id)
            .and_then(|slot| lock(&slot).last().cloned())
            .ok_or_else(|| Error::NotFound(format!("task {} is not registered", task_id)))
    }

    /// The task's active entry, if any.
    pub fn active(&self, task_id: &TaskId) -> Option<RegistryEntry> {
        let slot = self.slot(task_id)?;
        let history = lock(&slot);
        history.last().filter(|e| e.is_active()).cloned()
    }

    /// Every attempt, oldest first.
    pub fn history(&self, task_id: &TaskId) -> Vec<RegistryEntry> {
        self.slot(task_id)
            .map(|slot| lock(&slot).clone())
            .unwrap_or_default()
    }

    /// Active entries owned by `owner`.
    pub fn query_by_owner(&self, owner: WorkerId) -> Vec<RegistryEntry> {
        self.list(&ListFilter::all().with_owner(owner))
    }

    /// Entries matching `filter`, oldest update first.
    pub fn list(&self, filter: &ListFilter) -> Vec<RegistryEntry> {
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut out = Vec::new();
        for slot in slots {
            let history = lock(&slot);
            if filter.include_archived {
                out.extend(history.iter().filter(|e| filter.matches(e)).cloned());
            } else if let Some(entry) = history.last().filter(|e| e.is_active()) {
                if filter.matches(entry) {
                    out.push(entry.clone());
                }
            }
        }
        out.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
                .then_with(|| a.attempt.cmp(&b.attempt))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite durable storage as a snapshot of current state.
    pub fn compact(&self) -> Result<usize> {
        let _exclusive = self.compaction.write().unwrap_or_else(|e| e.into_inner());
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut snapshot: Vec<RegistryEntry> = Vec::new();
        for slot in slots {
            snapshot.extend(lock(&slot).iter().cloned());
        }
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let kept = self.store.compact(&snapshot)?;
        glog!("Registry compacted: {} entries", kept);
        Ok(kept)
    }
}

impl std::fmt::Debug for CoordinationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}
