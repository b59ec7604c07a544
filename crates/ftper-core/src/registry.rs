// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Task registry
//
// The registry is the only place a Task is mutated. Every mutation takes the
// same short-lived lock and publishes a fresh snapshot of the table.

use crate::store::TaskStore;
use crate::task::{Task, TaskEvent, TaskId, TaskSpec, TaskState};
use crate::types::AppError;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

struct Inner {
    tasks: BTreeMap<TaskId, Task>,
    next_id: TaskId,
    next_queue_seq: u64,
}

impl Inner {
    fn snapshot(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }
}

/// Authoritative table of transfer tasks
pub struct TaskRegistry {
    inner: Mutex<Inner>,
    snapshots: watch::Sender<Vec<Task>>,
    store: Option<TaskStore>,
}

impl TaskRegistry {
    /// In-memory registry with nothing persisted
    pub fn new() -> Self {
        Self::from_parts(Vec::new(), 1, None)
    }

    /// Registry backed by `store`, rehydrated from whatever it holds
    pub fn with_store(store: TaskStore) -> Result<Self, AppError> {
        let snapshot = store.load()?;
        Ok(Self::from_parts(snapshot.tasks, snapshot.next_id, Some(store)))
    }

    fn from_parts(tasks: Vec<Task>, next_id: TaskId, store: Option<TaskStore>) -> Self {
        let mut tasks: Vec<Task> = tasks;
        // keep the saved queue order, but renumber it densely
        tasks.sort_by_key(|t| (t.queue_seq, t.id));
        let mut next_queue_seq = 1;
        for task in tasks.iter_mut() {
            task.queue_seq = next_queue_seq;
            next_queue_seq += 1;
        }

        let inner = Inner {
            tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
            next_id,
            next_queue_seq,
        };
        let (snapshots, _) = watch::channel(inner.snapshot());

        Self {
            inner: Mutex::new(inner),
            snapshots,
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the current table and, for state changes, write it to disk
    fn commit(&self, inner: &Inner, persist: bool) {
        self.snapshots.send_replace(inner.snapshot());

        if !persist {
            return;
        }
        if let Some(store) = &self.store {
            let tasks: Vec<Task> = inner.tasks.values().cloned().collect();
            if let Err(e) = store.save(&tasks, inner.next_id) {
                tracing::error!("Failed to persist tasks: {}", e);
            }
        }
    }

    /// Add a new task in `Queued`
    pub fn create(&self, spec: TaskSpec) -> Result<Task, AppError> {
        spec.validate().map_err(AppError::InvalidTask)?;

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let seq = inner.next_queue_seq;
        inner.next_queue_seq += 1;

        let task = Task::new(id, spec, seq);
        tracing::info!(
            "Task {} queued: {:?} {} <-> {}",
            id,
            task.direction,
            task.source_path,
            task.remote_path
        );
        inner.tasks.insert(id, task.clone());
        self.commit(&inner, true);

        Ok(task)
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    /// All live tasks, ordered by id
    pub fn list(&self) -> Vec<Task> {
        self.lock().snapshot()
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == state)
            .count()
    }

    /// State `event` would lead to, without applying it
    pub fn check(&self, id: TaskId, event: &TaskEvent) -> Result<TaskState, AppError> {
        let inner = self.lock();
        let task = inner.tasks.get(&id).ok_or(AppError::TaskNotFound(id))?;
        task.state
            .next(event)
            .ok_or(AppError::InvalidTransition {
                id,
                state: task.state,
                event: event.name(),
            })
    }

    /// Apply a transition and return the task as it now stands.
    ///
    /// `Remove` purges the entry; the returned copy is the last view of it.
    pub fn apply(&self, id: TaskId, event: TaskEvent) -> Result<Task, AppError> {
        let mut inner = self.lock();
        let Inner {
            tasks,
            next_queue_seq,
            ..
        } = &mut *inner;

        let task = tasks.get_mut(&id).ok_or(AppError::TaskNotFound(id))?;
        task.apply(&event)
            .map_err(|state| AppError::InvalidTransition {
                id,
                state,
                event: event.name(),
            })?;

        if event == TaskEvent::Resume {
            // back of the line
            task.queue_seq = *next_queue_seq;
            *next_queue_seq += 1;
        }

        let task = if task.state == TaskState::Removed {
            tracing::info!("Task {} removed", id);
            tasks.remove(&id).ok_or(AppError::TaskNotFound(id))?
        } else {
            if event.is_state_change() {
                tracing::debug!("Task {} -> {}", id, task.state);
            }
            task.clone()
        };

        self.commit(&inner, event.is_state_change());
        Ok(task)
    }

    /// Drop an entry regardless of its state. Returns whether it existed.
    pub fn purge(&self, id: TaskId) -> bool {
        let mut inner = self.lock();
        let existed = inner.tasks.remove(&id).is_some();
        if existed {
            self.commit(&inner, true);
        }
        existed
    }

    /// Atomically move the oldest queued task to `Running`.
    ///
    /// `offset` picks the starting byte for the chosen task.
    pub fn dispatch_next(&self, offset: impl Fn(&Task) -> u64) -> Option<Task> {
        let mut inner = self.lock();
        let id = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .min_by_key(|t| (t.queue_seq, t.id))
            .map(|t| t.id)?;

        let task = inner.tasks.get_mut(&id)?;
        let event = TaskEvent::Dispatch {
            offset: offset(&*task),
        };
        task.apply(&event).ok()?;
        let task = task.clone();

        tracing::info!(
            "Task {} dispatched at offset {}",
            id,
            task.bytes_transferred
        );
        self.commit(&inner, true);
        Some(task)
    }

    /// Move a running task's counter back to zero because its transfer is starting over
    pub fn rewind(&self, id: TaskId) -> Result<Task, AppError> {
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(&id).ok_or(AppError::TaskNotFound(id))?;
        if task.state != TaskState::Running {
            return Err(AppError::InvalidTransition {
                id,
                state: task.state,
                event: "restart",
            });
        }
        task.bytes_transferred = 0;
        let task = task.clone();

        tracing::info!("Task {} restarting from zero", id);
        self.commit(&inner, true);
        Ok(task)
    }

    /// Receive the latest snapshot of the table whenever it changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<Task>> {
        self.snapshots.subscribe()
    }

    /// Write the table (including in-flight progress) to disk now
    pub fn flush(&self) -> Result<(), AppError> {
        let inner = self.lock();
        match &self.store {
            Some(store) => {
                let tasks: Vec<Task> = inner.tasks.values().cloned().collect();
                store.save(&tasks, inner.next_id)
            }
            None => Ok(()),
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
