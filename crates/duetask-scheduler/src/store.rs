//! Task persistence boundary.
//!
//! [`TaskStore`] is what the orchestrator and the worker see. The SQLite
//! implementation lives in [`crate::persistence`]; [`MemoryTaskStore`] is a
//! process-local implementation with failure injection for tests and
//! short-lived tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duetask_core::{Clock, SystemClock, Task, TaskStatus, TaskUpdate};

use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: Task) -> StoreResult<Task>;

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Task>>;

    /// Set `status = new_status` only if the current status is one of
    /// `expected`. Returns the number of rows affected (0 or 1).
    async fn conditional_update_status(
        &self,
        id: &str,
        expected: &[TaskStatus],
        new_status: TaskStatus,
    ) -> StoreResult<u64>;

    /// User-driven status change. `None` if the task is missing.
    ///
    /// Fails with [`StoreError::InvalidTransition`] when `new_status` cannot
    /// follow the current status (see [`TaskStatus::allowed_predecessors`]).
    async fn update_status(&self, id: &str, new_status: TaskStatus) -> StoreResult<Option<Task>>;

    /// Edit topic, description or due date. `None` if the task is missing.
    async fn update(&self, id: &str, update: TaskUpdate) -> StoreResult<Option<Task>>;

    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>>;
}

/// In-memory task store.
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    /// Number of upcoming calls that fail with `StoreError::Unavailable`.
    failures: AtomicU32,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            failures: AtomicU32::new(0),
            clock: Arc::new(SystemClock),
        }
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `clock` for `updated_at` stamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make the next `n` calls fail as if the backend were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    fn tasks(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, Task>>> {
        self.tasks.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: Task) -> StoreResult<Task> {
        self.check_available()?;
        self.tasks()?.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Task>> {
        self.check_available()?;
        Ok(self.tasks()?.get(id).cloned())
    }

    async fn conditional_update_status(
        &self,
        id: &str,
        expected: &[TaskStatus],
        new_status: TaskStatus,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let mut tasks = self.tasks()?;
        match tasks.get_mut(id) {
            Some(task) if expected.contains(&task.status) => {
                task.status = new_status;
                task.updated_at = self.clock.now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_status(&self, id: &str, new_status: TaskStatus) -> StoreResult<Option<Task>> {
        self.check_available()?;
        let mut tasks = self.tasks()?;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };
        if !new_status.can_follow(task.status) {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: new_status,
            });
        }
        task.status = new_status;
        task.updated_at = self.clock.now();
        Ok(Some(task.clone()))
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> StoreResult<Option<Task>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut tasks = self.tasks()?;
        Ok(tasks.get_mut(id).map(|task| {
            task.apply(update, now);
            task.clone()
        }))
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.tasks()?.remove(id).is_some())
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>> {
        self.check_available()?;
        let mut owned: Vec<Task> = self
            .tasks()?
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|t| t.due_date);
        Ok(owned)
    }
}
