//! In-memory task store.
//!
//! Transitions are conditional on the current status: the batcher is the only
//! writer that moves a task out of `queued`, the dispatcher the only one that
//! settles it. A mismatch is a programmer error and surfaces as
//! [`StoreError::StaleTransition`], never as user-visible state.
//!
//! Terminal transitions bump a sequence and wake [`TaskStore::wait_terminal`]
//! waiters, so synchronous callers (the `/v1/*` passthroughs) can await a
//! result without polling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::task::{Task, TaskRecord, TaskResult, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("stale transition for {task_id}: expected {expected:?}, found {actual:?}")]
    StaleTransition { task_id: String, expected: TaskStatus, actual: TaskStatus },
}

/// How a task leaves `processing`.
#[derive(Debug, Clone)]
pub enum Settlement {
    Completed(TaskResult),
    Failed(String),
}

struct StoreInner {
    tasks: HashMap<String, Task>,
    /// Insertion order, oldest first; drives cap-based eviction.
    order: VecDeque<String>,
}

pub struct TaskStore {
    inner: RwLock<StoreInner>,
    terminal_seq: AtomicU64,
    terminal_notify: Notify,
    retention: Duration,
    max_retained: usize,
}

impl TaskStore {
    pub fn new(retention: Duration, max_retained: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner { tasks: HashMap::new(), order: VecDeque::new() }),
            terminal_seq: AtomicU64::new(0),
            terminal_notify: Notify::new(),
            retention,
            max_retained,
        }
    }

    pub async fn create(&self, task: Task) {
        let mut inner = self.inner.write().await;
        inner.order.push_back(task.task_id.clone());
        inner.tasks.insert(task.task_id.clone(), task);
    }

    /// Drop a record that never made it into the queue.
    pub async fn remove(&self, task_id: &str) {
        let mut inner = self.inner.write().await;
        inner.tasks.remove(task_id);
        inner.order.retain(|id| id != task_id);
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    /// Most recent tasks for one principal, newest first.
    pub async fn list(&self, principal: &str, limit: usize) -> Vec<TaskRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<&Task> =
            inner.tasks.values().filter(|t| t.principal == principal).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.into_iter().take(limit).map(Task::record).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn counts_by_status(&self) -> HashMap<&'static str, u64> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for task in inner.tasks.values() {
            *counts.entry(task.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Claim a queued task for processing. Called only by the batcher;
    /// exactly one claim can succeed per task.
    pub async fn claim(&self, task_id: &str) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        expect_status(task, TaskStatus::Queued)?;
        task.status = TaskStatus::Processing;
        task.started_at = Some(Utc::now());
        task.started_instant = Some(Instant::now());
        Ok(task.clone())
    }

    /// Settle a processing task. `at`/`instant` are captured once per batch by
    /// the dispatcher so every member shares the same completion timestamp.
    pub async fn settle(
        &self,
        task_id: &str,
        settlement: Settlement,
        at: DateTime<Utc>,
        instant: Instant,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
            expect_status(task, TaskStatus::Processing)?;
            task.completed_at = Some(at);
            task.completed_instant = Some(instant);
            match settlement {
                Settlement::Completed(result) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                }
                Settlement::Failed(reason) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(reason);
                }
            }
        }
        self.notify_terminal();
        Ok(())
    }

    /// Fail a task straight out of `queued`. Only the shutdown path uses
    /// this; everything else goes through `claim` first.
    pub async fn fail_queued(&self, task_id: &str, reason: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
            expect_status(task, TaskStatus::Queued)?;
            task.status = TaskStatus::Failed;
            task.error = Some(reason.to_string());
            task.completed_at = Some(Utc::now());
        }
        self.notify_terminal();
        Ok(())
    }

    /// Wait until the task reaches a terminal state or the deadline passes.
    /// Returns the terminal task, or `None` on timeout / unknown id.
    pub async fn wait_terminal(&self, task_id: &str, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            // Subscribe before checking so a settle between the check and the
            // wait cannot be missed.
            let notified = self.terminal_notify.notified();
            match self.get(task_id).await {
                Some(task) if task.status.is_terminal() => return Some(task),
                Some(_) => {}
                None => return None,
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    fn notify_terminal(&self) {
        self.terminal_seq.fetch_add(1, Ordering::Release);
        self.terminal_notify.notify_waiters();
    }

    /// Drop terminal tasks past the retention TTL, then enforce the retained
    /// cap by evicting the oldest terminal tasks first.
    pub async fn evict(&self) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let ttl = self.retention;
        let StoreInner { tasks, order } = &mut *inner;
        let before = tasks.len();

        tasks.retain(|_, t| {
            !(t.status.is_terminal()
                && t.completed_instant
                    .is_some_and(|done| now.saturating_duration_since(done) > ttl))
        });

        let over = tasks.len().saturating_sub(self.max_retained);
        if over > 0 {
            let victims: Vec<String> = order
                .iter()
                .filter(|id| tasks.get(*id).is_some_and(|t| t.status.is_terminal()))
                .take(over)
                .cloned()
                .collect();
            for id in victims {
                tasks.remove(&id);
            }
        }
        order.retain(|id| tasks.contains_key(id));

        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!(evicted, retained = tasks.len(), "evicted tasks");
        }
    }
}

fn expect_status(task: &Task, expected: TaskStatus) -> Result<(), StoreError> {
    if task.status != expected {
        return Err(StoreError::StaleTransition {
            task_id: task.task_id.clone(),
            expected,
            actual: task.status,
        });
    }
    Ok(())
}
