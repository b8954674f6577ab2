use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{SourceKind, StorageFormat};
use crate::util;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task: {0}")]
    Unknown(String),
    #[error("task {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },
}

/// What a worker is asked to do. Travels over the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "work", rename_all = "snake_case")]
pub enum TaskPayload {
    ExtractSource { path: String, kind: SourceKind },
    RunPlugin { plugin: String },
}

impl TaskPayload {
    /// Path or plugin name shown in warnings and progress lines.
    pub fn display(&self) -> &str {
        match self {
            TaskPayload::ExtractSource { path, .. } => path,
            TaskPayload::RunPlugin { plugin } => plugin,
        }
    }
}

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub identifier: String,
    pub session_id: String,
    pub storage_format: StorageFormat,
    pub payload: TaskPayload,
    pub aborted: bool,
}

/// Foreman-side lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Scheduled,
    Processing,
    Processed,
    PendingMerge,
    Merging,
    Abandoned,
}

/// What happened when a processed store appeared for a task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedDisposition {
    /// The task is tracked and moves on toward merging. Covers the case
    /// of an abandoned task whose results arrive late, as long as no
    /// retry was issued for it.
    Accepted,
    /// Nobody is waiting for this store; the caller should discard it.
    Stale,
}

struct TrackedTask {
    task: Task,
    state: TaskState,
    retry_count: u32,
    last_activity: f64,
    storage_size: u64,
}

/// Owns every live task and enforces the state machine
/// `queued -> scheduled -> processing -> processed -> pending-merge ->
/// merging -> complete`, with `abandoned -> queued` as the bounded retry
/// path. Single-owner by design: only the foreman thread touches it.
pub struct TaskManager {
    session_id: String,
    storage_format: StorageFormat,
    inactive_timeout: Duration,
    maximum_retries: u32,
    next_seq: u64,
    tasks: HashMap<String, TrackedTask>,
    failed: Vec<TaskPayload>,
    total_created: u64,
}

impl TaskManager {
    pub fn new(
        session_id: &str,
        storage_format: StorageFormat,
        inactive_timeout: Duration,
        maximum_retries: u32,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            storage_format,
            inactive_timeout,
            maximum_retries,
            next_seq: 0,
            tasks: HashMap::new(),
            failed: Vec::new(),
            total_created: 0,
        }
    }

    fn new_identifier(&mut self) -> String {
        let id = format!("task-{:06}", self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Creates a fresh queued task for one work item.
    pub fn create_task(&mut self, payload: TaskPayload) -> Task {
        self.spawn_tracked(payload, 0)
    }

    /// Recreates one abandoned task as a fresh retry, if any is eligible.
    /// The original entry is dropped; a processed store arriving for it
    /// later is reported stale.
    pub fn create_retry_task(&mut self) -> Option<Task> {
        let candidate = self
            .tasks
            .iter()
            .find(|(_, t)| t.state == TaskState::Abandoned && t.retry_count < self.maximum_retries)
            .map(|(id, _)| id.clone())?;
        let old = self.tasks.remove(&candidate)?;
        debug!(
            "retrying task {candidate} (attempt {}) for {}",
            old.retry_count + 1,
            old.task.payload.display()
        );
        Some(self.spawn_tracked(old.task.payload, old.retry_count + 1))
    }

    fn spawn_tracked(&mut self, payload: TaskPayload, retry_count: u32) -> Task {
        let task = Task {
            identifier: self.new_identifier(),
            session_id: self.session_id.clone(),
            storage_format: self.storage_format,
            payload,
            aborted: false,
        };
        self.total_created += 1;
        self.tasks.insert(
            task.identifier.clone(),
            TrackedTask {
                task: task.clone(),
                state: TaskState::Queued,
                retry_count,
                last_activity: util::now_epoch_seconds(),
                storage_size: 0,
            },
        );
        task
    }

    fn transition(&mut self, id: &str, from: &[TaskState], to: TaskState) -> Result<(), TaskError> {
        let tracked = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::Unknown(id.to_string()))?;
        if !from.contains(&tracked.state) {
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                from: tracked.state,
                to,
            });
        }
        tracked.state = to;
        tracked.last_activity = util::now_epoch_seconds();
        Ok(())
    }

    /// Queued task went onto the wire.
    pub fn mark_scheduled(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(id, &[TaskState::Queued], TaskState::Scheduled)
    }

    /// A worker status report names this task as in flight. Stale reports
    /// about tasks already past processing are ignored.
    pub fn refresh_processing(&mut self, id: &str, reported_activity: Option<f64>) {
        let Some(tracked) = self.tasks.get_mut(id) else {
            return;
        };
        match tracked.state {
            TaskState::Scheduled => tracked.state = TaskState::Processing,
            TaskState::Processing => {}
            _ => return,
        }
        tracked.last_activity = reported_activity.unwrap_or_else(util::now_epoch_seconds);
    }

    /// A processed store was observed for this identifier.
    pub fn observe_processed(&mut self, id: &str, storage_size: u64) -> ProcessedDisposition {
        let Some(tracked) = self.tasks.get_mut(id) else {
            return ProcessedDisposition::Stale;
        };
        match tracked.state {
            // A fast task may publish before any status poll saw it in
            // flight; it still passes through processing here.
            TaskState::Scheduled | TaskState::Processing => {}
            // A retried task is tracked under its new identifier only, so
            // anything still here as abandoned has not been reissued.
            TaskState::Abandoned => {
                debug!("salvaging abandoned task {id}: results arrived late");
            }
            TaskState::Queued
            | TaskState::Processed
            | TaskState::PendingMerge
            | TaskState::Merging => {
                return ProcessedDisposition::Stale;
            }
        }
        tracked.state = TaskState::Processed;
        tracked.storage_size = storage_size;
        tracked.last_activity = util::now_epoch_seconds();
        ProcessedDisposition::Accepted
    }

    pub fn mark_pending_merge(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(id, &[TaskState::Processed], TaskState::PendingMerge)
    }

    pub fn mark_merging(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(id, &[TaskState::PendingMerge], TaskState::Merging)
    }

    /// Held merge goes back to the pending slot.
    pub fn mark_merge_on_hold(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(id, &[TaskState::Merging], TaskState::PendingMerge)
    }

    /// Removes a task from all tracking. Unknown identifiers error so the
    /// caller can log duplicate completions without failing the run.
    pub fn complete_task(&mut self, id: &str) -> Result<(), TaskError> {
        self.tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TaskError::Unknown(id.to_string()))
    }

    /// Sweeps scheduled and processing tasks that have gone quiet past the
    /// inactivity timeout. Tasks out of retries move to the failed list;
    /// the rest wait as abandoned until a retry task picks them up.
    pub fn abandon_inactive(&mut self, now: f64) -> Vec<String> {
        let timeout = self.inactive_timeout.as_secs_f64();
        let mut abandoned = Vec::new();
        let mut exhausted = Vec::new();
        for (id, tracked) in self.tasks.iter_mut() {
            let eligible = matches!(tracked.state, TaskState::Scheduled | TaskState::Processing);
            if !eligible || tracked.last_activity + timeout >= now {
                continue;
            }
            tracked.state = TaskState::Abandoned;
            if tracked.retry_count >= self.maximum_retries {
                exhausted.push(id.clone());
            } else {
                abandoned.push(id.clone());
            }
        }
        for id in exhausted {
            if let Some(tracked) = self.tasks.remove(&id) {
                warn!(
                    "task {id} failed after {} retries: {}",
                    tracked.retry_count,
                    tracked.task.payload.display()
                );
                self.failed.push(tracked.task.payload);
            }
        }
        abandoned
    }

    /// Identifier and processed storage size for every task awaiting a
    /// merge slot.
    pub fn pending_merge_candidates(&self) -> Vec<(String, u64)> {
        let mut candidates: Vec<(String, u64)> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state == TaskState::PendingMerge)
            .map(|(id, t)| (id.clone(), t.storage_size))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        candidates
    }

    /// Anything still tracked is pending: queued, on the wire, processing,
    /// awaiting or undergoing merge, or abandoned awaiting retry.
    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn total_created(&self) -> u64 {
        self.total_created
    }

    pub fn failed_payloads(&self) -> &[TaskPayload] {
        &self.failed
    }

    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.tasks.get(id).map(|t| t.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(retries: u32) -> TaskManager {
        TaskManager::new(
            "session",
            StorageFormat::Jsonl,
            Duration::from_secs(300),
            retries,
        )
    }

    fn payload(path: &str) -> TaskPayload {
        TaskPayload::ExtractSource {
            path: path.to_string(),
            kind: SourceKind::File,
        }
    }

    #[test]
    fn walks_the_full_lifecycle() {
        let mut m = manager(3);
        let task = m.create_task(payload("/a"));
        let id = task.identifier.clone();
        assert_eq!(m.state_of(&id), Some(TaskState::Queued));

        m.mark_scheduled(&id).expect("scheduled");
        m.refresh_processing(&id, Some(1.0));
        assert_eq!(m.state_of(&id), Some(TaskState::Processing));

        assert_eq!(m.observe_processed(&id, 10), ProcessedDisposition::Accepted);
        m.mark_pending_merge(&id).expect("pending");
        m.mark_merging(&id).expect("merging");
        m.complete_task(&id).expect("complete");
        assert!(!m.has_pending_tasks());
    }

    #[test]
    fn queued_task_cannot_jump_to_merging() {
        let mut m = manager(3);
        let task = m.create_task(payload("/a"));
        assert!(matches!(
            m.mark_merging(&task.identifier),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn fast_task_may_publish_before_a_processing_report() {
        let mut m = manager(3);
        let task = m.create_task(payload("/a"));
        let id = task.identifier.clone();
        m.mark_scheduled(&id).expect("scheduled");
        assert_eq!(m.observe_processed(&id, 5), ProcessedDisposition::Accepted);
        assert_eq!(m.state_of(&id), Some(TaskState::Processed));
    }

    #[test]
    fn inactive_task_is_abandoned_then_retried_once() {
        let mut m = manager(3);
        let task = m.create_task(payload("/a"));
        let id = task.identifier.clone();
        m.mark_scheduled(&id).expect("scheduled");

        let later = util::now_epoch_seconds() + 10_000.0;
        let abandoned = m.abandon_inactive(later);
        assert_eq!(abandoned, vec![id.clone()]);
        assert_eq!(m.state_of(&id), Some(TaskState::Abandoned));

        let retry = m.create_retry_task().expect("retry");
        assert_ne!(retry.identifier, id);
        assert_eq!(retry.payload, payload("/a"));
        assert_eq!(m.state_of(&id), None);
        assert_eq!(m.state_of(&retry.identifier), Some(TaskState::Queued));
        assert!(m.create_retry_task().is_none());
    }

    #[test]
    fn retries_are_bounded() {
        let mut m = manager(1);
        let task = m.create_task(payload("/a"));
        let mut id = task.identifier.clone();
        let far = util::now_epoch_seconds() + 10_000.0;

        // First abandonment leaves a retry; the retry's abandonment is
        // over the limit and lands in the failed list.
        m.mark_scheduled(&id).expect("scheduled");
        m.abandon_inactive(far);
        let retry = m.create_retry_task().expect("retry");
        id = retry.identifier.clone();
        m.mark_scheduled(&id).expect("scheduled");
        m.abandon_inactive(far * 2.0);

        assert!(m.create_retry_task().is_none());
        assert!(!m.has_pending_tasks());
        assert_eq!(m.failed_payloads(), &[payload("/a")]);
    }

    #[test]
    fn late_store_for_an_unretried_abandoned_task_is_salvaged() {
        let mut m = manager(3);
        let task = m.create_task(payload("/a"));
        let id = task.identifier.clone();
        m.mark_scheduled(&id).expect("scheduled");
        m.abandon_inactive(util::now_epoch_seconds() + 10_000.0);

        assert_eq!(m.observe_processed(&id, 7), ProcessedDisposition::Accepted);
        assert_eq!(m.state_of(&id), Some(TaskState::Processed));
    }

    #[test]
    fn late_store_after_a_retry_is_stale() {
        let mut m = manager(3);
        let task = m.create_task(payload("/a"));
        let id = task.identifier.clone();
        m.mark_scheduled(&id).expect("scheduled");
        m.abandon_inactive(util::now_epoch_seconds() + 10_000.0);
        let _retry = m.create_retry_task().expect("retry");

        assert_eq!(m.observe_processed(&id, 7), ProcessedDisposition::Stale);
    }

    #[test]
    fn merge_candidates_sort_smallest_first() {
        let mut m = manager(3);
        let mut ids = Vec::new();
        for (path, size) in [("/a", 300u64), ("/b", 100), ("/c", 200)] {
            let task = m.create_task(payload(path));
            let id = task.identifier.clone();
            m.mark_scheduled(&id).expect("scheduled");
            m.refresh_processing(&id, None);
            m.observe_processed(&id, size);
            m.mark_pending_merge(&id).expect("pending");
            ids.push(id);
        }
        let order: Vec<u64> = m
            .pending_merge_candidates()
            .iter()
            .map(|(_, size)| *size)
            .collect();
        assert_eq!(order, vec![100, 200, 300]);
    }
}
