use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::rpc::ItemCounters;
use crate::storage::{
    Record, RecordKind, SessionStore, SourceRecord, StorageError, TaskStorage, TaskStoreReader,
};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("task store read failed: {0}")]
    TaskRead(#[source] StorageError),
    #[error("session store write failed: {0}")]
    SessionWrite(#[source] StorageError),
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAdmission {
    /// The task is now the active merge.
    Started,
    /// One merge is already running; the task is parked on hold.
    Held,
    /// Both slots are taken; the task stays pending.
    Busy,
}

/// Result of one bounded merge pass over the active task. Merged source
/// records are handed back so the caller can feed them into the work-item
/// heap.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePass {
    pub task_id: String,
    pub records: u64,
    pub drained: bool,
    pub sources: Vec<SourceRecord>,
}

struct ActiveMerge {
    task_id: String,
    reader: Box<dyn TaskStoreReader>,
}

/// At most one merge in flight and at most one parked on hold, as an
/// explicit two-slot structure. The per-pass record bound is retuned from
/// the measured throughput of the previous pass so merging neither
/// starves scheduling nor idles the queue.
pub struct MergeCoordinator {
    active: Option<ActiveMerge>,
    held: Option<String>,
    bound: usize,
    ceiling: usize,
}

impl MergeCoordinator {
    pub fn new(initial_bound: usize, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            active: None,
            held: None,
            bound: initial_bound.clamp(1, ceiling),
            ceiling,
        }
    }

    pub fn active_task_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.task_id.as_str())
    }

    pub fn held_task_id(&self) -> Option<&str> {
        self.held.as_deref()
    }

    pub fn current_bound(&self) -> usize {
        self.bound
    }

    /// Takes the parked task out of the hold slot, if any. The caller
    /// re-admits it with [`begin`](Self::begin) once the active slot is
    /// free, which reopens its reader.
    pub fn take_held(&mut self) -> Option<String> {
        self.held.take()
    }

    /// Admits one pending-merge task: active if the slot is free, parked
    /// on hold if a merge is running, refused when both slots are taken.
    /// The reader is only opened for the task entering the active slot.
    pub fn begin(
        &mut self,
        task_id: &str,
        storage: &dyn TaskStorage,
    ) -> Result<MergeAdmission, StorageError> {
        if self.active.is_none() {
            let reader = storage.open_merge_reader(task_id)?;
            debug!("merge of task {task_id} started, bound {}", self.bound);
            self.active = Some(ActiveMerge {
                task_id: task_id.to_string(),
                reader,
            });
            return Ok(MergeAdmission::Started);
        }
        if self.held.is_none() {
            debug!("merge of task {task_id} parked on hold");
            self.held = Some(task_id.to_string());
            return Ok(MergeAdmission::Held);
        }
        Ok(MergeAdmission::Busy)
    }

    /// Drops the active merge without completing it, returning its task
    /// identifier so the caller can apply its failure policy.
    pub fn abandon_active(&mut self) -> Option<String> {
        self.active.take().map(|a| a.task_id)
    }

    /// Merges up to the current bound of records from the active task
    /// into the session store, then retunes the bound from the measured
    /// rate. Returns `None` when no merge is active.
    pub fn merge_pass(
        &mut self,
        session: &SessionStore,
        counters: &mut ItemCounters,
    ) -> Result<Option<MergePass>, MergeError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };
        let started = Instant::now();
        let mut records = 0u64;
        let mut drained = false;
        let mut sources = Vec::new();
        while records < self.bound as u64 {
            match active.reader.next_record().map_err(MergeError::TaskRead)? {
                Some(record) => {
                    let kind = record.kind();
                    session
                        .append_merged(&record)
                        .map_err(MergeError::SessionWrite)?;
                    if let Record::Source(source) = &record {
                        sources.push(source.clone());
                    }
                    tally(counters, kind);
                    records += 1;
                }
                None => {
                    drained = true;
                    break;
                }
            }
        }
        let task_id = active.task_id.clone();
        if drained {
            self.active = None;
        }

        let elapsed = started.elapsed().as_secs_f64();
        if records > 0 && elapsed > 0.0 {
            let tuned = (0.5 * records as f64 / elapsed) as usize;
            // A very fast pass can compute zero; the floor keeps merging
            // from stalling entirely.
            self.bound = tuned.clamp(1, self.ceiling);
        }

        Ok(Some(MergePass {
            task_id,
            records,
            drained,
            sources,
        }))
    }
}

fn tally(counters: &mut ItemCounters, kind: RecordKind) {
    match kind {
        RecordKind::Source => counters.sources += 1,
        RecordKind::Artifact => counters.artifacts += 1,
        RecordKind::Warning => counters.warnings += 1,
        RecordKind::Report => counters.reports += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        FsTaskStorage, Record, SourceKind, SourceRecord, StorageFormat, build_task_storage,
    };

    fn stage_task(storage: &dyn TaskStorage, task_id: &str, records: usize) {
        let mut writer = storage.create_task_store(task_id).expect("writer");
        for i in 0..records {
            writer
                .add_record(&Record::Source(SourceRecord {
                    path: format!("/{task_id}/{i}"),
                    kind: SourceKind::File,
                }))
                .expect("add");
        }
        writer.close().expect("close");
        storage.publish_processed(task_id).expect("publish");
        storage.prepare_merge(task_id).expect("prepare");
    }

    #[test]
    fn second_task_parks_on_hold_and_third_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("storage");
        for id in ["t1", "t2", "t3"] {
            stage_task(&storage, id, 2);
        }

        let mut merges = MergeCoordinator::new(100, 1000);
        assert_eq!(merges.begin("t1", &storage).expect("t1"), MergeAdmission::Started);
        assert_eq!(merges.begin("t2", &storage).expect("t2"), MergeAdmission::Held);
        assert_eq!(merges.begin("t3", &storage).expect("t3"), MergeAdmission::Busy);
        assert_eq!(merges.active_task_id(), Some("t1"));
        assert_eq!(merges.held_task_id(), Some("t2"));
    }

    #[test]
    fn bounded_pass_leaves_remainder_for_next_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = build_task_storage(StorageFormat::Jsonl, dir.path()).expect("storage");
        stage_task(storage.as_ref(), "t1", 5);

        let session_path = dir.path().join("session.jsonl");
        let session = SessionStore::create(&session_path, "s", "hash").expect("session");
        let mut counters = ItemCounters::default();

        // Ceiling of 2 pins the bound so the pass size is predictable.
        let mut merges = MergeCoordinator::new(2, 2);
        merges.begin("t1", storage.as_ref()).expect("begin");

        let pass = merges
            .merge_pass(&session, &mut counters)
            .expect("pass")
            .expect("active");
        assert_eq!(pass.records, 2);
        assert_eq!(pass.sources.len(), 2);
        assert!(!pass.drained);
        assert_eq!(merges.active_task_id(), Some("t1"));

        let mut total = pass.records;
        loop {
            let pass = merges
                .merge_pass(&session, &mut counters)
                .expect("pass")
                .expect("active");
            total += pass.records;
            if pass.drained {
                break;
            }
        }
        assert_eq!(total, 5);
        assert_eq!(counters.sources, 5);
        assert_eq!(merges.active_task_id(), None);
    }

    #[test]
    fn bound_is_retuned_but_never_below_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("storage");
        stage_task(&storage, "t1", 3);

        let session_path = dir.path().join("session.jsonl");
        let session = SessionStore::create(&session_path, "s", "hash").expect("session");
        let mut counters = ItemCounters::default();

        let mut merges = MergeCoordinator::new(1000, 10_000);
        merges.begin("t1", &storage).expect("begin");
        let pass = merges
            .merge_pass(&session, &mut counters)
            .expect("pass")
            .expect("active");
        assert!(pass.drained);
        assert!(merges.current_bound() >= 1);
        assert!(merges.current_bound() <= 10_000);
    }

    #[test]
    fn held_task_resumes_after_drain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("storage");
        stage_task(&storage, "t1", 1);
        stage_task(&storage, "t2", 1);

        let session_path = dir.path().join("session.jsonl");
        let session = SessionStore::create(&session_path, "s", "hash").expect("session");
        let mut counters = ItemCounters::default();

        let mut merges = MergeCoordinator::new(10, 100);
        merges.begin("t1", &storage).expect("t1");
        merges.begin("t2", &storage).expect("t2");

        let pass = merges
            .merge_pass(&session, &mut counters)
            .expect("pass")
            .expect("active");
        assert!(pass.drained);
        assert_eq!(pass.task_id, "t1");

        let held = merges.take_held().expect("held");
        assert_eq!(held, "t2");
        assert_eq!(merges.begin(&held, &storage).expect("resume"), MergeAdmission::Started);
        let pass = merges
            .merge_pass(&session, &mut counters)
            .expect("pass")
            .expect("active");
        assert!(pass.drained);
        assert_eq!(pass.task_id, "t2");
        assert_eq!(counters.sources, 2);
    }

    #[test]
    fn missing_store_surfaces_on_begin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("storage");
        let mut merges = MergeCoordinator::new(10, 100);
        assert!(matches!(
            merges.begin("ghost", &storage),
            Err(StorageError::UnknownTask(_))
        ));
        assert_eq!(merges.active_task_id(), None);
    }
}
