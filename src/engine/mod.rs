//! # Extraction Engine
//!
//! The foreman side of a session. One control loop owns the task state
//! machine, the bounded work-item heap, the dispatch queue and the merge
//! coordinator; worker processes run in a monitored pool and hand results
//! back through the task-store areas. The loop interleaves scheduling and
//! merging in small steps so neither side starves the other.

mod analysis;
mod heap;
mod merge;
mod status;
mod tasks;

pub use analysis::AnalysisEngine;
pub use heap::{WorkItem, WorkItemHeap};
pub use merge::{MergeAdmission, MergeCoordinator, MergeError, MergePass};
pub use status::{
    EnginePhase, EngineStatus, LogProgressReporter, NullProgressReporter, ProgressReporter,
};
pub use tasks::{ProcessedDisposition, Task, TaskError, TaskManager, TaskPayload, TaskState};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::process::{MonitorError, MonitorSettings, ProcessMonitor, WorkerCommand};
use crate::queue::{BufferedReplyBindQueue, ItemProducer, Queue, QueueError};
use crate::rpc::ItemCounters;
use crate::storage::{
    Record, SessionCompletion, SessionStore, SourceRecord, StorageError, TaskStorage,
    build_task_storage,
};
use crate::util;
use crate::worker::executor::{RootEnumerator, SourceEnumerator};

const LOOP_TICK: Duration = Duration::from_millis(20);
const ENUMERATION_BATCH: usize = 64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("queue failure: {0}")]
    Queue(#[from] QueueError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("worker pool failure: {0}")]
    Monitor(#[from] MonitorError),
    #[error("no worker could be started")]
    NoWorkers,
    #[error("session setup failed: {0}")]
    Setup(String),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Final accounting of one engine run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: String,
    pub aborted: bool,
    pub produced: ItemCounters,
    pub failed_items: Vec<String>,
    pub tasks_created: u64,
    pub worker_replacements: u64,
    pub elapsed_seconds: f64,
}

/// Drives one extraction session: enumerates source roots, dispatches one
/// task per work item to the worker pool and merges every published task
/// store into the session store. Child sources discovered by directory
/// tasks come back through the merge and re-enter the heap.
pub struct ExtractionEngine {
    config: Config,
    config_hash: String,
    session_dir: PathBuf,
    abort: Arc<AtomicBool>,
    reporter: Arc<dyn ProgressReporter>,
}

impl ExtractionEngine {
    pub fn new(config: Config, config_hash: &str, session_dir: &Path) -> Self {
        Self {
            config,
            config_hash: config_hash.to_string(),
            session_dir: session_dir.to_path_buf(),
            abort: Arc::new(AtomicBool::new(false)),
            reporter: Arc::new(LogProgressReporter),
        }
    }

    /// Shares an externally owned abort flag, typically set from a signal
    /// handler.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn run(&mut self, roots: &[PathBuf]) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        std::fs::create_dir_all(&self.session_dir)?;
        config::write_session_config(
            &self.config,
            &util::session_config_path(&self.session_dir),
        )
        .map_err(|err| EngineError::Setup(err.to_string()))?;
        let session = SessionStore::create(
            &util::session_store_path(&self.session_dir),
            &self.config.session_id,
            &self.config_hash,
        )?;
        let storage = build_task_storage(self.config.storage_format, &self.session_dir)?;

        let mut dispatch =
            BufferedReplyBindQueue::<Task>::new(self.config.queue_config("task-dispatch"));
        dispatch.open()?;
        let dispatch_port = dispatch
            .port()
            .ok_or_else(|| EngineError::Setup("dispatch queue reported no port".to_string()))?;

        let mut monitor = ProcessMonitor::new(
            MonitorSettings::from_config(&self.config),
            util::rpc_dir(&self.session_dir),
        );
        let program = resolve_worker_program(&self.config)?;
        let mut spawned = 0usize;
        for index in 0..self.config.effective_worker_count() {
            let label = format!("worker-{index:02}");
            let command = extract_command(&program, &self.session_dir, &label, dispatch_port);
            match monitor.spawn_worker(&label, command) {
                Ok(pid) => {
                    debug!("worker {label} running with pid {pid}");
                    spawned += 1;
                }
                Err(err) => warn!("spawn of {label} failed: {err}"),
            }
        }
        if spawned == 0 {
            let _ = dispatch.close(true);
            return Err(EngineError::NoWorkers);
        }
        monitor.start_health_checks()?;
        info!(
            "session {} extracting {} roots with {spawned} workers",
            self.config.session_id,
            roots.len()
        );

        let mut tasks = TaskManager::new(
            &self.config.session_id,
            self.config.storage_format,
            Duration::from_secs_f64(self.config.task_inactive_seconds),
            self.config.maximum_task_retries,
        );
        let mut merges = MergeCoordinator::new(
            self.config.merge_record_limit,
            self.config.merge_record_ceiling,
        );
        let mut heap = WorkItemHeap::new(self.config.maximum_heap_size);
        let mut enumerator = RootEnumerator::new(roots);
        let mut enumerator_done = false;
        let mut discovered: VecDeque<SourceRecord> = VecDeque::new();
        let mut produced = ItemCounters::default();
        let mut current: Option<Task> = None;
        let progress_interval =
            Duration::from_secs_f64(self.config.progress_interval_seconds.max(0.1));
        let mut last_progress = Instant::now();

        let outcome: Result<(), EngineError> = 'run: loop {
            if self.abort.load(Ordering::Relaxed) {
                break 'run Ok(());
            }
            let mut progressed = false;

            // Merged child sources re-enter the heap ahead of fresh
            // enumeration so deep trees drain before new roots fan out.
            while heap.has_room() {
                let Some(source) = discovered.pop_front() else {
                    break;
                };
                heap.push(WorkItem {
                    path: PathBuf::from(&source.path),
                    kind: source.kind,
                });
                progressed = true;
            }
            if !enumerator_done && discovered.is_empty() && heap.has_room() {
                let batch = enumerator.next_batch(heap.room().min(ENUMERATION_BATCH));
                if batch.is_empty() {
                    enumerator_done = true;
                }
                for source in batch {
                    if let Err(err) = session.append_merged(&Record::Source(source.clone())) {
                        break 'run Err(EngineError::Storage(err));
                    }
                    produced.sources += 1;
                    if !heap.push(WorkItem {
                        path: PathBuf::from(&source.path),
                        kind: source.kind,
                    }) {
                        discovered.push_back(source);
                    }
                    progressed = true;
                }
            }

            // Retries go out before fresh work so a flaky item cannot be
            // starved by a deep backlog.
            if current.is_none() {
                current = tasks.create_retry_task();
            }
            if current.is_none() {
                if let Some(item) = heap.pop() {
                    current = Some(tasks.create_task(TaskPayload::ExtractSource {
                        path: item.path.to_string_lossy().into_owned(),
                        kind: item.kind,
                    }));
                }
            }
            if let Some(task) = current.take() {
                match dispatch.try_push_item(&task) {
                    Ok(true) => {
                        if let Err(err) = tasks.mark_scheduled(&task.identifier) {
                            debug!("scheduling mark for {}: {err}", task.identifier);
                        }
                        progressed = true;
                    }
                    // Buffer full; the task stays current and goes out on
                    // a later iteration.
                    Ok(false) => current = Some(task),
                    Err(err) => break 'run Err(EngineError::Queue(err)),
                }
            }

            for snapshot in monitor.snapshots() {
                if let Some(report) = snapshot.report {
                    if let Some(task_id) = report.task_identifier {
                        tasks.refresh_processing(&task_id, report.last_activity_timestamp);
                    }
                }
            }

            match merge_step(
                storage.as_ref(),
                &session,
                &mut tasks,
                &mut merges,
                &mut produced,
                &mut discovered,
            ) {
                Ok(stepped) => progressed |= stepped,
                Err(err) => break 'run Err(err),
            }

            for id in tasks.abandon_inactive(util::now_epoch_seconds()) {
                debug!("task {id} abandoned, awaiting retry");
            }

            let idle = current.is_none()
                && heap.is_empty()
                && discovered.is_empty()
                && enumerator_done
                && !tasks.has_pending_tasks()
                && merges.active_task_id().is_none()
                && merges.held_task_id().is_none();
            if idle {
                break 'run Ok(());
            }

            if last_progress.elapsed() >= progress_interval {
                let phase = if merges.active_task_id().is_some() {
                    EnginePhase::Merging
                } else if enumerator_done {
                    EnginePhase::Running
                } else {
                    EnginePhase::Collecting
                };
                self.reporter.on_progress(&EngineStatus {
                    phase,
                    aborted: false,
                    queued_work_items: heap.len(),
                    pending_tasks: tasks.pending_task_count(),
                    merging_task: merges.active_task_id().map(str::to_string),
                    held_task: merges.held_task_id().map(str::to_string),
                    produced,
                    workers: monitor.snapshots(),
                    worker_replacements: monitor.replacement_count(),
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                });
                last_progress = Instant::now();
            }
            if !progressed {
                std::thread::sleep(LOOP_TICK);
            }
        };

        let aborted = self.abort.load(Ordering::Relaxed) || outcome.is_err();
        if !aborted {
            for _ in 0..monitor.live_worker_count() {
                match dispatch.push_abort() {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("abort sentinel dropped, dispatch buffer full");
                        break;
                    }
                    Err(err) => {
                        debug!("abort sentinel push failed: {err}");
                        break;
                    }
                }
            }
        }
        if let Err(err) = dispatch.close(aborted) {
            warn!("dispatch queue close failed: {err}");
        }
        let replacements = monitor.replacement_count();
        monitor.shutdown(aborted);

        let mut failed_items = Vec::new();
        for payload in tasks.failed_payloads() {
            failed_items.push(payload.display().to_string());
            match session.add_warning(
                "work item failed after exhausting retries",
                Some(payload.display()),
            ) {
                Ok(()) => produced.warnings += 1,
                Err(err) => warn!("failed-item warning not recorded: {err}"),
            }
        }

        let final_aborted = aborted || !failed_items.is_empty();
        let completion = SessionCompletion {
            session_id: self.config.session_id.clone(),
            aborted: final_aborted,
            completed: util::now_epoch_seconds(),
            produced_sources: produced.sources,
            produced_artifacts: produced.artifacts,
            produced_warnings: produced.warnings,
            produced_reports: produced.reports,
        };
        if let Err(err) = session.write_completion(&completion) {
            warn!("completion entry not recorded: {err}");
        }
        outcome?;

        let summary = RunSummary {
            session_id: self.config.session_id.clone(),
            aborted: final_aborted,
            produced,
            failed_items,
            tasks_created: tasks.total_created(),
            worker_replacements: replacements,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        };
        self.reporter.on_progress(&EngineStatus {
            phase: if final_aborted {
                EnginePhase::Aborted
            } else {
                EnginePhase::Completed
            },
            aborted: final_aborted,
            queued_work_items: 0,
            pending_tasks: 0,
            merging_task: None,
            held_task: None,
            produced: summary.produced,
            workers: Vec::new(),
            worker_replacements: summary.worker_replacements,
            elapsed_seconds: summary.elapsed_seconds,
        });
        info!(
            "session {} finished: {} sources, {} artifacts, {} warnings, {} failed items, aborted={}",
            summary.session_id,
            summary.produced.sources,
            summary.produced.artifacts,
            summary.produced.warnings,
            summary.failed_items.len(),
            summary.aborted,
        );
        Ok(summary)
    }
}

/// An empty `worker_program` setting means re-execute the current binary
/// with the hidden worker subcommand.
pub(crate) fn resolve_worker_program(config: &Config) -> Result<PathBuf, EngineError> {
    if config.worker_program.trim().is_empty() {
        Ok(std::env::current_exe()?)
    } else {
        Ok(PathBuf::from(&config.worker_program))
    }
}

fn extract_command(
    program: &Path,
    session_dir: &Path,
    label: &str,
    dispatch_port: u16,
) -> WorkerCommand {
    WorkerCommand::new(program)
        .arg("worker")
        .arg("--scratch")
        .arg(session_dir.to_string_lossy().into_owned())
        .arg("--name")
        .arg(label)
        .arg("--role")
        .arg("extract")
        .arg("--dispatch-port")
        .arg(dispatch_port.to_string())
}

/// One merge iteration of the control loop: pick up freshly published
/// stores, admit pending merges into the two coordinator slots and run a
/// single bounded pass over the active one. Session-store write failures
/// are fatal; anything wrong with a single task store falls back to
/// [`give_up_on_store`]. Returns whether anything moved.
pub(crate) fn merge_step(
    storage: &dyn TaskStorage,
    session: &SessionStore,
    tasks: &mut TaskManager,
    merges: &mut MergeCoordinator,
    produced: &mut ItemCounters,
    discovered: &mut VecDeque<SourceRecord>,
) -> Result<bool, EngineError> {
    let mut progressed = false;

    for id in storage.processed_task_ids()? {
        let size = match storage.task_store_size(&id) {
            Ok(size) => size,
            Err(err) => {
                warn!("size of processed store {id} unavailable: {err}");
                0
            }
        };
        match tasks.observe_processed(&id, size) {
            ProcessedDisposition::Accepted => {
                let has_content = match storage.has_content(&id) {
                    Ok(flag) => flag,
                    Err(err) => {
                        warn!("content check for store {id} failed: {err}");
                        true
                    }
                };
                if has_content {
                    match storage.prepare_merge(&id) {
                        Ok(()) => {
                            if let Err(err) = tasks.mark_pending_merge(&id) {
                                debug!("pending-merge mark for {id}: {err}");
                            }
                        }
                        Err(err) => {
                            warn!("staging store of task {id} failed: {err}");
                            give_up_on_store(&id, storage, session, tasks, produced);
                        }
                    }
                } else {
                    debug!("task {id} produced nothing, dropping its store");
                    if let Err(err) = storage.discard_processed(&id) {
                        warn!("empty store {id} not discarded: {err}");
                    }
                    if let Err(err) = tasks.complete_task(&id) {
                        debug!("completion of task {id}: {err}");
                    }
                }
                progressed = true;
            }
            ProcessedDisposition::Stale => {
                debug!("discarding stale store {id}");
                if let Err(err) = storage.discard_processed(&id) {
                    warn!("stale store {id} not discarded: {err}");
                }
            }
        }
    }

    // Smallest store first; the parked hold slot keeps its place.
    let held = merges.held_task_id().map(str::to_string);
    for (id, _size) in tasks.pending_merge_candidates() {
        if held.as_deref() == Some(id.as_str()) {
            continue;
        }
        match merges.begin(&id, storage) {
            Ok(MergeAdmission::Started) => {
                if let Err(err) = tasks.mark_merging(&id) {
                    debug!("merging mark for {id}: {err}");
                }
                progressed = true;
            }
            Ok(MergeAdmission::Held) => {}
            Ok(MergeAdmission::Busy) => break,
            Err(err) => {
                warn!("merge of task {id} could not start: {err}");
                give_up_on_store(&id, storage, session, tasks, produced);
                progressed = true;
            }
        }
    }

    match merges.merge_pass(session, produced) {
        Ok(Some(pass)) => {
            for source in &pass.sources {
                discovered.push_back(source.clone());
            }
            if pass.records > 0 || pass.drained {
                progressed = true;
            }
            if pass.drained {
                debug!(
                    "merge of task {} drained after {} records",
                    pass.task_id, pass.records
                );
                if let Err(err) = storage.remove_merged(&pass.task_id) {
                    warn!("merged store {} not removed: {err}", pass.task_id);
                }
                if let Err(err) = tasks.complete_task(&pass.task_id) {
                    debug!("completion of task {}: {err}", pass.task_id);
                }
                if let Some(held_id) = merges.take_held() {
                    match merges.begin(&held_id, storage) {
                        Ok(MergeAdmission::Started) => {
                            if let Err(err) = tasks.mark_merging(&held_id) {
                                debug!("merging mark for {held_id}: {err}");
                            }
                        }
                        Ok(other) => warn!("held task {held_id} not re-admitted: {other:?}"),
                        Err(err) => {
                            warn!("held merge of task {held_id} could not start: {err}");
                            give_up_on_store(&held_id, storage, session, tasks, produced);
                        }
                    }
                }
            }
        }
        Ok(None) => {}
        Err(MergeError::SessionWrite(err)) => return Err(EngineError::Storage(err)),
        Err(MergeError::TaskRead(err)) => {
            if let Some(id) = merges.abandon_active() {
                warn!("merge of task {id} failed mid-read: {err}");
                give_up_on_store(&id, storage, session, tasks, produced);
            }
        }
    }

    Ok(progressed)
}

/// Failure policy for a task store that cannot be staged or read: record
/// a session warning, clean the store out of whichever area it reached
/// and treat the task as merged so the run keeps moving.
fn give_up_on_store(
    id: &str,
    storage: &dyn TaskStorage,
    session: &SessionStore,
    tasks: &mut TaskManager,
    produced: &mut ItemCounters,
) {
    match session.add_warning(&format!("results of task {id} could not be merged"), None) {
        Ok(()) => produced.warnings += 1,
        Err(err) => warn!("merge-failure warning not recorded: {err}"),
    }
    if storage.remove_merged(id).is_err() {
        if let Err(err) = storage.discard_processed(id) {
            debug!("store of task {id} not cleaned up: {err}");
        }
    }
    if let Err(err) = tasks.complete_task(id) {
        debug!("completion of task {id}: {err}");
    }
}
