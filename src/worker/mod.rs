//! # Worker Process
//!
//! Code that runs inside a spawned worker. An extraction worker pulls one
//! task at a time over the request/reply queue, writes its results into a
//! private task store and publishes the store into the processed area; an
//! analysis worker pull-connects to the event fan-out, feeds every record
//! to its plugin and publishes one report store at end of stream. Both
//! serve the heartbeat RPC from a shared state the main loop updates as
//! it goes, so status polls see progress even mid-task.

pub mod executor;
pub mod plugins;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Task, TaskPayload};
use crate::queue::{
    ItemConsumer, Popped, PullConnectQueue, Queue, QueueError, RequestConnectQueue,
};
use crate::rpc::{ProcessingPhase, RpcError, StatusReport, StatusServer, StatusSource};
use crate::storage::{Record, RecordKind, StorageError, TaskStoreWriter, build_task_storage};
use crate::util;

use executor::{RecordSink, StatExecutor, TaskExecutor};
use plugins::build_plugin;

/// One-shot fault-injection hooks for integration tests. The variable
/// holds a marker path; the first worker to create it claims the hook, so
/// a replacement worker comes up clean.
pub const MUTE_RPC_HOOK: &str = "TIMESIFT_TEST_MUTE_RPC_ONCE";
pub const FREEZE_HOOK: &str = "TIMESIFT_TEST_FREEZE_ONCE";

const FREEZE_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue failure: {0}")]
    Queue(#[from] QueueError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("status server failed: {0}")]
    Rpc(#[from] RpcError),
    #[error("executor given the wrong payload kind")]
    WrongPayload,
    #[error("unknown analysis plugin: {0}")]
    UnknownPlugin(String),
}

/// How a spawned worker process is wired up, parsed off its command line.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub scratch: PathBuf,
    pub name: String,
    pub mode: WorkerMode,
}

#[derive(Debug, Clone)]
pub enum WorkerMode {
    Extract {
        dispatch_port: u16,
    },
    Analyze {
        event_port: u16,
        plugin: String,
        task_identifier: String,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Live worker state shared between the main loop and the status server
/// thread. The main loop writes, the server thread only reads snapshots.
struct WorkerState {
    name: String,
    phase: Mutex<ProcessingPhase>,
    task_id: Mutex<Option<String>>,
    // f64 epoch-seconds bit pattern; zero means no task in flight.
    last_activity: AtomicU64,
    consumed_sources: AtomicU64,
    consumed_artifacts: AtomicU64,
    produced_sources: AtomicU64,
    produced_artifacts: AtomicU64,
    produced_warnings: AtomicU64,
    produced_reports: AtomicU64,
}

impl WorkerState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: Mutex::new(ProcessingPhase::Initialized),
            task_id: Mutex::new(None),
            last_activity: AtomicU64::new(0),
            consumed_sources: AtomicU64::new(0),
            consumed_artifacts: AtomicU64::new(0),
            produced_sources: AtomicU64::new(0),
            produced_artifacts: AtomicU64::new(0),
            produced_warnings: AtomicU64::new(0),
            produced_reports: AtomicU64::new(0),
        }
    }

    fn set_phase(&self, phase: ProcessingPhase) {
        *lock(&self.phase) = phase;
    }

    fn begin_task(&self, task_id: &str) {
        *lock(&self.task_id) = Some(task_id.to_string());
        self.touch();
    }

    fn finish_task(&self) {
        *lock(&self.task_id) = None;
        self.last_activity.store(0, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.last_activity
            .store(util::now_epoch_seconds().to_bits(), Ordering::Relaxed);
    }

    fn count_produced(&self, kind: RecordKind) {
        let counter = match kind {
            RecordKind::Source => &self.produced_sources,
            RecordKind::Artifact => &self.produced_artifacts,
            RecordKind::Warning => &self.produced_warnings,
            RecordKind::Report => &self.produced_reports,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl StatusSource for WorkerState {
    fn status_report(&self) -> StatusReport {
        let bits = self.last_activity.load(Ordering::Relaxed);
        StatusReport {
            display_name: self.name.clone(),
            pid: std::process::id(),
            processing_status: *lock(&self.phase),
            used_memory: crate::process::info::current_rss_bytes()
                .unwrap_or(0)
                .to_string(),
            task_identifier: lock(&self.task_id).clone(),
            last_activity_timestamp: (bits != 0).then(|| f64::from_bits(bits)),
            consumed_sources: self.consumed_sources.load(Ordering::Relaxed),
            consumed_artifacts: self.consumed_artifacts.load(Ordering::Relaxed),
            produced_sources: self.produced_sources.load(Ordering::Relaxed),
            produced_artifacts: self.produced_artifacts.load(Ordering::Relaxed),
            produced_warnings: self.produced_warnings.load(Ordering::Relaxed),
            produced_reports: self.produced_reports.load(Ordering::Relaxed),
        }
    }
}

/// Sink wrapper around the private task store writer. Every emitted
/// record bumps the matching counter and the activity timestamp so the
/// heartbeat reflects mid-task progress.
struct CountingSink<'a> {
    writer: &'a mut dyn TaskStoreWriter,
    state: &'a WorkerState,
}

impl RecordSink for CountingSink<'_> {
    fn emit(&mut self, record: Record) -> Result<(), WorkerError> {
        self.writer.add_record(&record)?;
        self.state.count_produced(record.kind());
        self.state.touch();
        Ok(())
    }
}

/// Entry point of the hidden `worker` subcommand.
pub fn run_worker(config: &Config, options: WorkerOptions) -> Result<(), WorkerError> {
    let abort = Arc::new(AtomicBool::new(false));
    {
        let flag = abort.clone();
        let name = options.name.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
            eprintln!("worker {name}: termination requested");
        }) {
            warn!("signal handler installation failed: {err}");
        }
    }
    if config.enable_segfault_handler {
        install_segfault_handler();
    }

    let state = Arc::new(WorkerState::new(&options.name));
    let mute = claim_test_hook(MUTE_RPC_HOOK);
    if mute {
        warn!("worker {} starting with a muted status server", options.name);
    }
    let rpc_dir = util::rpc_dir(&options.scratch);
    let mut server = StatusServer::start(&rpc_dir, state.clone(), mute)?;
    info!(
        "worker {} pid {} serving status on port {}",
        options.name,
        std::process::id(),
        server.port()
    );

    let result = match &options.mode {
        WorkerMode::Extract { dispatch_port } => {
            run_extract_loop(config, &options, *dispatch_port, &state, &abort)
        }
        WorkerMode::Analyze {
            event_port,
            plugin,
            task_identifier,
        } => run_analysis_loop(
            config,
            &options,
            *event_port,
            plugin,
            task_identifier,
            &state,
            &abort,
        ),
    };

    let aborted = abort.load(Ordering::Relaxed);
    state.set_phase(match (&result, aborted) {
        (Err(_), _) | (_, true) => ProcessingPhase::Aborted,
        (Ok(()), false) => ProcessingPhase::Completed,
    });
    server.shutdown();
    info!(
        "worker {} finished, aborted={aborted}, result ok={}",
        options.name,
        result.is_ok()
    );
    result
}

fn run_extract_loop(
    config: &Config,
    options: &WorkerOptions,
    dispatch_port: u16,
    state: &Arc<WorkerState>,
    abort: &Arc<AtomicBool>,
) -> Result<(), WorkerError> {
    let storage = build_task_storage(config.storage_format, &options.scratch)?;
    let executor = StatExecutor;
    let mut queue = RequestConnectQueue::<Task>::new(
        config.queue_config("task-dispatch"),
        dispatch_port,
    )
    .with_abort_flag(abort.clone());
    queue.open()?;
    state.set_phase(ProcessingPhase::Running);

    loop {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        match queue.pop_item() {
            Ok(Popped::Item(task)) => {
                debug!(
                    "worker {} picked up task {} for {}",
                    options.name,
                    task.identifier,
                    task.payload.display()
                );
                state.begin_task(&task.identifier);
                if claim_test_hook(FREEZE_HOOK) {
                    freeze_until_aborted(abort);
                    break;
                }
                execute_task(&task, storage.as_ref(), &executor, state)?;
                state
                    .consumed_sources
                    .fetch_add(1, Ordering::Relaxed);
                state.finish_task();
            }
            Ok(Popped::Abort) => {
                debug!("worker {} received abort sentinel", options.name);
                break;
            }
            Err(QueueError::Empty) => continue,
            Err(QueueError::Closed) => break,
            Err(err) => return Err(err.into()),
        }
    }

    state.set_phase(ProcessingPhase::Reporting);
    let aborted = abort.load(Ordering::Relaxed);
    if let Err(err) = queue.close(aborted) {
        debug!("worker {} queue close failed: {err}", options.name);
    }
    Ok(())
}

fn execute_task(
    task: &Task,
    storage: &dyn crate::storage::TaskStorage,
    executor: &dyn TaskExecutor,
    state: &WorkerState,
) -> Result<(), WorkerError> {
    let mut writer = storage.create_task_store(&task.identifier)?;
    let mut sink = CountingSink {
        writer: writer.as_mut(),
        state,
    };
    executor.execute(&task.payload, &mut sink)?;
    writer.close()?;
    storage.publish_processed(&task.identifier)?;
    Ok(())
}

fn run_analysis_loop(
    config: &Config,
    options: &WorkerOptions,
    event_port: u16,
    plugin_name: &str,
    task_identifier: &str,
    state: &Arc<WorkerState>,
    abort: &Arc<AtomicBool>,
) -> Result<(), WorkerError> {
    let storage = build_task_storage(config.storage_format, &options.scratch)?;
    let mut plugin = build_plugin(plugin_name)?;
    let mut queue = PullConnectQueue::<Record>::new(
        config.queue_config("analysis-events"),
        event_port,
    )
    .with_abort_flag(abort.clone());
    queue.open()?;
    state.begin_task(task_identifier);
    state.set_phase(ProcessingPhase::Running);

    loop {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        match queue.pop_item() {
            Ok(Popped::Item(record)) => {
                plugin.examine(&record);
                state
                    .consumed_artifacts
                    .fetch_add(1, Ordering::Relaxed);
                state.touch();
            }
            // Both the sentinel and a peer close end the stream; the
            // report covers whatever was seen up to that point.
            Ok(Popped::Abort) => break,
            Err(QueueError::Empty) => continue,
            Err(QueueError::Closed) => break,
            Err(err) => return Err(err.into()),
        }
    }

    state.set_phase(ProcessingPhase::Reporting);
    let report = plugin.compile_report();
    let mut writer = storage.create_task_store(task_identifier)?;
    writer.add_record(&Record::Report(report))?;
    state.count_produced(RecordKind::Report);
    writer.close()?;
    storage.publish_processed(task_identifier)?;
    state.finish_task();

    let aborted = abort.load(Ordering::Relaxed);
    if let Err(err) = queue.close(aborted) {
        debug!("worker {} queue close failed: {err}", options.name);
    }
    Ok(())
}

/// Parks the worker mid-task without touching the activity timestamp, so
/// the monitor's inactivity classification can be exercised end to end.
fn freeze_until_aborted(abort: &AtomicBool) {
    warn!("freeze hook claimed, holding the current task");
    while !abort.load(Ordering::Relaxed) {
        std::thread::sleep(FREEZE_SLICE);
    }
}

/// Claims a one-shot hook by creating its marker file exclusively.
fn claim_test_hook(var: &str) -> bool {
    let Ok(marker) = std::env::var(var) else {
        return false;
    };
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)
        .is_ok()
}

/// Last-resort diagnostic on a segmentation fault inside domain logic:
/// one async-signal-safe line to stderr, then the default handler takes
/// over so the process still crashes visibly.
#[cfg(unix)]
fn install_segfault_handler() {
    extern "C" fn on_fault(signal: libc::c_int) {
        const MSG: &[u8] = b"timesift worker: segmentation fault, re-raising\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
            libc::signal(signal, libc::SIG_DFL);
            libc::raise(signal);
        }
    }
    unsafe {
        libc::signal(libc::SIGSEGV, on_fault as usize);
    }
}

#[cfg(not(unix))]
fn install_segfault_handler() {}
