//! Analysis over a completed session: every sorted artifact is streamed
//! to one worker per plugin over a dedicated event queue, each worker
//! publishes a single report store at end of stream and the reports are
//! merged back into the same session file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{
    EngineError, EnginePhase, EngineStatus, LogProgressReporter, MergeCoordinator,
    ProgressReporter, RunSummary, TaskManager, TaskPayload, merge_step, resolve_worker_program,
};
use crate::config::{self, Config};
use crate::process::{MonitorSettings, ProcessMonitor, WorkerCommand};
use crate::queue::{ItemProducer, PushBindQueue, Queue, QueueError};
use crate::rpc::ItemCounters;
use crate::storage::{Record, SessionCompletion, SessionStore, build_task_storage};
use crate::util;
use crate::worker::plugins::build_plugin;

const COLLECT_TICK: Duration = Duration::from_millis(20);
const PEER_POLL: Duration = Duration::from_millis(50);

struct PluginChannel {
    plugin: String,
    queue: PushBindQueue<Record>,
}

/// Runs the analysis phase of a session. One task and one worker per
/// plugin; the workers never touch the session store themselves, their
/// reports come back through the regular task-store handoff.
pub struct AnalysisEngine {
    config: Config,
    session_dir: PathBuf,
    abort: Arc<AtomicBool>,
    reporter: Arc<dyn ProgressReporter>,
}

impl AnalysisEngine {
    pub fn new(config: Config, session_dir: &Path) -> Self {
        Self {
            config,
            session_dir: session_dir.to_path_buf(),
            abort: Arc::new(AtomicBool::new(false)),
            reporter: Arc::new(LogProgressReporter),
        }
    }

    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn run(&mut self, plugins: &[String]) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        if plugins.is_empty() {
            return Err(EngineError::Setup("no analysis plugins requested".to_string()));
        }
        // Unknown names fail the whole run before any worker is spawned.
        for name in plugins {
            build_plugin(name).map_err(|err| EngineError::Setup(err.to_string()))?;
        }

        let store_path = util::session_store_path(&self.session_dir);
        let artifacts = SessionStore::sorted_artifacts(&store_path)?;
        info!(
            "session {} analyzing {} artifacts with {} plugins",
            self.config.session_id,
            artifacts.len(),
            plugins.len()
        );
        config::write_session_config(
            &self.config,
            &util::session_config_path(&self.session_dir),
        )
        .map_err(|err| EngineError::Setup(err.to_string()))?;
        let session = SessionStore::open_append(&store_path)?;
        let storage = build_task_storage(self.config.storage_format, &self.session_dir)?;

        // Analysis workers are one-shot; there is no retry path for a
        // plugin whose worker dies, it lands on the failed list directly.
        let mut tasks = TaskManager::new(
            &self.config.session_id,
            self.config.storage_format,
            Duration::from_secs_f64(self.config.task_inactive_seconds),
            0,
        );
        let mut monitor = ProcessMonitor::new(
            MonitorSettings::from_config(&self.config),
            util::rpc_dir(&self.session_dir),
        );
        let program = resolve_worker_program(&self.config)?;

        let mut channels: Vec<PluginChannel> = Vec::new();
        let mut spawn_failures: Vec<String> = Vec::new();
        for plugin in plugins {
            let mut queue = PushBindQueue::<Record>::new(
                self.config.queue_config(&format!("analysis-{plugin}")),
            );
            queue.open()?;
            let event_port = queue
                .port()
                .ok_or_else(|| EngineError::Setup("event queue reported no port".to_string()))?;
            let task = tasks.create_task(TaskPayload::RunPlugin {
                plugin: plugin.clone(),
            });
            let label = format!("analysis-{plugin}");
            let command = analyze_command(
                &program,
                &self.session_dir,
                &label,
                event_port,
                plugin,
                &task.identifier,
            );
            match monitor.spawn_worker(&label, command) {
                Ok(pid) => {
                    debug!("plugin {plugin} running as {label} with pid {pid}");
                    if let Err(err) = tasks.mark_scheduled(&task.identifier) {
                        debug!("scheduling mark for {}: {err}", task.identifier);
                    }
                    channels.push(PluginChannel {
                        plugin: plugin.clone(),
                        queue,
                    });
                }
                Err(err) => {
                    warn!("spawn of {label} failed: {err}");
                    let _ = queue.close(true);
                    if let Err(err) = tasks.complete_task(&task.identifier) {
                        debug!("completion of {}: {err}", task.identifier);
                    }
                    spawn_failures.push(plugin.clone());
                }
            }
        }
        let mut outcome: Result<(), EngineError> = Ok(());
        if !channels.is_empty() {
            monitor.start_health_checks()?;

            let deadline = Instant::now()
                + Duration::from_secs_f64(self.config.worker_startup_timeout_seconds);
            while Instant::now() < deadline {
                if channels.iter().all(|c| c.queue.peer_count() > 0) {
                    break;
                }
                std::thread::sleep(PEER_POLL);
            }

            'stream: for artifact in &artifacts {
                if self.abort.load(Ordering::Relaxed) {
                    break;
                }
                let record = Record::Artifact(artifact.clone());
                for channel in &channels {
                    match channel.queue.push_item(&record) {
                        Ok(()) => {}
                        Err(QueueError::Full) => {
                            warn!("plugin {} stopped draining its event queue", channel.plugin);
                            outcome = Err(EngineError::Queue(QueueError::Full));
                            break 'stream;
                        }
                        Err(err) => {
                            outcome = Err(EngineError::Queue(err));
                            break 'stream;
                        }
                    }
                }
            }
        }

        // End of stream: the in-band sentinel tells every consumer the
        // stream is complete before the socket goes away.
        let stream_aborted = self.abort.load(Ordering::Relaxed) || outcome.is_err();
        for channel in &mut channels {
            if !stream_aborted {
                match channel.queue.push_abort() {
                    Ok(true) => {}
                    Ok(false) => debug!("plugin {} saw no peer for the sentinel", channel.plugin),
                    Err(err) => debug!("sentinel push to {} failed: {err}", channel.plugin),
                }
            }
            if let Err(err) = channel.queue.close(stream_aborted) {
                debug!("event queue for {} close failed: {err}", channel.plugin);
            }
        }

        let mut merges = MergeCoordinator::new(
            self.config.merge_record_limit,
            self.config.merge_record_ceiling,
        );
        let mut produced = ItemCounters::default();
        let mut discovered = VecDeque::new();
        let progress_interval =
            Duration::from_secs_f64(self.config.progress_interval_seconds.max(0.1));
        let mut last_progress = Instant::now();
        if outcome.is_ok() {
            while tasks.has_pending_tasks() && !self.abort.load(Ordering::Relaxed) {
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
                    Ok(progressed) => {
                        if !progressed {
                            std::thread::sleep(COLLECT_TICK);
                        }
                    }
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
                for id in tasks.abandon_inactive(util::now_epoch_seconds()) {
                    debug!("analysis task {id} abandoned");
                }
                if last_progress.elapsed() >= progress_interval {
                    self.reporter.on_progress(&EngineStatus {
                        phase: EnginePhase::Merging,
                        aborted: false,
                        queued_work_items: 0,
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
            }
        }

        let aborted = self.abort.load(Ordering::Relaxed) || outcome.is_err();
        let replacements = monitor.replacement_count();
        monitor.shutdown(aborted);

        let mut failed_items = Vec::new();
        for plugin in &spawn_failures {
            failed_items.push(plugin.clone());
            match session.add_warning("analysis worker could not be started", Some(plugin)) {
                Ok(()) => produced.warnings += 1,
                Err(err) => warn!("spawn-failure warning not recorded: {err}"),
            }
        }
        for payload in tasks.failed_payloads() {
            failed_items.push(payload.display().to_string());
            match session.add_warning("analysis plugin produced no report", Some(payload.display()))
            {
                Ok(()) => produced.warnings += 1,
                Err(err) => warn!("failed-plugin warning not recorded: {err}"),
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
        info!(
            "session {} analysis finished: {} reports, {} failed plugins, aborted={}",
            summary.session_id,
            summary.produced.reports,
            summary.failed_items.len(),
            summary.aborted,
        );
        Ok(summary)
    }
}

fn analyze_command(
    program: &Path,
    session_dir: &Path,
    label: &str,
    event_port: u16,
    plugin: &str,
    task_id: &str,
) -> WorkerCommand {
    WorkerCommand::new(program)
        .arg("worker")
        .arg("--scratch")
        .arg(session_dir.to_string_lossy().into_owned())
        .arg("--name")
        .arg(label)
        .arg("--role")
        .arg("analyze")
        .arg("--event-port")
        .arg(event_port.to_string())
        .arg("--plugin")
        .arg(plugin)
        .arg("--task-id")
        .arg(task_id)
}
