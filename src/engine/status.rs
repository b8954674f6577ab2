use std::fmt;

use tracing::{debug, info};

use crate::process::WorkerSnapshot;
use crate::rpc::ItemCounters;

/// Lifecycle phase of an engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Collecting,
    Running,
    Merging,
    Finalizing,
    Completed,
    Aborted,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnginePhase::Idle => "idle",
            EnginePhase::Collecting => "collecting",
            EnginePhase::Running => "running",
            EnginePhase::Merging => "merging",
            EnginePhase::Finalizing => "finalizing",
            EnginePhase::Completed => "completed",
            EnginePhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Aggregate snapshot reported during a run. Counters reflect records
/// merged into the session store, not records still sitting in task
/// stores.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub phase: EnginePhase,
    pub aborted: bool,
    pub queued_work_items: usize,
    pub pending_tasks: usize,
    pub merging_task: Option<String>,
    pub held_task: Option<String>,
    pub produced: ItemCounters,
    pub workers: Vec<WorkerSnapshot>,
    pub worker_replacements: u64,
    pub elapsed_seconds: f64,
}

/// Progress callback trait for long-running sessions.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, status: &EngineStatus);
}

/// Logs one aggregate line per report, plus a debug line per worker.
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn on_progress(&self, status: &EngineStatus) {
        info!(
            "progress phase={} queued={} pending={} workers={} sources={} artifacts={} warnings={} reports={}",
            status.phase,
            status.queued_work_items,
            status.pending_tasks,
            status.workers.len(),
            status.produced.sources,
            status.produced.artifacts,
            status.produced.warnings,
            status.produced.reports,
        );
        if let Some(task) = &status.merging_task {
            debug!("merging task {task}");
        }
        for worker in &status.workers {
            debug!(
                "worker {} pid {} health {:?} rss {}",
                worker.label,
                worker.pid,
                worker.health,
                worker
                    .report
                    .as_ref()
                    .map(|r| r.used_memory.clone())
                    .unwrap_or_default(),
            );
        }
    }
}

/// Discards every report. Used where progress output is unwanted.
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn on_progress(&self, _status: &EngineStatus) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_is_lowercase() {
        assert_eq!(EnginePhase::Idle.to_string(), "idle");
        assert_eq!(EnginePhase::Merging.to_string(), "merging");
        assert_eq!(EnginePhase::Aborted.to_string(), "aborted");
    }

    #[test]
    fn reporters_accept_empty_status() {
        let status = EngineStatus {
            phase: EnginePhase::Running,
            aborted: false,
            queued_work_items: 0,
            pending_tasks: 0,
            merging_task: None,
            held_task: None,
            produced: ItemCounters::default(),
            workers: Vec::new(),
            worker_replacements: 0,
            elapsed_seconds: 0.0,
        };
        LogProgressReporter.on_progress(&status);
        NullProgressReporter.on_progress(&status);
    }
}
