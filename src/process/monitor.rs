use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::MonitorError;
use super::info::rss_bytes;
use super::launch::{WorkerCommand, WorkerHandle};
use crate::config::Config;
use crate::rpc::{StatusClient, StatusReport};
use crate::util;

const RPC_TIMEOUT: Duration = Duration::from_millis(1500);
const RESPAWN_DELAY: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const STOP_SLICE: Duration = Duration::from_millis(50);

/// Thresholds the pool manager enforces, lifted out of the session config.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub maximum_rpc_errors: u32,
    pub maximum_restart_attempts: u32,
    pub memory_limit_bytes: u64,
    pub worker_timeout: Duration,
    pub startup_timeout: Duration,
    pub health_interval: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            maximum_rpc_errors: config.maximum_rpc_errors,
            maximum_restart_attempts: config.maximum_restart_attempts,
            memory_limit_bytes: config.worker_memory_limit,
            worker_timeout: Duration::from_secs_f64(config.worker_timeout_seconds),
            startup_timeout: Duration::from_secs_f64(config.worker_startup_timeout_seconds),
            health_interval: Duration::from_secs_f64(config.status_interval_seconds),
        }
    }
}

/// Health classification for one poll of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Healthy,
    Exited,
    RpcUnreachable,
    Inactive,
    OverMemory,
}

/// Published once per poll round; the engine reads these instead of
/// sharing any live counters with the monitor thread.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub pid: u32,
    pub label: String,
    pub health: WorkerHealth,
    pub report: Option<StatusReport>,
}

struct ProcessEntry {
    handle: WorkerHandle,
    command: WorkerCommand,
    client: StatusClient,
    rpc_failures: u32,
    last_report: Option<StatusReport>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type Pool = Mutex<HashMap<u32, ProcessEntry>>;

/// Worker pool manager. Registers spawned workers, polls their heartbeat
/// RPC on a background timer thread, replaces the ones that die or go
/// silent with the same command line, and escalates termination on
/// shutdown.
pub struct ProcessMonitor {
    settings: MonitorSettings,
    rpc_dir: PathBuf,
    pool: Arc<Pool>,
    snapshots: Arc<Mutex<Vec<WorkerSnapshot>>>,
    replacements: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    health: Option<JoinHandle<()>>,
}

impl ProcessMonitor {
    pub fn new(settings: MonitorSettings, rpc_dir: PathBuf) -> Self {
        Self {
            settings,
            rpc_dir,
            pool: Arc::new(Mutex::new(HashMap::new())),
            snapshots: Arc::new(Mutex::new(Vec::new())),
            replacements: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            health: None,
        }
    }

    /// Spawns and registers one worker. The command line is retained so a
    /// replacement runs the same program with the same arguments.
    pub fn spawn_worker(&self, label: &str, command: WorkerCommand) -> Result<u32, MonitorError> {
        spawn_into_pool(&self.settings, &self.rpc_dir, label, command, &self.pool)
    }

    /// Starts the periodic health pass on its own timer thread.
    pub fn start_health_checks(&mut self) -> Result<(), MonitorError> {
        let ctx = HealthContext {
            settings: self.settings.clone(),
            rpc_dir: self.rpc_dir.clone(),
            pool: self.pool.clone(),
            snapshots: self.snapshots.clone(),
            replacements: self.replacements.clone(),
            stop: self.stop.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("health-monitor".to_string())
            .spawn(move || ctx.run())
            .map_err(MonitorError::Thread)?;
        self.health = Some(handle);
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        lock(&self.snapshots).clone()
    }

    pub fn replacement_count(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }

    pub fn live_worker_count(&self) -> usize {
        lock(&self.pool).len()
    }

    /// Stops polling and brings the pool down. Normal shutdown gives each
    /// worker a grace window to drain before escalation; abort goes
    /// straight to a hard kill.
    pub fn shutdown(&mut self, abort: bool) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.health.take() {
            let _ = handle.join();
        }
        let mut pool = lock(&self.pool);
        for (pid, mut entry) in pool.drain() {
            if abort {
                entry.handle.kill();
            } else if !entry.handle.wait_timeout(SHUTDOWN_GRACE) {
                warn!(
                    "worker {} still running at shutdown, escalating",
                    entry.handle.label()
                );
                entry.handle.terminate();
            }
            util::remove_port_file(&self.rpc_dir, pid);
        }
        lock(&self.snapshots).clear();
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if self.health.is_some() || !lock(&self.pool).is_empty() {
            self.shutdown(true);
        }
    }
}

/// Registration sequence: spawn, wait for the published rpc port, open a
/// status client, then insert under the process id. Any failure tears the
/// half-started process down and surfaces an error.
fn spawn_into_pool(
    settings: &MonitorSettings,
    rpc_dir: &Path,
    label: &str,
    command: WorkerCommand,
    pool: &Pool,
) -> Result<u32, MonitorError> {
    let mut handle = WorkerHandle::spawn(label.to_string(), &command)?;
    let pid = handle.pid();

    let port = match util::wait_for_port_file(rpc_dir, pid, settings.startup_timeout) {
        Some(port) => port,
        None => {
            warn!("worker {label} never published an rpc port");
            handle.terminate();
            util::remove_port_file(rpc_dir, pid);
            return Err(MonitorError::PortTimeout {
                label: label.to_string(),
            });
        }
    };
    let client = match StatusClient::connect(port, RPC_TIMEOUT) {
        Ok(client) => client,
        Err(source) => {
            warn!("worker {label} rpc connect failed: {source}");
            handle.terminate();
            util::remove_port_file(rpc_dir, pid);
            return Err(MonitorError::Connect {
                label: label.to_string(),
                source,
            });
        }
    };
    info!("worker {label} registered with pid {pid} rpc port {port}");
    lock(pool).insert(
        pid,
        ProcessEntry {
            handle,
            command,
            client,
            rpc_failures: 0,
            last_report: None,
        },
    );
    Ok(pid)
}

struct HealthContext {
    settings: MonitorSettings,
    rpc_dir: PathBuf,
    pool: Arc<Pool>,
    snapshots: Arc<Mutex<Vec<WorkerSnapshot>>>,
    replacements: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

impl HealthContext {
    fn run(self) {
        while !self.stop.load(Ordering::Relaxed) {
            let round_started = Instant::now();
            self.poll_round();
            while Instant::now() - round_started < self.settings.health_interval {
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(STOP_SLICE);
            }
        }
    }

    fn poll_round(&self) {
        let mut unhealthy: Vec<(u32, WorkerHealth)> = Vec::new();
        let mut snaps: Vec<WorkerSnapshot> = Vec::new();
        {
            let mut pool = lock(&self.pool);
            for (pid, entry) in pool.iter_mut() {
                let health = poll_entry(&self.settings, *pid, entry);
                snaps.push(WorkerSnapshot {
                    pid: *pid,
                    label: entry.handle.label().to_string(),
                    health,
                    report: entry.last_report.clone(),
                });
                if health != WorkerHealth::Healthy {
                    unhealthy.push((*pid, health));
                }
            }
        }
        snaps.sort_by(|a, b| a.label.cmp(&b.label));
        *lock(&self.snapshots) = snaps;

        for (pid, health) in unhealthy {
            self.recover(pid, health);
        }
    }

    /// Deregister, stop and replace one worker. Replacement attempts are
    /// bounded; exhausting them shrinks the pool but never fails the run.
    fn recover(&self, pid: u32, health: WorkerHealth) {
        let entry = lock(&self.pool).remove(&pid);
        let Some(mut entry) = entry else {
            return;
        };
        let label = entry.handle.label().to_string();
        warn!("worker {label} pid {pid} classified {health:?}, replacing");
        entry.handle.terminate();
        util::remove_port_file(&self.rpc_dir, pid);

        for attempt in 1..=self.settings.maximum_restart_attempts {
            std::thread::sleep(RESPAWN_DELAY);
            match spawn_into_pool(
                &self.settings,
                &self.rpc_dir,
                &label,
                entry.command.clone(),
                &self.pool,
            ) {
                Ok(new_pid) => {
                    self.replacements.fetch_add(1, Ordering::Relaxed);
                    info!("replaced worker {label} pid {pid} with pid {new_pid}");
                    return;
                }
                Err(err) => warn!("replacement attempt {attempt} for {label} failed: {err}"),
            }
        }
        warn!(
            "giving up on replacing worker {label} after {} attempts",
            self.settings.maximum_restart_attempts
        );
    }
}

fn poll_entry(settings: &MonitorSettings, pid: u32, entry: &mut ProcessEntry) -> WorkerHealth {
    if !entry.handle.is_alive() {
        warn!(
            "worker {} pid {pid} exited unexpectedly",
            entry.handle.label()
        );
        return WorkerHealth::Exited;
    }

    if settings.memory_limit_bytes > 0 {
        if let Some(rss) = rss_bytes(pid) {
            if rss > settings.memory_limit_bytes {
                warn!(
                    "worker {} pid {pid} uses {rss} bytes, over limit {}",
                    entry.handle.label(),
                    settings.memory_limit_bytes
                );
                // Hard kill right away; recovery handles the respawn.
                entry.handle.kill();
                return WorkerHealth::OverMemory;
            }
        }
    }

    match entry.client.query() {
        Some(report) => {
            entry.rpc_failures = 0;
            let stale =
                inactivity_exceeded(&report, settings.worker_timeout, util::now_epoch_seconds());
            entry.last_report = Some(report);
            if stale {
                warn!(
                    "worker {} pid {pid} inactive past timeout",
                    entry.handle.label()
                );
                WorkerHealth::Inactive
            } else {
                WorkerHealth::Healthy
            }
        }
        None => {
            entry.rpc_failures += 1;
            debug!(
                "worker {} pid {pid} rpc failure {} of {}",
                entry.handle.label(),
                entry.rpc_failures,
                settings.maximum_rpc_errors
            );
            if entry.rpc_failures >= settings.maximum_rpc_errors {
                WorkerHealth::RpcUnreachable
            } else {
                WorkerHealth::Healthy
            }
        }
    }
}

/// A worker with no in-flight task reports no activity timestamp and is
/// exempt from the inactivity check.
fn inactivity_exceeded(report: &StatusReport, timeout: Duration, now: f64) -> bool {
    match report.last_activity_timestamp {
        Some(last) => last + timeout.as_secs_f64() < now,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ProcessingPhase;

    fn report(last_activity: Option<f64>) -> StatusReport {
        StatusReport {
            display_name: "w".to_string(),
            pid: 1,
            processing_status: ProcessingPhase::Running,
            used_memory: "0".to_string(),
            task_identifier: None,
            last_activity_timestamp: last_activity,
            consumed_sources: 0,
            consumed_artifacts: 0,
            produced_sources: 0,
            produced_artifacts: 0,
            produced_warnings: 0,
            produced_reports: 0,
        }
    }

    #[test]
    fn recent_activity_is_not_stale() {
        let r = report(Some(100.0));
        assert!(!inactivity_exceeded(&r, Duration::from_secs(60), 120.0));
    }

    #[test]
    fn old_activity_is_stale() {
        let r = report(Some(100.0));
        assert!(inactivity_exceeded(&r, Duration::from_secs(60), 200.0));
    }

    #[test]
    fn idle_worker_is_never_stale() {
        let r = report(None);
        assert!(!inactivity_exceeded(&r, Duration::from_secs(1), 1_000_000.0));
    }

    #[test]
    fn settings_come_from_config() {
        let config = crate::config::load_config(None).expect("defaults").config;
        let settings = MonitorSettings::from_config(&config);
        assert_eq!(settings.maximum_rpc_errors, config.maximum_rpc_errors);
        assert_eq!(
            settings.worker_timeout,
            Duration::from_secs_f64(config.worker_timeout_seconds)
        );
    }

    #[test]
    fn spawn_failure_reports_launch_error() {
        let settings = MonitorSettings {
            maximum_rpc_errors: 3,
            maximum_restart_attempts: 1,
            memory_limit_bytes: 0,
            worker_timeout: Duration::from_secs(60),
            startup_timeout: Duration::from_millis(200),
            health_interval: Duration::from_millis(100),
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let monitor = ProcessMonitor::new(settings, dir.path().to_path_buf());
        let command = WorkerCommand::new("/nonexistent/worker/binary");
        let result = monitor.spawn_worker("worker-00", command);
        assert!(matches!(result, Err(MonitorError::Launch(_))));
        assert_eq!(monitor.live_worker_count(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn silent_program_fails_port_wait_and_is_cleaned_up() {
        let settings = MonitorSettings {
            maximum_rpc_errors: 3,
            maximum_restart_attempts: 1,
            memory_limit_bytes: 0,
            worker_timeout: Duration::from_secs(60),
            startup_timeout: Duration::from_millis(300),
            health_interval: Duration::from_millis(100),
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let monitor = ProcessMonitor::new(settings, dir.path().to_path_buf());
        // `sleep` never publishes a port file, so registration times out.
        let command = WorkerCommand::new("sleep").arg("30");
        let result = monitor.spawn_worker("worker-00", command);
        assert!(matches!(result, Err(MonitorError::PortTimeout { .. })));
        assert_eq!(monitor.live_worker_count(), 0);
    }
}
