use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::MonitorError;

const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Program and argument list a pool spawns its workers with. Respawns
/// reuse the same command line.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Owned handle to a spawned worker. Wraps the OS child with the
/// terminate-then-kill escalation the pool relies on.
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    label: String,
}

impl WorkerHandle {
    pub fn spawn(label: String, command: &WorkerCommand) -> Result<Self, MonitorError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .spawn()
            .map_err(MonitorError::Launch)?;
        debug!("spawned worker {label} as pid {}", child.id());
        Ok(Self { child, label })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Non-blocking liveness check through `try_wait`, which also reaps
    /// the child once it has exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(err) => {
                warn!("worker {} wait failed: {err}", self.label);
                false
            }
        }
    }

    /// Polls for exit until the timeout elapses. Returns whether the
    /// process ended inside the window.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_SLICE);
        }
    }

    /// Graceful stop: SIGTERM, bounded wait, then SIGKILL for stragglers.
    pub fn terminate(&mut self) {
        if !self.is_alive() {
            return;
        }
        let pid = self.pid();
        if let Err(err) = send_signal(pid, libc::SIGTERM) {
            debug!("sigterm to worker {} failed: {err}", self.label);
        }
        if self.wait_timeout(TERMINATE_GRACE) {
            return;
        }
        warn!("worker {} ignored sigterm, killing", self.label);
        self.kill();
    }

    /// Hard stop without grace.
    pub fn kill(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!("kill of worker {} failed: {err}", self.label);
        }
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: i32) -> Result<(), MonitorError> {
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone, which is what the caller wanted.
        return Ok(());
    }
    Err(MonitorError::Signal(err))
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: i32) -> Result<(), MonitorError> {
    Ok(())
}
