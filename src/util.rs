//! # Utility Module
//!
//! Session directory preparation, RPC port-file handoff, and time helpers
//! shared between the foreman and worker processes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
#[cfg(unix)]
use tracing::warn;

/// Current wall-clock time as float epoch seconds.
pub fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Ensure the session directory exists and is writable.
pub fn ensure_session_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "session path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)?;
    }
    let metadata = std::fs::metadata(path)?;

    let probe_path = path.join(".timesift_write_probe");
    match OpenOptions::new().write(true).create(true).open(&probe_path) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "session directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("session directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}

/// Directory the workers publish their RPC port files into.
pub fn rpc_dir(session_dir: &Path) -> PathBuf {
    session_dir.join("rpc")
}

/// Session store file written exclusively by the foreman.
pub fn session_store_path(session_dir: &Path) -> PathBuf {
    session_dir.join("session.jsonl")
}

/// Effective configuration snapshot the workers start from.
pub fn session_config_path(session_dir: &Path) -> PathBuf {
    session_dir.join("session.yml")
}

fn port_file_path(rpc_dir: &Path, pid: u32) -> PathBuf {
    rpc_dir.join(format!("{pid}.port"))
}

/// Publish an RPC port for the given process id. The write is atomic so a
/// polling reader never observes a partial file.
pub fn write_port_file(rpc_dir: &Path, pid: u32, port: u16) -> std::io::Result<()> {
    std::fs::create_dir_all(rpc_dir)?;
    let tmp = rpc_dir.join(format!(".{pid}.port.tmp"));
    std::fs::write(&tmp, port.to_string())?;
    std::fs::rename(&tmp, port_file_path(rpc_dir, pid))
}

/// Read a published RPC port, if present and well-formed.
pub fn read_port_file(rpc_dir: &Path, pid: u32) -> Option<u16> {
    let contents = std::fs::read_to_string(port_file_path(rpc_dir, pid)).ok()?;
    contents.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Poll for a worker's published RPC port until the timeout elapses.
pub fn wait_for_port_file(rpc_dir: &Path, pid: u32, timeout: Duration) -> Option<u16> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(port) = read_port_file(rpc_dir, pid) {
            return Some(port);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Remove a published port file. Missing files are not an error.
pub fn remove_port_file(rpc_dir: &Path, pid: u32) {
    let _ = std::fs::remove_file(port_file_path(rpc_dir, pid));
}
