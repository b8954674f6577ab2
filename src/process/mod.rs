//! # Worker Process Management
//!
//! Spawning, liveness probing and health supervision for the worker pool.
//! The monitor polls each worker's heartbeat RPC on a timer thread and
//! applies the recovery ladder: terminate with grace, kill stragglers,
//! respawn a bounded number of replacements.

pub mod info;
mod launch;
mod monitor;

pub use launch::{WorkerCommand, WorkerHandle, send_signal};
pub use monitor::{MonitorSettings, ProcessMonitor, WorkerHealth, WorkerSnapshot};

use thiserror::Error;

use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to launch worker process: {0}")]
    Launch(#[source] std::io::Error),
    #[error("worker {label} never published an rpc port")]
    PortTimeout { label: String },
    #[error("worker {label} rpc connect failed: {source}")]
    Connect { label: String, source: RpcError },
    #[error("signal delivery failed: {0}")]
    Signal(#[source] std::io::Error),
    #[error("monitor thread failed to start: {0}")]
    Thread(#[source] std::io::Error),
}
