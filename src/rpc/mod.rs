//! # Heartbeat RPC
//!
//! Status polling between the foreman and its workers. Each worker binds a
//! small request/response server on a port derived from its process id and
//! publishes the port through a file in the session scratch directory; the
//! foreman opens one persistent client per worker and polls it on a timer.
//! The exposed call takes no arguments and returns a flat status record.

mod client;
mod server;

pub use client::StatusClient;
pub use server::StatusServer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no port available for status server")]
    NoPort,
    #[error("port file error: {0}")]
    PortFile(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// Phase a worker reports over the heartbeat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    Initialized,
    Running,
    Reporting,
    Completed,
    Aborted,
}

impl std::fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ProcessingPhase::Initialized => "initialized",
            ProcessingPhase::Running => "running",
            ProcessingPhase::Reporting => "reporting",
            ProcessingPhase::Completed => "completed",
            ProcessingPhase::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Per-kind record tallies carried inside a status report and aggregated
/// into the session status snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounters {
    pub sources: u64,
    pub artifacts: u64,
    pub warnings: u64,
    pub reports: u64,
}

impl ItemCounters {
    pub fn accumulate(&mut self, other: &ItemCounters) {
        self.sources += other.sources;
        self.artifacts += other.artifacts;
        self.warnings += other.warnings;
        self.reports += other.reports;
    }

    pub fn total(&self) -> u64 {
        self.sources + self.artifacts + self.warnings + self.reports
    }
}

/// Flat status record returned by the single heartbeat call. Memory is
/// string-encoded so oversized counters survive any wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub display_name: String,
    pub pid: u32,
    pub processing_status: ProcessingPhase,
    pub used_memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_timestamp: Option<f64>,
    #[serde(default)]
    pub consumed_sources: u64,
    #[serde(default)]
    pub consumed_artifacts: u64,
    #[serde(default)]
    pub produced_sources: u64,
    #[serde(default)]
    pub produced_artifacts: u64,
    #[serde(default)]
    pub produced_warnings: u64,
    #[serde(default)]
    pub produced_reports: u64,
}

impl StatusReport {
    pub fn used_memory_bytes(&self) -> u64 {
        self.used_memory.parse().unwrap_or(0)
    }

    pub fn consumed(&self) -> ItemCounters {
        ItemCounters {
            sources: self.consumed_sources,
            artifacts: self.consumed_artifacts,
            warnings: 0,
            reports: 0,
        }
    }

    pub fn produced(&self) -> ItemCounters {
        ItemCounters {
            sources: self.produced_sources,
            artifacts: self.produced_artifacts,
            warnings: self.produced_warnings,
            reports: self.produced_reports,
        }
    }
}

/// Implemented by whatever owns the live worker state; the server thread
/// calls it once per incoming request.
pub trait StatusSource: Send + Sync {
    fn status_report(&self) -> StatusReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_serializes_flat() {
        let report = StatusReport {
            display_name: "worker-1".to_string(),
            pid: 4242,
            processing_status: ProcessingPhase::Running,
            used_memory: "1048576".to_string(),
            task_identifier: Some("task-abc".to_string()),
            last_activity_timestamp: Some(1_700_000_000.5),
            consumed_sources: 3,
            consumed_artifacts: 0,
            produced_sources: 7,
            produced_artifacts: 21,
            produced_warnings: 1,
            produced_reports: 0,
        };
        let value = serde_json::to_value(&report).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["processing_status"], "running");
        assert_eq!(object["used_memory"], "1048576");
        assert!(object.values().all(|v| !v.is_object()));
    }

    #[test]
    fn absent_task_fields_are_omitted() {
        let report = StatusReport {
            display_name: "analysis".to_string(),
            pid: 1,
            processing_status: ProcessingPhase::Initialized,
            used_memory: "0".to_string(),
            task_identifier: None,
            last_activity_timestamp: None,
            consumed_sources: 0,
            consumed_artifacts: 0,
            produced_sources: 0,
            produced_artifacts: 0,
            produced_warnings: 0,
            produced_reports: 0,
        };
        let value = serde_json::to_value(&report).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("task_identifier"));
        assert!(!object.contains_key("last_activity_timestamp"));
    }

    #[test]
    fn counters_accumulate() {
        let mut total = ItemCounters::default();
        total.accumulate(&ItemCounters {
            sources: 1,
            artifacts: 2,
            warnings: 3,
            reports: 4,
        });
        total.accumulate(&ItemCounters {
            sources: 10,
            artifacts: 20,
            warnings: 30,
            reports: 40,
        });
        assert_eq!(total.sources, 11);
        assert_eq!(total.total(), 110);
    }
}
