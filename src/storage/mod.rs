//! # Task and Session Storage
//!
//! Every task gets a private store written by exactly one worker, handed
//! to the foreman through three areas: in-progress (worker-owned),
//! processed (published, foreman-readable) and merge (foreman-exclusive
//! staging). Two backends implement the same handoff: a directory layout
//! with atomic renames, and a keyed SQLite variant that swaps directories
//! for namespaced rows. Merged records land in the session store, which
//! only the foreman writes.

mod fs;
mod keyed;
mod session;

pub use fs::FsTaskStorage;
pub use keyed::KeyedTaskStorage;
pub use session::{SessionCompletion, SessionEntry, SessionStart, SessionStore};

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("database failure: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("unknown task store: {0}")]
    UnknownTask(String),
    #[error("writer already closed")]
    WriterClosed,
}

/// Storage backend selector, settable from the config file or the
/// command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    Jsonl,
    Sqlite,
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "jsonl" => Ok(StorageFormat::Jsonl),
            "sqlite" => Ok(StorageFormat::Sqlite),
            other => Err(format!("unknown storage format: {other}")),
        }
    }
}

impl std::fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageFormat::Jsonl => f.write_str("jsonl"),
            StorageFormat::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Source category. Directories sort ahead of files in the work-item
/// heap so discovery keeps flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub path: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub source_path: String,
    pub name: String,
    pub timestamp: f64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub plugin: String,
    pub text: String,
    pub created: f64,
}

/// One stored record of any kind, tagged for the wire and the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Source(SourceRecord),
    Artifact(ArtifactRecord),
    Warning(WarningRecord),
    Report(ReportRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Source,
    Artifact,
    Warning,
    Report,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Source(_) => RecordKind::Source,
            Record::Artifact(_) => RecordKind::Artifact,
            Record::Warning(_) => RecordKind::Warning,
            Record::Report(_) => RecordKind::Report,
        }
    }
}

/// Writer half of a private task store. Owned by one worker at a time.
pub trait TaskStoreWriter: Send {
    fn add_record(&mut self, record: &Record) -> Result<(), StorageError>;
    fn record_count(&self) -> u64;
    fn close(&mut self) -> Result<(), StorageError>;
}

/// Streaming reader over a task store staged for merge. Yields records
/// in the order the worker wrote them.
pub trait TaskStoreReader: Send {
    fn next_record(&mut self) -> Result<Option<Record>, StorageError>;
}

/// Three-phase task store handoff shared by both backends.
///
/// Worker side: `create_task_store`, write, `close`, `publish_processed`.
/// Foreman side: `processed_task_ids` to discover, `has_content` to decide
/// whether a merge is needed, `prepare_merge` to stage, then a reader and
/// finally `remove_merged`.
pub trait TaskStorage: Send + Sync {
    fn create_task_store(&self, task_id: &str) -> Result<Box<dyn TaskStoreWriter>, StorageError>;
    fn publish_processed(&self, task_id: &str) -> Result<(), StorageError>;
    fn processed_task_ids(&self) -> Result<Vec<String>, StorageError>;
    fn task_store_size(&self, task_id: &str) -> Result<u64, StorageError>;
    fn has_content(&self, task_id: &str) -> Result<bool, StorageError>;
    fn discard_processed(&self, task_id: &str) -> Result<(), StorageError>;
    fn prepare_merge(&self, task_id: &str) -> Result<(), StorageError>;
    fn open_merge_reader(&self, task_id: &str) -> Result<Box<dyn TaskStoreReader>, StorageError>;
    fn remove_merged(&self, task_id: &str) -> Result<(), StorageError>;
}

/// Builds the backend for the configured format. Safe to call from both
/// the foreman and every worker against the same scratch directory.
pub fn build_task_storage(
    format: StorageFormat,
    scratch: &Path,
) -> Result<Box<dyn TaskStorage>, StorageError> {
    match format {
        StorageFormat::Jsonl => Ok(Box::new(FsTaskStorage::create(scratch)?)),
        StorageFormat::Sqlite => Ok(Box::new(KeyedTaskStorage::create(scratch)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let record = Record::Artifact(ArtifactRecord {
            source_path: "/evidence/a.txt".to_string(),
            name: "file_stat".to_string(),
            timestamp: 1_700_000_000.0,
            size: 42,
            sha256: Some("ab".repeat(32)),
        });
        let line = serde_json::to_string(&record).expect("encode");
        assert!(line.contains("\"record\":\"artifact\""));
        let back: Record = serde_json::from_str(&line).expect("decode");
        assert_eq!(back, record);
        assert_eq!(back.kind(), RecordKind::Artifact);
    }

    #[test]
    fn storage_format_parses_from_text() {
        assert_eq!("jsonl".parse::<StorageFormat>(), Ok(StorageFormat::Jsonl));
        assert_eq!("sqlite".parse::<StorageFormat>(), Ok(StorageFormat::Sqlite));
        assert!("parquet".parse::<StorageFormat>().is_err());
    }

    #[test]
    fn directory_sources_tag_their_kind() {
        let record = Record::Source(SourceRecord {
            path: "/evidence".to_string(),
            kind: SourceKind::Directory,
        });
        let line = serde_json::to_string(&record).expect("encode");
        assert!(line.contains("\"record\":\"source\""));
        assert!(line.contains("\"kind\":\"directory\""));
        let back: Record = serde_json::from_str(&line).expect("decode");
        assert_eq!(back, record);
    }
}
