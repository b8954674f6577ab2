use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ArtifactRecord, Record, StorageError, WarningRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: String,
    pub config_hash: String,
    pub started: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletion {
    pub session_id: String,
    pub aborted: bool,
    pub completed: f64,
    pub produced_sources: u64,
    pub produced_artifacts: u64,
    pub produced_warnings: u64,
    pub produced_reports: u64,
}

/// One line of the session store file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum SessionEntry {
    SessionStart(SessionStart),
    Record(Record),
    SessionCompletion(SessionCompletion),
}

/// Long-lived aggregate store, JSON lines, owned exclusively by the
/// foreman. Workers never touch it; their output arrives here only
/// through the merge pass.
pub struct SessionStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl SessionStore {
    /// Creates the store and writes the session-start entry.
    pub fn create(path: &Path, session_id: &str, config_hash: &str) -> Result<Self, StorageError> {
        let file = File::create(path)?;
        let store = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        };
        store.append(&SessionEntry::SessionStart(SessionStart {
            session_id: session_id.to_string(),
            config_hash: config_hash.to_string(),
            started: crate::util::now_epoch_seconds(),
        }))?;
        debug!("session store created at {}", path.display());
        Ok(store)
    }

    /// Reopens an existing store for a follow-up run, e.g. analysis over
    /// a completed extraction session.
    pub fn open_append(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &SessionEntry) -> Result<(), StorageError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn append_merged(&self, record: &Record) -> Result<(), StorageError> {
        self.append(&SessionEntry::Record(record.clone()))
    }

    pub fn add_warning(&self, message: &str, path: Option<&str>) -> Result<(), StorageError> {
        self.append(&SessionEntry::Record(Record::Warning(WarningRecord {
            message: message.to_string(),
            path: path.map(|p| p.to_string()),
        })))
    }

    pub fn write_completion(&self, completion: &SessionCompletion) -> Result<(), StorageError> {
        self.append(&SessionEntry::SessionCompletion(completion.clone()))?;
        self.flush()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.flush()?;
        Ok(())
    }

    /// Reads a store file back, line by line.
    pub fn read_entries(path: &Path) -> Result<Vec<SessionEntry>, StorageError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// All merged artifacts ordered by timestamp, then source path. The
    /// analysis stage streams these to its plugins.
    pub fn sorted_artifacts(path: &Path) -> Result<Vec<ArtifactRecord>, StorageError> {
        let mut artifacts: Vec<ArtifactRecord> = Self::read_entries(path)?
            .into_iter()
            .filter_map(|entry| match entry {
                SessionEntry::Record(Record::Artifact(artifact)) => Some(artifact),
                _ => None,
            })
            .collect();
        artifacts.sort_by(|a, b| {
            a.timestamp
                .total_cmp(&b.timestamp)
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        Ok(artifacts)
    }
}
