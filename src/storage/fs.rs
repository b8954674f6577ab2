use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Record, StorageError, TaskStorage, TaskStoreReader, TaskStoreWriter};

const IN_PROGRESS_DIR: &str = "in_progress";
const PROCESSED_DIR: &str = "processed";
const MERGE_DIR: &str = "merge";

/// Directory-backed task storage. One JSON-lines file per task moves
/// between the three areas by atomic rename, so "processed" membership
/// is a plain directory listing.
pub struct FsTaskStorage {
    in_progress: PathBuf,
    processed: PathBuf,
    merge: PathBuf,
}

impl FsTaskStorage {
    pub fn create(scratch: &Path) -> Result<Self, StorageError> {
        let root = scratch.join("tasks");
        let storage = Self {
            in_progress: root.join(IN_PROGRESS_DIR),
            processed: root.join(PROCESSED_DIR),
            merge: root.join(MERGE_DIR),
        };
        fs::create_dir_all(&storage.in_progress)?;
        fs::create_dir_all(&storage.processed)?;
        fs::create_dir_all(&storage.merge)?;
        Ok(storage)
    }

    fn file_name(task_id: &str) -> String {
        format!("{task_id}.jsonl")
    }

    fn in_progress_path(&self, task_id: &str) -> PathBuf {
        self.in_progress.join(Self::file_name(task_id))
    }

    fn processed_path(&self, task_id: &str) -> PathBuf {
        self.processed.join(Self::file_name(task_id))
    }

    fn merge_path(&self, task_id: &str) -> PathBuf {
        self.merge.join(Self::file_name(task_id))
    }
}

fn map_not_found(err: std::io::Error, task_id: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::UnknownTask(task_id.to_string())
    } else {
        StorageError::Io(err)
    }
}

impl TaskStorage for FsTaskStorage {
    fn create_task_store(&self, task_id: &str) -> Result<Box<dyn TaskStoreWriter>, StorageError> {
        let path = self.in_progress_path(task_id);
        let file = File::create(&path)?;
        debug!("created task store {}", path.display());
        Ok(Box::new(FsTaskWriter {
            writer: Some(BufWriter::new(file)),
            count: 0,
        }))
    }

    fn publish_processed(&self, task_id: &str) -> Result<(), StorageError> {
        fs::rename(self.in_progress_path(task_id), self.processed_path(task_id))
            .map_err(|e| map_not_found(e, task_id))
    }

    fn processed_task_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.processed)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn task_store_size(&self, task_id: &str) -> Result<u64, StorageError> {
        fs::metadata(self.processed_path(task_id))
            .map(|m| m.len())
            .map_err(|e| map_not_found(e, task_id))
    }

    fn has_content(&self, task_id: &str) -> Result<bool, StorageError> {
        Ok(self.task_store_size(task_id)? > 0)
    }

    fn discard_processed(&self, task_id: &str) -> Result<(), StorageError> {
        fs::remove_file(self.processed_path(task_id)).map_err(|e| map_not_found(e, task_id))
    }

    fn prepare_merge(&self, task_id: &str) -> Result<(), StorageError> {
        fs::rename(self.processed_path(task_id), self.merge_path(task_id))
            .map_err(|e| map_not_found(e, task_id))
    }

    fn open_merge_reader(&self, task_id: &str) -> Result<Box<dyn TaskStoreReader>, StorageError> {
        let file =
            File::open(self.merge_path(task_id)).map_err(|e| map_not_found(e, task_id))?;
        Ok(Box::new(FsTaskReader {
            reader: BufReader::new(file),
            line: String::new(),
        }))
    }

    fn remove_merged(&self, task_id: &str) -> Result<(), StorageError> {
        fs::remove_file(self.merge_path(task_id)).map_err(|e| map_not_found(e, task_id))
    }
}

struct FsTaskWriter {
    writer: Option<BufWriter<File>>,
    count: u64,
}

impl TaskStoreWriter for FsTaskWriter {
    fn add_record(&mut self, record: &Record) -> Result<(), StorageError> {
        let writer = self.writer.as_mut().ok_or(StorageError::WriterClosed)?;
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    fn record_count(&self) -> u64 {
        self.count
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

struct FsTaskReader {
    reader: BufReader<File>,
    line: String,
}

impl TaskStoreReader for FsTaskReader {
    fn next_record(&mut self) -> Result<Option<Record>, StorageError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SourceKind, SourceRecord};

    fn source(path: &str) -> Record {
        Record::Source(SourceRecord {
            path: path.to_string(),
            kind: SourceKind::File,
        })
    }

    #[test]
    fn handoff_moves_store_through_areas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("create");

        let mut writer = storage.create_task_store("t1").expect("writer");
        writer.add_record(&source("/a")).expect("add");
        writer.add_record(&source("/b")).expect("add");
        assert_eq!(writer.record_count(), 2);
        writer.close().expect("close");

        assert!(storage.processed_task_ids().expect("ids").is_empty());
        storage.publish_processed("t1").expect("publish");
        assert_eq!(storage.processed_task_ids().expect("ids"), vec!["t1"]);
        assert!(storage.has_content("t1").expect("content"));
        assert!(storage.task_store_size("t1").expect("size") > 0);

        storage.prepare_merge("t1").expect("prepare");
        assert!(storage.processed_task_ids().expect("ids").is_empty());

        let mut reader = storage.open_merge_reader("t1").expect("reader");
        assert_eq!(reader.next_record().expect("rec"), Some(source("/a")));
        assert_eq!(reader.next_record().expect("rec"), Some(source("/b")));
        assert_eq!(reader.next_record().expect("rec"), None);

        storage.remove_merged("t1").expect("remove");
        assert!(matches!(
            storage.open_merge_reader("t1"),
            Err(StorageError::UnknownTask(_))
        ));
    }

    #[test]
    fn closed_writer_rejects_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("create");
        let mut writer = storage.create_task_store("t1").expect("writer");
        writer.close().expect("close");
        assert!(matches!(
            writer.add_record(&source("/a")),
            Err(StorageError::WriterClosed)
        ));
    }

    #[test]
    fn unknown_task_is_reported_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("create");
        match storage.publish_processed("ghost") {
            Err(StorageError::UnknownTask(id)) => assert_eq!(id, "ghost"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_store_has_no_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FsTaskStorage::create(dir.path()).expect("create");
        let mut writer = storage.create_task_store("t1").expect("writer");
        writer.close().expect("close");
        storage.publish_processed("t1").expect("publish");
        assert!(!storage.has_content("t1").expect("content"));
        storage.discard_processed("t1").expect("discard");
        assert!(storage.processed_task_ids().expect("ids").is_empty());
    }
}
