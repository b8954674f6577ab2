use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use super::{Record, StorageError, TaskStorage, TaskStoreReader, TaskStoreWriter};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BATCH: usize = 256;

const AREA_IN_PROGRESS: &str = "in_progress";
const AREA_PROCESSED: &str = "processed";
const AREA_MERGE: &str = "merge";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_state (
    task_id TEXT PRIMARY KEY,
    area TEXT NOT NULL,
    byte_size INTEGER NOT NULL DEFAULT 0,
    record_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS task_records (
    task_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (task_id, seq)
);
";

/// Keyed task storage on a single shared SQLite database. The directory
/// areas become an `area` column, so the three-phase handoff is an UPDATE
/// instead of a rename. WAL plus a busy timeout covers concurrent worker
/// writers and the foreman reader.
pub struct KeyedTaskStorage {
    db_path: PathBuf,
}

impl KeyedTaskStorage {
    pub fn create(scratch: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(scratch)?;
        let db_path = scratch.join("tasks.sqlite");
        let conn = open_database(&db_path)?;
        conn.execute_batch(SCHEMA)?;
        debug!("keyed task storage at {}", db_path.display());
        Ok(Self { db_path })
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        open_database(&self.db_path)
    }

    /// UPDATE guarded by the current area; zero affected rows means the
    /// task is not where the handoff requires it to be.
    fn move_area(&self, task_id: &str, from: &str, to: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE task_state SET area = ?1 WHERE task_id = ?2 AND area = ?3",
            (to, task_id, from),
        )?;
        if changed == 0 {
            return Err(StorageError::UnknownTask(task_id.to_string()));
        }
        Ok(())
    }

    fn state_row(&self, task_id: &str) -> Result<(u64, u64), StorageError> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT byte_size, record_count FROM task_state WHERE task_id = ?1")?;
        let mut rows = stmt.query([task_id])?;
        match rows.next()? {
            Some(row) => {
                let bytes: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((bytes.max(0) as u64, count.max(0) as u64))
            }
            None => Err(StorageError::UnknownTask(task_id.to_string())),
        }
    }

    fn delete_task(&self, conn: &Connection, task_id: &str) -> Result<(), StorageError> {
        conn.execute("DELETE FROM task_records WHERE task_id = ?1", [task_id])?;
        conn.execute("DELETE FROM task_state WHERE task_id = ?1", [task_id])?;
        Ok(())
    }
}

fn open_database(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn task_in_area(conn: &Connection, task_id: &str, area: &str) -> Result<bool, StorageError> {
    let mut stmt = conn.prepare("SELECT 1 FROM task_state WHERE task_id = ?1 AND area = ?2")?;
    let mut rows = stmt.query((task_id, area))?;
    Ok(rows.next()?.is_some())
}

impl TaskStorage for KeyedTaskStorage {
    fn create_task_store(&self, task_id: &str) -> Result<Box<dyn TaskStoreWriter>, StorageError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO task_state (task_id, area) VALUES (?1, ?2)",
            (task_id, AREA_IN_PROGRESS),
        )?;
        Ok(Box::new(KeyedTaskWriter {
            conn: Some(conn),
            task_id: task_id.to_string(),
            seq: 0,
            bytes: 0,
        }))
    }

    fn publish_processed(&self, task_id: &str) -> Result<(), StorageError> {
        self.move_area(task_id, AREA_IN_PROGRESS, AREA_PROCESSED)
    }

    fn processed_task_ids(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT task_id FROM task_state WHERE area = ?1 ORDER BY task_id")?;
        let rows = stmt.query_map([AREA_PROCESSED], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    fn task_store_size(&self, task_id: &str) -> Result<u64, StorageError> {
        Ok(self.state_row(task_id)?.0)
    }

    fn has_content(&self, task_id: &str) -> Result<bool, StorageError> {
        Ok(self.state_row(task_id)?.1 > 0)
    }

    fn discard_processed(&self, task_id: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        if !task_in_area(&conn, task_id, AREA_PROCESSED)? {
            return Err(StorageError::UnknownTask(task_id.to_string()));
        }
        self.delete_task(&conn, task_id)
    }

    fn prepare_merge(&self, task_id: &str) -> Result<(), StorageError> {
        self.move_area(task_id, AREA_PROCESSED, AREA_MERGE)
    }

    fn open_merge_reader(&self, task_id: &str) -> Result<Box<dyn TaskStoreReader>, StorageError> {
        let conn = self.connect()?;
        if !task_in_area(&conn, task_id, AREA_MERGE)? {
            return Err(StorageError::UnknownTask(task_id.to_string()));
        }
        Ok(Box::new(KeyedTaskReader {
            conn,
            task_id: task_id.to_string(),
            last_seq: -1,
            buffered: VecDeque::new(),
            drained: false,
        }))
    }

    fn remove_merged(&self, task_id: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        self.delete_task(&conn, task_id)
    }
}

struct KeyedTaskWriter {
    conn: Option<Connection>,
    task_id: String,
    seq: i64,
    bytes: u64,
}

impl TaskStoreWriter for KeyedTaskWriter {
    fn add_record(&mut self, record: &Record) -> Result<(), StorageError> {
        let conn = self.conn.as_ref().ok_or(StorageError::WriterClosed)?;
        let payload = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO task_records (task_id, seq, payload) VALUES (?1, ?2, ?3)",
            (&self.task_id, self.seq, &payload),
        )?;
        self.seq += 1;
        self.bytes += payload.len() as u64;
        Ok(())
    }

    fn record_count(&self) -> u64 {
        self.seq.max(0) as u64
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(conn) = self.conn.take() {
            conn.execute(
                "UPDATE task_state SET byte_size = ?1, record_count = ?2 WHERE task_id = ?3",
                (self.bytes as i64, self.seq, &self.task_id),
            )?;
        }
        Ok(())
    }
}

struct KeyedTaskReader {
    conn: Connection,
    task_id: String,
    last_seq: i64,
    buffered: VecDeque<Record>,
    drained: bool,
}

impl TaskStoreReader for KeyedTaskReader {
    fn next_record(&mut self) -> Result<Option<Record>, StorageError> {
        if self.buffered.is_empty() && !self.drained {
            let mut stmt = self.conn.prepare(
                "SELECT seq, payload FROM task_records
                 WHERE task_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt.query_map((&self.task_id, self.last_seq, READ_BATCH as i64), |row| {
                let seq: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((seq, payload))
            })?;
            for row in rows {
                let (seq, payload) = row?;
                self.last_seq = seq;
                self.buffered.push_back(serde_json::from_str(&payload)?);
            }
            if self.buffered.is_empty() {
                self.drained = true;
            }
        }
        Ok(self.buffered.pop_front())
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
    fn handoff_moves_rows_through_areas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = KeyedTaskStorage::create(dir.path()).expect("create");

        let mut writer = storage.create_task_store("t1").expect("writer");
        writer.add_record(&source("/a")).expect("add");
        writer.add_record(&source("/b")).expect("add");
        writer.close().expect("close");

        assert!(storage.processed_task_ids().expect("ids").is_empty());
        storage.publish_processed("t1").expect("publish");
        assert_eq!(storage.processed_task_ids().expect("ids"), vec!["t1"]);
        assert!(storage.has_content("t1").expect("content"));
        assert!(storage.task_store_size("t1").expect("size") > 0);

        storage.prepare_merge("t1").expect("prepare");
        let mut reader = storage.open_merge_reader("t1").expect("reader");
        assert_eq!(reader.next_record().expect("rec"), Some(source("/a")));
        assert_eq!(reader.next_record().expect("rec"), Some(source("/b")));
        assert_eq!(reader.next_record().expect("rec"), None);
        drop(reader);

        storage.remove_merged("t1").expect("remove");
        assert!(matches!(
            storage.open_merge_reader("t1"),
            Err(StorageError::UnknownTask(_))
        ));
    }

    #[test]
    fn publish_requires_in_progress_area() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = KeyedTaskStorage::create(dir.path()).expect("create");
        assert!(matches!(
            storage.publish_processed("ghost"),
            Err(StorageError::UnknownTask(_))
        ));
    }

    #[test]
    fn empty_store_discards_without_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = KeyedTaskStorage::create(dir.path()).expect("create");
        let mut writer = storage.create_task_store("t1").expect("writer");
        writer.close().expect("close");
        storage.publish_processed("t1").expect("publish");
        assert!(!storage.has_content("t1").expect("content"));
        storage.discard_processed("t1").expect("discard");
        assert!(storage.processed_task_ids().expect("ids").is_empty());
    }

    #[test]
    fn reader_pages_past_one_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = KeyedTaskStorage::create(dir.path()).expect("create");
        let total = READ_BATCH + 10;
        let mut writer = storage.create_task_store("big").expect("writer");
        for i in 0..total {
            writer.add_record(&source(&format!("/f{i}"))).expect("add");
        }
        writer.close().expect("close");
        storage.publish_processed("big").expect("publish");
        storage.prepare_merge("big").expect("prepare");

        let mut reader = storage.open_merge_reader("big").expect("reader");
        let mut seen = 0usize;
        while let Some(record) = reader.next_record().expect("rec") {
            assert_eq!(record, source(&format!("/f{seen}")));
            seen += 1;
        }
        assert_eq!(seen, total);
    }
}
