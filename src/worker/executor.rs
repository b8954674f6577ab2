use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::WorkerError;
use crate::engine::TaskPayload;
use crate::storage::{ArtifactRecord, Record, SourceKind, SourceRecord, WarningRecord};

/// Where an executor delivers its records. The worker wraps the private
/// task store writer so counters and the activity timestamp move with
/// every emitted record.
pub trait RecordSink {
    fn emit(&mut self, record: Record) -> Result<(), WorkerError>;
}

/// Turns one task payload into records. The concrete parsers behind real
/// artifact extraction plug in here; the built-in [`StatExecutor`] keeps
/// the binary runnable end to end.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, payload: &TaskPayload, sink: &mut dyn RecordSink)
    -> Result<(), WorkerError>;
}

/// Yields discovered work items in bounded batches. Recursion does not
/// happen here: directory tasks produce child source records, which the
/// foreman merges and feeds back into the heap.
pub trait SourceEnumerator: Send {
    /// Up to `limit` not-yet-yielded items. An empty batch means the
    /// enumerator is exhausted.
    fn next_batch(&mut self, limit: usize) -> Vec<SourceRecord>;
}

/// Built-in enumerator over the source roots given on the command line.
pub struct RootEnumerator {
    roots: VecDeque<PathBuf>,
}

impl RootEnumerator {
    pub fn new(roots: &[PathBuf]) -> Self {
        Self {
            roots: roots.iter().cloned().collect(),
        }
    }
}

impl SourceEnumerator for RootEnumerator {
    fn next_batch(&mut self, limit: usize) -> Vec<SourceRecord> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            let Some(root) = self.roots.pop_front() else {
                break;
            };
            match std::fs::metadata(&root) {
                Ok(meta) => {
                    let kind = if meta.is_dir() {
                        SourceKind::Directory
                    } else {
                        SourceKind::File
                    };
                    batch.push(SourceRecord {
                        path: root.to_string_lossy().into_owned(),
                        kind,
                    });
                }
                Err(err) => {
                    warn!("skipping unreadable source root {}: {err}", root.display());
                }
            }
        }
        batch
    }
}

/// Default extraction executor: one `file_stat` artifact per file, one
/// child source record per directory entry. Unreadable paths become
/// warning records instead of failing the task.
pub struct StatExecutor;

impl TaskExecutor for StatExecutor {
    fn execute(
        &self,
        payload: &TaskPayload,
        sink: &mut dyn RecordSink,
    ) -> Result<(), WorkerError> {
        let TaskPayload::ExtractSource { path, kind } = payload else {
            return Err(WorkerError::WrongPayload);
        };
        let path = Path::new(path);
        match kind {
            SourceKind::Directory => expand_directory(path, sink),
            SourceKind::File => stat_file(path, sink),
        }
    }
}

fn expand_directory(path: &Path, sink: &mut dyn RecordSink) -> Result<(), WorkerError> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            return sink.emit(Record::Warning(WarningRecord {
                message: format!("directory not readable: {err}"),
                path: Some(path.to_string_lossy().into_owned()),
            }));
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                sink.emit(Record::Warning(WarningRecord {
                    message: format!("directory entry not readable: {err}"),
                    path: Some(path.to_string_lossy().into_owned()),
                }))?;
                continue;
            }
        };
        let child = entry.path();
        let kind = match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => SourceKind::Directory,
            Ok(_) => SourceKind::File,
            Err(err) => {
                sink.emit(Record::Warning(WarningRecord {
                    message: format!("file type unavailable: {err}"),
                    path: Some(child.to_string_lossy().into_owned()),
                }))?;
                continue;
            }
        };
        sink.emit(Record::Source(SourceRecord {
            path: child.to_string_lossy().into_owned(),
            kind,
        }))?;
    }
    debug!("expanded directory {}", path.display());
    Ok(())
}

fn stat_file(path: &Path, sink: &mut dyn RecordSink) -> Result<(), WorkerError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            return sink.emit(Record::Warning(WarningRecord {
                message: format!("file not readable: {err}"),
                path: Some(path.to_string_lossy().into_owned()),
            }));
        }
    };
    let timestamp = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let sha256 = match hash_file(path) {
        Ok(digest) => Some(digest),
        Err(err) => {
            sink.emit(Record::Warning(WarningRecord {
                message: format!("file hash failed: {err}"),
                path: Some(path.to_string_lossy().into_owned()),
            }))?;
            None
        }
    };
    sink.emit(Record::Artifact(ArtifactRecord {
        source_path: path.to_string_lossy().into_owned(),
        name: "file_stat".to_string(),
        timestamp,
        size: meta.len(),
        sha256,
    }))
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink(Vec<Record>);

    impl RecordSink for VecSink {
        fn emit(&mut self, record: Record) -> Result<(), WorkerError> {
            self.0.push(record);
            Ok(())
        }
    }

    fn run(payload: &TaskPayload) -> Vec<Record> {
        let mut sink = VecSink(Vec::new());
        StatExecutor.execute(payload, &mut sink).expect("execute");
        sink.0
    }

    #[test]
    fn directory_task_emits_child_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), b"a").expect("write");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");

        let records = run(&TaskPayload::ExtractSource {
            path: dir.path().to_string_lossy().into_owned(),
            kind: SourceKind::Directory,
        });
        assert_eq!(records.len(), 2);
        let mut kinds: Vec<SourceKind> = records
            .iter()
            .map(|r| match r {
                Record::Source(s) => s.kind,
                other => panic!("expected source, got {other:?}"),
            })
            .collect();
        kinds.sort_by_key(|k| *k == SourceKind::File);
        assert_eq!(kinds, vec![SourceKind::Directory, SourceKind::File]);
    }

    #[test]
    fn file_task_emits_one_stat_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("evidence.bin");
        std::fs::write(&path, b"0123456789").expect("write");

        let records = run(&TaskPayload::ExtractSource {
            path: path.to_string_lossy().into_owned(),
            kind: SourceKind::File,
        });
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Artifact(artifact) => {
                assert_eq!(artifact.name, "file_stat");
                assert_eq!(artifact.size, 10);
                assert_eq!(artifact.sha256.as_ref().map(|s| s.len()), Some(64));
                assert!(artifact.timestamp > 0.0);
            }
            other => panic!("expected artifact, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_becomes_a_warning() {
        let records = run(&TaskPayload::ExtractSource {
            path: "/nonexistent/evidence.bin".to_string(),
            kind: SourceKind::File,
        });
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], Record::Warning(_)));
    }

    #[test]
    fn plugin_payload_is_rejected() {
        let mut sink = VecSink(Vec::new());
        let result = StatExecutor.execute(
            &TaskPayload::RunPlugin {
                plugin: "counter".to_string(),
            },
            &mut sink,
        );
        assert!(matches!(result, Err(WorkerError::WrongPayload)));
    }

    #[test]
    fn root_enumerator_tags_kinds_and_drains() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"x").expect("write");

        let mut roots = RootEnumerator::new(&[
            dir.path().to_path_buf(),
            file.clone(),
            PathBuf::from("/nonexistent/root"),
        ]);
        let batch = roots.next_batch(10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].kind, SourceKind::Directory);
        assert_eq!(batch[1].kind, SourceKind::File);
        assert!(roots.next_batch(10).is_empty());
    }
}
