use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use timesift::config::{Config, load_config};
use timesift::engine::{ExtractionEngine, RunSummary};
use timesift::storage::{Record, SessionEntry, SessionStore, StorageFormat};
use timesift::util;

const FILE_COUNT: usize = 9;

fn evidence_tree(base: &Path) -> PathBuf {
    let root = base.join("evidence");
    std::fs::create_dir(&root).expect("mkdir");
    for i in 0..FILE_COUNT {
        std::fs::write(root.join(format!("file-{i:02}.bin")), vec![b'x'; 16 + i]).expect("write");
    }
    root
}

fn session_config(format: StorageFormat) -> (Config, String) {
    let loaded = load_config(None).expect("config");
    let mut cfg = loaded.config;
    cfg.worker_program = env!("CARGO_BIN_EXE_timesift").to_string();
    cfg.worker_count = 2;
    cfg.storage_format = format;
    cfg.queue_timeout_seconds = 1.0;
    cfg.queue_linger_seconds = 2.0;
    cfg.status_interval_seconds = 0.2;
    cfg.progress_interval_seconds = 0.5;
    (cfg, loaded.config_hash)
}

fn run_session(format: StorageFormat) -> (tempfile::TempDir, RunSummary) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = evidence_tree(dir.path());
    let session_dir = dir.path().join("session");
    let (cfg, hash) = session_config(format);
    let mut engine = ExtractionEngine::new(cfg, &hash, &session_dir);
    let summary = engine.run(&[root]).expect("run");
    (dir, summary)
}

fn check_summary(summary: &RunSummary) {
    assert!(!summary.aborted, "failed items: {:?}", summary.failed_items);
    assert!(summary.failed_items.is_empty());
    // One root directory plus one source per file inside it.
    assert_eq!(summary.produced.sources, 1 + FILE_COUNT as u64);
    assert_eq!(summary.produced.artifacts, FILE_COUNT as u64);
    assert_eq!(summary.produced.warnings, 0);
    assert_eq!(summary.tasks_created, 1 + FILE_COUNT as u64);
    assert_eq!(summary.worker_replacements, 0);
}

fn check_session_store(session_dir: &Path, summary: &RunSummary) {
    let path = util::session_store_path(session_dir);
    let entries = SessionStore::read_entries(&path).expect("entries");
    let Some(SessionEntry::SessionStart(start)) = entries.first() else {
        panic!("expected session start first");
    };
    assert_eq!(start.session_id, summary.session_id);
    let Some(SessionEntry::SessionCompletion(completion)) = entries.last() else {
        panic!("expected completion last");
    };
    assert!(!completion.aborted);
    assert_eq!(completion.produced_sources, summary.produced.sources);
    assert_eq!(completion.produced_artifacts, summary.produced.artifacts);

    let artifacts = SessionStore::sorted_artifacts(&path).expect("artifacts");
    assert_eq!(artifacts.len(), FILE_COUNT);
    assert!(artifacts.iter().all(|a| a.name == "file_stat"));
    assert!(
        artifacts
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    );
    // Every merged artifact carries a content hash over these readable
    // fixtures.
    assert!(artifacts.iter().all(|a| a.sha256.is_some()));
}

#[test]
fn extraction_session_completes_over_jsonl() {
    let (dir, summary) = run_session(StorageFormat::Jsonl);
    check_summary(&summary);
    check_session_store(&dir.path().join("session"), &summary);
}

#[test]
fn extraction_session_completes_over_sqlite() {
    let (dir, summary) = run_session(StorageFormat::Sqlite);
    check_summary(&summary);
    check_session_store(&dir.path().join("session"), &summary);
}

#[test]
fn preset_abort_flag_ends_the_session_before_enumeration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = evidence_tree(dir.path());
    let session_dir = dir.path().join("session");
    let (cfg, hash) = session_config(StorageFormat::Jsonl);

    let abort = Arc::new(AtomicBool::new(false));
    abort.store(true, Ordering::Relaxed);
    let mut engine =
        ExtractionEngine::new(cfg, &hash, &session_dir).with_abort_flag(abort.clone());
    let summary = engine.run(&[root]).expect("run");

    assert!(summary.aborted);
    assert_eq!(summary.produced.sources, 0);
    assert_eq!(summary.produced.artifacts, 0);

    let entries =
        SessionStore::read_entries(&util::session_store_path(&session_dir)).expect("entries");
    let Some(SessionEntry::SessionCompletion(completion)) = entries.last() else {
        panic!("expected completion last");
    };
    assert!(completion.aborted);
    assert!(
        !entries
            .iter()
            .any(|e| matches!(e, SessionEntry::Record(Record::Artifact(_))))
    );
}
