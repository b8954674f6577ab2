use std::path::{Path, PathBuf};

use timesift::config::{Config, load_config};
use timesift::engine::{AnalysisEngine, EngineError, ExtractionEngine};
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

fn session_config() -> (Config, String) {
    let loaded = load_config(None).expect("config");
    let mut cfg = loaded.config;
    cfg.worker_program = env!("CARGO_BIN_EXE_timesift").to_string();
    cfg.worker_count = 2;
    cfg.storage_format = StorageFormat::Jsonl;
    cfg.queue_timeout_seconds = 1.0;
    cfg.queue_linger_seconds = 2.0;
    cfg.status_interval_seconds = 0.2;
    cfg.progress_interval_seconds = 0.5;
    (cfg, loaded.config_hash)
}

fn extracted_session(base: &Path) -> (Config, String) {
    let root = evidence_tree(base);
    let (cfg, hash) = session_config();
    let mut engine = ExtractionEngine::new(cfg.clone(), &hash, &base.join("session"));
    let summary = engine.run(&[root]).expect("extraction");
    assert!(!summary.aborted);
    (cfg, hash)
}

#[test]
fn analysis_streams_artifacts_and_merges_plugin_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let session_dir = dir.path().join("session");
    let (cfg, _hash) = extracted_session(dir.path());

    let mut analysis = AnalysisEngine::new(cfg, &session_dir);
    let summary = analysis
        .run(&["counter".to_string(), "extensions".to_string()])
        .expect("analysis");

    assert!(!summary.aborted, "failed items: {:?}", summary.failed_items);
    assert!(summary.failed_items.is_empty());
    assert_eq!(summary.tasks_created, 2);
    assert_eq!(summary.produced.reports, 2);
    assert_eq!(summary.produced.artifacts, 0);

    let path = util::session_store_path(&session_dir);
    let entries = SessionStore::read_entries(&path).expect("entries");
    let reports: Vec<_> = entries
        .iter()
        .filter_map(|e| match e {
            SessionEntry::Record(Record::Report(report)) => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 2);
    // Only artifacts travel on the event stream, every plugin sees all of
    // them and the fixture tree has one extension.
    let counter = reports
        .iter()
        .find(|r| r.plugin == "counter")
        .expect("counter report");
    assert_eq!(
        counter.text,
        format!("sources=0 artifacts={FILE_COUNT} warnings=0 reports=0")
    );
    let extensions = reports
        .iter()
        .find(|r| r.plugin == "extensions")
        .expect("extensions report");
    assert_eq!(extensions.text, format!("bin={FILE_COUNT}"));

    // Second completion entry, appended after the extraction one.
    let Some(SessionEntry::SessionCompletion(completion)) = entries.last() else {
        panic!("expected completion last");
    };
    assert!(!completion.aborted);
    assert_eq!(completion.produced_reports, 2);
}

#[test]
fn unknown_plugin_fails_before_any_worker_spawns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let session_dir = dir.path().join("session");
    let (cfg, _hash) = extracted_session(dir.path());

    let mut analysis = AnalysisEngine::new(cfg, &session_dir);
    let result = analysis.run(&["ghost".to_string()]);
    assert!(matches!(result, Err(EngineError::Setup(_))));
}

#[test]
fn analysis_requires_at_least_one_plugin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (cfg, _hash) = session_config();
    let mut analysis = AnalysisEngine::new(cfg, &dir.path().join("session"));
    assert!(matches!(analysis.run(&[]), Err(EngineError::Setup(_))));
}
