use std::collections::BTreeMap;
use std::path::Path;

use super::WorkerError;
use crate::storage::{Record, ReportRecord};
use crate::util;

/// One analysis pass over the merged session records. A plugin sees every
/// record the event queue delivers and compiles a single report at the
/// end of the stream.
pub trait AnalysisPlugin: Send {
    fn name(&self) -> &str;
    fn examine(&mut self, record: &Record);
    fn compile_report(&self) -> ReportRecord;
}

/// Builds a plugin by name. Unknown names fail up front, before a worker
/// is spawned for them.
pub fn build_plugin(name: &str) -> Result<Box<dyn AnalysisPlugin>, WorkerError> {
    match name {
        "counter" => Ok(Box::new(CounterPlugin::default())),
        "extensions" => Ok(Box::new(ExtensionsPlugin::default())),
        other => Err(WorkerError::UnknownPlugin(other.to_string())),
    }
}

pub fn known_plugins() -> &'static [&'static str] {
    &["counter", "extensions"]
}

/// Tallies records per kind.
#[derive(Default)]
pub struct CounterPlugin {
    sources: u64,
    artifacts: u64,
    warnings: u64,
    reports: u64,
}

impl AnalysisPlugin for CounterPlugin {
    fn name(&self) -> &str {
        "counter"
    }

    fn examine(&mut self, record: &Record) {
        match record {
            Record::Source(_) => self.sources += 1,
            Record::Artifact(_) => self.artifacts += 1,
            Record::Warning(_) => self.warnings += 1,
            Record::Report(_) => self.reports += 1,
        }
    }

    fn compile_report(&self) -> ReportRecord {
        ReportRecord {
            plugin: self.name().to_string(),
            text: format!(
                "sources={} artifacts={} warnings={} reports={}",
                self.sources, self.artifacts, self.warnings, self.reports
            ),
            created: util::now_epoch_seconds(),
        }
    }
}

/// Tallies artifact file extensions, lowercased; extensionless paths are
/// grouped under `(none)`.
#[derive(Default)]
pub struct ExtensionsPlugin {
    tally: BTreeMap<String, u64>,
}

impl AnalysisPlugin for ExtensionsPlugin {
    fn name(&self) -> &str {
        "extensions"
    }

    fn examine(&mut self, record: &Record) {
        let Record::Artifact(artifact) = record else {
            return;
        };
        let extension = Path::new(&artifact.source_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "(none)".to_string());
        *self.tally.entry(extension).or_insert(0) += 1;
    }

    fn compile_report(&self) -> ReportRecord {
        let text = self
            .tally
            .iter()
            .map(|(ext, count)| format!("{ext}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        ReportRecord {
            plugin: self.name().to_string(),
            text,
            created: util::now_epoch_seconds(),
        }
    }
}
