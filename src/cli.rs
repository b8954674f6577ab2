use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::storage::StorageFormat;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract artifacts from the given source roots into a session
    Extract(ExtractArgs),
    /// Run analysis plugins over a completed session
    Analyze(AnalyzeArgs),
    /// Worker entry point, spawned by the engine
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum StorageBackend {
    Jsonl,
    Sqlite,
}

impl From<StorageBackend> for StorageFormat {
    fn from(backend: StorageBackend) -> Self {
        match backend {
            StorageBackend::Jsonl => StorageFormat::Jsonl,
            StorageBackend::Sqlite => StorageFormat::Sqlite,
        }
    }
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Source roots (files or directories)
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Session directory for stores, scratch and worker handoff
    #[arg(short, long, default_value = "./session")]
    pub session_dir: PathBuf,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Number of worker processes (0 = one per CPU)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Task store backend
    #[arg(long, value_enum)]
    pub storage_format: Option<StorageBackend>,

    /// Worker memory limit, in MiB (0 disables the check)
    #[arg(long)]
    pub memory_limit_mib: Option<u64>,

    /// Session identifier (defaults to a generated one)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Session directory of a completed extraction
    #[arg(short, long, default_value = "./session")]
    pub session_dir: PathBuf,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Plugins to run (comma-separated list)
    #[arg(long, value_delimiter = ',', default_value = "counter,extensions")]
    pub plugins: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum WorkerRole {
    Extract,
    Analyze,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Session scratch directory
    #[arg(long)]
    pub scratch: PathBuf,

    /// Worker display name
    #[arg(long)]
    pub name: String,

    #[arg(long, value_enum)]
    pub role: WorkerRole,

    /// Port of the task dispatch queue (extract role)
    #[arg(long)]
    pub dispatch_port: Option<u16>,

    /// Port of the event fan-out queue (analyze role)
    #[arg(long)]
    pub event_port: Option<u16>,

    /// Plugin name (analyze role)
    #[arg(long)]
    pub plugin: Option<String>,

    /// Task identifier assigned by the foreman (analyze role)
    #[arg(long)]
    pub task_id: Option<String>,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}

#[cfg(test)]
mod tests {
    use super::{CliOptions, Command, StorageBackend, WorkerRole};
    use clap::Parser;

    #[test]
    fn parses_extract_with_overrides() {
        let opts = CliOptions::try_parse_from([
            "timesift",
            "extract",
            "/evidence",
            "--session-dir",
            "/tmp/session",
            "--workers",
            "4",
            "--storage-format",
            "sqlite",
        ])
        .expect("parse");
        let Command::Extract(args) = opts.command else {
            panic!("expected extract");
        };
        assert_eq!(args.sources.len(), 1);
        assert_eq!(args.workers, Some(4));
        assert!(matches!(args.storage_format, Some(StorageBackend::Sqlite)));
    }

    #[test]
    fn extract_requires_at_least_one_source() {
        assert!(CliOptions::try_parse_from(["timesift", "extract"]).is_err());
    }

    #[test]
    fn parses_analyze_plugin_list() {
        let opts = CliOptions::try_parse_from([
            "timesift",
            "analyze",
            "--session-dir",
            "/tmp/session",
            "--plugins",
            "counter,extensions",
        ])
        .expect("parse");
        let Command::Analyze(args) = opts.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.plugins, vec!["counter", "extensions"]);
    }

    #[test]
    fn parses_hidden_worker_subcommand() {
        let opts = CliOptions::try_parse_from([
            "timesift",
            "worker",
            "--scratch",
            "/tmp/session",
            "--name",
            "worker-00",
            "--role",
            "extract",
            "--dispatch-port",
            "49200",
        ])
        .expect("parse");
        let Command::Worker(args) = opts.command else {
            panic!("expected worker");
        };
        assert_eq!(args.name, "worker-00");
        assert!(matches!(args.role, WorkerRole::Extract));
        assert_eq!(args.dispatch_port, Some(49200));
        assert_eq!(args.event_port, None);
    }
}
