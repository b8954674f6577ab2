use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use timesift::{cli, config, engine, logging, util, worker};

fn main() -> Result<()> {
    let options = cli::parse();
    match options.command {
        cli::Command::Extract(args) => run_extract(args),
        cli::Command::Analyze(args) => run_analyze(args),
        cli::Command::Worker(args) => run_worker(args),
    }
}

fn run_extract(args: cli::ExtractArgs) -> Result<()> {
    let loaded = config::load_config(args.config_path.as_deref())?;
    let mut cfg = loaded.config;
    if let Some(workers) = args.workers {
        cfg.worker_count = workers;
    }
    if let Some(backend) = args.storage_format {
        cfg.storage_format = backend.into();
    }
    if let Some(limit) = args.memory_limit_mib {
        cfg.worker_memory_limit = limit.saturating_mul(1024 * 1024);
    }
    if let Some(session_id) = args.session_id {
        cfg.session_id = session_id;
    }
    if args.log_json {
        cfg.log_json = true;
    }
    logging::init_logging(cfg.log_json);

    util::ensure_session_dir(&args.session_dir)?;
    info!(
        "starting session {} into {} with {} source roots",
        cfg.session_id,
        args.session_dir.display(),
        args.sources.len()
    );

    let abort = Arc::new(AtomicBool::new(false));
    install_abort_handler(abort.clone());

    let mut extraction = engine::ExtractionEngine::new(cfg, &loaded.config_hash, &args.session_dir)
        .with_abort_flag(abort);
    let summary = extraction.run(&args.sources)?;
    report_summary(&summary)
}

fn run_analyze(args: cli::AnalyzeArgs) -> Result<()> {
    let loaded = config::load_config(args.config_path.as_deref())?;
    let mut cfg = loaded.config;
    if args.log_json {
        cfg.log_json = true;
    }
    logging::init_logging(cfg.log_json);

    util::ensure_session_dir(&args.session_dir)?;
    let abort = Arc::new(AtomicBool::new(false));
    install_abort_handler(abort.clone());

    let mut analysis = engine::AnalysisEngine::new(cfg, &args.session_dir).with_abort_flag(abort);
    let summary = analysis.run(&args.plugins)?;
    report_summary(&summary)
}

fn run_worker(args: cli::WorkerArgs) -> Result<()> {
    let config_path = util::session_config_path(&args.scratch);
    let loaded = config::load_config(Some(&config_path))
        .with_context(|| format!("session config missing at {}", config_path.display()))?;
    let cfg = loaded.config;
    logging::init_logging(cfg.log_json);

    let mode = match args.role {
        cli::WorkerRole::Extract => worker::WorkerMode::Extract {
            dispatch_port: args
                .dispatch_port
                .context("--dispatch-port is required for the extract role")?,
        },
        cli::WorkerRole::Analyze => worker::WorkerMode::Analyze {
            event_port: args
                .event_port
                .context("--event-port is required for the analyze role")?,
            plugin: args
                .plugin
                .context("--plugin is required for the analyze role")?,
            task_identifier: args
                .task_id
                .context("--task-id is required for the analyze role")?,
        },
    };
    worker::run_worker(
        &cfg,
        worker::WorkerOptions {
            scratch: args.scratch,
            name: args.name,
            mode,
        },
    )?;
    Ok(())
}

/// First interrupt flips the shared abort flag so the engine can wind
/// down; a second one exits on the spot.
fn install_abort_handler(flag: Arc<AtomicBool>) {
    if let Err(err) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::Relaxed) {
            eprintln!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
        eprintln!("interrupt received, aborting session");
    }) {
        warn!("signal handler installation failed: {err}");
    }
}

fn report_summary(summary: &engine::RunSummary) -> Result<()> {
    for item in &summary.failed_items {
        warn!("failed item: {item}");
    }
    if summary.aborted {
        bail!("session {} ended aborted", summary.session_id);
    }
    Ok(())
}
