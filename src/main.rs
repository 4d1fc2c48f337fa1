use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use website_archiver::archive::sweep_archives;
use website_archiver::cli::{ArchiverCommand, CloneArgs, Command};
use website_archiver::config::{load_config, validate, ArchiverConfig};
use website_archiver::job::{format_bytes, JobEvent};
use website_archiver::WebCloner;

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = ArchiverCommand::parse();
    init_logging(&cmd);

    let mut config = match &cmd.config {
        Some(path) => load_config(path).with_context(|| format!("Failed to load config file {:?}", path))?,
        None => ArchiverConfig::default(),
    };
    cmd.apply_overrides(&mut config);
    validate(&config).context("Invalid configuration")?;

    match &cmd.command {
        Command::Clone(args) => run_clone(config, args, cmd.quiet).await,
        Command::Sweep => run_sweep(&config),
    }
}

fn init_logging(cmd: &ArchiverCommand) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cmd.log_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_clone(config: ArchiverConfig, args: &CloneArgs, quiet: bool) -> Result<()> {
    if !quiet {
        println!("🚀 Cloning {}", args.url.blue());
        println!("📁 Archives go to {:?}", config.storage.storage_dir);
        println!("⚡ Concurrent downloads: {}", config.cloning.concurrency);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cloner = WebCloner::new(config, args.options()).with_events(events_tx);
    let display = tokio::spawn(show_progress(events_rx, quiet));

    let result = cloner.run(&args.url).await;
    drop(cloner);
    let _ = display.await;

    let report = result.with_context(|| format!("Failed to clone {}", args.url))?;

    println!("✅ Archive ready: {}", report.archive_path.display().to_string().green());
    if !quiet {
        let counters = report.counters;
        println!(
            "   {} files, {} optimized, {} downloaded in {:.1}s via the {} strategy",
            counters.downloaded,
            counters.optimized,
            format_bytes(counters.bytes),
            report.elapsed.as_secs_f64(),
            report.strategy,
        );
        if report.pages > 1 {
            println!("   {} pages saved", report.pages);
        }
        if !report.errors.is_empty() {
            println!("{}", format!("⚠️  {} resources could not be saved:", report.errors.len()).yellow());
            for error in &report.errors {
                println!("   {} {}", error.url.dimmed(), error.message);
            }
        }
    }

    Ok(())
}

async fn show_progress(mut events: mpsc::UnboundedReceiver<JobEvent>, quiet: bool) {
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    if let Ok(style) = ProgressStyle::default_bar().template("{spinner} [{bar:40.cyan/blue}] {pos:>3}% {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }

    while let Some(event) = events.recv().await {
        bar.set_position(u64::from(event.percent));
        bar.set_message(event.message);
        if event.status.is_terminal() {
            break;
        }
    }
    bar.finish_and_clear();
}

fn run_sweep(config: &ArchiverConfig) -> Result<()> {
    let storage = &config.storage;
    let removed = sweep_archives(&storage.storage_dir, storage.retention())
        .with_context(|| format!("Failed to sweep {:?}", storage.storage_dir))?;

    println!(
        "🧹 Removed {} archive(s) older than {} days from {:?}",
        removed.to_string().bold(),
        storage.retention_days,
        storage.storage_dir
    );
    Ok(())
}
