use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lazarus::fs::ntfs::RecoverabilityPolicy;
use lazarus::io::DiskReader;
use lazarus::{
    run_scan, CancelToken, EngineKind, RecoverabilityStatus, RecoveredFileRecord, ScanOptions,
    ScanState,
};

#[derive(Parser)]
#[command(name = "lazarus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deleted-file recovery for FAT32/NTFS volumes and raw disk images")]
struct Cli {
    /// Block device or disk image to scan.
    device: PathBuf,

    /// Recovery engine.
    #[arg(short, long, value_enum, default_value_t = Engine::Fat32)]
    engine: Engine,

    /// Directory where the carve engine writes payloads.
    #[arg(short, long, default_value = "recovered_files")]
    output: PathBuf,

    /// Path of the JSON report.
    #[arg(short, long, default_value = "deleted_files.json")]
    report: PathBuf,

    /// Stop the carve engine after scanning this many bytes.
    #[arg(long)]
    budget: Option<u64>,

    /// Classify NTFS candidates against the volume bitmap instead of
    /// reporting every candidate as Deleted.
    #[arg(long)]
    ntfs_bitmap: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Engine {
    Fat32,
    Ntfs,
    Carve,
}

impl Engine {
    fn kind(self) -> EngineKind {
        match self {
            Engine::Fat32 => EngineKind::Fat,
            Engine::Ntfs => EngineKind::Ntfs,
            Engine::Carve => EngineKind::Carve,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lazarus=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    print_banner();

    let mut options = ScanOptions::new(cli.engine.kind());
    options.output_dir = cli.output.clone();
    options.byte_budget = cli.budget;
    if cli.ntfs_bitmap {
        options.ntfs_policy = RecoverabilityPolicy::Bitmap;
    }

    let mut reader = DiskReader::open(&cli.device)
        .with_context(|| format!("Failed to open {}", cli.device.display()))?;

    println!(
        "\nScanning {} with the {} engine...",
        style(cli.device.display()).cyan(),
        style(options.engine.name()).cyan()
    );

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40.cyan/blue}] {percent}% {msg}")?
            .progress_chars("=>-"),
    );
    let bar = pb.clone();

    let mut records: Vec<RecoveredFileRecord> = Vec::new();
    let outcome = run_scan(
        &mut reader,
        &options,
        &mut records,
        CancelToken::new(),
        Some(Box::new(move |pct| bar.set_position(u64::from(pct)))),
    );

    match outcome.state {
        ScanState::Completed => pb.finish_with_message("done"),
        ScanState::Cancelled => pb.abandon_with_message("cancelled"),
        _ => pb.abandon_with_message("failed"),
    }

    if outcome.state == ScanState::Failed {
        let reason = outcome
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        anyhow::bail!("Scan of {} failed: {reason}", cli.device.display());
    }

    println!();
    println!("{}", style("Scan Complete!").green().bold());
    println!();
    println!(
        "Files found:           {}",
        style(records.len()).green().bold()
    );
    for (status, count) in count_by_status(&records) {
        println!("{:<22} {}", format!("{status}:"), count);
    }
    if outcome.cycles_detected > 0 {
        println!(
            "\n[!] {} directory cycles skipped",
            style(outcome.cycles_detected).yellow()
        );
    }

    let file = File::create(&cli.report)
        .with_context(|| format!("Failed to create report {}", cli.report.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &records)
        .context("Failed to write JSON report")?;

    println!();
    println!(
        "Report written:        {}",
        style(cli.report.display()).cyan()
    );
    if options.engine == EngineKind::Carve && !records.is_empty() {
        println!(
            "Output folder:         {}",
            style(options.output_dir.display()).cyan()
        );
    }
    println!();

    Ok(())
}

fn count_by_status(records: &[RecoveredFileRecord]) -> Vec<(RecoverabilityStatus, usize)> {
    const ORDER: [RecoverabilityStatus; 5] = [
        RecoverabilityStatus::Recoverable,
        RecoverabilityStatus::PartiallyRecoverable,
        RecoverabilityStatus::Overwritten,
        RecoverabilityStatus::Deleted,
        RecoverabilityStatus::Unknown,
    ];
    ORDER
        .iter()
        .map(|status| {
            let count = records.iter().filter(|r| r.status == *status).count();
            (*status, count)
        })
        .filter(|(_, count)| *count > 0)
        .collect()
}

fn print_banner() {
    println!();
    println!("{}", style("Lazarus - Deleted File Recovery").cyan().bold());
}
