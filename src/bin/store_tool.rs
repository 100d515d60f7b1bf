use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dualstore::storage::{
    ContainerValidator, Generation, GenerationFiles, OwnerOnlyProtection, ValidationContext,
    YearMonth,
};
use dualstore::{Goal, SegmentConfig, SegmentedStore, StoreConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "store-tool")]
#[command(about = "Maintenance tooling for dualstore data directories")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report the health of every backup generation of a dataset
    Inspect {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "goals")]
        stem: String,
        #[arg(long)]
        json: bool,
    },
    /// Run the container invariants against every readable generation
    Verify {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "goals")]
        stem: String,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        allow_future_start: bool,
    },
    /// Delete historical partitions of a segmented store
    PurgeHistory {
        #[arg(long)]
        dir: PathBuf,
        /// Remove partitions older than this month (yyyy-MM)
        #[arg(long, conflicts_with = "retention_months")]
        before: Option<String>,
        /// Keep this many months before the current one
        #[arg(long)]
        retention_months: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { dir, stem, json } => inspect(&dir, &stem, json),
        Command::Verify {
            dir,
            stem,
            strict,
            allow_future_start,
        } => verify(&dir, &stem, strict, allow_future_start),
        Command::PurgeHistory {
            dir,
            before,
            retention_months,
        } => purge_history(dir, before.as_deref(), retention_months).await,
    }
}

fn generation_files(dir: &Path, stem: &str) -> Result<GenerationFiles> {
    if !dir.is_dir() {
        bail!("Data directory '{}' does not exist", dir.display());
    }
    Ok(GenerationFiles::new(dir, stem, Arc::new(OwnerOnlyProtection)))
}

fn inspect(dir: &Path, stem: &str, json: bool) -> Result<()> {
    let files = generation_files(dir, stem)?;
    let reports = files.inspect::<Goal>();

    if json {
        let rendered =
            serde_json::to_string_pretty(&reports).context("Failed to render report as JSON")?;
        println!("{}", rendered);
        return Ok(());
    }

    for report in &reports {
        let status = match (&report.error, report.exists) {
            (_, false) => "missing".to_string(),
            (Some(error), true) => format!("corrupt: {}", error),
            (None, true) => format!(
                "ok, {} records, schema {}, updated {}",
                report.record_count.unwrap_or_default(),
                report.schema_version.as_deref().unwrap_or("?"),
                report
                    .last_updated
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "?".to_string())
            ),
        };
        println!("{:<5} {}  ({})", report.generation, status, report.path.display());
    }

    if !reports.iter().any(|report| report.is_healthy()) {
        println!("No readable generation; the next load will start from an empty container.");
    }
    Ok(())
}

fn verify(dir: &Path, stem: &str, strict: bool, allow_future_start: bool) -> Result<()> {
    let files = generation_files(dir, stem)?;
    let config = StoreConfig::new()
        .strict_domain_validation(strict)
        .allow_future_start(allow_future_start);
    let validator = ContainerValidator::<Goal>::from_config(&config);

    let mut failures = 0;
    let mut checked = 0;
    for generation in Generation::ALL {
        if !files.exists(generation) {
            continue;
        }
        checked += 1;
        let path = files.path(generation);
        let size = fs::metadata(&path)
            .with_context(|| format!("Failed to stat '{}'", path.display()))?
            .len();

        let outcome = files
            .read_container::<Goal>(generation)
            .map_err(anyhow::Error::from)
            .and_then(|container| {
                validator
                    .validate(&container, &ValidationContext::new(size))
                    .map(|()| container.len())
                    .map_err(anyhow::Error::from)
            });
        match outcome {
            Ok(records) => println!("{:<5} valid ({} records)", generation, records),
            Err(err) => {
                failures += 1;
                println!("{:<5} INVALID: {:#}", generation, err);
            }
        }
    }

    if checked == 0 {
        bail!("No generation files for '{}' in '{}'", stem, dir.display());
    }
    if failures > 0 {
        return Err(anyhow!("{} of {} generations failed verification", failures, checked));
    }
    Ok(())
}

async fn purge_history(
    dir: PathBuf,
    before: Option<&str>,
    retention_months: Option<u32>,
) -> Result<()> {
    let cutoff = match (before, retention_months) {
        (Some(month), _) => month
            .parse::<YearMonth>()
            .map_err(|e| anyhow!("Invalid --before value: {}", e))?,
        (None, Some(months)) => YearMonth::of(Utc::now().date_naive()).minus_months(months),
        (None, None) => bail!("Either --before or --retention-months is required"),
    };

    let store = SegmentedStore::<Goal>::open(&dir, SegmentConfig::default())
        .with_context(|| format!("Failed to open segmented store in '{}'", dir.display()))?;
    let removed = store
        .purge_history_before(cutoff)
        .await
        .context("Failed to purge history partitions")?;

    println!("Removed {} history partitions older than {}", removed, cutoff);
    Ok(())
}
