use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use imgdupes::core::pool::PoolProgress;
use imgdupes::core::scanner;
use imgdupes::logging;
use imgdupes::{
    ColorHistogramFactory, DuplicateFinder, DuplicateGroup, DuplicateReport, EngineConfig,
    FeatureMatching, PoolLifetime, ScanOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "imgdupes",
    version,
    about = "Find duplicate images by average hash and feature vectors"
)]
struct Cli {
    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    /// Also write log output to this file
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find and list duplicate groups in one or two folders
    Scan(ScanArgs),
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Folder with images
    #[arg(value_name = "FOLDER1")]
    folder1: PathBuf,

    /// Optional second folder, compared together with the first
    #[arg(value_name = "FOLDER2")]
    folder2: Option<PathBuf>,

    /// Descend into subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Images per batch (default: 64)
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Worker threads (default: number of CPUs)
    #[arg(short = 'j', long, value_name = "N")]
    workers: Option<usize>,

    /// Rebuild the worker pool for every batch
    #[arg(long)]
    pool_per_batch: bool,

    /// Cluster feature vectors by cosine similarity instead of exact equality
    #[arg(long, value_name = "F")]
    min_similarity: Option<f32>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Load engine settings from a JSON file; flags override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logger(
        logging::level_from_verbosity(cli.verbose, cli.quiet),
        cli.log_file.as_deref(),
    )?;

    match cli.command {
        Commands::Scan(args) => scan(args),
    }
}

fn scan(args: ScanArgs) -> Result<()> {
    let config = build_config(&args)?;

    let mut folders = vec![args.folder1.clone()];
    if let Some(folder2) = &args.folder2 {
        folders.push(folder2.clone());
    }
    if !args.json {
        for folder in &folders {
            println!("▶ Scanning for duplicates in: {}", folder.display());
        }
    }

    let paths = discover(&folders, &config.scan)?;
    log::info!("Parallel fingerprinting {} images…", paths.len());

    let bar = ProgressBar::new(paths.len() as u64);
    bar.set_style(ProgressStyle::with_template(
        "{bar:40.cyan/blue} {pos}/{len} images ({eta})",
    )?);
    let sink = bar.clone();
    let finder = DuplicateFinder::new(ColorHistogramFactory::default(), config)?
        .with_progress_callback(Arc::new(move |p: PoolProgress| sink.set_position(p.processed as u64)));

    let report = benchmark("fingerprinting all images", || finder.find_in_paths(&paths));
    bar.finish_and_clear();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn build_config(args: &ScanArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if args.recursive {
        config.scan.recursive = true;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    if args.pool_per_batch {
        config.pool_lifetime = PoolLifetime::PerBatch;
    }
    if let Some(min_similarity) = args.min_similarity {
        config.feature_matching = FeatureMatching::Cosine { min_similarity };
    }

    config.validate().context("Invalid settings")?;
    Ok(config)
}

/// List image files in `folders`, showing a spinner while walking.
fn discover(folders: &[PathBuf], options: &ScanOptions) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let paths = scanner::discover_images(folders, options);
    spinner.finish_and_clear();

    let paths = paths.with_context(|| format!("Failed to scan {}", display_list(folders)))?;
    log::info!("Scan complete: {} image file(s)", paths.len());
    Ok(paths)
}

fn print_report(report: &DuplicateReport) {
    print!("{}", render_groups("hash", &report.hash_groups));
    print!("{}", render_groups("feature", &report.feature_groups));
}

fn render_groups(kind: &str, groups: &[DuplicateGroup]) -> String {
    if groups.is_empty() {
        return format!("No {} duplicates found.\n", kind);
    }

    let mut out = format!("Found {} duplicates:\n", kind);
    for (i, group) in groups.iter().enumerate() {
        match group.fingerprint {
            Some(fingerprint) => out.push_str(&format!(" Group {} [{}]:\n", i + 1, fingerprint)),
            None => out.push_str(&format!(" Group {}:\n", i + 1)),
        }
        for file in &group.paths {
            out.push_str(&format!("   ▶ {}\n", file.display()));
        }
    }
    out
}

fn display_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run `f()`, log how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
