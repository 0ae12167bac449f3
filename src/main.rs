use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use crossbeam_channel::Receiver;
use dirzip_upload::compress::queue::RunOutcome;
use dirzip_upload::compress::statistics::StatisticsSnapshot;
use dirzip_upload::compress::{
    generate_simple_zip_name, select_directories, CompressStatistics, CompressionOptions,
    QueueEvent, TaskQueue,
};
use dirzip_upload::upload::{CompressUploadUnit, LocalStore, TaskExecutor, UploadPolicy};
use dirzip_upload::utils::config::Config;
use dirzip_upload::utils::format::{format_duration, format_size, percentage};
use dirzip_upload::utils::logging::init_tracing;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dirzip-upload", version, about = "Package directories into ZIP archives and upload them")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress directories into local archives
    Compress {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory receiving the archives (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        selection: Selection,
    },

    /// Compress directories and upload each archive
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Remote directory receiving the archives
        #[arg(long)]
        save_path: String,

        /// Concurrency per archive upload
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Archives uploaded at the same time
        #[arg(short, long)]
        load: Option<usize>,

        /// Retries per directory
        #[arg(long)]
        retry: Option<u32>,

        #[arg(long)]
        policy: Option<UploadPolicy>,

        #[arg(long)]
        no_rapid_upload: bool,

        #[arg(long)]
        delete_after_upload: bool,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        selection: Selection,
    },
}

#[derive(Args)]
struct Selection {
    /// 0 = each path as one archive, 1 = one archive per child directory
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    depth: i32,

    #[arg(long)]
    include_hidden: bool,
}

impl Selection {
    fn options(&self, config: &Config) -> CompressionOptions {
        CompressionOptions {
            depth: self.depth,
            include_hidden: self.include_hidden,
            compression_level: config.compression_level,
        }
    }
}

#[derive(Serialize)]
struct UploadReport {
    #[serde(flatten)]
    statistics: StatisticsSnapshot,
    failed: Vec<FailedEntry>,
}

#[derive(Serialize)]
struct FailedEntry {
    id: String,
    path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Command::Compress {
            paths,
            output,
            selection,
        } => {
            let options = selection.options(&config);
            run_compress(&paths, output.as_deref(), options).await
        }
        Command::Upload {
            paths,
            save_path,
            parallel,
            load,
            retry,
            policy,
            no_rapid_upload,
            delete_after_upload,
            json,
            selection,
        } => {
            let mut config = config;
            if let Some(parallel) = parallel {
                config.max_upload_parallel = parallel.max(1);
            }
            if let Some(load) = load {
                config.max_upload_load = load.max(1);
            }
            if let Some(retry) = retry {
                config.max_retry = retry;
            }
            if let Some(policy) = policy {
                config.upload_policy = policy;
            }
            let options = selection.options(&config);
            let flags = UploadFlags {
                save_path,
                no_rapid_upload,
                delete_after_upload,
                json,
            };
            run_upload(&paths, &config, options, flags).await
        }
    }
}

/// Expand CLI paths into the directories to package, skipping bad input
fn collect_directories(paths: &[PathBuf], depth: i32) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for path in paths {
        match select_directories(path, depth) {
            Ok(selected) => dirs.extend(selected),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    dirs
}

/// `<dir>/<name>.zip`, suffixed with a counter when the name is taken
fn archive_path(dir: &Path, source: &Path, used: &mut HashSet<PathBuf>) -> PathBuf {
    let name = generate_simple_zip_name(source);
    let mut candidate = dir.join(&name);
    let stem = name.trim_end_matches(".zip").to_string();
    let mut n = 1;
    while used.contains(&candidate) {
        candidate = dir.join(format!("{}_{}.zip", stem, n));
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

async fn run_compress(paths: &[PathBuf], output: Option<&Path>, options: CompressionOptions) -> Result<()> {
    let output = match output {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
            dir.to_path_buf()
        }
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut queue = TaskQueue::new(1);
    queue.set_observer(Arc::new(tx));

    let mut used = HashSet::new();
    for dir in collect_directories(paths, options.depth) {
        let target = archive_path(&output, &dir, &mut used);
        if let Err(e) = queue.add_task(&dir, Some(&target), options.clone()) {
            warn!("Failed to queue {}: {}", dir.display(), e);
        }
    }

    if queue.is_empty() {
        println!("No directories to compress.");
        return Ok(());
    }

    println!("Compressing {} directories...", queue.len());
    info!("Compress run started with {} items", queue.len());

    let printer = std::thread::spawn(move || print_events(rx));
    let handle = queue.handle();

    let mut runner = tokio::task::spawn_blocking(move || {
        let outcome = queue.execute();
        // Dropping the sender ends the printer
        queue.take_observer();
        (queue, outcome)
    });

    let (queue, outcome) = tokio::select! {
        joined = &mut runner => joined?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, stopping after the current directory...");
            handle.stop();
            runner.await?
        }
    };

    if printer.join().is_err() {
        warn!("Progress printer panicked");
    }

    match outcome.context("Compression queue failed")? {
        RunOutcome::Completed => info!("Compress run completed"),
        RunOutcome::Stopped => info!("Compress run stopped"),
    }

    print!("{}", queue.summary());

    let removed = queue.cleanup_failed_tasks();
    if removed > 0 {
        info!("Removed {} partial archives", removed);
    }

    Ok(())
}

fn print_events(rx: Receiver<QueueEvent>) {
    let stdout = std::io::stdout();
    for event in rx {
        let mut out = stdout.lock();
        let _ = match event {
            QueueEvent::TaskStarted(item) => {
                writeln!(out, "[start] {}", item.source_path.display())
            }
            QueueEvent::TaskProgress {
                source_path,
                processed,
                total,
                ..
            } => {
                let name = source_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let _ = write!(
                    out,
                    "\r[compressing] {}: {}/{} ({:.1}%)",
                    name,
                    processed,
                    total,
                    percentage(processed, total)
                );
                out.flush()
            }
            QueueEvent::TaskCompleted(item) => match &item.result {
                Some(result) if result.success => writeln!(
                    out,
                    "\n[done] {} -> {} (original: {}, packed: {})",
                    item.source_path.display(),
                    item.target_path.display(),
                    format_size(result.total_size),
                    format_size(result.compressed_size)
                ),
                Some(result) => writeln!(
                    out,
                    "\n[failed] {}: {}",
                    item.source_path.display(),
                    result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string())
                ),
                None => Ok(()),
            },
            QueueEvent::QueueCompleted(items) => writeln!(out, "\nAll {} directories processed.", items.len()),
        };
    }
}

struct UploadFlags {
    save_path: String,
    no_rapid_upload: bool,
    delete_after_upload: bool,
    json: bool,
}

async fn run_upload(
    paths: &[PathBuf],
    config: &Config,
    options: CompressionOptions,
    flags: UploadFlags,
) -> Result<()> {
    let store: Arc<LocalStore> = Arc::new(LocalStore::new(&config.store_root));
    let statistics = Arc::new(CompressStatistics::new());
    let staging = std::env::current_dir().context("Failed to read current directory")?;

    println!(
        "Upload parallelism per archive: {}, archives at once: {}",
        config.max_upload_parallel, config.max_upload_load
    );
    println!("Depth: {} (0 = path itself, 1 = child directories)", options.depth);
    println!("Delete archives after upload: {}", flags.delete_after_upload);
    info!("Uploading into store at {}", config.store_root.display());

    let mut executor = TaskExecutor::new();
    let mut used = HashSet::new();
    for dir in collect_directories(paths, options.depth) {
        let zip_path = archive_path(&staging, &dir, &mut used);
        let unit = CompressUploadUnit::new(dir.clone(), zip_path, flags.save_path.clone(), store.clone())
            .with_options(options.clone())
            .with_statistics(statistics.clone())
            .with_parallel(config.max_upload_parallel)
            .with_policy(config.upload_policy)
            .with_no_rapid_upload(flags.no_rapid_upload)
            .with_delete_after_upload(flags.delete_after_upload)
            .with_backoff(config.backoff());

        let info = executor.append(Box::new(unit), config.max_retry);
        println!("[{}] queued: {}", info.id(), dir.display());
    }

    if executor.is_empty() {
        println!("No directories to upload.");
        return Ok(());
    }

    if executor.len() > config.max_upload_load {
        println!(
            "{} archives exceed the load limit, running {} at a time",
            executor.len(),
            config.max_upload_load
        );
    }
    executor.set_parallel(executor.len().min(config.max_upload_load));

    statistics.start_timer();
    executor.execute().await;

    let report = UploadReport {
        statistics: statistics.snapshot(),
        failed: executor
            .failed_units()
            .iter()
            .map(|f| FailedEntry {
                id: f.info.id().to_string(),
                path: f.unit.label(),
            })
            .collect(),
    };

    if flags.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("Finished in {}", format_duration(statistics.elapsed()));
    println!(
        "Files: {}, original size: {}, packed size: {}",
        report.statistics.file_count,
        format_size(report.statistics.total_size),
        format_size(report.statistics.compressed_size)
    );

    if !report.failed.is_empty() {
        println!("Failed directories:");
        println!("{}", failed_table(&report.failed));
    }

    Ok(())
}

fn failed_table(failed: &[FailedEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "PATH"]);
    for entry in failed {
        table.add_row(vec![entry.id.as_str(), entry.path.as_str()]);
    }
    table
}
