use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use sift_indexer::{
    config::SiftConfig,
    fs::LocalFilesystem,
    pipeline::{Pipeline, open_store, open_tracker},
    retrieval::{
        change_tracker::{FileFingerprint, FileStatus},
        orchestrator::{IndexOptions, IndexingResult},
        progress::CancellationFlag,
        search::{SearchResponse, SearchScope},
        watcher::FileWatcher,
    },
    status::{StatusReport, status},
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Incrementally index documents and spreadsheets into a vector store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./sift.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "summary")]
    format: OutputFormat,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index a file or a directory
    Index {
        path: PathBuf,
        /// Only index the top level of a directory
        #[arg(long)]
        no_recursive: bool,
        /// Re-index files even when their fingerprint is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Index directories, then keep indexing changes until Ctrl-C
    Watch {
        /// Directories to watch (defaults to [watch] directories)
        directories: Vec<PathBuf>,
    },
    /// Search the indexed content
    Search {
        query: String,
        /// Collections to search: all, documents, structured, rows, columns, summaries
        #[arg(short, long, default_value = "all")]
        scope: SearchScope,
        /// Maximum results per collection
        #[arg(short, long)]
        limit: Option<usize>,
        /// Minimum similarity score (-1.0 to 1.0)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Show collection and tracker statistics
    Status,
    /// List tracked files with a given status
    List {
        #[arg(long, default_value = "failed")]
        status: FileStatus,
    },
    /// Force re-index every tracked file with a given status
    Reindex {
        #[arg(long, default_value = "partial")]
        status: FileStatus,
    },
    /// Delete a file's points and forget its fingerprint
    Forget { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = SiftConfig::load(args.config.as_deref())?;
    let format = args.format;

    match args.command {
        Commands::Index {
            path,
            no_recursive,
            force,
        } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let options = IndexOptions { force };
            let result = if path.is_dir() {
                let cancel = cancel_on_ctrl_c();
                pipeline
                    .orchestrator()
                    .index_directory(&path, !no_recursive, options, &cancel)
                    .await?
            } else if path.is_file() {
                pipeline.orchestrator().index_file(&path, options).await
            } else {
                bail!("{} does not exist", path.display());
            };
            print_result(&result, format)?;
            if result.files_failed > 0 {
                process::exit(2);
            }
            Ok(())
        }
        Commands::Watch { directories } => {
            let directories = if directories.is_empty() {
                config.watch.directories.clone()
            } else {
                directories
            };
            if directories.is_empty() {
                bail!("No directories to watch: pass them as arguments or set [watch] directories");
            }
            watch(&config, &directories, format).await
        }
        Commands::Search {
            query,
            scope,
            limit,
            threshold,
        } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let response = pipeline
                .router()
                .search(&query, scope, limit, threshold)
                .await?;
            print_search(&response, format)
        }
        Commands::Status => {
            // No embedding provider needed
            let store = open_store(&config.vector_store)?;
            let tracker = open_tracker(&config, Arc::new(LocalFilesystem)).await?;
            let report = status(store.as_ref(), &tracker).await?;
            print_status(&report, format)
        }
        Commands::List { status } => {
            let tracker = open_tracker(&config, Arc::new(LocalFilesystem)).await?;
            let files = tracker.list_by_status(status).await?;
            print_fingerprints(&files, format)
        }
        Commands::Reindex { status } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let result = pipeline
                .orchestrator()
                .reindex_status(status, &cancel)
                .await?;
            print_result(&result, format)
        }
        Commands::Forget { path } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let existed = pipeline.orchestrator().remove_file(&path).await?;
            if format == OutputFormat::Json {
                println!(
                    "{}",
                    serde_json::json!({ "path": path, "was_tracked": existed })
                );
            } else if existed {
                println!("Removed {} from the index", path.display());
            } else {
                println!("{} was not tracked; deleted any stray points", path.display());
            }
            Ok(())
        }
    }
}

/// A flag that flips on the first Ctrl-C. Files already started still finish.
fn cancel_on_ctrl_c() -> CancellationFlag {
    let cancel = CancellationFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling: waiting for files in progress...");
            flag.cancel();
        }
    });
    cancel
}

async fn watch(
    config: &SiftConfig,
    directories: &[PathBuf],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let orchestrator = pipeline.orchestrator().clone();

    let cancel = cancel_on_ctrl_c();
    for directory in directories {
        let result = orchestrator
            .index_directory(directory, config.watch.recursive, IndexOptions::default(), &cancel)
            .await
            .with_context(|| format!("Initial index of {} failed", directory.display()))?;
        print_result(&result, format)?;
        if cancel.is_cancelled() {
            return Ok(());
        }
    }

    let watcher = FileWatcher::start(directories, config.watcher_config(), orchestrator)?;
    eprintln!("Watching {} director(ies). Press Ctrl-C to stop.", directories.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    watcher.shutdown().await
}

fn print_result(result: &IndexingResult, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!(
        "Files: {} total | {} indexed | {} partial | {} failed | {} skipped | {} unsupported | {} locked",
        result.files_total,
        result.files_indexed,
        result.files_partial,
        result.files_failed,
        result.files_skipped,
        result.files_unsupported,
        result.files_locked,
    );
    println!(
        "Units: {} written | {} failed (of {})",
        result.units_succeeded, result.units_failed, result.units_total
    );
    if result.cancelled {
        println!(
            "Cancelled: {} file(s) were not started",
            result.files_not_dispatched
        );
    }
    println!("Elapsed: {} ms", result.elapsed_ms);

    if format == OutputFormat::Full {
        let collections: Vec<String> = result
            .collections_touched
            .iter()
            .map(|c| c.to_string())
            .collect();
        println!("Collections: {}", collections.join(", "));
        for failure in &result.failures {
            println!("  failed {}: {}", failure.path.display(), failure.error);
        }
    }
    Ok(())
}

fn print_search(response: &SearchResponse, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    println!("Found {} results for \"{}\":", response.hits.len(), response.query);
    for (rank, hit) in response.hits.iter().enumerate() {
        let file = hit.file_path.as_deref().unwrap_or("?");
        match format {
            OutputFormat::Full => {
                println!("{}. [{:.3}] {} ({})", rank + 1, hit.score, file, hit.collection);
                println!("{}", hit.text);
                println!("---");
            }
            _ => println!(
                "{}. [{:.3}] {} ({}): {}",
                rank + 1,
                hit.score,
                file,
                hit.collection,
                preview(&hit.text, 100)
            ),
        }
    }
    for failure in &response.failures {
        eprintln!("Warning: {} could not be searched: {}", failure.collection, failure.error);
    }
    Ok(())
}

fn print_status(report: &StatusReport, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Vector store: {} ({} points)", report.store, report.total_points());
    for collection in &report.collections {
        match (&collection.error, collection.vector_size) {
            (Some(err), _) => println!("  {}: unreachable ({err})", collection.name),
            (None, Some(size)) => println!(
                "  {}: {} points, {} dims, {}",
                collection.name, collection.point_count, size, collection.status
            ),
            (None, None) => println!("  {}: {}", collection.name, collection.status),
        }
    }

    println!("Tracked files: {}", report.total_tracked);
    for (status, count) in &report.tracked_files {
        println!("  {status}: {count}");
    }

    if !report.recent_files.is_empty() {
        println!("Recently indexed:");
        for file in &report.recent_files {
            println!(
                "  {} [{}] {}",
                file.last_indexed.format("%Y-%m-%d %H:%M:%S"),
                file.status,
                file.path.display()
            );
        }
    }
    Ok(())
}

fn print_fingerprints(files: &[FileFingerprint], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(files)?),
        OutputFormat::Summary => {
            println!("Found {} files:", files.len());
            for file in files {
                println!(
                    "  {} | units: {} ({} failed) | {}",
                    file.path.display(),
                    file.unit_count,
                    file.units_failed,
                    file.last_indexed.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        OutputFormat::Full => {
            for file in files {
                print_fingerprint(file);
                println!("---");
            }
        }
    }
    Ok(())
}

fn print_fingerprint(file: &FileFingerprint) {
    println!("Path: {}", file.path.display());
    println!("Status: {}", file.status);
    println!("Content hash: {}", file.content_hash);
    println!("Modified: {}", file.last_modified);
    println!("Indexed: {}", file.last_indexed);
    println!("Units: {} ({} failed)", file.unit_count, file.units_failed);
    println!("Collections: {}", file.target_collection);
    if let Some(err) = &file.last_error {
        println!("Last error: {err}");
    }
}

fn preview(text: &str, chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= chars {
        flat
    } else {
        format!("{}...", flat.chars().take(chars).collect::<String>())
    }
}
