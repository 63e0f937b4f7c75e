//! # Knowledge CLI (`know`)
//!
//! ## Usage
//!
//! ```bash
//! know --config ./config/know.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `know init` | Create the SQLite database and run schema migrations |
//! | `know create-dataset <id>` | Create a dataset |
//! | `know list-datasets` | List datasets |
//! | `know get-dataset <id>` | Show a dataset, optionally with its files |
//! | `know edit-dataset <id>` | Update dataset metadata |
//! | `know delete-dataset <id>` | Delete a dataset with all its files |
//! | `know ingest <paths>...` | Ingest files and directories into a dataset |
//! | `know retrieve "<query>"` | Query one or more datasets |
//! | `know get-file <dataset> <ref>` | Show a file by absolute path or id |
//! | `know delete-file <dataset> <ref>` | Delete a file and its documents |
//! | `know export [ids]...` | Write datasets to a JSON snapshot |
//! | `know import <file>` | Recreate datasets from a snapshot |
//!
//! ## Examples
//!
//! ```bash
//! know init
//! know ingest -d docs ./docs --dedupe-func file_metadata --prune
//! know retrieve -d docs "how do I rotate credentials?" --top-k 5
//! know export -o backup.json docs
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use knowledge::config::{self, Config};
use knowledge::datastore::{Datastore, DatasetUpdate, FileRef, RetrieveOpts};
use knowledge::flows::config::{FlowConfig, FlowConfigEntry};
use knowledge::ingest_paths::{ingest_paths, IngestPathsOpts};
use knowledge::logging::{init_logging, LogFormat};
use knowledge::progress::ProgressMode;
use knowledge_core::models::Metadata;

const DEFAULT_CONFIG: &str = "./config/know.toml";
const DEFAULT_DATASET: &str = "default";

/// Knowledge CLI: dataset ingestion and retrieval for RAG.
#[derive(Parser)]
#[command(
    name = "know",
    about = "Knowledge: dataset ingestion and retrieval for retrieval-augmented generation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). When the default file is missing,
    /// a local database with the offline hash embedder is used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log output format on stderr. Filter with `KNOW_LOG` or `RUST_LOG`.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Create a dataset.
    CreateDataset {
        id: String,

        /// Dataset metadata as a JSON object.
        #[arg(long)]
        metadata: Option<String>,

        /// Succeed without changes if the dataset exists.
        #[arg(long)]
        ignore_exists: bool,
    },

    /// List datasets.
    ListDatasets,

    /// Show a dataset.
    GetDataset {
        id: String,

        /// Include files and their document ids.
        #[arg(long)]
        files: bool,
    },

    /// Update a dataset's metadata.
    EditDataset {
        id: String,

        /// Metadata as a JSON object; merged into the existing metadata.
        #[arg(long)]
        metadata: String,

        /// Replace the metadata instead of merging.
        #[arg(long)]
        replace_metadata: bool,
    },

    /// Delete a dataset with its files and documents.
    DeleteDataset { id: String },

    /// Ingest files and directories.
    ///
    /// The dataset is created if it does not exist. Directories are walked
    /// recursively, `.zip` archives are expanded into their entries.
    Ingest {
        #[arg(short, long, default_value = DEFAULT_DATASET)]
        dataset: String,

        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Do not descend into subdirectories.
        #[arg(long)]
        no_recursive: bool,

        /// Files ingested concurrently (default: ingest.concurrency).
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Deduplication policy: upsert, file_metadata, content_hash.
        #[arg(long)]
        dedupe_func: Option<String>,

        /// Comma-separated extensions to skip.
        #[arg(long, value_delimiter = ',')]
        ignore_extensions: Vec<String>,

        /// File with glob patterns to skip, one per line.
        #[arg(long)]
        ignore_file: Option<PathBuf>,

        #[arg(long)]
        include_hidden: bool,

        #[arg(long)]
        err_on_unsupported_file: bool,

        /// Abort at the first file that fails.
        #[arg(long)]
        exit_on_failed_file: bool,

        /// Remove indexed files under the given directories that no longer exist.
        #[arg(long)]
        prune: bool,

        /// Metadata added to every document, as a JSON object.
        #[arg(long)]
        metadata: Option<String>,

        /// Flow configuration file or `blueprint:<name>`.
        #[arg(long)]
        flows_file: Option<String>,

        /// Flow to use from the flow configuration.
        #[arg(long)]
        flow: Option<String>,

        /// Progress on stderr: off, human, json. Default: human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Retrieve documents for a query.
    Retrieve {
        query: String,

        /// Dataset to search; repeat for several.
        #[arg(short, long = "dataset", default_value = DEFAULT_DATASET)]
        datasets: Vec<String>,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(long)]
        flows_file: Option<String>,

        #[arg(long)]
        flow: Option<String>,
    },

    /// Show a file by absolute path (or id with `--id`).
    GetFile {
        dataset: String,
        file: String,

        #[arg(long)]
        id: bool,
    },

    /// Delete a file and its documents.
    DeleteFile {
        dataset: String,
        file: String,

        #[arg(long)]
        id: bool,
    },

    /// Export datasets (all when none given) to JSON.
    Export {
        datasets: Vec<String>,

        /// Output file; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import datasets from a JSON export.
    Import { file: PathBuf },
}

fn load(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        tracing::debug!("no config file, using built-in defaults");
        return Ok(Config::minimal());
    }
    config::load_config(path)
}

fn parse_metadata(raw: Option<&str>) -> Result<Metadata> {
    match raw {
        None => Ok(Metadata::new()),
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("metadata must be valid JSON")?;
            match value {
                serde_json::Value::Object(map) => Ok(map),
                _ => bail!("metadata must be a JSON object"),
            }
        }
    }
}

/// The flow for `dataset`: explicit name, else the dataset mapping, else
/// the default flow of the flow configuration.
fn resolve_flow(
    cfg: &Config,
    flows_file: Option<&str>,
    flow: Option<&str>,
    dataset: &str,
) -> Result<Option<FlowConfigEntry>> {
    let Some(reference) = flows_file.or(cfg.flows.file.as_deref()) else {
        return Ok(None);
    };
    let flows = FlowConfig::load(reference)?;
    match flow.or(cfg.flows.flow.as_deref()) {
        Some(name) => Ok(Some(flows.get_flow(name)?.clone())),
        None => Ok(flows.for_dataset(dataset)?.cloned()),
    }
}

fn file_ref(file: &str, by_id: bool) -> FileRef {
    if by_id {
        return FileRef::Id(file.to_string());
    }
    let path = std::fs::canonicalize(file)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| file.to_string());
    FileRef::Path(path)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, "info");

    let cfg = load(&cli.config)?;
    let datastore = Datastore::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::CreateDataset {
            id,
            metadata,
            ignore_exists,
        } => {
            let dataset = datastore
                .create_dataset(&id, parse_metadata(metadata.as_deref())?, !ignore_exists)
                .await?;
            print_json(&dataset)?;
        }
        Commands::ListDatasets => {
            for dataset in datastore.list_datasets().await? {
                match &dataset.embeddings_provider_config {
                    Some(binding) => println!("{}\t{}", dataset.id, binding),
                    None => println!("{}\t-", dataset.id),
                }
            }
        }
        Commands::GetDataset { id, files } => match datastore.get_dataset(&id, files).await? {
            Some(dataset) => print_json(&dataset)?,
            None => bail!("dataset {:?} not found", id),
        },
        Commands::EditDataset {
            id,
            metadata,
            replace_metadata,
        } => {
            let update = DatasetUpdate {
                metadata: Some(parse_metadata(Some(&metadata))?),
                replace_metadata,
                ..Default::default()
            };
            print_json(&datastore.update_dataset(&id, update).await?)?;
        }
        Commands::DeleteDataset { id } => {
            datastore.delete_dataset(&id).await?;
            println!("Deleted dataset {}", id);
        }
        Commands::Ingest {
            dataset,
            paths,
            no_recursive,
            concurrency,
            dedupe_func,
            ignore_extensions,
            ignore_file,
            include_hidden,
            err_on_unsupported_file,
            exit_on_failed_file,
            prune,
            metadata,
            flows_file,
            flow,
            progress,
        } => {
            let mut opts = IngestPathsOpts::from_config(&cfg);
            opts.recursive = !no_recursive;
            if let Some(c) = concurrency {
                opts.concurrency = c.max(1);
            }
            if let Some(name) = dedupe_func {
                opts.ingest.is_duplicate_func_name = Some(name);
            }
            opts.ignore_extensions.extend(ignore_extensions);
            opts.ignore_file = ignore_file;
            opts.include_hidden |= include_hidden;
            opts.ingest.err_on_unsupported_file |= err_on_unsupported_file;
            // One explicitly named file (not an archive) must not be skipped silently.
            if let [path] = paths.as_slice() {
                let is_zip = path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
                if path.is_file() && !is_zip {
                    opts.ingest.err_on_unsupported_file = true;
                }
            }
            opts.exit_on_failed_file |= exit_on_failed_file;
            opts.prune = prune;
            opts.ingest.extra_metadata = parse_metadata(metadata.as_deref())?;
            if let Some(entry) =
                resolve_flow(&cfg, flows_file.as_deref(), flow.as_deref(), &dataset)?
            {
                opts.ingest.ingestion_flows = entry.as_ingestion_flows(datastore.splitter_opts())?;
            }

            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some("off") => ProgressMode::Off,
                Some("human") => ProgressMode::Human,
                Some("json") => ProgressMode::Json,
                Some(other) => bail!("unknown progress mode {:?}", other),
            };
            let reporter = mode.reporter();

            datastore.create_dataset(&dataset, Metadata::new(), false).await?;
            let datastore = Arc::new(datastore);
            let summary = tokio::select! {
                result = ingest_paths(datastore, &dataset, &paths, opts, reporter.as_ref()) => result?,
                _ = tokio::signal::ctrl_c() => {
                    bail!("interrupted; files ingested so far remain in dataset {:?}", dataset)
                }
            };

            println!(
                "Ingested {} files ({} documents) into dataset {}; skipped {} ({} duplicate, {} unsupported, {} empty); failed {}; pruned {}",
                summary.ingested,
                summary.documents,
                dataset,
                summary.skipped(),
                summary.duplicates,
                summary.unsupported,
                summary.empty,
                summary.failed.len(),
                summary.pruned
            );
            for failed in &summary.failed {
                eprintln!("  {}: {}", failed.path, failed.error);
            }
            summary.ensure_success()?;
        }
        Commands::Retrieve {
            query,
            datasets,
            top_k,
            flows_file,
            flow,
        } => {
            let first = datasets.first().map(String::as_str).unwrap_or(DEFAULT_DATASET);
            let flow = resolve_flow(&cfg, flows_file.as_deref(), flow.as_deref(), first)?
                .map(|entry| entry.as_retrieval_flow())
                .transpose()?;
            let opts = RetrieveOpts {
                top_k: top_k.unwrap_or(cfg.retrieval.top_k),
                flow,
            };
            print_json(&datastore.retrieve(&datasets, &query, opts).await?)?;
        }
        Commands::GetFile { dataset, file, id } => {
            match datastore.find_file(&dataset, &file_ref(&file, id)).await? {
                Some(found) => print_json(&found)?,
                None => bail!("file {:?} not found in dataset {:?}", file, dataset),
            }
        }
        Commands::DeleteFile { dataset, file, id } => {
            if !datastore.delete_file(&dataset, &file_ref(&file, id)).await? {
                bail!("file {:?} not found in dataset {:?}", file, dataset);
            }
            println!("Deleted file {}", file);
        }
        Commands::Export { datasets, output } => {
            datastore
                .export_datasets_to_file(output.as_deref(), &datasets)
                .await?;
        }
        Commands::Import { file } => {
            let imported = datastore.import_datasets_from_file(&file).await?;
            println!("Imported datasets: {}", imported.join(", "));
        }
    }

    Ok(())
}
