//! Directory ingestion: walk paths, filter, expand archives and run
//! [`Datastore::ingest`] for every file on a bounded task pool.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use knowledge_core::embedding::EmbeddingCache;
use knowledge_core::models::{content_checksum, FileMetadata};

use crate::config::Config;
use crate::datastore::{Datastore, IngestOpts, IngestOutcome, ModelPreference};
use crate::progress::{IngestProgressEvent, IngestProgressReporter};

/// Maximum bytes read from a single archive entry.
const MAX_ARCHIVE_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct IngestPathsOpts {
    /// Files ingested at the same time.
    pub concurrency: usize,
    pub recursive: bool,
    pub include_hidden: bool,
    /// Extensions (without the dot, case-insensitive) to skip.
    pub ignore_extensions: Vec<String>,
    /// File with one glob per line; matching paths are skipped.
    pub ignore_file: Option<PathBuf>,
    /// Abort the run at the first failed file.
    pub exit_on_failed_file: bool,
    /// After a successful run, delete indexed files under each input
    /// directory that were not seen.
    pub prune: bool,
    /// Template for every per-file ingest call.
    pub ingest: IngestOpts,
}

impl Default for IngestPathsOpts {
    fn default() -> Self {
        Self {
            concurrency: 10,
            recursive: true,
            include_hidden: false,
            ignore_extensions: Vec::new(),
            ignore_file: None,
            exit_on_failed_file: false,
            prune: false,
            ingest: IngestOpts::default(),
        }
    }
}

impl IngestPathsOpts {
    pub fn from_config(config: &Config) -> Self {
        let ingest = &config.ingest;
        Self {
            concurrency: ingest.concurrency,
            include_hidden: ingest.include_hidden,
            ignore_extensions: ingest.ignore_extensions.clone(),
            exit_on_failed_file: ingest.exit_on_failed_file,
            ingest: IngestOpts {
                is_duplicate_func_name: Some(ingest.dedupe_func.clone())
                    .filter(|n| !n.is_empty()),
                reuse_embeddings: ingest.reuse_embeddings,
                err_on_unsupported_file: ingest.err_on_unsupported_file,
                model_preference: if ingest.prefer_new_embedding_model {
                    ModelPreference::PreferConfigured
                } else {
                    ModelPreference::PreferDataset
                },
                strict_embedding_config: ingest.strict_embedding_config,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestPathsSummary {
    pub files: usize,
    pub ingested: usize,
    pub duplicates: usize,
    pub unsupported: usize,
    pub empty: usize,
    pub documents: usize,
    pub failed: Vec<FailedFile>,
    pub pruned: usize,
}

impl IngestPathsSummary {
    pub fn skipped(&self) -> usize {
        self.duplicates + self.unsupported + self.empty
    }

    /// Error when any file failed.
    pub fn ensure_success(&self) -> Result<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let first = &self.failed[0];
        bail!(
            "{} of {} files failed to ingest (first: {}: {})",
            self.failed.len(),
            self.files,
            first.path,
            first.error
        )
    }

    fn record(&mut self, result: &FileResult) {
        self.files += 1;
        match &result.outcome {
            Ok(IngestOutcome::Ingested(ids)) => {
                self.ingested += 1;
                self.documents += ids.len();
            }
            Ok(IngestOutcome::Duplicate) => self.duplicates += 1,
            Ok(IngestOutcome::Unsupported { .. }) => self.unsupported += 1,
            Ok(IngestOutcome::Empty) => self.empty += 1,
            Err(e) => self.failed.push(FailedFile {
                path: result.path.clone(),
                error: format!("{:#}", e),
            }),
        }
    }
}

struct FileResult {
    path: String,
    outcome: Result<IngestOutcome>,
}

/// Files to ingest and the directories they were found under.
#[derive(Debug, Default)]
struct Discovered {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

struct PathFilter {
    include_hidden: bool,
    ignore_extensions: Vec<String>,
    ignore: GlobSet,
}

impl PathFilter {
    fn new(opts: &IngestPathsOpts) -> Result<Self> {
        let patterns = match &opts.ignore_file {
            Some(path) => read_ignore_file(path)?,
            None => Vec::new(),
        };
        Ok(Self {
            include_hidden: opts.include_hidden,
            ignore_extensions: opts
                .ignore_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            ignore: build_globset(&patterns)?,
        })
    }

    fn is_hidden(name: &str) -> bool {
        name.starts_with('.') && name != "." && name != ".."
    }

    /// `relative` is the path below the walk root.
    fn accepts_file(&self, relative: &Path) -> bool {
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !self.include_hidden && Self::is_hidden(&name) {
            return false;
        }
        if let Some(ext) = relative.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if self.ignore_extensions.contains(&ext) {
                return false;
            }
        }
        !self.ignore.is_match(relative)
    }

    fn accepts_dir(&self, relative: &Path) -> bool {
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !self.include_hidden && Self::is_hidden(&name) {
            return false;
        }
        !self.ignore.is_match(relative)
    }
}

/// One glob per line; blank lines and `#` comments are skipped. Patterns
/// without a `/` match at any depth, a trailing `/` matches a directory
/// and everything below it.
fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ignore file: {}", path.display()))?;
    let mut patterns = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (base, dir_only) = match line.strip_suffix('/') {
            Some(b) => (b.trim_start_matches('/'), true),
            None => (line.trim_start_matches('/'), false),
        };
        let anchored = line.starts_with('/') || base.contains('/');
        let mut add = |p: String| {
            if dir_only {
                patterns.push(format!("{}/**", p));
            }
            patterns.push(p);
        };
        add(base.to_string());
        if !anchored {
            add(format!("**/{}", base));
        }
    }
    Ok(patterns)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid ignore pattern: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn discover(paths: &[PathBuf], opts: &IngestPathsOpts, filter: &PathFilter) -> Result<Discovered> {
    let mut found = Discovered::default();
    let mut seen = HashSet::new();
    for input in paths {
        let root = std::fs::canonicalize(input)
            .with_context(|| format!("Path does not exist: {}", input.display()))?;
        if root.is_file() {
            if seen.insert(root.clone()) {
                found.files.push(root);
            }
            continue;
        }

        found.dirs.push(root.clone());
        let max_depth = if opts.recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(&root)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                filter.accepts_dir(relative)
            });
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            if !filter.accepts_file(relative) {
                tracing::debug!(path = %entry.path().display(), "ignoring file");
                continue;
            }
            if seen.insert(entry.path().to_path_buf()) {
                found.files.push(entry.path().to_path_buf());
            }
        }
    }
    found.files.sort();
    Ok(found)
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

async fn ingest_file(
    datastore: Arc<Datastore>,
    dataset_id: String,
    path: PathBuf,
    opts: IngestOpts,
    filter: Arc<PathFilter>,
) -> Vec<FileResult> {
    let display = path_string(&path);
    let loaded = async {
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let meta = tokio::fs::metadata(&path).await?;
        let modified_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        anyhow::Ok((content, modified_at))
    }
    .await;
    let (content, modified_at) = match loaded {
        Ok(v) => v,
        Err(e) => {
            return vec![FileResult {
                path: display,
                outcome: Err(e),
            }]
        }
    };

    if is_archive(&path) {
        return ingest_archive(datastore, dataset_id, display, content, modified_at, opts, filter).await;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| display.clone());
    let mut file_opts = opts;
    file_opts.file_metadata = Some(FileMetadata {
        name: name.clone(),
        absolute_path: display.clone(),
        size: content.len() as i64,
        modified_at,
        checksum: Some(content_checksum(&content)),
    });
    let outcome = datastore
        .ingest_with_outcome(&dataset_id, &name, &content, file_opts)
        .await
        .map_err(anyhow::Error::from);
    vec![FileResult {
        path: display,
        outcome,
    }]
}

/// Ingest every entry of a zip archive as its own file, addressed as
/// `<archive path>/<entry name>`.
async fn ingest_archive(
    datastore: Arc<Datastore>,
    dataset_id: String,
    archive_path: String,
    content: Vec<u8>,
    modified_at: DateTime<Utc>,
    opts: IngestOpts,
    filter: Arc<PathFilter>,
) -> Vec<FileResult> {
    let entries = tokio::task::spawn_blocking(move || read_archive_entries(&content, &filter))
        .await
        .map_err(|e| anyhow!(e))
        .and_then(|r| r);
    let entries = match entries {
        Ok(entries) => entries,
        Err(e) => {
            return vec![FileResult {
                path: archive_path,
                outcome: Err(e.context("Failed to read archive")),
            }]
        }
    };

    let mut results = Vec::with_capacity(entries.len());
    for (entry_name, bytes) in entries {
        let absolute_path = format!("{}/{}", archive_path, entry_name);
        let name = entry_name
            .rsplit('/')
            .next()
            .unwrap_or(entry_name.as_str())
            .to_string();
        let mut entry_opts = opts.clone();
        entry_opts.file_metadata = Some(FileMetadata {
            name: name.clone(),
            absolute_path: absolute_path.clone(),
            size: bytes.len() as i64,
            modified_at,
            checksum: Some(content_checksum(&bytes)),
        });
        let outcome = datastore
            .ingest_with_outcome(&dataset_id, &name, &bytes, entry_opts)
            .await
            .map_err(anyhow::Error::from);
        results.push(FileResult {
            path: absolute_path,
            outcome,
        });
    }
    results
}

fn read_archive_entries(content: &[u8], filter: &PathFilter) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(content))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry.enclosed_name().map(|p| path_string(&p)) else {
            tracing::warn!(entry = entry.name(), "skipping archive entry with unsafe path");
            continue;
        };
        if name.starts_with("__MACOSX/") || !filter.accepts_file(Path::new(&name)) {
            continue;
        }
        let mut bytes = Vec::new();
        entry.take(MAX_ARCHIVE_ENTRY_BYTES).read_to_end(&mut bytes)?;
        entries.push((name, bytes));
    }
    Ok(entries)
}

/// Ingest `paths` (files or directories) into `dataset_id`.
///
/// Per-file failures are collected in the summary; with
/// `exit_on_failed_file` the first one aborts the remaining tasks and is
/// returned as the error. Files committed before an abort stay committed.
pub async fn ingest_paths(
    datastore: Arc<Datastore>,
    dataset_id: &str,
    paths: &[PathBuf],
    mut opts: IngestPathsOpts,
    progress: &dyn IngestProgressReporter,
) -> Result<IngestPathsSummary> {
    if datastore.get_dataset(dataset_id, false).await?.is_none() {
        bail!("dataset {:?} not found", dataset_id);
    }
    progress.report(IngestProgressEvent::Discovering {
        dataset: dataset_id.to_string(),
    });

    let filter = Arc::new(PathFilter::new(&opts)?);
    let discovered = discover(paths, &opts, &filter)?;
    let total = discovered.files.len() as u64;
    tracing::info!(dataset = dataset_id, files = total, "discovered files");

    if opts.ingest.reuse_embeddings && opts.ingest.embedding_cache.is_none() {
        opts.ingest.embedding_cache = Some(Arc::new(EmbeddingCache::new()));
    }

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for path in discovered.files {
        let semaphore = semaphore.clone();
        let datastore = datastore.clone();
        let dataset_id = dataset_id.to_string();
        let ingest_opts = opts.ingest.clone();
        let filter = filter.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            ingest_file(datastore, dataset_id, path, ingest_opts, filter).await
        });
    }

    let mut summary = IngestPathsSummary::default();
    let mut seen_paths = HashSet::new();
    let mut done = 0u64;
    while let Some(joined) = tasks.join_next().await {
        let results = joined.map_err(|e| anyhow!("ingest task failed: {}", e))?;
        for result in &results {
            seen_paths.insert(result.path.clone());
            summary.record(result);
            if let Err(e) = &result.outcome {
                tracing::error!(dataset = dataset_id, path = %result.path, error = %format!("{:#}", e), "failed to ingest file");
                if opts.exit_on_failed_file {
                    tasks.abort_all();
                    return Err(anyhow!("Failed to ingest {}: {:#}", result.path, e));
                }
            }
        }
        done += 1;
        progress.report(IngestProgressEvent::Ingesting {
            dataset: dataset_id.to_string(),
            n: done,
            total,
        });
    }

    if opts.prune {
        for dir in &discovered.dirs {
            let mut prefix = path_string(dir);
            if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
                prefix.push(std::path::MAIN_SEPARATOR);
            }
            let pruned = datastore
                .prune_files(dataset_id, &prefix, &seen_paths)
                .await?;
            for file in &pruned {
                tracing::info!(dataset = dataset_id, absolute_path = %file.metadata.absolute_path, "pruned file");
            }
            summary.pruned += pruned.len();
        }
    }

    progress.report(IngestProgressEvent::Finished {
        dataset: dataset_id.to_string(),
        ingested: summary.ingested as u64,
        skipped: summary.skipped() as u64,
        failed: summary.failed.len() as u64,
    });
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn filter(opts: &IngestPathsOpts) -> PathFilter {
        PathFilter::new(opts).unwrap()
    }

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    #[test]
    fn test_discover_skips_hidden_and_ignored_extensions() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.txt");
        touch(tmp.path(), ".hidden.txt");
        touch(tmp.path(), ".git/config");
        touch(tmp.path(), "sub/b.md");
        touch(tmp.path(), "sub/c.log");

        let opts = IngestPathsOpts {
            ignore_extensions: vec![".LOG".to_string()],
            ..Default::default()
        };
        let found = discover(&[tmp.path().to_path_buf()], &opts, &filter(&opts)).unwrap();
        let names: Vec<String> = found
            .files
            .iter()
            .map(|p| p.strip_prefix(std::fs::canonicalize(tmp.path()).unwrap()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt".to_string(), format!("sub{}b.md", std::path::MAIN_SEPARATOR)]);
        assert_eq!(found.dirs.len(), 1);
    }

    #[test]
    fn test_discover_non_recursive() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.txt");
        touch(tmp.path(), "sub/b.txt");
        let opts = IngestPathsOpts {
            recursive: false,
            ..Default::default()
        };
        let found = discover(&[tmp.path().to_path_buf()], &opts, &filter(&opts)).unwrap();
        assert_eq!(found.files.len(), 1);
    }

    #[test]
    fn test_ignore_file_patterns() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "keep.txt");
        touch(tmp.path(), "notes.tmp");
        touch(tmp.path(), "build/out.txt");
        touch(tmp.path(), "docs/build/keep.txt");
        touch(tmp.path(), "docs/secret.txt");

        let ignore = tmp.path().join("ignore");
        let mut f = std::fs::File::create(&ignore).unwrap();
        writeln!(f, "# comment\n*.tmp\n/build/\ndocs/secret.txt").unwrap();

        let opts = IngestPathsOpts {
            ignore_file: Some(ignore),
            ..Default::default()
        };
        let found = discover(&[tmp.path().to_path_buf()], &opts, &filter(&opts)).unwrap();
        let mut names: Vec<String> = found
            .files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["ignore", "keep.txt", "keep.txt"]);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let opts = IngestPathsOpts::default();
        let err = discover(&[PathBuf::from("/definitely/not/here")], &opts, &filter(&opts)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_summary_ensure_success() {
        let mut summary = IngestPathsSummary::default();
        summary.record(&FileResult {
            path: "a".into(),
            outcome: Ok(IngestOutcome::Ingested(vec!["1".into(), "2".into()])),
        });
        summary.record(&FileResult {
            path: "b".into(),
            outcome: Ok(IngestOutcome::Duplicate),
        });
        assert!(summary.ensure_success().is_ok());
        assert_eq!(summary.documents, 2);
        assert_eq!(summary.skipped(), 1);

        summary.record(&FileResult {
            path: "c".into(),
            outcome: Err(anyhow!("boom")),
        });
        let err = summary.ensure_success().unwrap_err();
        assert!(err.to_string().contains("1 of 3 files failed"));
    }
}
