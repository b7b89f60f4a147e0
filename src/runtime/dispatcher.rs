//! Batch dispatcher.
//!
//! Discovers the input files of a run, prepares the output directory and
//! runs one worker per file on a bounded pool of blocking tasks. A failed
//! file is reported and does not affect the others.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::EngineError;
use crate::runtime::config_loader::ConfigError;
use crate::runtime::context::DispatchContext;
use crate::runtime::engine::{Engine, FileSummary};

/// Shared cancellation flag, set once and observed by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One capture file to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub absolute: PathBuf,
    /// Path below the input root; output paths mirror it.
    pub relative: PathBuf,
    pub size: u64,
}

fn io_error(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| name.ends_with(&ext.to_ascii_lowercase()))
}

/// Find the capture files under `input`.
///
/// A single file is taken as is. A directory is walked recursively,
/// following symbolic links, keeping files whose name ends with one of
/// `extensions`.
///
/// # Returns
///
/// Files sorted by size (largest first) when `by_size`, by path otherwise
pub fn discover_inputs(
    input: &Path,
    extensions: &[String],
    by_size: bool,
) -> Result<Vec<InputFile>, EngineError> {
    let metadata = fs::metadata(input).map_err(|e| io_error(input, e))?;
    let mut files = Vec::new();

    if metadata.is_file() {
        let relative = input
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| input.to_path_buf());
        files.push(InputFile {
            absolute: input.to_path_buf(),
            relative,
            size: metadata.len(),
        });
        return Ok(files);
    }

    let mut visited = HashSet::new();
    walk(input, input, extensions, &mut visited, &mut files)?;

    if by_size {
        files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.relative.cmp(&b.relative)));
    } else {
        files.sort_by(|a, b| a.relative.cmp(&b.relative));
    }
    tracing::info!("Found {} input files under {}", files.len(), input.display());
    Ok(files)
}

fn walk(
    root: &Path,
    dir: &Path,
    extensions: &[String],
    visited: &mut HashSet<PathBuf>,
    files: &mut Vec<InputFile>,
) -> Result<(), EngineError> {
    let canonical = dir.canonicalize().map_err(|e| io_error(dir, e))?;
    if !visited.insert(canonical) {
        tracing::debug!("Skipping already visited directory {}", dir.display());
        return Ok(());
    }

    for entry in fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
        let path = entry.map_err(|e| io_error(dir, e))?.path();
        // Follows symlinks.
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if metadata.is_dir() {
            walk(root, &path, extensions, visited, files)?;
        } else if metadata.is_file() && has_extension(&path, extensions) {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            files.push(InputFile {
                absolute: path,
                relative,
                size: metadata.len(),
            });
        }
    }
    Ok(())
}

/// Create the output directory.
///
/// An existing non-empty directory, or a regular file at `path`, is removed
/// when `force_remove` is set and rejected otherwise, so results of earlier
/// runs never mix with this one.
pub fn prepare_output_dir(path: &Path, force_remove: bool) -> Result<(), EngineError> {
    let occupied = |what: &str| {
        EngineError::Config(ConfigError::InvalidValue {
            setting: "output_path",
            message: format!(
                "{} {}; set force_remove to replace it",
                path.display(),
                what
            ),
        })
    };

    if path.is_file() {
        if !force_remove {
            return Err(occupied("is a file"));
        }
        tracing::warn!("Removing file {} in place of the output directory", path.display());
        fs::remove_file(path).map_err(|e| io_error(path, e))?;
    } else if path.is_dir() {
        let mut entries = fs::read_dir(path).map_err(|e| io_error(path, e))?;
        if entries.next().is_some() {
            if !force_remove {
                return Err(occupied("is not empty"));
            }
            tracing::warn!("Removing existing output directory {}", path.display());
            fs::remove_dir_all(path).map_err(|e| io_error(path, e))?;
        }
    }
    fs::create_dir_all(path).map_err(|e| io_error(path, e))
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<FileFailure>,
    pub cancelled: bool,
}

impl BatchReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
        }
    }

    fn record(&mut self, input: &InputFile, result: Result<FileSummary, EngineError>) {
        match result {
            Ok(summary) => {
                tracing::debug!(
                    "{} done: {} outputs",
                    input.relative.display(),
                    summary.outputs.len()
                );
                self.succeeded.push(input.relative.clone());
            }
            Err(EngineError::Cancelled) => {
                tracing::warn!("{} cancelled", input.relative.display());
                self.cancelled = true;
                self.failed.push(FileFailure {
                    path: input.relative.clone(),
                    reason: EngineError::Cancelled.to_string(),
                });
            }
            Err(e) => {
                tracing::error!("{} failed: {}", input.relative.display(), e);
                self.failed.push(FileFailure {
                    path: input.relative.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty()
    }

    /// 0 when every file succeeded, 130 when cancelled, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if self.failed.is_empty() {
            0
        } else {
            1
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one file, turning a panic (typically from plugin code) into an error.
fn run_guarded(
    engine: &Engine,
    ctx: &mut DispatchContext,
    file_index: usize,
    input: &InputFile,
    cancel: &CancelToken,
) -> Result<FileSummary, EngineError> {
    catch_unwind(AssertUnwindSafe(|| {
        engine.process_file(ctx, file_index, input, cancel)
    }))
    .unwrap_or_else(|payload| Err(EngineError::Panic(panic_message(payload))))
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    cancel: CancelToken,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, cancel: CancelToken) -> Self {
        Self { engine, cancel }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Discover the inputs, prepare the output directory and process every
    /// file.
    pub async fn run(&self) -> Result<BatchReport, EngineError> {
        let config = self.engine.config();
        let inputs = discover_inputs(
            &config.input_path,
            &config.extensions,
            config.sort_by_filesize,
        )?;
        prepare_output_dir(&config.output_path, config.force_remove)?;
        Ok(self.dispatch(inputs).await)
    }

    /// Process `inputs`; file indexes are positions in `inputs`.
    pub async fn dispatch(&self, inputs: Vec<InputFile>) -> BatchReport {
        let mut report = BatchReport::new();
        if self.engine.config().parallel {
            self.dispatch_parallel(inputs, &mut report).await;
        } else {
            self.dispatch_sequential(inputs, &mut report).await;
        }
        if self.cancel.is_cancelled() {
            report.cancelled = true;
        }
        report.finished_at = Utc::now();

        tracing::info!(
            "Batch finished in {}s: {} succeeded, {} failed{}",
            report.elapsed().num_seconds(),
            report.succeeded.len(),
            report.failed.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        report
    }

    async fn dispatch_parallel(&self, inputs: Vec<InputFile>, report: &mut BatchReport) {
        let concurrency = self.engine.config().effective_concurrency();
        tracing::info!("Processing {} files with {} workers", inputs.len(), concurrency);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();

        for (file_index, input) in inputs.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancelled; not dispatching remaining files");
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let engine = Arc::clone(&self.engine);
            let cancel = self.cancel.clone();
            workers.spawn_blocking(move || {
                let _permit = permit;
                let mut ctx = engine.new_context();
                let result = run_guarded(&engine, &mut ctx, file_index, &input, &cancel);
                (input, result)
            });

            // Reap finished workers so the report fills in as we go.
            while let Some(joined) = workers.try_join_next() {
                Self::collect(joined, report);
            }
        }

        while let Some(joined) = workers.join_next().await {
            Self::collect(joined, report);
        }
    }

    async fn dispatch_sequential(&self, inputs: Vec<InputFile>, report: &mut BatchReport) {
        tracing::info!("Processing {} files sequentially", inputs.len());
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let mut ctx = engine.new_context();
            let mut results = Vec::with_capacity(inputs.len());
            for (file_index, input) in inputs.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    break;
                }
                let result = run_guarded(&engine, &mut ctx, file_index, &input, &cancel);
                results.push((input, result));
            }
            results
        })
        .await;

        match joined {
            Ok(results) => {
                for (input, result) in results {
                    report.record(&input, result);
                }
            }
            Err(e) => tracing::error!("Sequential worker failed: {}", e),
        }
    }

    fn collect(
        joined: Result<(InputFile, Result<FileSummary, EngineError>), tokio::task::JoinError>,
        report: &mut BatchReport,
    ) {
        match joined {
            Ok((input, result)) => report.record(&input, result),
            Err(e) => tracing::error!("Worker task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec![".pcap".to_string(), ".pcapng".to_string()]
    }

    #[test]
    fn test_discover_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("day1")).unwrap();
        fs::write(dir.path().join("small.pcap"), b"x").unwrap();
        fs::write(dir.path().join("day1/big.PCAPNG"), b"xxxxxxxx").unwrap();
        fs::write(dir.path().join("notes.txt"), b"xxxxxxxxxxxxxxxx").unwrap();

        let by_size = discover_inputs(dir.path(), &exts(), true).unwrap();
        let relative: Vec<_> = by_size.iter().map(|f| f.relative.clone()).collect();
        assert_eq!(relative, vec![PathBuf::from("day1/big.PCAPNG"), PathBuf::from("small.pcap")]);

        let by_path = discover_inputs(dir.path(), &exts(), false).unwrap();
        assert_eq!(by_path[0].relative, PathBuf::from("day1/big.PCAPNG"));
        assert_eq!(by_path[1].size, 1);
    }

    #[test]
    fn test_discover_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.txt");
        fs::write(&path, b"abc").unwrap();

        let files = discover_inputs(&path, &exts(), true).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, PathBuf::from("one.txt"));
        assert_eq!(files[0].size, 3);
    }

    #[test]
    fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_inputs(&dir.path().join("nope"), &exts(), true),
            Err(EngineError::Io { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_is_visited_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pcap"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let files = discover_inputs(dir.path(), &exts(), false).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_prepare_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        prepare_output_dir(&out, false).unwrap();
        assert!(out.is_dir());
        // An empty directory is reused as is.
        prepare_output_dir(&out, false).unwrap();

        fs::write(out.join("stale.pkt.csv"), b"old").unwrap();
        assert!(matches!(
            prepare_output_dir(&out, false),
            Err(EngineError::Config(_))
        ));
        assert!(out.join("stale.pkt.csv").exists());

        prepare_output_dir(&out, true).unwrap();
        assert!(out.is_dir());
        assert!(!out.join("stale.pkt.csv").exists());
    }

    #[test]
    fn test_output_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::write(&out, b"not a directory").unwrap();

        assert!(matches!(
            prepare_output_dir(&out, false),
            Err(EngineError::Config(_))
        ));
        assert!(out.is_file());

        prepare_output_dir(&out, true).unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn test_exit_codes() {
        let mut report = BatchReport::new();
        assert_eq!(report.exit_code(), 0);
        report.failed.push(FileFailure {
            path: PathBuf::from("a.pcap"),
            reason: "boom".to_string(),
        });
        assert_eq!(report.exit_code(), 1);
        report.cancelled = true;
        assert_eq!(report.exit_code(), 130);
        assert!(!report.is_success());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(3)), "unknown panic");
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
