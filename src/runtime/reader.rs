//! Packet reader.
//!
//! Runs the dissector (`tshark`) on one capture file and turns each line of
//! its tab-separated field output into a raw record.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::record::Record;
use crate::runtime::config_loader::ToolConfig;
use crate::runtime::context::DispatchContext;
use crate::runtime::dispatcher::CancelToken;

/// Error type for the reader
#[derive(Debug)]
pub enum ReaderError {
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    ErrorLog {
        path: PathBuf,
        source: std::io::Error,
    },
    Io(std::io::Error),
    /// The tool exited unsuccessfully before its output was fully consumed.
    Failed {
        status: ExitStatus,
        error_log: Option<PathBuf>,
    },
    Cancelled,
}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderError::Spawn { program, source } => {
                write!(f, "Failed to start {}: {}", program.display(), source)
            }
            ReaderError::ErrorLog { path, source } => {
                write!(f, "Failed to open error log {}: {}", path.display(), source)
            }
            ReaderError::Io(e) => write!(f, "Failed to read tool output: {}", e),
            ReaderError::Failed { status, error_log } => {
                write!(f, "Tool exited with {}", status)?;
                if let Some(log) = error_log {
                    write!(f, " (see {})", log.display())?;
                }
                Ok(())
            }
            ReaderError::Cancelled => write!(f, "Reading cancelled"),
        }
    }
}

impl std::error::Error for ReaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReaderError::Spawn { source, .. } | ReaderError::ErrorLog { source, .. } => {
                Some(source)
            }
            ReaderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(err: std::io::Error) -> Self {
        ReaderError::Io(err)
    }
}

/// Error log path for one worker: `<stem>.<file_index>.<ext>` when numbered.
pub fn error_log_path(tool: &ToolConfig, file_index: usize) -> Option<PathBuf> {
    let log = tool.error_log.as_ref()?;
    if !tool.number_error_logs {
        return Some(log.clone());
    }
    let numbered = match log.extension().and_then(|e| e.to_str()) {
        Some(ext) => log.with_extension(format!("{}.{}", file_index, ext)),
        None => log.with_extension(file_index.to_string()),
    };
    Some(numbered)
}

/// Build the dissector invocation for one capture file.
pub fn build_command(
    tool: &ToolConfig,
    fields: &[String],
    input: &Path,
    file_index: usize,
) -> Result<Command, ReaderError> {
    let mut command = Command::new(&tool.path);
    command.args(tool.options.split_whitespace());
    if !tool.display_filter.trim().is_empty() {
        command.arg("-Y").arg(&tool.display_filter);
    }
    command.arg("-T").arg("fields");
    for field in fields {
        command.arg("-e").arg(field);
    }
    command.arg("-r").arg(input);

    command.stdin(Stdio::null()).stdout(Stdio::piped());
    match error_log_path(tool, file_index) {
        Some(path) => {
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| ReaderError::ErrorLog {
                    path: path.clone(),
                    source,
                })?;
            command.stderr(Stdio::from(log));
        }
        None => {
            command.stderr(Stdio::inherit());
        }
    }
    Ok(command)
}

/// Split one output line into a record; missing trailing columns are empty.
pub fn parse_line(line: &str, fields: &[String]) -> Record {
    let line = line.trim_end_matches(['\n', '\r']);
    let mut values = line.split('\t');
    fields
        .iter()
        .map(|field| (field.clone(), values.next().unwrap_or("").to_string()))
        .collect()
}

fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!("Tool already exited: {}", e);
    }
    let _ = child.wait();
}

/// Read one capture file into `ctx`'s raw records.
///
/// # Arguments
///
/// * `tool` - Dissector settings
/// * `fields` - Dissector fields to collect, in column order
/// * `input` - Capture file
/// * `early_stop` - Read at most this many records
/// * `cancel` - Checked before every line
/// * `ctx` - Receives the raw records
///
/// # Returns
///
/// Number of records read
pub fn read_capture(
    tool: &ToolConfig,
    fields: &[String],
    input: &Path,
    early_stop: Option<usize>,
    cancel: &CancelToken,
    ctx: &mut DispatchContext,
) -> Result<usize, ReaderError> {
    let mut command = build_command(tool, fields, input, ctx.file_index())?;
    tracing::debug!("Running {:?}", command);

    let mut child = command.spawn().map_err(|source| ReaderError::Spawn {
        program: tool.path.clone(),
        source,
    })?;
    let Some(stdout) = child.stdout.take() else {
        stop(&mut child);
        return Err(ReaderError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "tool stdout was not captured",
        )));
    };

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut count = 0usize;
    let mut early_stopped = false;

    loop {
        if cancel.is_cancelled() {
            stop(&mut child);
            return Err(ReaderError::Cancelled);
        }
        if early_stop.is_some_and(|limit| count >= limit) {
            tracing::info!("Early stop after {} records of {}", count, input.display());
            early_stopped = true;
            break;
        }

        buf.clear();
        let read = match reader.read_until(b'\n', &mut buf) {
            Ok(read) => read,
            Err(e) => {
                stop(&mut child);
                return Err(ReaderError::Io(e));
            }
        };
        if read == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        ctx.push_raw(parse_line(&line, fields));
        count += 1;
    }

    if early_stopped {
        drop(reader);
        stop(&mut child);
    } else {
        let status = child.wait()?;
        if !status.success() {
            return Err(ReaderError::Failed {
                status,
                error_log: error_log_path(tool, ctx.file_index()),
            });
        }
    }

    if count == 0 {
        tracing::warn!("No packets read from {}", input.display());
    }
    Ok(count)
}
