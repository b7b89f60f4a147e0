//! Level output writers.
//!
//! Each level's records are written in creation order, one row (CSV) or one
//! ordered JSON object (NDJSON) per record, restricted to the level's output
//! fields.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::record::Record;

/// Error type for serialization operations
#[derive(Debug)]
pub enum SerializationError {
    JsonError(serde_json::Error),
    CsvError(csv::Error),
    IoError(std::io::Error),
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::JsonError(err)
    }
}

impl From<csv::Error> for SerializationError {
    fn from(err: csv::Error) -> Self {
        SerializationError::CsvError(err)
    }
}

impl From<std::io::Error> for SerializationError {
    fn from(err: std::io::Error) -> Self {
        SerializationError::IoError(err)
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::JsonError(e) => write!(f, "JSON error: {}", e),
            SerializationError::CsvError(e) => write!(f, "CSV error: {}", e),
            SerializationError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for SerializationError {}

/// Output file format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Ndjson,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Ndjson => "ndjson",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "ndjson" | "jsonl" => Ok(OutputFormat::Ndjson),
            other => Err(format!("unsupported output type '{}' (expected csv or ndjson)", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Output file of `level` for an input at `relative` under `output_dir`:
/// the input's extension is replaced by `<level>.<format>`.
pub fn level_output_path(
    output_dir: &Path,
    relative: &Path,
    level: &str,
    format: OutputFormat,
) -> PathBuf {
    output_dir
        .join(relative)
        .with_extension(format!("{}.{}", level, format.extension()))
}

/// NDJSON (Newline Delimited JSON) writer
///
/// Writes records as NDJSON, one JSON object per line, keys in column order.
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonWriter<W> {
    /// Create a new NDJSON writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write the projection of one record as an NDJSON line
    pub fn write(&mut self, fields: &[String], record: &Record) -> Result<(), SerializationError> {
        let object: IndexMap<&str, &str> = fields
            .iter()
            .map(|f| (f.as_str(), record.get_or_empty(f)))
            .collect();
        let json = serde_json::to_string(&object)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    /// Flush the underlying writer
    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer with a header row of field ids.
pub struct CsvWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvWriter<W> {
    /// Create a new CSV writer and write the header row
    pub fn new(writer: W, fields: &[String]) -> Result<Self, SerializationError> {
        let mut writer = csv::WriterBuilder::new().from_writer(writer);
        writer.write_record(fields)?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, fields: &[String], record: &Record) -> Result<(), SerializationError> {
        self.writer.write_record(record.project(fields))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Write every record of a level to `writer` in the given format.
///
/// # Returns
///
/// Number of records written
pub fn write_level<'a, W, I>(
    format: OutputFormat,
    fields: &[String],
    records: I,
    writer: W,
) -> Result<usize, SerializationError>
where
    W: Write,
    I: IntoIterator<Item = &'a Record>,
{
    let mut count = 0;
    match format {
        OutputFormat::Csv => {
            let mut out = CsvWriter::new(writer, fields)?;
            for record in records {
                out.write(fields, record)?;
                count += 1;
            }
            out.flush()?;
        }
        OutputFormat::Ndjson => {
            let mut out = NdjsonWriter::new(writer);
            for record in records {
                out.write(fields, record)?;
                count += 1;
            }
            out.flush()?;
        }
    }
    Ok(count)
}
