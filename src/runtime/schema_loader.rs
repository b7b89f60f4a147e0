//! Schema definition files.
//!
//! A schema directory holds `input_tshark.csv` (the dissector fields to
//! collect) and one `output_<level>.csv` per granularity level (the output
//! fields and their transform chains).

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::runtime::context::GranularityChain;
use crate::schema::{ChainPolicy, InputSchema, LevelSchema, SchemaError, SchemaRegistry};

pub const INPUT_SCHEMA_FILE: &str = "input_tshark.csv";

/// File name of a level's output schema.
pub fn output_schema_file(level: &str) -> String {
    format!("output_{}.csv", level)
}

#[derive(Debug, Deserialize)]
struct InputRow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    tshark_displayfilter_field: String,
}

#[derive(Debug, Deserialize)]
struct OutputRow {
    #[serde(default)]
    field: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    preprocess_fns: String,
    #[serde(default)]
    options: String,
}

fn file_error(path: &Path, message: impl ToString) -> SchemaError {
    SchemaError::File {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, SchemaError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| file_error(path, e))
}

/// Read the dissector field list.
pub fn load_input_schema(path: &Path) -> Result<InputSchema, SchemaError> {
    let mut reader = open(path)?;
    let mut schema = InputSchema::new();
    for (i, row) in reader.deserialize::<InputRow>().enumerate() {
        let row = row.map_err(|e| file_error(path, e))?;
        schema.add_field(i + 1, &row.tshark_displayfilter_field, &row.name)?;
    }
    tracing::debug!("Read {} input fields from {}", schema.len(), path.display());
    Ok(schema)
}

/// Read one level's output field list.
pub fn load_level_schema(
    path: &Path,
    level: &str,
    policy: ChainPolicy,
) -> Result<LevelSchema, SchemaError> {
    let mut reader = open(path)?;
    let mut schema = LevelSchema::new(level);
    for row in reader.deserialize::<OutputRow>() {
        let row = row.map_err(|e| file_error(path, e))?;
        schema.add_field(&row.field, &row.name, &row.preprocess_fns, &row.options, policy)?;
    }
    tracing::debug!(
        "Read {} output fields for level '{}' from {}",
        schema.len(),
        level,
        path.display()
    );
    Ok(schema)
}

/// Read the input schema and the output schema of every level in `chain`.
pub fn load_schema_dir(
    dir: &Path,
    chain: &GranularityChain,
    policy: ChainPolicy,
) -> Result<(InputSchema, SchemaRegistry), SchemaError> {
    let input = load_input_schema(&dir.join(INPUT_SCHEMA_FILE))?;
    let mut outputs = SchemaRegistry::new();
    for level in chain.levels() {
        let path: PathBuf = dir.join(output_schema_file(level));
        outputs.insert(load_level_schema(&path, level, policy)?);
    }
    Ok((input, outputs))
}
