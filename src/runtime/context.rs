//! Per-worker dispatch context.
//!
//! Holds the raw records of the file being processed and, for every
//! granularity level, the aggregate records keyed by their grouping key plus
//! the parent → children key lists. Plugins receive it as `&DispatchContext`.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::record::{Record, IN_IDX, RAW_IDX};
use crate::runtime::navigator::NavigationError;

/// Error type for granularity chain definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GranularityError {
    Empty,
    EmptyName { position: usize },
    Duplicate(String),
}

impl fmt::Display for GranularityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GranularityError::Empty => write!(f, "No granularity levels configured"),
            GranularityError::EmptyName { position } => {
                write!(f, "Granularity level at position {} has an empty name", position)
            }
            GranularityError::Duplicate(name) => {
                write!(f, "Granularity level '{}' is listed twice", name)
            }
        }
    }
}

impl std::error::Error for GranularityError {}

/// Ordered level names, finest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranularityChain {
    levels: Vec<String>,
    positions: HashMap<String, usize>,
}

impl GranularityChain {
    /// Parse a comma-delimited level list such as `"pkt, flow, flowset"`.
    pub fn parse(levels: &str) -> Result<Self, GranularityError> {
        Self::from_levels(levels.split(',').map(|s| s.to_string()))
    }

    pub fn from_levels<I, S>(levels: I) -> Result<Self, GranularityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names = Vec::new();
        let mut positions = HashMap::new();
        for (position, name) in levels.into_iter().enumerate() {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(GranularityError::EmptyName { position });
            }
            if positions.insert(name.to_string(), position).is_some() {
                return Err(GranularityError::Duplicate(name.to_string()));
            }
            names.push(name.to_string());
        }
        if names.is_empty() {
            return Err(GranularityError::Empty);
        }
        Ok(Self {
            levels: names,
            positions,
        })
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Position of `level` in the chain (0 = finest).
    pub fn position(&self, level: &str) -> Option<usize> {
        self.positions.get(level).copied()
    }

    pub fn name(&self, position: usize) -> Option<&str> {
        self.levels.get(position).map(|s| s.as_str())
    }

    pub fn contains(&self, level: &str) -> bool {
        self.positions.contains_key(level)
    }
}

impl fmt::Display for GranularityChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.join(","))
    }
}

/// Aggregate records of one level.
///
/// The map's insertion order gives each key its dense index.
#[derive(Debug, Clone, Default)]
pub struct LevelStore {
    records: IndexMap<String, Record>,
    children: HashMap<String, Vec<String>>,
}

impl LevelStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.records.get_index_of(key)
    }

    pub fn key_at(&self, idx: usize) -> Option<&str> {
        self.records.get_index(idx).map(|(k, _)| k.as_str())
    }

    pub fn record_at(&self, idx: usize) -> Option<&Record> {
        self.records.get_index(idx).map(|(_, r)| r)
    }

    /// Immediate children (keys one level finer), in creation order.
    pub fn children_of(&self, key: &str) -> &[String] {
        self.children.get(key).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// `(key, record)` pairs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.records.iter().map(|(k, r)| (k.as_str(), r))
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Record> {
        self.records.get_mut(key)
    }

    pub(crate) fn record_at_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.records.get_index_mut(idx).map(|(_, r)| r)
    }

    /// Append a record for a key not yet present; returns its dense index.
    pub(crate) fn insert_new(&mut self, key: String, record: Record) -> usize {
        let (idx, _) = self.records.insert_full(key, record);
        idx
    }

    pub(crate) fn push_child(&mut self, parent: &str, child: String) {
        self.children.entry(parent.to_string()).or_default().push(child);
    }

    fn clear(&mut self) {
        self.records.clear();
        self.children.clear();
    }
}

/// State of one worker while it processes one input file.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    chain: Arc<GranularityChain>,
    file_index: usize,
    input_path: PathBuf,
    raw: Vec<Record>,
    levels: Vec<LevelStore>,
}

impl DispatchContext {
    pub fn new(chain: Arc<GranularityChain>) -> Self {
        let levels = vec![LevelStore::default(); chain.len()];
        Self {
            chain,
            file_index: 0,
            input_path: PathBuf::new(),
            raw: Vec::new(),
            levels,
        }
    }

    /// Reset all per-file state before processing a new file.
    pub fn begin_file(&mut self, file_index: usize, input_path: &Path) {
        self.file_index = file_index;
        self.input_path = input_path.to_path_buf();
        self.raw.clear();
        for store in &mut self.levels {
            store.clear();
        }
    }

    /// Append a raw record, injecting `__in_idx` (and `idx` when the reader
    /// did not provide one). Returns its index.
    pub fn push_raw(&mut self, mut record: Record) -> usize {
        let idx = self.raw.len();
        record.set(IN_IDX, idx.to_string());
        if !record.is_set(RAW_IDX) {
            record.set(RAW_IDX, idx.to_string());
        }
        self.raw.push(record);
        idx
    }

    pub fn chain(&self) -> &GranularityChain {
        &self.chain
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn raw(&self, idx: usize) -> Option<&Record> {
        self.raw.get(idx)
    }

    pub fn raw_records(&self) -> &[Record] {
        &self.raw
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// Raw record an aggregate record was created from.
    pub fn source_of(&self, record: &Record) -> Option<&Record> {
        record.in_idx().and_then(|idx| self.raw.get(idx))
    }

    /// Store of `level`, or an error when the level is not in the chain.
    pub fn level_store(&self, level: &str) -> Result<&LevelStore, NavigationError> {
        let position = self
            .chain
            .position(level)
            .ok_or_else(|| NavigationError::UnknownLevel(level.to_string()))?;
        Ok(&self.levels[position])
    }

    pub fn level_store_at(&self, position: usize) -> Option<&LevelStore> {
        self.levels.get(position)
    }

    pub(crate) fn raw_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.raw.get_mut(idx)
    }

    pub(crate) fn level_store_at_mut(&mut self, position: usize) -> Option<&mut LevelStore> {
        self.levels.get_mut(position)
    }

    /// Move a record out of its store, leaving an empty record in its slot.
    pub(crate) fn detach(&mut self, position: usize, idx: usize) -> Option<Record> {
        self.levels
            .get_mut(position)
            .and_then(|s| s.record_at_mut(idx))
            .map(std::mem::take)
    }

    /// Put a detached record back into its slot.
    pub(crate) fn restore(&mut self, position: usize, idx: usize, record: Record) {
        if let Some(slot) = self
            .levels
            .get_mut(position)
            .and_then(|s| s.record_at_mut(idx))
        {
            *slot = record;
        }
    }
}
