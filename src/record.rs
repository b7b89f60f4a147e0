//! Record type shared by raw packets and aggregate nodes.
//!
//! Raw packet rows and per-level aggregate records are both ordered string
//! maps. Bookkeeping fields maintained by the engine start with a double
//! underscore (`__in_idx`, `__<level>_key`, `__<level>_idx`).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of the raw record that created (or is) this record.
pub const IN_IDX: &str = "__in_idx";

/// Packet counter injected by the reader; used by packet-level key generators.
pub const RAW_IDX: &str = "idx";

/// Name of the field holding a record's key at `level`.
pub fn key_field(level: &str) -> String {
    format!("__{}_key", level)
}

/// Name of the field holding a record's dense index at `level`.
pub fn idx_field(level: &str) -> String {
    format!("__{}_idx", level)
}

/// Returns true for engine-maintained fields.
pub fn is_internal_field(name: &str) -> bool {
    name.starts_with("__")
}

/// An ordered field name → string value mapping.
///
/// A field that is absent is *unset*; the empty string is a regular value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record carrying only its `__in_idx`.
    pub fn with_in_idx(in_idx: usize) -> Self {
        let mut record = Self::new();
        record.set(IN_IDX, in_idx.to_string());
        record
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|s| s.as_str())
    }

    /// Value of `field`, or `""` when unset.
    pub fn get_or_empty(&self, field: &str) -> &str {
        self.get(field).unwrap_or("")
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Remove a field, preserving the order of the remaining ones.
    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.fields.shift_remove(field)
    }

    pub fn is_set(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.fields.iter()
    }

    /// The raw record index this record was created from.
    pub fn in_idx(&self) -> Option<usize> {
        self.get_usize(IN_IDX)
    }

    /// Parse a field as an unsigned index.
    pub fn get_usize(&self, field: &str) -> Option<usize> {
        self.get(field).and_then(|v| v.parse().ok())
    }

    /// Values of `fields` in the given order; unset fields render as `""`.
    pub fn project<'a>(&'a self, fields: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        fields.iter().map(move |f| self.get_or_empty(f))
    }
}

impl FromIterator<(String, String)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", k, v)?;
        }
        write!(f, "}}")
    }
}
