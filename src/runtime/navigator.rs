//! Cross-level navigation over the aggregate stores.
//!
//! Upward lookups (`get_index`, `get_key`) read the `__<level>_idx` /
//! `__<level>_key` fields stamped on the source record. Downward lookups
//! (`get_indexes`, `get_keys`) walk the immediate child lists recursively.
//!
//! While a record's transform chain runs it is detached from its store, so
//! upward lookups starting from that record's own key see an empty record.
//! Transforms read their own record through the `record` argument instead.

use std::fmt;

use crate::record::{idx_field, key_field, Record};
use crate::runtime::context::DispatchContext;

/// Error type for navigator misuse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    UnknownLevel(String),
    UnknownKey {
        level: String,
        key: String,
    },
    IndexOutOfRange {
        level: String,
        idx: usize,
    },
    /// Upward lookup asked for a strictly finer level.
    NotCoarser {
        from: String,
        to: String,
    },
    /// Downward lookup asked for the same or a coarser level.
    NotFiner {
        from: String,
        to: String,
    },
    /// Source record lacks the stamped link field.
    MissingLink {
        level: String,
        key: String,
        field: String,
    },
}

impl fmt::Display for NavigationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationError::UnknownLevel(level) => write!(f, "Unknown level '{}'", level),
            NavigationError::UnknownKey { level, key } => {
                write!(f, "No record with key '{}' at level '{}'", key, level)
            }
            NavigationError::IndexOutOfRange { level, idx } => {
                write!(f, "No record at index {} of level '{}'", idx, level)
            }
            NavigationError::NotCoarser { from, to } => write!(
                f,
                "Cannot look up '{}' from '{}': target must be the same or a coarser level",
                to, from
            ),
            NavigationError::NotFiner { from, to } => write!(
                f,
                "Cannot list '{}' under '{}': target must be a finer level",
                to, from
            ),
            NavigationError::MissingLink { level, key, field } => write!(
                f,
                "Record '{}' at level '{}' has no '{}' field",
                key, level, field
            ),
        }
    }
}

impl std::error::Error for NavigationError {}

impl DispatchContext {
    fn position_of(&self, level: &str) -> Result<usize, NavigationError> {
        self.chain()
            .position(level)
            .ok_or_else(|| NavigationError::UnknownLevel(level.to_string()))
    }

    fn upward(&self, from: &str, to: &str) -> Result<(usize, usize), NavigationError> {
        let from_pos = self.position_of(from)?;
        let to_pos = self.position_of(to)?;
        if to_pos < from_pos {
            return Err(NavigationError::NotCoarser {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok((from_pos, to_pos))
    }

    fn downward(&self, from: &str, to: &str) -> Result<(usize, usize), NavigationError> {
        let from_pos = self.position_of(from)?;
        let to_pos = self.position_of(to)?;
        if to_pos >= from_pos {
            return Err(NavigationError::NotFiner {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok((from_pos, to_pos))
    }

    /// Aggregate record with `key` at `level`.
    pub fn record(&self, level: &str, key: &str) -> Result<&Record, NavigationError> {
        self.level_store(level)?
            .get(key)
            .ok_or_else(|| NavigationError::UnknownKey {
                level: level.to_string(),
                key: key.to_string(),
            })
    }

    /// Aggregate record at dense index `idx` of `level`.
    pub fn record_at(&self, level: &str, idx: usize) -> Result<&Record, NavigationError> {
        self.level_store(level)?
            .record_at(idx)
            .ok_or_else(|| NavigationError::IndexOutOfRange {
                level: level.to_string(),
                idx,
            })
    }

    /// Dense index, at level `to`, of the record that contains `key`.
    ///
    /// # Arguments
    ///
    /// * `key` - Key of the source record at level `from`
    /// * `from` - Level of the source record
    /// * `to` - Target level; the same as or coarser than `from`
    pub fn get_index(&self, key: &str, from: &str, to: &str) -> Result<usize, NavigationError> {
        let (from_pos, to_pos) = self.upward(from, to)?;
        let store = self.level_store(from)?;
        if from_pos == to_pos {
            return store.index_of(key).ok_or_else(|| NavigationError::UnknownKey {
                level: from.to_string(),
                key: key.to_string(),
            });
        }

        let field = idx_field(to);
        self.record(from, key)?
            .get_usize(&field)
            .ok_or_else(|| NavigationError::MissingLink {
                level: from.to_string(),
                key: key.to_string(),
                field,
            })
    }

    /// Key, at level `to`, of the record that contains `key`.
    pub fn get_key(&self, key: &str, from: &str, to: &str) -> Result<&str, NavigationError> {
        let (from_pos, to_pos) = self.upward(from, to)?;
        let store = self.level_store(from)?;
        if from_pos == to_pos {
            return store
                .index_of(key)
                .and_then(|idx| store.key_at(idx))
                .ok_or_else(|| NavigationError::UnknownKey {
                    level: from.to_string(),
                    key: key.to_string(),
                });
        }

        let field = key_field(to);
        self.record(from, key)?
            .get(&field)
            .ok_or_else(|| NavigationError::MissingLink {
                level: from.to_string(),
                key: key.to_string(),
                field,
            })
    }

    /// Dense indexes of every descendant of `key` at the finer level `to`,
    /// in creation order.
    pub fn get_indexes(
        &self,
        key: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<usize>, NavigationError> {
        let (from_pos, to_pos) = self.downward(from, to)?;
        self.record(from, key)?;

        let mut out = Vec::new();
        let target = self.level_store(to)?;
        self.descend(key, from_pos, to_pos, &mut |child| {
            if let Some(idx) = target.index_of(child) {
                out.push(idx);
            }
        });
        Ok(out)
    }

    /// Keys of every descendant of `key` at the finer level `to`, in
    /// creation order.
    pub fn get_keys(&self, key: &str, from: &str, to: &str) -> Result<Vec<&str>, NavigationError> {
        let (from_pos, to_pos) = self.downward(from, to)?;
        self.record(from, key)?;

        let mut out = Vec::new();
        self.descend(key, from_pos, to_pos, &mut |child| out.push(child));
        Ok(out)
    }

    fn descend<'a>(&'a self, key: &str, pos: usize, to_pos: usize, visit: &mut dyn FnMut(&'a str)) {
        let Some(store) = self.level_store_at(pos) else {
            return;
        };
        for child in store.children_of(key) {
            if pos - 1 == to_pos {
                visit(child.as_str());
            } else {
                self.descend(child, pos - 1, to_pos, visit);
            }
        }
    }

    /// Immediate children of `key` at `level` (keys one level finer).
    pub fn children(&self, level: &str, key: &str) -> Result<&[String], NavigationError> {
        let store = self.level_store(level)?;
        if !store.contains(key) {
            return Err(NavigationError::UnknownKey {
                level: level.to_string(),
                key: key.to_string(),
            });
        }
        Ok(store.children_of(key))
    }

    /// Name of the level directly finer than `level`, if any.
    pub fn child_level(&self, level: &str) -> Result<Option<&str>, NavigationError> {
        let pos = self.position_of(level)?;
        Ok(pos.checked_sub(1).and_then(|p| self.chain().name(p)))
    }

    /// Name of the level directly coarser than `level`, if any.
    pub fn parent_level(&self, level: &str) -> Result<Option<&str>, NavigationError> {
        let pos = self.position_of(level)?;
        Ok(self.chain().name(pos + 1))
    }
}
