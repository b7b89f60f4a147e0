//! Key/record builder.
//!
//! Derives a key per level for every raw record and creates or reuses the
//! aggregate record for that key, linking it to its parent and stamping the
//! cross-level key/index fields the navigator relies on.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::record::{idx_field, key_field, Record};
use crate::runtime::context::{DispatchContext, GranularityChain};
use crate::runtime::dispatcher::CancelToken;
use crate::transform_registry::{KeyContext, KeyGenFn, TransformError, TransformRegistry};

/// Raw records processed between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// Key generator handle for every level, indexed by chain position.
#[derive(Clone)]
pub struct KeyGenerators {
    handles: Vec<Arc<dyn KeyGenFn>>,
    names: Vec<String>,
}

impl KeyGenerators {
    /// Resolve the configured key generator of every level.
    ///
    /// # Arguments
    ///
    /// * `chain` - Granularity chain
    /// * `names` - Level name → key generator name
    /// * `registry` - Registry to resolve from
    pub fn resolve(
        chain: &GranularityChain,
        names: &HashMap<String, String>,
        registry: &TransformRegistry,
    ) -> Result<Self, TransformError> {
        let mut handles = Vec::with_capacity(chain.len());
        let mut resolved = Vec::with_capacity(chain.len());
        for level in chain.levels() {
            let name = names.get(level).ok_or_else(|| {
                TransformError::InvalidArgs(format!(
                    "no key generator configured for level '{}'",
                    level
                ))
            })?;
            handles.push(registry.resolve_key_gen(name)?);
            resolved.push(name.clone());
        }
        Ok(Self {
            handles,
            names: resolved,
        })
    }

    pub fn name(&self, position: usize) -> Option<&str> {
        self.names.get(position).map(|s| s.as_str())
    }
}

/// Build every level's store from the raw records already in `ctx`.
///
/// Levels are visited coarsest to finest for each raw record, so coarser
/// keys and indexes are known when a finer record is created.
pub fn build_levels(
    ctx: &mut DispatchContext,
    key_gens: &KeyGenerators,
    strict: bool,
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let chain: Vec<String> = ctx.chain().levels().to_vec();
    let n = chain.len();
    let key_ctx = KeyContext {
        file_index: ctx.file_index(),
        strict,
    };

    let mut keys = vec![String::new(); n];
    let mut idxs = vec![0usize; n];

    for raw_index in 0..ctx.raw_len() {
        if raw_index % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        for pos in (0..n).rev() {
            let level = chain[pos].as_str();
            let key = match ctx.raw(raw_index) {
                Some(raw) => key_gens.handles[pos]
                    .generate(&key_ctx, raw, level)
                    .map_err(|source| EngineError::KeyGen {
                        level: level.to_string(),
                        raw_index,
                        source,
                    })?,
                None => break,
            };

            if let Some(raw) = ctx.raw_mut(raw_index) {
                raw.set(key_field(level), key.clone());
            }

            let existing = ctx.level_store_at(pos).and_then(|s| s.index_of(&key));
            let idx = match existing {
                Some(idx) => idx,
                None => {
                    let idx = create_record(ctx, &chain, pos, raw_index, &key, &keys, &idxs);
                    tracing::trace!("New {} record '{}' at index {}", level, key, idx);
                    idx
                }
            };

            keys[pos] = key;
            idxs[pos] = idx;
        }
    }

    for (pos, level) in chain.iter().enumerate() {
        let count = ctx.level_store_at(pos).map(|s| s.len()).unwrap_or(0);
        tracing::debug!("Level '{}': {} records", level, count);
    }
    Ok(())
}

/// Create the record for a new key at `pos` and link it into the coarser
/// levels, whose keys and indexes for this raw record are in `keys`/`idxs`.
fn create_record(
    ctx: &mut DispatchContext,
    chain: &[String],
    pos: usize,
    raw_index: usize,
    key: &str,
    keys: &[String],
    idxs: &[usize],
) -> usize {
    let level = chain[pos].as_str();
    let Some(store) = ctx.level_store_at_mut(pos) else {
        return 0;
    };
    let idx = store.len();

    let mut record = Record::with_in_idx(raw_index);
    record.set(key_field(level), key);
    record.set(idx_field(level), idx.to_string());
    for j in pos + 1..chain.len() {
        record.set(key_field(&chain[j]), keys[j].as_str());
        record.set(idx_field(&chain[j]), idxs[j].to_string());
    }
    store.insert_new(key.to_string(), record);

    for j in pos + 1..chain.len() {
        if let Some(parent) = ctx
            .level_store_at_mut(j)
            .and_then(|s| s.get_mut(&keys[j]))
        {
            parent.set(key_field(level), key);
            parent.set(idx_field(level), idx.to_string());
        }
    }

    if pos + 1 < chain.len() {
        if let Some(parent_store) = ctx.level_store_at_mut(pos + 1) {
            parent_store.push_child(&keys[pos + 1], key.to_string());
        }
    }
    idx
}
