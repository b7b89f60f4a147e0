//! Transform registry for plugin-provided functions.
//!
//! Two kinds of functions are registered by name:
//!
//! - **transforms** (prefix `P_`) populate one field of an aggregate record;
//! - **key generators** (prefix `genKey_`) derive a grouping key from a raw record.
//!
//! Functions are registered by plugin modules through [`PluginRegistrar`] (see
//! [`crate::plugin`]), resolved once by name, and then shared read-only by every
//! worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::plugin::{ModuleRegistrar, PluginError, BUILTIN_MODULE};
use crate::record::Record;
use crate::runtime::context::DispatchContext;
use crate::runtime::navigator::NavigationError;

/// Name prefix of transform functions.
pub const TRANSFORM_PREFIX: &str = "P_";

/// Name prefix of key generator functions.
pub const KEY_GEN_PREFIX: &str = "genKey_";

/// Error type for transform and key generator operations
#[derive(Debug, Clone)]
pub enum TransformError {
    NotFound(String),
    InvalidArgs(String),
    /// A field required by the function is absent from its input record.
    MissingField(String),
    Navigation(NavigationError),
    ExecutionError(String),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::NotFound(name) => write!(f, "Transform not found: {}", name),
            TransformError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            TransformError::MissingField(field) => {
                write!(f, "Required field '{}' is missing", field)
            }
            TransformError::Navigation(err) => write!(f, "Navigation error: {}", err),
            TransformError::ExecutionError(msg) => write!(f, "Execution error: {}", msg),
        }
    }
}

impl std::error::Error for TransformError {}

impl From<NavigationError> for TransformError {
    fn from(err: NavigationError) -> Self {
        TransformError::Navigation(err)
    }
}

/// Per-call arguments handed to a transform.
#[derive(Debug, Clone, Copy)]
pub struct TransformArgs<'a> {
    /// Option string configured for this chain step.
    pub option: &'a str,
    /// Granularity level of the record being populated.
    pub level: &'a str,
    /// Key of the record being populated.
    pub key: &'a str,
    /// Output field being populated.
    pub field: &'a str,
}

/// Trait for transformation functions
///
/// The record under transformation is detached from its level store while its
/// chain runs, so a transform reads and writes it through `record`. Every other
/// record (any level, raw packets) is reachable through `ctx`.
pub trait TransformFn: Send + Sync {
    fn apply(
        &self,
        ctx: &DispatchContext,
        args: &TransformArgs<'_>,
        record: &mut Record,
    ) -> Result<(), TransformError>;
}

/// Simple function-based implementation of TransformFn
impl<F> TransformFn for F
where
    F: Fn(&DispatchContext, &TransformArgs<'_>, &mut Record) -> Result<(), TransformError>
        + Send
        + Sync,
{
    fn apply(
        &self,
        ctx: &DispatchContext,
        args: &TransformArgs<'_>,
        record: &mut Record,
    ) -> Result<(), TransformError> {
        self(ctx, args, record)
    }
}

/// Inputs a key generator may depend on besides the raw record.
#[derive(Debug, Clone, Copy)]
pub struct KeyContext {
    /// Index of the file being processed; only used to build keys for
    /// packets that cannot be grouped normally.
    pub file_index: usize,
    /// When set, a missing required field aborts the file instead of being
    /// replaced by a sentinel.
    pub strict: bool,
}

impl KeyContext {
    /// Resolve a missing required field according to the strictness policy.
    pub fn missing(
        &self,
        field: &str,
        sentinel: impl Into<String>,
    ) -> Result<String, TransformError> {
        if self.strict {
            return Err(TransformError::MissingField(field.to_string()));
        }
        let sentinel = sentinel.into();
        tracing::debug!("Field '{}' missing; substituting '{}'", field, sentinel);
        Ok(sentinel)
    }
}

/// Trait for key generator functions
pub trait KeyGenFn: Send + Sync {
    fn generate(
        &self,
        ctx: &KeyContext,
        raw: &Record,
        level: &str,
    ) -> Result<String, TransformError>;
}

impl<F> KeyGenFn for F
where
    F: Fn(&KeyContext, &Record, &str) -> Result<String, TransformError> + Send + Sync,
{
    fn generate(
        &self,
        ctx: &KeyContext,
        raw: &Record,
        level: &str,
    ) -> Result<String, TransformError> {
        self(ctx, raw, level)
    }
}

/// Registration surface handed to a plugin module's entry point.
pub trait PluginRegistrar {
    fn register_transform(&mut self, name: &str, transform: Arc<dyn TransformFn>);
    fn register_key_gen(&mut self, name: &str, key_gen: Arc<dyn KeyGenFn>);
}

struct Registered<T: ?Sized> {
    handle: Arc<T>,
    module: String,
}

/// Registry for storing and resolving plugin functions
pub struct TransformRegistry {
    transforms: HashMap<String, Registered<dyn TransformFn>>,
    key_gens: HashMap<String, Registered<dyn KeyGenFn>>,
    // Must stay the last field: the handles above may live in these libraries.
    libraries: Vec<libloading::Library>,
}

impl TransformRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            transforms: HashMap::new(),
            key_gens: HashMap::new(),
            libraries: Vec::new(),
        }
    }

    /// Create a registry holding the built-in key generators and transforms.
    pub fn with_builtins() -> Result<Self, PluginError> {
        let mut registry = Self::new();
        let mut registrar = ModuleRegistrar::new(&mut registry, BUILTIN_MODULE);
        crate::builtin::register(&mut registrar);
        registrar.finish()?;
        Ok(registry)
    }

    /// Register a transformation function
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_transform("builtin", "P_upper", Arc::new(|_ctx, args, record| {
    ///     let value = record.get_or_empty(args.field).to_uppercase();
    ///     record.set(args.field, value);
    ///     Ok(())
    /// }))?;
    /// ```
    pub fn register_transform(
        &mut self,
        module: &str,
        name: &str,
        transform: Arc<dyn TransformFn>,
    ) -> Result<(), PluginError> {
        if !name.starts_with(TRANSFORM_PREFIX) {
            return Err(PluginError::InvalidName {
                name: name.to_string(),
                expected_prefix: TRANSFORM_PREFIX,
            });
        }
        if let Some(existing) = self.transforms.get(name) {
            return Err(PluginError::Duplicate {
                name: name.to_string(),
                first: existing.module.clone(),
                second: module.to_string(),
            });
        }
        self.transforms.insert(
            name.to_string(),
            Registered {
                handle: transform,
                module: module.to_string(),
            },
        );
        Ok(())
    }

    /// Register a key generator function
    pub fn register_key_gen(
        &mut self,
        module: &str,
        name: &str,
        key_gen: Arc<dyn KeyGenFn>,
    ) -> Result<(), PluginError> {
        if !name.starts_with(KEY_GEN_PREFIX) {
            return Err(PluginError::InvalidName {
                name: name.to_string(),
                expected_prefix: KEY_GEN_PREFIX,
            });
        }
        if let Some(existing) = self.key_gens.get(name) {
            return Err(PluginError::Duplicate {
                name: name.to_string(),
                first: existing.module.clone(),
                second: module.to_string(),
            });
        }
        self.key_gens.insert(
            name.to_string(),
            Registered {
                handle: key_gen,
                module: module.to_string(),
            },
        );
        Ok(())
    }

    /// Resolve a transform by name.
    pub fn resolve_transform(&self, name: &str) -> Result<Arc<dyn TransformFn>, TransformError> {
        self.transforms
            .get(name)
            .map(|r| Arc::clone(&r.handle))
            .ok_or_else(|| TransformError::NotFound(name.to_string()))
    }

    /// Resolve a key generator by name.
    pub fn resolve_key_gen(&self, name: &str) -> Result<Arc<dyn KeyGenFn>, TransformError> {
        self.key_gens
            .get(name)
            .map(|r| Arc::clone(&r.handle))
            .ok_or_else(|| TransformError::NotFound(name.to_string()))
    }

    /// Check that `name` is registered under the kind its prefix implies.
    pub fn validate(&self, name: &str) -> bool {
        if name.starts_with(TRANSFORM_PREFIX) {
            self.transforms.contains_key(name)
        } else if name.starts_with(KEY_GEN_PREFIX) {
            self.key_gens.contains_key(name)
        } else {
            false
        }
    }

    /// Check if a transform is registered
    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Check if a key generator is registered
    pub fn has_key_gen(&self, name: &str) -> bool {
        self.key_gens.contains_key(name)
    }

    /// Sorted names of all registered transforms
    pub fn transform_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Sorted names of all registered key generators
    pub fn key_gen_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.key_gens.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Module that registered `name`, if any.
    pub fn module_of(&self, name: &str) -> Option<&str> {
        self.transforms
            .get(name)
            .map(|r| r.module.as_str())
            .or_else(|| self.key_gens.get(name).map(|r| r.module.as_str()))
    }

    /// Total number of registered functions.
    pub fn count(&self) -> usize {
        self.transforms.len() + self.key_gens.len()
    }

    /// Number of native modules kept loaded.
    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    pub(crate) fn adopt_library(&mut self, library: libloading::Library) {
        self.libraries.push(library);
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
