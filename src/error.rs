//! Umbrella error for processing one input file.

use std::fmt;
use std::path::PathBuf;

use crate::plugin::PluginError;
use crate::runtime::config_loader::ConfigError;
use crate::runtime::context::GranularityError;
use crate::runtime::navigator::NavigationError;
use crate::runtime::reader::ReaderError;
use crate::schema::SchemaError;
use crate::serialization::SerializationError;
use crate::transform_registry::TransformError;

#[derive(Debug)]
pub enum EngineError {
    Config(ConfigError),
    Schema(SchemaError),
    Plugin(PluginError),
    Granularity(GranularityError),
    /// A transform failed while populating one field.
    Transform {
        level: String,
        key: String,
        field: String,
        transform: String,
        source: TransformError,
    },
    /// A key generator failed on one raw record.
    KeyGen {
        level: String,
        raw_index: usize,
        source: TransformError,
    },
    Navigation(NavigationError),
    Reader(ReaderError),
    Serialization(SerializationError),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A worker panicked (typically inside plugin code).
    Panic(String),
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(e) => write!(f, "Configuration error: {}", e),
            EngineError::Schema(e) => write!(f, "Schema error: {}", e),
            EngineError::Plugin(e) => write!(f, "Plugin error: {}", e),
            EngineError::Granularity(e) => write!(f, "Granularity error: {}", e),
            EngineError::Transform {
                level,
                key,
                field,
                transform,
                source,
            } => write!(
                f,
                "Transform '{}' failed on field '{}' of record '{}' at level '{}': {}",
                transform, field, key, level, source
            ),
            EngineError::KeyGen {
                level,
                raw_index,
                source,
            } => write!(
                f,
                "Key generation for level '{}' failed on raw record {}: {}",
                level, raw_index, source
            ),
            EngineError::Navigation(e) => write!(f, "Navigation error: {}", e),
            EngineError::Reader(e) => write!(f, "Reader error: {}", e),
            EngineError::Serialization(e) => write!(f, "Output error: {}", e),
            EngineError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            EngineError::Panic(msg) => write!(f, "Worker panicked: {}", msg),
            EngineError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Config(e) => Some(e),
            EngineError::Schema(e) => Some(e),
            EngineError::Plugin(e) => Some(e),
            EngineError::Granularity(e) => Some(e),
            EngineError::Transform { source, .. } => Some(source),
            EngineError::KeyGen { source, .. } => Some(source),
            EngineError::Navigation(e) => Some(e),
            EngineError::Reader(e) => Some(e),
            EngineError::Serialization(e) => Some(e),
            EngineError::Io { source, .. } => Some(source),
            EngineError::Panic(_) | EngineError::Cancelled => None,
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}

impl From<SchemaError> for EngineError {
    fn from(e: SchemaError) -> Self {
        EngineError::Schema(e)
    }
}

impl From<PluginError> for EngineError {
    fn from(e: PluginError) -> Self {
        EngineError::Plugin(e)
    }
}

impl From<GranularityError> for EngineError {
    fn from(e: GranularityError) -> Self {
        EngineError::Granularity(e)
    }
}

impl From<NavigationError> for EngineError {
    fn from(e: NavigationError) -> Self {
        EngineError::Navigation(e)
    }
}

impl From<ReaderError> for EngineError {
    fn from(e: ReaderError) -> Self {
        match e {
            ReaderError::Cancelled => EngineError::Cancelled,
            other => EngineError::Reader(other),
        }
    }
}

impl From<SerializationError> for EngineError {
    fn from(e: SerializationError) -> Self {
        EngineError::Serialization(e)
    }
}
