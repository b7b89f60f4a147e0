//! Per-run and per-worker runtime.
//!
//! This module provides the granularity-level infrastructure: the dispatch
//! context and navigator, the key/record builder, the transform executor,
//! the reader and schema loader, and the batch dispatcher.

pub mod builder;
pub mod config_loader;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod navigator;
pub mod reader;
pub mod schema_loader;

// Re-export key types
pub use builder::{build_levels, KeyGenerators};
pub use config_loader::{ConfigError, ConfigOverrides, RunConfig, ToolConfig};
pub use context::{DispatchContext, GranularityChain, GranularityError, LevelStore};
pub use dispatcher::{
    discover_inputs, prepare_output_dir, BatchReport, CancelToken, Dispatcher, InputFile,
};
pub use engine::{Engine, FileSummary};
pub use executor::TransformExecutor;
pub use navigator::NavigationError;
pub use reader::{read_capture, ReaderError};
pub use schema_loader::load_schema_dir;
