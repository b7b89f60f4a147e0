//! # Flowfeat: Hierarchical Feature Extraction for Packet Traces
//!
//! Flowfeat turns the per-packet field output of a dissector into feature
//! tables at several configurable granularity levels (packet, flow, flow
//! set, ...), populating every output field through a chain of plugin
//! transforms.
//!
//! ## Features
//!
//! - **Granularity chain**: any number of levels, finest first, each grouped by a key generator
//! - **Transform registry**: plugin functions resolved by name, built-ins plus native modules
//! - **Cross-level navigation**: transforms read parent and child records through the context
//! - **Batch dispatch**: one worker per capture file with bounded concurrency and cancellation
//!
//! ## Example: run configuration
//!
//! ```yaml
//! schema_dir: schema/
//! input_path: captures/
//! output_path: features/
//! granularities: pkt,flow
//! key_generators:
//!   pkt: genKey_pkt_default
//!   flow: genKey_flow_default
//! ```
//!
//! ## Example: flow level schema (`output_flow.csv`)
//!
//! ```text
//! field,name,preprocess_fns,options
//! pkts,Packets,P_childcount,
//! bytes,Bytes,P_childsum_ll,frame.len
//! ```

// Core modules
pub mod builtin;
pub mod error;
pub mod plugin;
pub mod record;
pub mod schema;
pub mod serialization;
pub mod transform_registry;

// Per-run and per-worker runtime
pub mod runtime;

// Re-export key types
pub use error::EngineError;
pub use plugin::{PluginDeclaration, PluginError, PLUGIN_ABI_VERSION};
pub use record::Record;
pub use schema::{ChainPolicy, InputSchema, LevelSchema, SchemaError, SchemaRegistry};
pub use serialization::{OutputFormat, SerializationError};
pub use transform_registry::{
    KeyContext, KeyGenFn, PluginRegistrar, TransformArgs, TransformError, TransformFn,
    TransformRegistry,
};

// Re-export runtime types
pub use runtime::{
    BatchReport, CancelToken, DispatchContext, Dispatcher, Engine, GranularityChain,
    NavigationError, RunConfig,
};
