//! Per-run engine.
//!
//! Holds everything shared read-only by the workers of one run: the
//! granularity chain, the schemas, the plugin registry and the resolved key
//! generator and transform handles. Processing one input file is
//! read → build → transform → write on a worker-owned [`DispatchContext`].

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::error::EngineError;
use crate::record::Record;
use crate::runtime::builder::{build_levels, KeyGenerators};
use crate::runtime::config_loader::{ConfigError, RunConfig};
use crate::runtime::context::{DispatchContext, GranularityChain};
use crate::runtime::dispatcher::{CancelToken, InputFile};
use crate::runtime::executor::TransformExecutor;
use crate::runtime::navigator::NavigationError;
use crate::runtime::reader::read_capture;
use crate::runtime::schema_loader::load_schema_dir;
use crate::schema::{InputSchema, SchemaRegistry};
use crate::serialization::{level_output_path, write_level};
use crate::transform_registry::TransformRegistry;

/// Outcome of one successfully processed input file.
#[derive(Debug, Clone)]
pub struct FileSummary {
    pub raw_records: usize,
    /// Records per level, in chain order.
    pub level_records: Vec<(String, usize)>,
    pub outputs: Vec<PathBuf>,
}

pub struct Engine {
    config: RunConfig,
    chain: Arc<GranularityChain>,
    input_schema: InputSchema,
    input_fields: Vec<String>,
    schema: SchemaRegistry,
    key_gens: KeyGenerators,
    executor: TransformExecutor,
    // Last: handles above may point into its libraries.
    registry: Arc<TransformRegistry>,
}

impl Engine {
    /// Assemble the engine for a run: validate the configuration, load the
    /// plugin modules and the schema directory, then resolve every name.
    pub fn from_config(config: RunConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let mut registry = TransformRegistry::with_builtins()?;
        // SAFETY: modules are trusted code built against this crate version.
        let loaded = unsafe { registry.load_modules(&config.plugins)? };
        tracing::info!(
            "{} functions registered ({} from {} plugin modules)",
            registry.count(),
            loaded,
            registry.library_count()
        );

        let chain = config.chain()?;
        let (input_schema, schema) =
            load_schema_dir(&config.schema_dir, &chain, config.chain_policy)?;
        Self::from_parts(config, input_schema, schema, registry)
    }

    /// Assemble the engine from already-built schemas and registry.
    pub fn from_parts(
        config: RunConfig,
        input_schema: InputSchema,
        schema: SchemaRegistry,
        registry: TransformRegistry,
    ) -> Result<Self, EngineError> {
        let chain = Arc::new(config.chain()?);
        schema.validate(&registry)?;

        let key_gens = KeyGenerators::resolve(&chain, &config.key_generators, &registry)
            .map_err(|e| {
                EngineError::Config(ConfigError::InvalidValue {
                    setting: "key_generators",
                    message: e.to_string(),
                })
            })?;
        let order = config.execution_order(&chain);
        let executor = TransformExecutor::new(&chain, &order, &schema, &registry)?;
        let input_fields = input_schema.fields().map(|f| f.to_string()).collect();

        Ok(Self {
            config,
            chain,
            input_schema,
            input_fields,
            schema,
            key_gens,
            executor,
            registry: Arc::new(registry),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn chain(&self) -> &GranularityChain {
        &self.chain
    }

    pub fn input_schema(&self) -> &InputSchema {
        &self.input_schema
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    /// A fresh context for one worker.
    pub fn new_context(&self) -> DispatchContext {
        DispatchContext::new(Arc::clone(&self.chain))
    }

    /// Build and transform every level from the raw records already in `ctx`.
    pub fn aggregate(
        &self,
        ctx: &mut DispatchContext,
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        build_levels(ctx, &self.key_gens, self.config.strict_keys, cancel)?;
        self.executor.run(ctx, cancel)
    }

    /// Run build and transform over records that did not come from the tool.
    pub fn process_records<I>(
        &self,
        ctx: &mut DispatchContext,
        file_index: usize,
        path: &Path,
        records: I,
        cancel: &CancelToken,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Record>,
    {
        ctx.begin_file(file_index, path);
        for record in records {
            ctx.push_raw(record);
        }
        self.aggregate(ctx, cancel)
    }

    /// Process one capture file: read, build, transform, write.
    ///
    /// Nothing is written unless every step before writing succeeded.
    pub fn process_file(
        &self,
        ctx: &mut DispatchContext,
        file_index: usize,
        input: &InputFile,
        cancel: &CancelToken,
    ) -> Result<FileSummary, EngineError> {
        let span =
            tracing::info_span!("file", index = file_index, path = %input.relative.display());
        let _guard = span.enter();

        ctx.begin_file(file_index, &input.absolute);
        let raw_records = read_capture(
            &self.config.tool,
            &self.input_fields,
            &input.absolute,
            self.config.early_stop_records,
            cancel,
            ctx,
        )?;

        self.aggregate(ctx, cancel)?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let outputs = self.write_outputs(ctx, &input.relative)?;

        let level_records: Vec<(String, usize)> = self
            .chain
            .levels()
            .iter()
            .enumerate()
            .map(|(pos, level)| {
                let count = ctx.level_store_at(pos).map(|s| s.len()).unwrap_or(0);
                (level.clone(), count)
            })
            .collect();

        if self.config.log_file_info {
            tracing::info!(
                "{}: {} packets, levels {:?}, {} bytes",
                input.relative.display(),
                raw_records,
                level_records,
                input.size
            );
        } else {
            tracing::debug!("{}: {} packets", input.relative.display(), raw_records);
        }

        Ok(FileSummary {
            raw_records,
            level_records,
            outputs,
        })
    }

    /// Write every level's store under the output directory.
    ///
    /// Each level is staged in a temporary file next to its destination and
    /// only moved into place once every level has been written, so a failure
    /// leaves no partial output for the file.
    ///
    /// # Returns
    ///
    /// Paths of the written files, in chain order
    pub fn write_outputs(
        &self,
        ctx: &DispatchContext,
        relative: &Path,
    ) -> Result<Vec<PathBuf>, EngineError> {
        let format = self.config.output_type;
        let mut staged = Vec::with_capacity(self.chain.len());

        for (pos, level) in self.chain.levels().iter().enumerate() {
            let fields = self.schema.level(level)?.field_ids();
            let store = ctx
                .level_store_at(pos)
                .ok_or_else(|| NavigationError::UnknownLevel(level.clone()))?;

            let path = level_output_path(&self.config.output_path, relative, level, format);
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(parent).map_err(|source| EngineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
            let mut temp = NamedTempFile::new_in(parent).map_err(|source| EngineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
            let count = write_level(format, &fields, store.records(), BufWriter::new(&mut temp))?;
            tracing::debug!("Staged {} {} records for {}", count, level, path.display());
            staged.push((temp, path));
        }

        let mut written: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (temp, path) in staged {
            if let Err(e) = temp.persist(&path) {
                for done in &written {
                    if let Err(remove) = fs::remove_file(done) {
                        tracing::warn!("Failed to remove {}: {}", done.display(), remove);
                    }
                }
                return Err(EngineError::Io {
                    path,
                    source: e.error,
                });
            }
            written.push(path);
        }

        for (pos, level) in self.chain.levels().iter().enumerate() {
            if !self.config.mirror_levels.iter().any(|m| m == level) {
                continue;
            }
            let fields = self.schema.level(level)?.field_ids();
            if let Some(store) = ctx.level_store_at(pos) {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                write_level(format, &fields, store.records(), &mut lock)?;
                lock.flush().map_err(|source| EngineError::Io {
                    path: PathBuf::from("<stdout>"),
                    source,
                })?;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChainPolicy;

    fn config(output: &Path) -> RunConfig {
        let mut config = RunConfig::from_yaml_str(
            r#"
schema_dir: unused
input_path: unused
granularities: pkt,flow
key_generators:
  pkt: genKey_pkt_default
  flow: genKey_protocol_default
"#,
        )
        .unwrap();
        config.output_path = output.to_path_buf();
        config
    }

    fn engine(output: &Path) -> Engine {
        let mut input = InputSchema::new();
        input.add_field(1, "_ws.col.protocol", "Protocol").unwrap();
        input.add_field(2, "frame.len", "Length").unwrap();

        let mut schema = SchemaRegistry::new();
        schema
            .add_field("pkt", "len", "", "P_cpy", "frame.len", ChainPolicy::Reject)
            .unwrap();
        schema
            .add_field("flow", "count", "", "P_childcount", "", ChainPolicy::Reject)
            .unwrap();
        schema
            .add_field("flow", "total", "", "P_childsum_ll", "len", ChainPolicy::Reject)
            .unwrap();

        let registry = TransformRegistry::with_builtins().unwrap();
        Engine::from_parts(config(output), input, schema, registry).unwrap()
    }

    fn packet(protocol: &str, len: &str) -> Record {
        [
            ("_ws.col.protocol".to_string(), protocol.to_string()),
            ("frame.len".to_string(), len.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_process_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ctx = engine.new_context();

        engine
            .process_records(
                &mut ctx,
                0,
                Path::new("a.pcap"),
                vec![packet("TCP", "60"), packet("UDP", "100"), packet("TCP", "40")],
                &CancelToken::new(),
            )
            .unwrap();

        let flows = ctx.level_store("flow").unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows.get("TCP").unwrap().get("count"), Some("2"));
        assert_eq!(flows.get("TCP").unwrap().get("total"), Some("100"));

        let written = engine.write_outputs(&ctx, Path::new("day1/a.pcap")).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1], dir.path().join("day1/a.flow.csv"));
        let flow_csv = fs::read_to_string(&written[1]).unwrap();
        assert_eq!(flow_csv, "count,total\n2,100\n1,100\n");
        let pkt_csv = fs::read_to_string(&written[0]).unwrap();
        assert_eq!(pkt_csv, "len\n60\n100\n40\n");
    }

    #[test]
    fn test_failed_level_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ctx = engine.new_context();
        engine
            .process_records(
                &mut ctx,
                0,
                Path::new("a.pcap"),
                vec![packet("TCP", "60")],
                &CancelToken::new(),
            )
            .unwrap();

        // A directory in the way of the flow table.
        fs::create_dir_all(dir.path().join("a.flow.csv")).unwrap();

        let result = engine.write_outputs(&ctx, Path::new("a.pcap"));
        assert!(matches!(result, Err(EngineError::Io { .. })));
        assert!(!dir.path().join("a.pkt.csv").exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("a.flow.csv")]);
    }

    #[test]
    fn test_unknown_key_generator_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config
            .key_generators
            .insert("flow".to_string(), "genKey_nope".to_string());

        let result = Engine::from_parts(
            config,
            InputSchema::new(),
            SchemaRegistry::new(),
            TransformRegistry::with_builtins().unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_transform_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("pkt", "len", "", "P_nope", "", ChainPolicy::Reject)
            .unwrap();
        schema.level_mut("flow");

        let result = Engine::from_parts(
            config(dir.path()),
            InputSchema::new(),
            schema,
            TransformRegistry::with_builtins().unwrap(),
        );
        assert!(matches!(result, Err(EngineError::Schema(_))));
    }
}
