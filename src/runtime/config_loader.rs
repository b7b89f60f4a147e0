//! Run configuration loader.
//!
//! Loads the run configuration from YAML (JSON is accepted as a YAML subset),
//! applies command-line overrides and validates the result before any input
//! file is touched.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::runtime::context::{GranularityChain, GranularityError};
use crate::schema::ChainPolicy;
use crate::serialization::OutputFormat;

/// Error type for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        message: String,
    },
    /// A required setting is missing or empty.
    Missing(&'static str),
    /// An input/output path resolves to the current working directory.
    CurrentDirectory {
        setting: &'static str,
        path: PathBuf,
    },
    Granularity(GranularityError),
    MissingKeyGenerator(String),
    TransformOrder(String),
    InvalidValue {
        setting: &'static str,
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "Failed to parse config file {}: {}", path.display(), message)
            }
            ConfigError::Missing(setting) => write!(f, "Config missing '{}'", setting),
            ConfigError::CurrentDirectory { setting, path } => write!(
                f,
                "'{}' ({}) must not be the current directory",
                setting,
                path.display()
            ),
            ConfigError::Granularity(e) => write!(f, "Invalid 'granularities': {}", e),
            ConfigError::MissingKeyGenerator(level) => {
                write!(f, "No key generator configured for level '{}'", level)
            }
            ConfigError::TransformOrder(msg) => write!(f, "Invalid 'transform_order': {}", msg),
            ConfigError::InvalidValue { setting, message } => {
                write!(f, "Invalid '{}': {}", setting, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Granularity(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GranularityError> for ConfigError {
    fn from(err: GranularityError) -> Self {
        ConfigError::Granularity(err)
    }
}

/// Dissector subprocess settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub path: PathBuf,
    /// Extra arguments, split on whitespace.
    pub options: String,
    /// Passed as `-Y` when non-empty.
    pub display_filter: String,
    /// Stderr destination; inherited when unset.
    pub error_log: Option<PathBuf>,
    pub number_error_logs: bool,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tshark"),
            options: "-n".to_string(),
            display_filter: String::new(),
            error_log: None,
            number_error_logs: true,
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec![".pcap".to_string(), ".pcapng".to_string()]
}

fn default_true() -> bool {
    true
}

/// Run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub schema_dir: PathBuf,
    #[serde(default)]
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: PathBuf,
    #[serde(default)]
    pub output_type: OutputFormat,
    /// Native modules, or directories of them.
    #[serde(default)]
    pub plugins: Vec<PathBuf>,

    /// Comma-delimited level names, finest first.
    #[serde(default)]
    pub granularities: String,
    /// Level name -> key generator name
    #[serde(default)]
    pub key_generators: HashMap<String, String>,
    /// Level execution order; chain order when unset.
    #[serde(default)]
    pub transform_order: Option<Vec<String>>,

    #[serde(default)]
    pub tool: ToolConfig,

    #[serde(default = "default_true")]
    pub parallel: bool,
    /// 0 = available parallelism
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub early_stop_records: Option<usize>,
    #[serde(default)]
    pub strict_keys: bool,
    #[serde(default)]
    pub chain_policy: ChainPolicy,

    #[serde(default = "default_true")]
    pub sort_by_filesize: bool,
    #[serde(default)]
    pub force_remove: bool,
    #[serde(default)]
    pub log_file_info: bool,
    /// Levels also written to stdout.
    #[serde(default)]
    pub mirror_levels: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            schema_dir: PathBuf::new(),
            input_path: PathBuf::new(),
            output_path: PathBuf::new(),
            output_type: OutputFormat::default(),
            plugins: Vec::new(),
            granularities: String::new(),
            key_generators: HashMap::new(),
            transform_order: None,
            tool: ToolConfig::default(),
            parallel: true,
            max_concurrency: 0,
            early_stop_records: None,
            strict_keys: false,
            chain_policy: ChainPolicy::default(),
            sort_by_filesize: true,
            force_remove: false,
            log_file_info: false,
            mirror_levels: Vec::new(),
            extensions: default_extensions(),
        }
    }
}

/// Settings given on the command line; each one replaces its config value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub output_type: Option<OutputFormat>,
    /// Appended to the configured modules.
    pub plugins: Vec<PathBuf>,
    pub max_concurrency: Option<usize>,
}

impl RunConfig {
    /// Load run configuration from a YAML or JSON file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if the file can't be read or has invalid format
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse run configuration from YAML text.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(input) = overrides.input_path {
            self.input_path = input;
        }
        if let Some(output) = overrides.output_path {
            self.output_path = output;
        }
        if let Some(format) = overrides.output_type {
            self.output_type = format;
        }
        self.plugins.extend(overrides.plugins);
        if let Some(n) = overrides.max_concurrency {
            self.max_concurrency = n;
        }
    }

    /// Parse the configured granularity chain.
    pub fn chain(&self) -> Result<GranularityChain, ConfigError> {
        if self.granularities.trim().is_empty() {
            return Err(ConfigError::Missing("granularities"));
        }
        Ok(GranularityChain::parse(&self.granularities)?)
    }

    /// Level execution order: `transform_order`, or the chain itself.
    pub fn execution_order(&self, chain: &GranularityChain) -> Vec<String> {
        self.transform_order
            .clone()
            .unwrap_or_else(|| chain.levels().to_vec())
    }

    /// Number of concurrent workers; 0 means available parallelism.
    pub fn effective_concurrency(&self) -> usize {
        if !self.parallel {
            return 1;
        }
        if self.max_concurrency > 0 {
            return self.max_concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Check settings that don't need the schema or plugins.
    ///
    /// Name resolution of key generators and transforms happens when the
    /// engine is assembled.
    pub fn validate(&self) -> Result<GranularityChain, ConfigError> {
        if self.schema_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("schema_dir"));
        }
        if self.input_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("input_path"));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("output_path"));
        }
        reject_current_dir("input_path", &self.input_path)?;
        reject_current_dir("output_path", &self.output_path)?;

        if self.extensions.is_empty() {
            return Err(ConfigError::Missing("extensions"));
        }

        let chain = self.chain()?;
        for level in chain.levels() {
            match self.key_generators.get(level) {
                Some(name) if !name.trim().is_empty() => {}
                _ => return Err(ConfigError::MissingKeyGenerator(level.clone())),
            }
        }

        if let Some(order) = &self.transform_order {
            validate_order(&chain, order)?;
        }

        for level in &self.mirror_levels {
            if !chain.contains(level) {
                return Err(ConfigError::InvalidValue {
                    setting: "mirror_levels",
                    message: format!("unknown level '{}'", level),
                });
            }
        }

        if self.early_stop_records == Some(0) {
            return Err(ConfigError::InvalidValue {
                setting: "early_stop_records",
                message: "must be positive when set".to_string(),
            });
        }

        Ok(chain)
    }
}

fn reject_current_dir(setting: &'static str, path: &Path) -> Result<(), ConfigError> {
    let same = match (path.canonicalize(), std::env::current_dir()) {
        (Ok(resolved), Ok(cwd)) => resolved == cwd,
        _ => path == Path::new(".") || path == Path::new("./"),
    };
    if same {
        return Err(ConfigError::CurrentDirectory {
            setting,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// `order` must name every chain level exactly once.
fn validate_order(chain: &GranularityChain, order: &[String]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for level in order {
        if !chain.contains(level) {
            return Err(ConfigError::TransformOrder(format!("unknown level '{}'", level)));
        }
        if !seen.insert(level.as_str()) {
            return Err(ConfigError::TransformOrder(format!("level '{}' listed twice", level)));
        }
    }
    if seen.len() != chain.len() {
        let missing: Vec<&str> = chain
            .levels()
            .iter()
            .map(|l| l.as_str())
            .filter(|l| !seen.contains(l))
            .collect();
        return Err(ConfigError::TransformOrder(format!(
            "missing levels {:?}",
            missing
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
schema_dir: /etc/flowfeat/schema
input_path: /data/captures
output_path: /data/features
output_type: ndjson
granularities: "pkt, flow"
key_generators:
  pkt: genKey_pkt_default
  flow: genKey_flow_default
tool:
  path: /usr/bin/tshark
  display_filter: "ip or ipv6"
early_stop_records: 1000
chain_policy: reconcile
"#;

    #[test]
    fn test_parse_config() {
        let config = RunConfig::from_yaml_str(CONFIG).unwrap();

        assert_eq!(config.output_type, OutputFormat::Ndjson);
        assert_eq!(config.chain_policy, ChainPolicy::Reconcile);
        assert_eq!(config.tool.path, PathBuf::from("/usr/bin/tshark"));
        assert_eq!(config.tool.options, "-n");
        assert!(config.tool.number_error_logs);
        assert_eq!(config.early_stop_records, Some(1000));
        assert!(config.parallel);
        assert_eq!(config.extensions, vec![".pcap", ".pcapng"]);

        let chain = config.validate().unwrap();
        assert_eq!(chain.levels(), &["pkt".to_string(), "flow".to_string()]);
        assert_eq!(config.execution_order(&chain), vec!["pkt", "flow"]);
    }

    #[test]
    fn test_json_config() {
        let config = RunConfig::from_yaml_str(
            r#"{"schema_dir": "s", "input_path": "in", "output_path": "out",
                "granularities": "pkt", "key_generators": {"pkt": "genKey_pkt_default"}}"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_key_generator() {
        let mut config = RunConfig::from_yaml_str(CONFIG).unwrap();
        config.key_generators.remove("flow");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKeyGenerator(level)) if level == "flow"
        ));
    }

    #[test]
    fn test_output_must_not_be_current_dir() {
        let mut config = RunConfig::from_yaml_str(CONFIG).unwrap();
        config.output_path = PathBuf::from(".");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CurrentDirectory { setting: "output_path", .. })
        ));
    }

    #[test]
    fn test_transform_order_must_cover_chain() {
        let mut config = RunConfig::from_yaml_str(CONFIG).unwrap();
        config.transform_order = Some(vec!["flow".to_string()]);
        assert!(matches!(config.validate(), Err(ConfigError::TransformOrder(_))));

        config.transform_order = Some(vec!["flow".to_string(), "flow".to_string()]);
        assert!(matches!(config.validate(), Err(ConfigError::TransformOrder(_))));

        config.transform_order = Some(vec!["flow".to_string(), "pkt".to_string()]);
        let chain = config.validate().unwrap();
        assert_eq!(config.execution_order(&chain), vec!["flow", "pkt"]);
    }

    #[test]
    fn test_empty_granularities() {
        let mut config = RunConfig::from_yaml_str(CONFIG).unwrap();
        config.granularities = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("granularities"))));

        config.granularities = "pkt,,flow".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Granularity(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = RunConfig::from_yaml_str(CONFIG).unwrap();
        config.apply_overrides(ConfigOverrides {
            output_path: Some(PathBuf::from("/tmp/out")),
            output_type: Some(OutputFormat::Csv),
            plugins: vec![PathBuf::from("/opt/plugins")],
            max_concurrency: Some(3),
            ..ConfigOverrides::default()
        });

        assert_eq!(config.input_path, PathBuf::from("/data/captures"));
        assert_eq!(config.output_path, PathBuf::from("/tmp/out"));
        assert_eq!(config.output_type, OutputFormat::Csv);
        assert_eq!(config.plugins, vec![PathBuf::from("/opt/plugins")]);
        assert_eq!(config.effective_concurrency(), 3);

        config.parallel = false;
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, CONFIG).unwrap();
        assert!(RunConfig::load_from_file(&path).is_ok());

        fs::write(&path, "granularities: [").unwrap();
        match RunConfig::load_from_file(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
