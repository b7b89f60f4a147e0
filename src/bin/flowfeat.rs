//! flowfeat CLI - hierarchical feature extraction for packet traces
//!
//! Runs the dissector over every capture file of the input, groups packets
//! into the configured granularity levels and writes one feature table per
//! level.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use flowfeat::runtime::{discover_inputs, ConfigOverrides, Dispatcher};
use flowfeat::{CancelToken, Engine, OutputFormat, RunConfig, TransformRegistry};

#[derive(Parser)]
#[command(name = "flowfeat")]
#[command(version, about = "Hierarchical feature extraction for packet traces", long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "debug" or "flowfeat=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the run configuration (YAML or JSON)
    #[arg(short, long, default_value = "flowfeat.yaml")]
    config: PathBuf,

    /// Input capture file or directory
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output type (csv, ndjson)
    #[arg(short = 't', long)]
    output_type: Option<OutputFormat>,

    /// Plugin module or directory of modules (repeatable)
    #[arg(short, long = "plugin")]
    plugins: Vec<PathBuf>,

    /// Maximum number of concurrent workers (0 = available parallelism)
    #[arg(short = 'j', long)]
    max_concurrency: Option<usize>,
}

impl ConfigArgs {
    fn load(self) -> Result<RunConfig, String> {
        let mut config = RunConfig::load_from_file(&self.config).map_err(|e| e.to_string())?;
        config.apply_overrides(ConfigOverrides {
            input_path: self.input,
            output_path: self.output,
            output_type: self.output_type,
            plugins: self.plugins,
            max_concurrency: self.max_concurrency,
        });
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Process every capture file of the input
    Run {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Load configuration, schema and plugins, then report without processing
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the output schema of one or all levels
    Schema {
        #[command(flatten)]
        config: ConfigArgs,

        /// Level to print (default: every level)
        #[arg(short, long)]
        level: Option<String>,
    },

    /// List registered key generators and transforms
    Plugins {
        /// Plugin module or directory of modules (repeatable)
        #[arg(short, long = "plugin")]
        plugins: Vec<PathBuf>,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    // Stdout is reserved for mirrored level output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let result = match cli.command {
        Commands::Run { config } => run(config),
        Commands::Validate { config } => validate(config),
        Commands::Schema { config, level } => print_schema(config, level),
        Commands::Plugins { plugins } => list_plugins(plugins),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Process the batch; returns the batch exit code
fn run(args: ConfigArgs) -> Result<i32, String> {
    let config = args.load()?;
    let workers = config.effective_concurrency();
    let engine = Arc::new(Engine::from_config(config).map_err(|e| e.to_string())?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(workers.max(1))
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;

    let report = runtime.block_on(async move {
        let cancel = CancelToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; stopping workers");
                on_signal.cancel();
            }
        });

        Dispatcher::new(engine, cancel).run().await
    });
    let report = report.map_err(|e| e.to_string())?;

    for failure in &report.failed {
        eprintln!("  ✗ {}: {}", failure.path.display(), failure.reason);
    }
    println!(
        "✓ {} files processed, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    Ok(report.exit_code())
}

fn validate(args: ConfigArgs) -> Result<i32, String> {
    let config = args.load()?;
    let engine = Engine::from_config(config).map_err(|e| e.to_string())?;
    let config = engine.config();

    println!("✓ Granularities: {}", engine.chain());
    for level in engine.chain().levels() {
        let fields = engine.schema().level(level).map_err(|e| e.to_string())?.len();
        let key_gen = config.key_generators.get(level).map(|s| s.as_str()).unwrap_or("");
        println!("  {} ({} fields, key {})", level, fields, key_gen);
    }
    println!("✓ {} input fields", engine.input_schema().len());
    println!(
        "✓ {} functions registered, {} plugin modules",
        engine.registry().count(),
        engine.registry().library_count()
    );

    let inputs = discover_inputs(&config.input_path, &config.extensions, config.sort_by_filesize)
        .map_err(|e| e.to_string())?;
    println!("✓ {} input files under {}", inputs.len(), config.input_path.display());
    Ok(0)
}

fn print_schema(args: ConfigArgs, level: Option<String>) -> Result<i32, String> {
    let config = args.load()?;
    let engine = Engine::from_config(config).map_err(|e| e.to_string())?;

    let levels: Vec<String> = match level {
        Some(level) => vec![level],
        None => engine.chain().levels().to_vec(),
    };
    for level in levels {
        let text = engine.schema().describe(&level).map_err(|e| e.to_string())?;
        println!("{}", text);
    }
    Ok(0)
}

fn list_plugins(plugins: Vec<PathBuf>) -> Result<i32, String> {
    let mut registry = TransformRegistry::with_builtins().map_err(|e| e.to_string())?;
    // SAFETY: modules are trusted code built against this crate version.
    unsafe { registry.load_modules(&plugins) }.map_err(|e| e.to_string())?;

    println!("Key generators:");
    for name in registry.key_gen_names() {
        println!("  {} ({})", name, registry.module_of(name).unwrap_or(""));
    }
    println!("Transforms:");
    for name in registry.transform_names() {
        println!("  {} ({})", name, registry.module_of(name).unwrap_or(""));
    }
    Ok(0)
}
