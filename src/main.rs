//! RuleFlow CLI Entry Point
//!
//! Provides command-line interface for pipeline execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a pipeline locally
//! ruleflow pipeline.yaml --resources resources.yaml
//!
//! # Submit tasks to a batch cluster
//! ruleflow pipeline.yaml --resources resources.yaml --cluster
//!
//! # Set maximum parallel tasks
//! ruleflow pipeline.yaml --resources resources.yaml --parallel 8
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use ruleflow::config::ResourceConfig;
use ruleflow::execution::{Backend, ClusterBackend, ClusterCommands, Engine, LocalBackend};
use ruleflow::workflow::{Pipeline, TaskGraph};
use ruleflow::{APP_NAME, VERSION};

/// Default pipeline file used when none is specified.
const DEFAULT_PIPELINE: &str = "pipeline.yaml";

/// Default resource configuration file.
const DEFAULT_RESOURCES: &str = "resources.yaml";

/// Default maximum parallel tasks.
const DEFAULT_PARALLEL: usize = 4;

/// Where jobs are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    Local,
    Cluster,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    pipeline_path: String,
    resources_path: String,
    backend: BackendKind,
    working_dir: Option<PathBuf>,
    report_path: Option<PathBuf>,
    parallel: usize,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline_path: DEFAULT_PIPELINE.to_string(),
            resources_path: DEFAULT_RESOURCES.to_string(),
            backend: BackendKind::Local,
            working_dir: None,
            report_path: None,
            parallel: DEFAULT_PARALLEL,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Declarative Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: ruleflow [OPTIONS] <PIPELINE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!();
    println!("Options:");
    println!("  --resources PATH    Resource profile YAML (default: {})", DEFAULT_RESOURCES);
    println!("  --local             Run tasks as local subprocesses (default)");
    println!("  --cluster           Submit tasks to the batch scheduler");
    println!("  --working-dir PATH  Set working directory for file operations");
    println!("  --report PATH       Write the run report as JSON");
    println!("  --parallel N        Maximum parallel tasks (default: {})", DEFAULT_PARALLEL);
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  ruleflow pipeline.yaml");
    println!("  ruleflow pipeline.yaml --resources cluster.yaml --cluster");
    println!("  ruleflow pipeline.yaml --working-dir /data/analysis --parallel 8");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--local" => {
                config.backend = BackendKind::Local;
            }
            "--cluster" => {
                config.backend = BackendKind::Cluster;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--resources" => {
                i += 1;
                if i >= args.len() {
                    return Err("--resources requires a path argument".to_string());
                }
                config.resources_path = args[i].clone();
            }
            "--working-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--working-dir requires a path argument".to_string());
                }
                config.working_dir = Some(PathBuf::from(&args[i]));
            }
            "--report" => {
                i += 1;
                if i >= args.len() {
                    return Err("--report requires a path argument".to_string());
                }
                config.report_path = Some(PathBuf::from(&args[i]));
            }
            "--parallel" => {
                i += 1;
                if i >= args.len() {
                    return Err("--parallel requires a number argument".to_string());
                }
                config.parallel = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", args[i]))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.pipeline_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Validates and sets up the working directory.
fn setup_working_directory(
    working_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        let current = env::current_dir()?;
        info!("Working directory: {}", current.display());
        return Ok(());
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    // Change to working directory for relative path resolution
    env::set_current_dir(&dir)?;
    info!("Working directory: {}", env::current_dir()?.display());

    Ok(())
}

/// Builds the selected backend.
fn create_backend(kind: BackendKind) -> Result<Arc<dyn Backend>, Box<dyn std::error::Error>> {
    match kind {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new())),
        BackendKind::Cluster => {
            let backend = ClusterBackend::connect(ClusterCommands::default()).map_err(|e| {
                error!("Failed to reach the batch scheduler: {}", e);
                e
            })?;
            Ok(Arc::new(backend))
        }
    }
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Setup working directory
    setup_working_directory(config.working_dir)?;

    // Load the declarations
    info!("Loading pipeline: {}", config.pipeline_path);
    let pipeline = Pipeline::load(&config.pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!(
            "Could not load pipeline from '{}': {}",
            config.pipeline_path, e
        )
    })?;

    info!("Loading resource profiles: {}", config.resources_path);
    let resources = ResourceConfig::load(&config.resources_path)?;

    // Build the task graph
    let graph = TaskGraph::build(&pipeline, &resources)?;
    info!(
        "Pipeline expanded: {} rules, {} tasks",
        pipeline.len(),
        graph.len()
    );

    // Create and configure the engine
    let backend = create_backend(config.backend)?;
    let mut engine = Engine::new(graph, backend);
    engine.set_concurrency_cap(config.parallel);

    let report = engine.run()?;

    println!();
    println!(
        "Completed: {}  Skipped: {}  Failed: {}  Blocked: {}",
        report.completed.len(),
        report.skipped.len(),
        report.failed.len(),
        report.blocked.len()
    );

    for label in &report.failed {
        error!("failed: {}", label);
    }
    for label in &report.blocked {
        error!("blocked: {}", label);
    }

    if let Some(path) = config.report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)?;
        info!("Report written to {}", path.display());
    }

    Ok(report.success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
