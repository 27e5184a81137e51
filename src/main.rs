//! infraplan CLI entrypoint.
//!
//! This is the main entrypoint for the infraplan command-line tool. Every
//! command runs against the sandbox provider, persisted next to the state so
//! that separate runs see the same objects.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use infraplan::cli::{Cli, Commands, OutputFormatter, StateCommands};
use infraplan::config::{
    find_config_file, ConfigParser, ConfigValidator, DeclarationFile, StateBackend,
};
use infraplan::error::{ConfigError, Result};
use infraplan::model::ResourceAddress;
use infraplan::provider::SandboxProvider;
use infraplan::reconciler::Reconciler;
use infraplan::state::{LocalStateStore, MemoryStateStore, StateStore};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over
/// `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, workers } => cmd_apply(config, yes, workers, &formatter).await,
        Commands::Graph => cmd_graph(config, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate declarations.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating declarations: {}", config_file.display());

    let declarations = parse_declarations(&config_file)?;
    let result = ConfigValidator::new().check(&declarations);

    println!(
        "{}",
        formatter.format_validation(&declarations, &result, show_warnings)
    );

    match result.errors.first() {
        Some(first) => Err(ConfigError::validation(first.message.clone(), first.field.clone()).into()),
        None => Ok(()),
    }
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, None).await?;
    let plan = reconciler.plan().await?;

    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Apply the plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    workers: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, workers).await?;
    let plan = reconciler.plan().await?;

    if !plan.has_changes() {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    // Show plan
    println!("{}", formatter.format_plan(&plan, false));

    // Confirm
    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let result = reconciler.apply(&plan).await?;
    println!("{}", formatter.format_reconciliation(&result));

    result.failure().map_or(Ok(()), |err| Err(err.into()))
}

/// Show the dependency graph.
async fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = load_reconciler(config_path, None).await?;
    let graph = reconciler.graph()?;
    let levels = graph.levels()?;

    println!("{}", formatter.format_graph(&graph, &levels));
    Ok(())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = load_reconciler(config_path, None).await?;
    let report = reconciler.check_drift().await?;

    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// Destroy everything recorded in state.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, None).await?;
    let plan = reconciler.destroy_plan().await?;

    if !plan.has_changes() {
        eprintln!("Nothing to destroy.");
        return Ok(());
    }

    println!("{}", formatter.format_plan(&plan, false));

    // Confirm
    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let result = reconciler.destroy(&plan).await?;
    println!("{}", formatter.format_reconciliation(&result));

    result.failure().map_or(Ok(()), |err| Err(err.into()))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, None).await?;

    match command {
        StateCommands::Show => {
            let state = reconciler.state().await?;
            println!("{}", formatter.format_state(&state));
        }
        StateCommands::Rm { address } => {
            let address = ResourceAddress::parse(&address)?;
            if reconciler.forget(&address).await? {
                eprintln!("Removed {address} from state. The object itself was not deleted.");
            } else {
                eprintln!("{address} is not recorded in state.");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory relative paths in the declaration file are resolved against.
fn base_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Resolves `path` against the declaration file's directory.
fn relative_to(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() { base.join(path) } else { path }
}

/// Loads `.env`, then the declaration file with environment overrides.
fn parse_declarations(config_file: &Path) -> Result<DeclarationFile> {
    let parser = ConfigParser::new().with_base_path(base_dir(config_file));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Loads and validates declarations, then wires the state store and the
/// sandbox provider into a reconciler.
async fn load_reconciler(
    config_path: Option<&PathBuf>,
    workers: Option<usize>,
) -> Result<Reconciler> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declarations from: {}", config_file.display());

    let mut declarations = parse_declarations(&config_file)?;
    if let Some(workers) = workers {
        debug!("Overriding apply.workers from command line");
        declarations.apply.workers = workers;
    }

    // Validate
    let validation = ConfigValidator::new().validate(&declarations)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let base = base_dir(&config_file);

    // Create state store based on declarations
    let store: Arc<dyn StateStore> = match declarations.state.backend {
        StateBackend::Local => Arc::new(LocalStateStore::with_state_path(relative_to(
            base,
            declarations.state_path(),
        ))),
        StateBackend::Memory => {
            warn!("Memory state backend selected; nothing will be remembered after this run");
            Arc::new(MemoryStateStore::new())
        }
    };

    let sandbox_path = relative_to(base, declarations.sandbox_path());
    if let Some(parent) = sandbox_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let provider = Arc::new(SandboxProvider::open(&sandbox_path).await?);

    info!(
        "Project {} with {} resources ({} state backend)",
        declarations.qualified_name(),
        declarations.resources.len(),
        store.backend_type()
    );
    Reconciler::from_declarations(&declarations, provider, store)
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}
