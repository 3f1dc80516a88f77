//! Halldyll CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use halldyll_provision::cli::{Cli, Commands, OutputFormatter, RunArgs, StateCommands};
use halldyll_provision::config::{
    ConfigParser, ConfigValidator, InfraConfig, ResourceKey, find_config_file,
};
use halldyll_provision::context::RunContext;
use halldyll_provision::error::{HalldyllError, LoadError, Result};
use halldyll_provision::graph::GraphBuilder;
use halldyll_provision::reconciler::{self, PlannedRun, Reconciler};
use halldyll_provision::state::{StateStore, generate_holder_id, open_store};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, run } => cmd_apply(config, yes, run, &formatter).await,
        Commands::Destroy { yes, run } => cmd_destroy(config, yes, run, &formatter).await,
        Commands::Graph { dot } => cmd_graph(config, dot, &formatter),
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Halldyll project in: {}", path.display());

    let config_path = path.join("halldyll.infra.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    // Create directory if needed
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    // Write config template
    let config_template = include_str!("../templates/halldyll.infra.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    // Write .env.example
    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    // Write/update .gitignore
    let gitignore_content = ".env\n.halldyll/\n";
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".halldyll") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".halldyll") {
                writeln!(file, ".halldyll/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, gitignore_content)?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit halldyll.infra.yaml with your resources and providers");
    eprintln!("  2. Run 'halldyll validate' to check your configuration");
    eprintln!("  3. Run 'halldyll plan' to see what will change");
    eprintln!("  4. Run 'halldyll apply' to provision");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, _) = load_config(config_path)?;

    let result = ConfigValidator::new().check(&config);
    let valid = result.is_valid();
    emit(&formatter.format_validation(&config, &result, show_warnings))?;

    if !valid {
        // Report the typed error of the first failure.
        ConfigValidator::new().validate(&config)?;
    }

    // Reference and cycle checks need the graph.
    let specs = ConfigParser::resource_specs(&config)?;
    let graph = GraphBuilder::new().build(specs)?;
    debug!("Graph has {} nodes and {} edges", graph.len(), graph.edges().len());
    Ok(())
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, RunArgs::default()).await?;
    let planned = reconciler.plan().await?;
    emit(&formatter.format_plan(&planned.plan, detailed))
}

/// Plan and apply.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    run: RunArgs,
    formatter: &OutputFormatter,
) -> Result<()> {
    require_approval_for_json(auto_approve, formatter)?;
    let reconciler = load_reconciler(config_path, run).await?;
    let lock = reconciler.lock("apply").await?;

    let result: Result<_> = async {
        let planned = reconciler.plan().await?;
        if !planned.plan.has_changes() && !needs_refresh(&planned) {
            emit(&formatter.format_plan(&planned.plan, false))?;
            return Ok(());
        }

        emit(&formatter.format_plan(&planned.plan, true))?;
        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }

        execute(&reconciler, &planned, formatter).await
    }
    .await;

    lock.release().await;
    result
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    run: RunArgs,
    formatter: &OutputFormatter,
) -> Result<()> {
    require_approval_for_json(auto_approve, formatter)?;
    let reconciler = load_reconciler(config_path, run).await?;
    let lock = reconciler.lock("destroy").await?;

    let result: Result<_> = async {
        let planned = reconciler.plan_destroy().await?;
        if planned.plan.is_empty() {
            emit(&formatter.success("Nothing to destroy."))?;
            return Ok(());
        }

        eprintln!("The following resources will be destroyed:");
        for action in &planned.plan.actions {
            eprintln!(
                "  - {} ({})",
                action.key,
                action.provider_id.as_deref().unwrap_or("-")
            );
        }

        if !auto_approve
            && !confirm(
                "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
                "destroy",
            )?
        {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }

        execute(&reconciler, &planned, formatter).await
    }
    .await;

    lock.release().await;
    result
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&Path>, dot: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;
    let graph = GraphBuilder::new().build(ConfigParser::resource_specs(&config)?)?;

    if dot {
        emit(&graph.to_dot(&config.qualified_name()))
    } else {
        emit(&formatter.format_graph(&graph))
    }
}

/// State management commands.
///
/// These only need the state settings, so they work even when providers
/// are unreachable or misconfigured.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, base_dir) = load_config(config_path)?;
    let store = open_store(&config.state, &base_dir).await?;

    match command {
        StateCommands::List => {
            let snapshot = store.load().await?;
            emit(&formatter.format_records(&snapshot, &store.location()))
        }
        StateCommands::Show { resource } => {
            let key = parse_key(&resource)?;
            let record = reconciler::show_record(store.as_ref(), &key).await?;
            emit(&formatter.format_record(&record))
        }
        StateCommands::Rm { resource } => {
            let key = parse_key(&resource)?;
            let lock = store.acquire_lock(&generate_holder_id(), "state rm").await?;
            let result = reconciler::forget_record(store.as_ref(), &key).await;
            store.release_lock(&lock.lock_id).await?;
            let record = result?;
            emit(&formatter.success(&format!(
                "Removed {key} ({}) from state; the resource itself was not deleted.",
                record.provider_id
            )))
        }
        StateCommands::Lock { operation } => {
            let lock = store.acquire_lock(&generate_holder_id(), &operation).await?;
            emit(&formatter.format_lock(Some(&lock)))
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(&formatter.warning("State forcefully unlocked."))
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.success("State unlocked."))
            } else {
                let info = store.get_lock_info().await?;
                emit(&formatter.format_lock(info.as_ref()))?;
                eprintln!("Provide --lock-id to release it, or --force.");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Executes a plan with Ctrl-C wired to cancellation.
async fn execute(
    reconciler: &Reconciler,
    planned: &PlannedRun,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (ctx, cancel) = RunContext::new(reconciler.timeout());
    info!("Run {}", ctx.run_id());

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight actions");
            cancel.cancel();
        }
    });

    let report = reconciler.execute(planned, &ctx).await;
    interrupt.abort();

    let report = report?;
    emit(&formatter.format_apply(&report))?;
    report.ensure_complete()
}

/// Returns true if some record only needs its metadata rewritten.
fn needs_refresh(planned: &PlannedRun) -> bool {
    planned.plan.actions.iter().any(|a| a.refresh_record)
}

/// JSON output is meant for scripts, which cannot answer a prompt.
fn require_approval_for_json(auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    if formatter.is_json() && !auto_approve {
        return Err(HalldyllError::Load(LoadError::validation(
            "--yes is required with JSON output",
            "--yes",
        )));
    }
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

fn parse_key(resource: &str) -> Result<ResourceKey> {
    ResourceKey::parse(resource).ok_or_else(|| {
        HalldyllError::Load(LoadError::validation(
            format!("'{resource}' is not of the form kind.name"),
            "resource",
        ))
    })
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env` and the configuration with environment overrides.
///
/// Returns the configuration and the directory relative paths resolve
/// against.
fn load_config(config_path: Option<&Path>) -> Result<(InfraConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(base_dir.clone());
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    Ok((config, base_dir))
}

/// Loads the configuration and builds a reconciler for it.
async fn load_reconciler(
    config_path: Option<&Path>,
    run: RunArgs,
) -> Result<Reconciler> {
    let (mut config, base_dir) = load_config(config_path)?;
    if let Some(parallelism) = run.parallelism {
        config.execution.parallelism = parallelism;
    }
    if let Some(timeout) = run.timeout {
        config.execution.timeout_secs = timeout;
    }

    let reconciler = Reconciler::from_config(&config, &base_dir).await?;
    debug!(
        "Loaded {} resources; per-call timeout {:?}",
        reconciler.graph().len(),
        reconciler.timeout()
    );
    Ok(reconciler)
}
