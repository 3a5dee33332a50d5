//! Workbench agent entry point
//!
//! Runs a benchmark profile on this machine, optionally hosting the control
//! plane that peer agents in a multi-role layout talk to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use workbench_engine::api::{AgentState, ControlPlaneServer};
use workbench_engine::error::ConfigError;
use workbench_engine::executor::{LoggingObserver, ScenarioFilter};
use workbench_engine::profile::parse_timespan;
use workbench_engine::{
    ComponentRegistry, DeterminismScope, EngineConfig, EngineError, ErrorKind, EnvironmentLayout, ExecutionOptions, ExecutionProfile,
    ParameterValue, ProfileExecutor, ProfileTiming, RunContext,
};

/// Workbench agent command line interface
#[derive(Parser)]
#[command(name = "workbench-agent")]
#[command(about = "Runs benchmark profiles and hosts the workbench control plane")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WORKBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level for workbench crates
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a profile
    Run(RunArgs),

    /// Host the control plane until interrupted
    Serve,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// List registered component types
    Components,
}

#[derive(Args)]
struct RunArgs {
    /// Profile file (JSON)
    #[arg(long)]
    profile: PathBuf,

    /// Environment layout file (JSON); omit for a single-node run
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Override the configured agent id
    #[arg(long)]
    agent_id: Option<String>,

    /// Run the action stage N times
    #[arg(long, conflicts_with = "timeout")]
    iterations: Option<u64>,

    /// Run the action stage until this duration elapses (e.g. 30m, 01:00:00)
    #[arg(long)]
    timeout: Option<String>,

    /// Let running work finish past the timeout: `action` (default) or `all`
    #[arg(long, requires = "timeout", num_args = 0..=1, default_missing_value = "action")]
    deterministic: Option<String>,

    #[arg(long, group = "stages")]
    dependencies_only: bool,

    #[arg(long, group = "stages")]
    actions_only: bool,

    #[arg(long, group = "stages")]
    monitors_only: bool,

    /// Stop an iteration at the first failing action
    #[arg(long)]
    fail_fast: bool,

    /// How long monitors may take to stop after the actions finish
    #[arg(long)]
    exit_wait: Option<String>,

    /// Scenario filter, e.g. `zstd,-lz4`
    #[arg(long)]
    scenarios: Option<ScenarioFilter>,

    /// Profile parameter overrides, e.g. `Port=9092,Threads=16`
    #[arg(long, value_delimiter = ',')]
    parameters: Vec<String>,

    /// Do not host the control plane during the run
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            process::exit(2);
        }
    };

    let _guard = match initialize_logging(&cli, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Run(args) => run_profile(config, args).await,
        Commands::Serve => exit_code(serve(config).await),
        Commands::Config { show } => exit_code(handle_config(&config, show)),
        Commands::Components => {
            for name in ComponentRegistry::with_defaults().names() {
                println!("{}", name);
            }
            0
        }
    };

    process::exit(code);
}

fn exit_code(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("Command failed: {:#}", e);
            for cause in e.chain() {
                if let Some(engine_error) = cause.downcast_ref::<EngineError>() {
                    return engine_error.exit_code();
                }
                if cause.downcast_ref::<ConfigError>().is_some() {
                    return ErrorKind::Configuration.exit_code();
                }
            }
            1
        }
    }
}

fn load_configuration(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let path = match &cli.config {
        Some(path) => {
            anyhow::ensure!(path.exists(), "configuration file {} not found", path.display());
            Some(path.clone())
        }
        None => EngineConfig::default_config_path().ok(),
    };

    let mut config = EngineConfig::load_with_fallback(path.as_ref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.format = "json".to_string();
    }
    Ok(config)
}

/// Console logging plus an optional daily-rolled file
fn initialize_logging(cli: &Cli, config: &EngineConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = &config.logging.level;
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("workbench_engine={}", level).parse()?)
        .add_directive(format!("workbench_agent={}", level).parse()?)
        .add_directive("tokio=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let json = cli.json_logs || config.logging.format.eq_ignore_ascii_case("json");

    let (file_layer, guard) = match &config.logging.file_path {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let file_name = path.file_name().context("logging.file_path has no file name")?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("failed to create log directory {}", directory.display()))?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }

    Ok(guard)
}

fn build_options(config: &EngineConfig, args: &RunArgs) -> anyhow::Result<ExecutionOptions> {
    let mut options = ExecutionOptions::from_config(&config.execution);

    options.timing = match (args.iterations, &args.timeout) {
        (Some(count), _) => ProfileTiming::iterations(count)?,
        (None, Some(timeout)) => {
            let scope = match args.deterministic.as_deref() {
                None => DeterminismScope::Immediate,
                Some("all") => DeterminismScope::AllActions,
                Some("action") => DeterminismScope::IndividualAction,
                Some(other) => anyhow::bail!("unknown --deterministic scope '{}': expected 'action' or 'all'", other),
            };
            ProfileTiming::duration(parse_timespan(timeout)?, scope)
        }
        (None, None) => ProfileTiming::once(),
    };

    if args.dependencies_only {
        options = options.dependencies_only();
    } else if args.actions_only {
        options = options.actions_only();
    } else if args.monitors_only {
        options = options.monitors_only();
    }

    options.fail_fast |= args.fail_fast;
    if let Some(exit_wait) = &args.exit_wait {
        options.exit_wait = parse_timespan(exit_wait)?;
    }
    if let Some(scenarios) = &args.scenarios {
        options.scenarios = scenarios.clone();
    }
    Ok(options)
}

fn parse_overrides(entries: &[String]) -> anyhow::Result<HashMap<String, ParameterValue>> {
    entries
        .iter()
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (name, value) = entry
                .split_once('=')
                .with_context(|| format!("parameter override '{}' is not Name=Value", entry))?;
            Ok((name.trim().to_string(), ParameterValue::parse_loose(value.trim())))
        })
        .collect()
}

async fn run_profile(mut config: EngineConfig, args: RunArgs) -> i32 {
    if let Some(agent_id) = &args.agent_id {
        config.agent.agent_id = agent_id.clone();
    }

    let prepared = prepare_run(config, &args).await;
    let (executor, context, server) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return exit_code(Err(e)),
    };

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    let report = executor.run(&context, &cancel).await;
    signals.abort();

    if let Some((shutdown, handle)) = server {
        shutdown.cancel();
        if let Ok(Err(e)) = handle.await {
            warn!("Control plane shut down with error: {}", e);
        }
    }

    info!(
        status = ?report.status,
        iterations = report.iterations,
        failures = report.failures().count(),
        reboot_requested = report.reboot_requested,
        metrics = context.publisher.records().len(),
        "Run finished"
    );
    if let Ok(summary) = serde_json::to_string_pretty(&report.outcomes) {
        println!("{}", summary);
    }
    if let Some(e) = &report.error {
        error!(kind = %e.kind(), "{}", e);
    }
    report.exit_code()
}

type ServerTask = (CancellationToken, tokio::task::JoinHandle<workbench_engine::Result<()>>);

async fn prepare_run(
    config: EngineConfig,
    args: &RunArgs,
) -> anyhow::Result<(ProfileExecutor, RunContext, Option<ServerTask>)> {
    let options = build_options(&config, args)?;

    let mut profile = ExecutionProfile::from_file(&args.profile)
        .with_context(|| format!("failed to load profile {}", args.profile.display()))?;
    profile.apply_overrides(&parse_overrides(&args.parameters)?);

    let layout = match &args.layout {
        Some(path) => EnvironmentLayout::from_file(path)
            .with_context(|| format!("failed to load layout {}", path.display()))?,
        None => EnvironmentLayout::single_node(&config.agent.agent_id),
    };

    let host_api = config.api.enabled && !args.no_api;
    let agent = Arc::new(AgentState::new(&config.agent.agent_id));
    let context = RunContext::with_agent_state(config, layout, agent.clone())?;

    let server = if host_api {
        let address = api_address(&context.config)?;
        let server =
            ControlPlaneServer::bind(address, agent, Some(context.service_metrics.clone()), &context.config.api).await?;
        let shutdown = CancellationToken::new();
        Some((shutdown.clone(), server.spawn(shutdown)))
    } else {
        None
    };

    let executor = ProfileExecutor::new(profile, ComponentRegistry::with_defaults(), options)
        .with_observer(Arc::new(LoggingObserver));

    info!(
        agent_id = %context.agent_id,
        experiment_id = %context.experiment_id,
        profile = %args.profile.display(),
        "Prepared run"
    );
    Ok((executor, context, server))
}

fn api_address(config: &EngineConfig) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", config.api.bind_address, config.api.port)
        .parse()
        .with_context(|| format!("invalid api bind address '{}'", config.api.bind_address))
}

async fn serve(config: EngineConfig) -> anyhow::Result<()> {
    let agent = Arc::new(AgentState::new(&config.agent.agent_id));
    let metrics = Arc::new(workbench_engine::EngineMetrics::new()?);
    let server = ControlPlaneServer::bind(api_address(&config)?, agent, Some(metrics), &config.api).await?;

    let shutdown = CancellationToken::new();
    let handle = server.spawn(shutdown.clone());
    cancel_on_signal(shutdown).await;

    match tokio::time::timeout(Duration::from_secs(10), handle).await {
        Ok(joined) => joined.context("control plane task panicked")??,
        Err(_) => warn!("Control plane did not stop within 10s"),
    }
    Ok(())
}

fn handle_config(config: &EngineConfig, show: bool) -> anyhow::Result<()> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, cancelling"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, cancelling"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl-C, cancelling");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C, cancelling");
    }

    token.cancel();
}
