use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod commands;
mod error;
mod output;
mod settings;

use api::AgentClient;
use commands::*;
use error::Result;
use output::{OutputFormat, OutputManager};
use settings::CliSettings;

#[derive(Parser)]
#[command(name = "workbenchctl")]
#[command(about = "Workbench CLI - inspect and drive workbench agent control planes")]
#[command(version)]
#[command(long_about = "
workbenchctl talks to the control plane hosted by a workbench-agent: liveness,
server readiness, shared state documents and exit notifications.

Examples:
  workbenchctl status                                   # Heartbeat and online status
  workbenchctl --url http://10.0.0.5:4500 wait --online # Block until the server is ready
  workbenchctl state get ServerState                    # Print the published server state
  workbenchctl notify-exit fire client-01               # Release a waiting server
")]
struct Cli {
    /// Agent control-plane URL (overrides config file)
    #[arg(long, global = true, env = "WORKBENCH_URL")]
    url: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormatArg,

    /// Per-request timeout in seconds (overrides config file)
    #[arg(long, global = true)]
    request_timeout: Option<u64>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, env = "WORKBENCH_CLI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum OutputFormatArg {
    Table,
    Json,
    Raw,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Raw => OutputFormat::Raw,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check agent heartbeat and server readiness
    Status(StatusArgs),

    /// Read and write shared state documents
    State(StateArgs),

    /// Block until the agent answers or reports online
    Wait(WaitArgs),

    /// Register or fire client exit notifications
    NotifyExit(NotifyExitArgs),

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&cli);

    if let Commands::Completions { shell } = cli.command {
        generate_completions(shell);
        return;
    }

    if let Err(e) = run_command(cli).await {
        eprintln!("{}", error::format_error(&e));
        process::exit(e.exit_code());
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let settings = CliSettings::load(cli.config.as_deref())?;

    let agent_url = cli.url.unwrap_or_else(|| settings.agent_url.clone());
    let request_timeout = Duration::from_secs(cli.request_timeout.unwrap_or(settings.timeout_secs));
    info!("Connecting to workbench agent at: {}", agent_url);

    let client = AgentClient::new(&agent_url)?.with_timeout(request_timeout);

    let colored = !cli.no_color && console::Term::stdout().features().colors_supported();
    let output = OutputManager::new(OutputFormat::from(cli.format), colored).quiet(cli.quiet);

    match cli.command {
        Commands::Status(args) => commands::status::run(args, client, output).await,
        Commands::State(args) => commands::state::run(args, client, output).await,
        Commands::Wait(args) => {
            let poll_interval = Duration::from_millis(settings.poll_interval_ms);
            commands::wait::run(args, client, output, poll_interval).await
        }
        Commands::NotifyExit(args) => commands::notify::run(args, client, output).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else if cli.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("workbenchctl={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn generate_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_output_format_conversion() {
        assert_eq!(OutputFormat::from(OutputFormatArg::Table), OutputFormat::Table);
        assert_eq!(OutputFormat::from(OutputFormatArg::Json), OutputFormat::Json);
        assert_eq!(OutputFormat::from(OutputFormatArg::Raw), OutputFormat::Raw);
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["workbenchctl", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status(_)));

        let cli = Cli::try_parse_from(["workbenchctl", "--format", "json", "state", "get", "ServerState"]).unwrap();
        assert!(matches!(cli.format, OutputFormatArg::Json));
        match cli.command {
            Commands::State(StateArgs { action: StateAction::Get { name } }) => assert_eq!(name, "ServerState"),
            _ => panic!("expected state get"),
        }

        let cli = Cli::try_parse_from(["workbenchctl", "wait", "--online", "--timeout", "30"]).unwrap();
        match cli.command {
            Commands::Wait(args) => {
                assert!(args.online);
                assert_eq!(args.timeout, 30);
            }
            _ => panic!("expected wait"),
        }
    }

    #[test]
    fn test_state_put_requires_document() {
        assert!(Cli::try_parse_from(["workbenchctl", "state", "put", "ServerState"]).is_err());
        assert!(Cli::try_parse_from(["workbenchctl", "state", "put", "ServerState", "--json", "{}"]).is_ok());
    }
}
