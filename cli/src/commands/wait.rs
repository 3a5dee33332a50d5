use crate::api::AgentClient;
use crate::error::{CliError, Result};
use crate::output::OutputManager;
use clap::Args;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Wait for the server workload to report online, not just a heartbeat
    #[arg(long)]
    pub online: bool,

    /// Give up after this many seconds
    #[arg(long, default_value = "600")]
    pub timeout: u64,
}

/// Poll until the agent answers (and, with `--online`, reports ready)
pub async fn run(args: WaitArgs, client: AgentClient, output: OutputManager, poll_interval: Duration) -> Result<()> {
    let what = if args.online { "online" } else { "heartbeat" };
    let spinner = output.create_spinner(&format!("Waiting for {} from {}...", what, client.base_url()));
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    let result = loop {
        let ready = match client.heartbeat().await {
            Ok(_) if args.online => client.online().await,
            Ok(_) => Ok(true),
            Err(e) => Err(e),
        };

        match ready {
            Ok(true) => break Ok(()),
            Ok(false) => debug!("Agent answered but is not online yet"),
            Err(e) if e.is_retryable() => debug!("Agent not ready: {}", e),
            Err(e) => break Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            break Err(CliError::Timeout);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Err(CliError::Cancelled),
            _ = tokio::time::sleep(poll_interval.min(deadline - now)) => {}
        }
    };

    spinner.finish_and_clear();
    result?;
    output.print_success(&format!("Agent at {} is {}", client.base_url(), if args.online { "online" } else { "alive" }))
}
