use crate::api::AgentClient;
use crate::error::Result;
use crate::output::OutputManager;
use clap::Args;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Check liveness only (heartbeat)
    #[arg(long)]
    pub ping: bool,
}

pub async fn run(args: StatusArgs, client: AgentClient, output: OutputManager) -> Result<()> {
    if args.ping {
        let spinner = output.create_spinner("Pinging agent...");
        let heartbeat = client.heartbeat().await;
        spinner.finish_and_clear();

        let heartbeat = heartbeat?;
        output.print_success(&format!("Agent {} is reachable at {}", heartbeat.agent_id, client.base_url()))?;
        return Ok(());
    }

    let spinner = output.create_spinner("Checking agent status...");
    let status = client.status().await;
    spinner.finish_and_clear();

    let status = status?;
    output.print_status(&status)?;
    if !status.online {
        output.print_info("The server workload on this agent is not ready")?;
    }
    Ok(())
}
