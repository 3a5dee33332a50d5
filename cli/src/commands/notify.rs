use crate::api::AgentClient;
use crate::error::Result;
use crate::output::OutputManager;
use clap::{Args, Subcommand};

#[derive(Args, Debug)]
pub struct NotifyExitArgs {
    #[command(subcommand)]
    pub action: NotifyAction,
}

#[derive(Subcommand, Debug)]
pub enum NotifyAction {
    /// Ask the agent to wait for this instance's exit notification
    Register { instance: String },

    /// Tell the agent that this instance has exited
    Fire { instance: String },
}

pub async fn run(args: NotifyExitArgs, client: AgentClient, output: OutputManager) -> Result<()> {
    match args.action {
        NotifyAction::Register { instance } => {
            client.register_exit(&instance).await?;
            output.print_success(&format!("Registered exit notification for '{}'", instance))
        }
        NotifyAction::Fire { instance } => {
            client.notify_exit(&instance).await?;
            output.print_success(&format!("Sent exit notification for '{}'", instance))
        }
    }
}
