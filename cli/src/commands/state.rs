use crate::api::AgentClient;
use crate::error::{CliError, Result};
use crate::output::OutputManager;
use clap::{Args, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct StateArgs {
    #[command(subcommand)]
    pub action: StateAction,
}

#[derive(Subcommand, Debug)]
pub enum StateAction {
    /// Print a state document
    Get {
        /// State name, e.g. ServerState
        name: String,
    },

    /// Create or replace a state document
    Put {
        name: String,

        /// Document as inline JSON
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        json: Option<String>,

        /// Read the document from a JSON file
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Delete a state document; absent documents are not an error
    Delete { name: String },
}

pub async fn run(args: StateArgs, client: AgentClient, output: OutputManager) -> Result<()> {
    match args.action {
        StateAction::Get { name } => {
            let document = client.get_state(&name).await?;
            output.print_document(&name, &document)
        }
        StateAction::Put { name, json, file } => {
            let document = read_document(json.as_deref(), file.as_deref())?;
            let stored = client.put_state(&name, &document).await?;
            output.print_success(&format!("Stored state '{}'", name))?;
            output.print_document(&name, &stored)
        }
        StateAction::Delete { name } => {
            client.delete_state(&name).await?;
            output.print_success(&format!("Deleted state '{}'", name))
        }
    }
}

fn read_document(json: Option<&str>, file: Option<&std::path::Path>) -> Result<Value> {
    let raw = match (json, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => return Err(CliError::Validation("either --json or --file is required".to_string())),
    };

    serde_json::from_str(&raw).map_err(|e| CliError::Validation(format!("document is not valid JSON: {}", e)))
}
