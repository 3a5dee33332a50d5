use crate::api::AgentStatus;
use crate::error::Result;
use console::{style, Style};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
    Raw,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "table" => Ok(OutputFormat::Table),
            "raw" => Ok(OutputFormat::Raw),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

pub struct OutputManager {
    format: OutputFormat,
    colored: bool,
    quiet: bool,
}

impl OutputManager {
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self { format, colored, quiet: false }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn print_status(&self, status: &AgentStatus) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(status)?);
            }
            OutputFormat::Table => {
                self.print_status_table(status);
            }
            OutputFormat::Raw => {
                println!("{} {} {}", status.agent_id, status.url, if status.online { "online" } else { "offline" });
            }
        }
        Ok(())
    }

    /// Print a state document
    pub fn print_document(&self, name: &str, document: &Value) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&json!({ "name": name, "document": document }))?);
            }
            OutputFormat::Table => {
                self.print_document_table(name, document)?;
            }
            OutputFormat::Raw => {
                println!("{}", serde_json::to_string(document)?);
            }
        }
        Ok(())
    }

    pub fn print_key_value(&self, key: &str, value: &str) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&json!({ key: value }))?);
            }
            OutputFormat::Table => {
                if self.colored {
                    println!("{}: {}", style(key).bold().blue(), style(value).green());
                } else {
                    println!("{}: {}", key, value);
                }
            }
            OutputFormat::Raw => {
                println!("{}", value);
            }
        }
        Ok(())
    }

    pub fn print_success(&self, message: &str) -> Result<()> {
        if self.quiet || self.format == OutputFormat::Json {
            return Ok(());
        }
        if self.colored {
            println!("{} {}", style("✓").green().bold(), message);
        } else {
            println!("✓ {}", message);
        }
        Ok(())
    }

    pub fn print_warning(&self, message: &str) -> Result<()> {
        if self.colored {
            eprintln!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
        } else {
            eprintln!("⚠ {}", message);
        }
        Ok(())
    }

    pub fn print_error(&self, message: &str) -> Result<()> {
        if self.colored {
            eprintln!("{} {}", style("✗").red().bold(), style(message).red());
        } else {
            eprintln!("✗ {}", message);
        }
        Ok(())
    }

    pub fn print_info(&self, message: &str) -> Result<()> {
        if self.quiet || self.format == OutputFormat::Json {
            return Ok(());
        }
        if self.colored {
            println!("{} {}", style("ℹ").blue().bold(), message);
        } else {
            println!("ℹ {}", message);
        }
        Ok(())
    }

    /// Spinner on stderr; hidden in quiet and machine-readable modes
    pub fn create_spinner(&self, message: &str) -> ProgressBar {
        if self.quiet || self.format != OutputFormat::Table {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        if let Ok(spinner_style) = ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.green} {msg} [{elapsed}]")
        {
            pb.set_style(spinner_style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    fn print_status_table(&self, status: &AgentStatus) {
        let online_style = if status.online { Style::new().green() } else { Style::new().yellow() };
        let online = if status.online { "online" } else { "offline" };
        let heartbeat = status.heartbeat.format("%Y-%m-%d %H:%M:%S UTC").to_string();

        if self.colored {
            println!("{}", style("Agent Status").bold().underlined());
            println!("{}: {}", style("Agent").bold(), style(&status.agent_id).cyan());
            println!("{}: {}", style("Endpoint").bold(), status.url);
            println!("{}: {}", style("Heartbeat").bold(), heartbeat);
            println!("{}: {}", style("Server").bold(), online_style.apply_to(online));
        } else {
            println!("Agent Status");
            println!("Agent: {}", status.agent_id);
            println!("Endpoint: {}", status.url);
            println!("Heartbeat: {}", heartbeat);
            println!("Server: {}", online);
        }
    }

    fn print_document_table(&self, name: &str, document: &Value) -> Result<()> {
        if self.colored {
            println!("{}", style(format!("State: {}", name)).bold().underlined());
        } else {
            println!("State: {}", name);
        }

        let Value::Object(fields) = document else {
            println!("{}", serde_json::to_string_pretty(document)?);
            return Ok(());
        };

        println!("{:<30} {}", "Key", "Value");
        println!("{:-<30} {:-<50}", "", "");
        for (key, value) in fields {
            let value_str = match value {
                Value::String(s) => s.clone(),
                _ => serde_json::to_string(value)?,
            };

            if self.colored {
                println!("{:<30} {}", style(key).bold().blue(), style(&value_str).green());
            } else {
                println!("{:<30} {}", key, value_str);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("raw".parse::<OutputFormat>().unwrap(), OutputFormat::Raw);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_print_status_all_formats() {
        let status = AgentStatus {
            url: "http://10.0.0.5:4500".to_string(),
            agent_id: "server-01".to_string(),
            heartbeat: Utc::now(),
            online: true,
        };

        for format in [OutputFormat::Table, OutputFormat::Json, OutputFormat::Raw] {
            let output = OutputManager::new(format, false);
            assert!(output.print_status(&status).is_ok());
        }
    }

    #[test]
    fn test_print_non_object_document() {
        let output = OutputManager::new(OutputFormat::Table, false);
        assert!(output.print_document("Ports", &json!([9092, 9093])).is_ok());
    }
}
