use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(name = "resviz-sync")]
#[command(version)]
#[command(about = "Follow and drive a research-assistant conversation from the terminal")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend root URL (overrides config and RESVIZ_API_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Retries for the initial history fetch on transport or 5xx errors
    #[arg(long, global = true, default_value = "0")]
    pub retries: u32,

    /// Print the final log as JSON instead of coloured text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Load history, continue any incomplete message, print the log
    History,

    /// Send a user message and stream the reply
    Send {
        content: String,

        /// Message title (defaults to the configured title)
        #[arg(long)]
        title: Option<String>,

        /// Agent to address (defaults to the configured agent)
        #[arg(long)]
        agent: Option<String>,

        /// Extra request parameter as key=value; the value is parsed as JSON
        /// when possible
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Resume streaming an incomplete message
    Continue { message_id: String },

    /// Ask the backend to stop generating
    Stop,

    /// Roll the conversation back to a message and reopen it
    Rollback { message_id: String },

    /// Print shell completions
    Completions { shell: Shell },
}

/// Parse a `key=value` pair.
pub fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

/// Build the `other_params` object, or `None` when no params were given.
pub fn build_other_params(params: &[(String, String)]) -> Option<Map<String, Value>> {
    if params.is_empty() {
        return None;
    }
    let map = params
        .iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()));
            (k.clone(), value)
        })
        .collect();
    Some(map)
}
