use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "metamux", version, about = "MCP meta-tool dispatcher")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "metamux.yaml")]
    pub config: PathBuf,

    /// Override the configured transport (stdio, sse, http).
    #[arg(long)]
    pub transport: Option<String>,

    /// Override the configured listen address (sse/http transports).
    #[arg(long)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse and validate the config file, then exit.
    Validate,
}
