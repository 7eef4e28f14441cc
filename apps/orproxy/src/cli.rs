use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "orproxy",
    version,
    about = "Expose OpenRouter free models through Ollama- and OpenAI-compatible APIs",
    long_about = "orproxy serves OpenRouter models behind the Ollama and OpenAI chat APIs,\n\
                  with free-model discovery, failover, rate limiting and failure tracking."
)]
pub(crate) struct Cli {
    /// Config file path (default: $HOME/.config/ollama-router/config.yaml)
    #[arg(short, long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Verbose logging (forces debug level)
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,

    /// OpenRouter API key
    #[arg(short = 'k', long, global = true)]
    pub(crate) api_key: Option<String>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start the proxy server
    Start(StartArgs),
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List the current free-model pool
    ListModels {
        /// Only show models that support tool use
        #[arg(long)]
        tool_use_only: bool,
    },
    /// Probe a running server
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Args)]
pub(crate) struct StartArgs {
    /// Listen port
    #[arg(short, long)]
    pub(crate) port: Option<u16>,

    /// Listen address
    #[arg(short = 'H', long)]
    pub(crate) host: Option<String>,

    /// Route requests through the free-model pool
    #[arg(long)]
    pub(crate) free_mode: Option<bool>,

    /// Narrow the pool to tool-capable models
    #[arg(long)]
    pub(crate) tool_use_only: bool,

    /// Log level (debug, info, warn, error)
    #[arg(long)]
    pub(crate) log_level: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Set one configuration key
    Set { key: String, value: String },
    /// Print one configuration key
    Get { key: String },
}
