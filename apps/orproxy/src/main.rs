mod cli;
mod config_file;
mod inspect;
mod start;

use anyhow::{bail, Result};
use clap::Parser;
use colored::Colorize;

use orproxy_common::{RouterConfig, RouterConfigPatch};

use cli::{Cli, Command, ConfigAction, StartArgs};
use config_file::{mask_api_key, FileConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(FileConfig::default_path);

    match &cli.command {
        Command::Start(args) => {
            let config = resolve_config(&cli, &config_path, Some(args))?;
            start::run(config).await
        }
        Command::Config { action } => run_config(action, &config_path),
        Command::ListModels { tool_use_only } => {
            let mut config = resolve_config(&cli, &config_path, None)?;
            config.tool_use_only |= *tool_use_only;
            inspect::list_models(&config).await
        }
        Command::Status { host, port } => {
            let file = FileConfig::load(&config_path)?;
            let port = (*port).or(file.server.port).unwrap_or(11434);
            inspect::status(host, port).await
        }
    }
}

/// CLI flags > environment > config file > defaults. A missing API key is a
/// startup error with a pointer at every place it can come from.
fn resolve_config(
    cli: &Cli,
    config_path: &std::path::Path,
    start: Option<&StartArgs>,
) -> Result<RouterConfig> {
    let mut patch = FileConfig::load(config_path)?.to_patch();
    patch.overlay(RouterConfigPatch::from_env());

    let mut flags = RouterConfigPatch {
        api_key: cli.api_key.clone(),
        ..Default::default()
    };
    if let Some(args) = start {
        flags.host = args.host.clone();
        flags.port = args.port;
        flags.free_mode = args.free_mode;
        if args.tool_use_only {
            flags.tool_use_only = Some(true);
        }
        flags.log_level = args.log_level.clone();
    }
    if cli.verbose {
        flags.log_level = Some("debug".to_string());
    }
    patch.overlay(flags);

    match patch.into_config() {
        Ok(config) => Ok(config),
        Err(orproxy_common::RouterConfigError::MissingField("api_key")) => {
            eprintln!("{}", "error: no OpenRouter API key configured".red().bold());
            eprintln!("set one of:");
            eprintln!("  1. config file: openrouter.api_key");
            eprintln!("  2. environment: OLLAMA_ROUTER_OPENROUTER_API_KEY or OPENROUTER_API_KEY");
            eprintln!("  3. flag: --api-key / -k");
            bail!("missing API key");
        }
        Err(err) => Err(err.into()),
    }
}

fn run_config(action: &ConfigAction, path: &std::path::Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = FileConfig::load(path)?;
            println!("{}", "Current configuration".cyan().bold());
            for key in [
                "openrouter.api_key",
                "server.port",
                "server.host",
                "mode.free_mode",
                "mode.tool_use_only",
                "logging.level",
                "filter.model_filter_path",
            ] {
                let value = match config.get(key) {
                    Some(value) if key == "openrouter.api_key" => mask_api_key(&value),
                    Some(value) => value,
                    None => "(unset)".to_string(),
                };
                println!("  {}: {}", key.yellow(), value);
            }
            if path.exists() {
                println!("\nconfig file: {}", path.display());
            } else {
                println!("\n{}", "no config file found, showing defaults".yellow());
            }
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            let mut config = FileConfig::load(path)?;
            config.set(key, value)?;
            config.save(path)?;
            let shown = if key == "openrouter.api_key" {
                mask_api_key(value)
            } else {
                value.clone()
            };
            println!("{} = {}", key.green(), shown);
            println!("saved to {}", path.display());
            Ok(())
        }
        ConfigAction::Get { key } => {
            let config = FileConfig::load(path)?;
            match config.get(key) {
                Some(value) if key == "openrouter.api_key" => {
                    println!("{}", mask_api_key(&value));
                    Ok(())
                }
                Some(value) => {
                    println!("{value}");
                    Ok(())
                }
                None => bail!("config key '{key}' is not set"),
            }
        }
    }
}
