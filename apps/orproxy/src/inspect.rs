//! `list-models` and `status`: operator-facing views over the same upstream
//! and HTTP surface the server uses.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde_json::Value;

use orproxy_common::RouterConfig;
use orproxy_core::{display_name, OpenRouterClient, Upstream};

pub(crate) async fn list_models(config: &RouterConfig) -> Result<()> {
    let client = OpenRouterClient::new(&config.api_key).context("building upstream client")?;
    let catalog = client.list_models().await.context("fetching catalog")?;

    let mut free: Vec<(&str, i64, bool)> = catalog
        .iter()
        .filter(|m| m.is_free())
        .filter(|m| !config.tool_use_only || m.supports_tool_use())
        .map(|m| (m.id.as_str(), m.effective_context_length(), m.supports_tool_use()))
        .collect();
    free.sort_by(|a, b| b.1.cmp(&a.1));

    if free.is_empty() {
        println!("{}", "No free models available.".yellow());
        return Ok(());
    }

    println!(
        "{} ({} models, largest context first)",
        "Free models".cyan().bold(),
        free.len()
    );
    for (id, context_length, tools) in free {
        let tools_tag = if tools { " [tools]".green() } else { "".normal() };
        println!(
            "  {}  {}{}",
            display_name(id).green(),
            format!("{}k context, {}", context_length / 1024, id).dimmed(),
            tools_tag
        );
    }
    Ok(())
}

pub(crate) async fn status(host: &str, port: u16) -> Result<()> {
    let base = format!("http://{host}:{port}");
    let client = wreq::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(5))
        .build()
        .context("building http client")?;

    let health = client
        .request(wreq::Method::GET, format!("{base}/health"))
        .send()
        .await;
    match health {
        Ok(resp) if resp.status().as_u16() == 200 => {
            println!("{} {}", "●".green(), format!("server is running at {base}").bold());
        }
        _ => {
            println!("{} server is not reachable at {}", "●".red(), base);
            bail!("no server at {base}");
        }
    }

    let tags = client
        .request(wreq::Method::GET, format!("{base}/api/tags"))
        .send()
        .await
        .context("fetching /api/tags")?;
    let bytes = tags.bytes().await.context("reading /api/tags")?;
    let parsed: Value = serde_json::from_slice(&bytes).context("decoding /api/tags")?;
    let models = parsed["models"].as_array().map(|m| m.len()).unwrap_or(0);
    println!("  {} models currently routable", models.to_string().cyan());

    Ok(())
}
