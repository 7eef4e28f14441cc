//! YAML config file: `openrouter.api_key`, `server.*`, `mode.*`,
//! `logging.level`, `filter.model_filter_path`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use orproxy_common::{default_config_dir, parse_bool, RouterConfigPatch};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) openrouter: OpenRouterSection,
    #[serde(default)]
    pub(crate) server: ServerSection,
    #[serde(default)]
    pub(crate) mode: ModeSection,
    #[serde(default)]
    pub(crate) logging: LoggingSection,
    #[serde(default)]
    pub(crate) filter: FilterSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct OpenRouterSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ServerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) host: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ModeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) free_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tool_use_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LoggingSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FilterSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) model_filter_path: Option<PathBuf>,
}

impl FileConfig {
    pub(crate) fn default_path() -> PathBuf {
        default_config_dir().join("config.yaml")
    }

    /// A missing file is an empty config, not an error.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = serde_yaml::to_string(self).context("serializing config")?;
        fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
    }

    pub(crate) fn to_patch(&self) -> RouterConfigPatch {
        RouterConfigPatch {
            api_key: self.openrouter.api_key.clone(),
            host: self.server.host.clone(),
            port: self.server.port,
            free_mode: self.mode.free_mode,
            tool_use_only: self.mode.tool_use_only,
            log_level: self.logging.level.clone(),
            filter_path: self.filter.model_filter_path.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        match key {
            "openrouter.api_key" => self.openrouter.api_key.clone(),
            "server.port" => self.server.port.map(|p| p.to_string()),
            "server.host" => self.server.host.clone(),
            "mode.free_mode" => self.mode.free_mode.map(|v| v.to_string()),
            "mode.tool_use_only" => self.mode.tool_use_only.map(|v| v.to_string()),
            "logging.level" => self.logging.level.clone(),
            "filter.model_filter_path" => self
                .filter
                .model_filter_path
                .as_ref()
                .map(|p| p.display().to_string()),
            _ => None,
        }
    }

    pub(crate) fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "openrouter.api_key" => self.openrouter.api_key = Some(value.to_string()),
            "server.port" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("invalid port: {value}"))?;
                self.server.port = Some(port);
            }
            "server.host" => self.server.host = Some(value.to_string()),
            "mode.free_mode" => self.mode.free_mode = Some(parse_bool(value)),
            "mode.tool_use_only" => self.mode.tool_use_only = Some(parse_bool(value)),
            "logging.level" => self.logging.level = Some(value.to_string()),
            "filter.model_filter_path" => {
                self.filter.model_filter_path = Some(PathBuf::from(value));
            }
            other => bail!("unknown config key: {other}"),
        }
        Ok(())
    }
}

pub(crate) fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &key[..4], &key[key.len() - 4..])
}
