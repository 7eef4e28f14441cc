use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FAILURE_COOLDOWN_MINUTES: u64 = 5;
pub const DEFAULT_RATELIMIT_COOLDOWN_MINUTES: u64 = 1;
pub const DEFAULT_CACHE_TTL_HOURS: u64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum RouterConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI flags > environment > config file > defaults. All paths
/// and cooldowns are resolved once here; nothing else reads the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub free_mode: bool,
    pub tool_use_only: bool,
    pub log_level: String,
    pub config_dir: PathBuf,
    /// Substring filter file, one pattern per line.
    pub filter_path: PathBuf,
    /// Newline-delimited cache of free model ids.
    pub pool_cache_path: PathBuf,
    pub failure_db_path: PathBuf,
    pub failure_cooldown: Duration,
    pub rate_limit_cooldown: Duration,
    pub cache_ttl: Duration,
}

/// Optional layer used for merging the final config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterConfigPatch {
    pub api_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub free_mode: Option<bool>,
    pub tool_use_only: Option<bool>,
    pub log_level: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub filter_path: Option<PathBuf>,
    pub pool_cache_path: Option<PathBuf>,
    pub failure_db_path: Option<PathBuf>,
    pub failure_cooldown_minutes: Option<u64>,
    pub rate_limit_cooldown_minutes: Option<u64>,
    pub cache_ttl_hours: Option<u64>,
}

impl RouterConfigPatch {
    /// Layer read from process environment variables.
    pub fn from_env() -> Self {
        Self {
            // OLLAMA_ROUTER_OPENROUTER_API_KEY overrides the plain variable.
            api_key: non_empty_env("OLLAMA_ROUTER_OPENROUTER_API_KEY")
                .or_else(|| non_empty_env("OPENROUTER_API_KEY")),
            host: None,
            port: parsed_env("PORT"),
            free_mode: non_empty_env("FREE_MODE").map(|v| parse_bool(&v)),
            tool_use_only: non_empty_env("TOOL_USE_ONLY").map(|v| parse_bool(&v)),
            log_level: non_empty_env("LOG_LEVEL"),
            config_dir: None,
            filter_path: None,
            pool_cache_path: non_empty_env("FREE_MODELS_CACHE").map(PathBuf::from),
            failure_db_path: non_empty_env("FAILURE_DB").map(PathBuf::from),
            failure_cooldown_minutes: parsed_env("FAILURE_COOLDOWN_MINUTES"),
            rate_limit_cooldown_minutes: parsed_env("RATELIMIT_COOLDOWN_MINUTES"),
            cache_ttl_hours: parsed_env("CACHE_TTL_HOURS"),
        }
    }

    pub fn overlay(&mut self, other: RouterConfigPatch) {
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.free_mode.is_some() {
            self.free_mode = other.free_mode;
        }
        if other.tool_use_only.is_some() {
            self.tool_use_only = other.tool_use_only;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
        if other.config_dir.is_some() {
            self.config_dir = other.config_dir;
        }
        if other.filter_path.is_some() {
            self.filter_path = other.filter_path;
        }
        if other.pool_cache_path.is_some() {
            self.pool_cache_path = other.pool_cache_path;
        }
        if other.failure_db_path.is_some() {
            self.failure_db_path = other.failure_db_path;
        }
        if other.failure_cooldown_minutes.is_some() {
            self.failure_cooldown_minutes = other.failure_cooldown_minutes;
        }
        if other.rate_limit_cooldown_minutes.is_some() {
            self.rate_limit_cooldown_minutes = other.rate_limit_cooldown_minutes;
        }
        if other.cache_ttl_hours.is_some() {
            self.cache_ttl_hours = other.cache_ttl_hours;
        }
    }

    pub fn into_config(self) -> Result<RouterConfig, RouterConfigError> {
        let api_key = self
            .api_key
            .filter(|key| !key.is_empty())
            .ok_or(RouterConfigError::MissingField("api_key"))?;
        let config_dir = self.config_dir.unwrap_or_else(default_config_dir);
        let filter_path = self
            .filter_path
            .unwrap_or_else(|| config_dir.join("models-filter"));
        let pool_cache_path = self
            .pool_cache_path
            .unwrap_or_else(|| config_dir.join("free-models"));
        let failure_db_path = self
            .failure_db_path
            .unwrap_or_else(|| config_dir.join("failures.db"));
        Ok(RouterConfig {
            api_key,
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(11434),
            free_mode: self.free_mode.unwrap_or(true),
            tool_use_only: self.tool_use_only.unwrap_or(false),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            config_dir,
            filter_path,
            pool_cache_path,
            failure_db_path,
            failure_cooldown: Duration::from_secs(
                60 * self
                    .failure_cooldown_minutes
                    .unwrap_or(DEFAULT_FAILURE_COOLDOWN_MINUTES),
            ),
            rate_limit_cooldown: Duration::from_secs(
                60 * self
                    .rate_limit_cooldown_minutes
                    .unwrap_or(DEFAULT_RATELIMIT_COOLDOWN_MINUTES),
            ),
            cache_ttl: Duration::from_secs(
                3600 * self.cache_ttl_hours.unwrap_or(DEFAULT_CACHE_TTL_HOURS),
            ),
        })
    }
}

impl From<RouterConfig> for RouterConfigPatch {
    fn from(value: RouterConfig) -> Self {
        Self {
            api_key: Some(value.api_key),
            host: Some(value.host),
            port: Some(value.port),
            free_mode: Some(value.free_mode),
            tool_use_only: Some(value.tool_use_only),
            log_level: Some(value.log_level),
            config_dir: Some(value.config_dir),
            filter_path: Some(value.filter_path),
            pool_cache_path: Some(value.pool_cache_path),
            failure_db_path: Some(value.failure_db_path),
            failure_cooldown_minutes: Some(value.failure_cooldown.as_secs() / 60),
            rate_limit_cooldown_minutes: Some(value.rate_limit_cooldown.as_secs() / 60),
            cache_ttl_hours: Some(value.cache_ttl.as_secs() / 3600),
        }
    }
}

/// `$HOME/.config/ollama-router`, the directory the Go-era tooling used, so
/// existing caches and filter files keep working.
pub fn default_config_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ollama-router")
}

pub fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_env(name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_newer_layer() {
        let mut base = RouterConfigPatch {
            api_key: Some("file-key".to_string()),
            port: Some(11434),
            ..Default::default()
        };
        base.overlay(RouterConfigPatch {
            api_key: Some("flag-key".to_string()),
            ..Default::default()
        });
        assert_eq!(base.api_key.as_deref(), Some("flag-key"));
        assert_eq!(base.port, Some(11434));
    }

    #[test]
    fn into_config_fills_defaults_under_config_dir() {
        let patch = RouterConfigPatch {
            api_key: Some("k".to_string()),
            config_dir: Some(PathBuf::from("/tmp/orproxy-test")),
            ..Default::default()
        };
        let config = patch.into_config().unwrap();
        assert_eq!(config.port, 11434);
        assert!(config.free_mode);
        assert_eq!(
            config.pool_cache_path,
            PathBuf::from("/tmp/orproxy-test/free-models")
        );
        assert_eq!(config.failure_cooldown, Duration::from_secs(300));
        assert_eq!(config.cache_ttl, Duration::from_secs(86400));
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err = RouterConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, RouterConfigError::MissingField("api_key")));
    }

    #[test]
    fn parse_bool_accepts_mixed_case() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" true "));
        assert!(!parse_bool("1"));
        assert!(!parse_bool("no"));
    }
}
