//! Free-model pool: discovery, ranking, file cache, and the display-name
//! filter. The pool is computed once at startup and immutable afterwards.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use orproxy_protocol::catalog::CatalogModel;

use crate::upstream::{Upstream, UpstreamError};

/// Tail segment of a fully-qualified model id; what clients see.
pub fn display_name(full: &str) -> &str {
    full.rsplit('/').next().unwrap_or(full)
}

/// Substring patterns loaded from the filter file. Empty set passes
/// everything.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    patterns: Vec<String>,
}

impl ModelFilter {
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to read model filter");
                }
                return Self::default();
            }
        };
        let filter = Self::from_lines(&contents);
        info!(patterns = filter.patterns.len(), "model filter loaded");
        filter
    }

    pub fn from_lines(contents: &str) -> Self {
        Self {
            patterns: contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn from_patterns(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, display_name: &str) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|pattern| display_name.contains(pattern.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub cache_path: PathBuf,
    pub cache_ttl: Duration,
    pub tool_use_only: bool,
}

/// Load the ordered free-model pool, preferring a fresh file cache, then a
/// live fetch, then a stale cache as the last resort.
pub async fn ensure_pool(
    upstream: &dyn Upstream,
    config: &PoolConfig,
) -> Result<Vec<String>, UpstreamError> {
    if cache_is_fresh(&config.cache_path, config.cache_ttl) {
        if let Ok(models) = read_cache(&config.cache_path) {
            info!(models = models.len(), "free model pool loaded from cache");
            return Ok(models);
        }
    }

    match fetch_free_models(upstream, config.tool_use_only).await {
        Ok(models) => {
            // Cache write is best effort; a read-only config dir only costs
            // a refetch on the next start.
            if let Err(err) = fs::write(&config.cache_path, models.join("\n")) {
                warn!(path = %config.cache_path.display(), error = %err, "failed to write pool cache");
            }
            info!(models = models.len(), "free model pool fetched");
            Ok(models)
        }
        Err(err) => match read_cache(&config.cache_path) {
            Ok(models) => {
                warn!(error = %err, models = models.len(), "upstream fetch failed, using stale pool cache");
                Ok(models)
            }
            Err(_) => Err(err),
        },
    }
}

/// Fetch the catalog and keep free models, ordered by effective context
/// length descending (ties keep catalog order).
pub async fn fetch_free_models(
    upstream: &dyn Upstream,
    tool_use_only: bool,
) -> Result<Vec<String>, UpstreamError> {
    let catalog = upstream.list_models().await?;
    Ok(rank_free_models(&catalog, tool_use_only))
}

pub fn rank_free_models(catalog: &[CatalogModel], tool_use_only: bool) -> Vec<String> {
    let mut entries: Vec<(&CatalogModel, i64)> = catalog
        .iter()
        .filter(|m| m.is_free())
        .filter(|m| !tool_use_only || m.supports_tool_use())
        .map(|m| (m, m.effective_context_length()))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.into_iter().map(|(m, _)| m.id.clone()).collect()
}

fn cache_is_fresh(path: &Path, ttl: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age < ttl)
        .unwrap_or(false)
}

fn read_cache(path: &Path) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
