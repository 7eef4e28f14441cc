use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use orproxy_common::RouterConfig;
use orproxy_core::pool::{ensure_pool, PoolConfig};
use orproxy_core::{ModelFilter, OpenRouterClient, RouterEngine, Upstream};
use orproxy_router::{api_router, AppState};
use orproxy_storage::FailureStore;

pub(crate) async fn run(config: RouterConfig) -> Result<()> {
    init_tracing(&config.log_level);
    fs::create_dir_all(&config.config_dir)
        .with_context(|| format!("creating {}", config.config_dir.display()))?;

    let upstream: Arc<dyn Upstream> =
        Arc::new(OpenRouterClient::new(&config.api_key).context("building upstream client")?);
    let filter = ModelFilter::load(&config.filter_path);

    let (engine, store) = if config.free_mode {
        let store = FailureStore::open(
            &config.failure_db_path,
            config.failure_cooldown,
            config.rate_limit_cooldown,
        )
        .await
        .context("opening failure store")?;
        let pool = ensure_pool(
            upstream.as_ref(),
            &PoolConfig {
                cache_path: config.pool_cache_path.clone(),
                cache_ttl: config.cache_ttl,
                tool_use_only: config.tool_use_only,
            },
        )
        .await
        .context("loading free models")?;
        info!(models = pool.len(), "free mode enabled");

        let engine = Arc::new(RouterEngine::new(
            upstream.clone(),
            store.clone(),
            pool,
            filter.clone(),
        ));
        (Some(engine), Some(store))
    } else {
        (None, None)
    };

    let state = AppState {
        upstream,
        engine,
        filter: Arc::new(filter),
        tool_use_only: config.tool_use_only,
    };

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, free_mode = config.free_mode, "server started");
    println!("listening on http://{bind}");

    axum::serve(listener, api_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(store) = store {
        store.close().await.context("closing failure store")?;
    }
    info!("server stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
