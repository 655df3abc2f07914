//! Solace server binary.
//!
//! Starts the worker pools, the background sweeps and the axum HTTP server
//! with structured logging, database initialization, and graceful shutdown
//! on SIGTERM/SIGINT.

use solace_db::DbRuntimeSettings;
use solace_queue::Broker;
use solace_server::{
    app, auth::TokenSigner, background, build_adapters, build_notifier, config,
    pipeline::{PipelineContext, PipelineSettings},
    ratelimit::{RateLimiter, SqliteRateStore},
    session::SessionManager,
    workers::{queue_defaults, Workers},
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SOLACE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn open_database(path: &str, settings: DbRuntimeSettings) -> solace_db::DbPool {
    let pool = solace_db::create_pool(path, settings)
        .expect("failed to create database pool, check database.path in config");
    let conn = pool
        .get()
        .expect("failed to get database connection for migrations");
    let applied = solace_db::run_migrations(&conn).expect("failed to run database migrations");
    if applied > 0 {
        tracing::info!(path, count = applied, "applied database migrations");
    }
    pool
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let db_settings = DbRuntimeSettings {
        busy_timeout_ms: config.database.busy_timeout_ms,
        pool_max_size: config.database.pool_max_size,
    };
    let pool = open_database(&config.database.path, db_settings);

    // Rate limiting: shared SQLite store when configured, else per-process.
    let rate_limiter = match &config.rate_limit.shared_store {
        Some(path) => {
            let store_pool = open_database(path, db_settings);
            tracing::info!(path = %path, "rate limiting backed by shared store");
            RateLimiter::with_store(&config.rate_limit, Arc::new(SqliteRateStore::new(store_pool)))
        }
        None => {
            tracing::info!("rate limiting is per-process (no shared store configured)");
            RateLimiter::in_memory(&config.rate_limit)
        }
    };

    let tokens = if config.auth.secret.is_empty() {
        tracing::warn!(
            "auth.secret is empty, using an ephemeral signing key; tokens will not survive a restart"
        );
        let secret = format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        TokenSigner::new(secret, Duration::from_secs(config.auth.token_ttl_secs))
    } else {
        TokenSigner::new(
            &config.auth.secret,
            Duration::from_secs(config.auth.token_ttl_secs),
        )
    };

    let broker = Broker::with_defaults(pool.clone(), queue_defaults(&config.queues));
    let pipeline = PipelineContext {
        pool,
        broker: broker.clone(),
        adapters: build_adapters(&config.adapters),
        settings: PipelineSettings {
            min_confidence: config.pipeline.min_confidence,
            context_turns: config.pipeline.context_turns,
        },
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, _) = broadcast::channel(256);

    let workers = Workers::spawn(
        &pipeline,
        build_notifier(&config.adapters),
        &config.queues,
        events_tx,
        shutdown_rx.clone(),
    );

    tokio::spawn(background::start_retention_task(
        broker,
        config.queues.completed_retention_secs,
        shutdown_rx.clone(),
    ));
    tokio::spawn(background::start_rate_limit_sweep(
        rate_limiter.clone(),
        Duration::from_secs(60),
        shutdown_rx.clone(),
    ));

    let state = AppState {
        sessions: SessionManager::new(
            pipeline.clone(),
            rate_limiter.clone(),
            tokens.clone(),
            shutdown_rx,
        ),
        pipeline,
        rate_limiter,
        tokens,
        failed_threshold: config.queues.failed_threshold,
    };

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting solace server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    // Serve with graceful shutdown
    let signal_tx = shutdown_tx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Live sessions and workers observe this too.
        let _ = signal_tx.send(true);
    })
    .await
    .expect("server error");

    let _ = shutdown_tx.send(true);
    tracing::info!("http server stopped, draining worker pools");
    workers.join().await;

    tracing::info!("solace server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
