use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{delete, get, post};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

mod auth;
mod auto_updater;
mod cleanup_scheduler;
mod config;
mod db;
mod error;
mod handlers;
mod instance_manager;
mod models;
mod port_allocator;
mod proxy;
mod resource_monitor;
mod version_manager;

use crate::auth::AuthState;
use crate::auto_updater::AutoUpdater;
use crate::config::{AppConfig, CliArgs};
use crate::db::Database;
use crate::instance_manager::InstanceManager;
use crate::resource_monitor::ResourceMonitor;
use crate::version_manager::VersionManager;

/// Shared application state handed to every management-API handler (§6).
pub struct AppState {
    pub db: Database,
    pub paths: config::Paths,
    pub instance_manager: Arc<InstanceManager>,
    pub resource_monitor: Arc<ResourceMonitor>,
    pub version_manager: Arc<VersionManager>,
    pub auto_updater: Arc<AutoUpdater>,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gowa_manager=info,tower_http=info,warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("starting GOWA Manager");

    let config = AppConfig::load(&cli).context("failed to load configuration")?;
    let db = Database::connect(&config.paths.db_url()).await?;

    let version_manager = Arc::new(VersionManager::new(
        config.paths.clone(),
        config.release_index_url.clone(),
    ));
    let resource_monitor = Arc::new(ResourceMonitor::new());
    let instance_manager = Arc::new(InstanceManager::new(
        db.clone(),
        config.paths.clone(),
        config.proxy_prefix.clone(),
        version_manager.clone(),
        resource_monitor.clone(),
    ));
    let auto_updater = AutoUpdater::new(db.clone(), version_manager.clone(), instance_manager.clone());

    // Startup auto-restart (§4.9): bring previously-running instances back up
    // before the public listener opens, so the proxy never serves a
    // seemingly-running instance with no backing process.
    if let Err(e) = instance_manager.startup_auto_restart().await {
        tracing::warn!("startup auto-restart failed: {e:#}");
    }

    cleanup_scheduler::spawn(db.clone(), config.paths.clone());
    auto_updater.clone().spawn();

    let app_state = Arc::new(AppState {
        db: db.clone(),
        paths: config.paths.clone(),
        instance_manager: instance_manager.clone(),
        resource_monitor,
        version_manager,
        auto_updater,
        started_at: Instant::now(),
    });

    let management_routes = Router::new()
        .route("/api/health", get(handlers::health::health_handler))
        .route(
            "/api/instances",
            get(handlers::instances::list_instances).post(handlers::instances::create_instance),
        )
        .route(
            "/api/instances/{id}",
            get(handlers::instances::get_instance)
                .put(handlers::instances::update_instance)
                .delete(handlers::instances::delete_instance),
        )
        .route("/api/instances/{id}/start", post(handlers::instances::start_instance))
        .route("/api/instances/{id}/stop", post(handlers::instances::stop_instance))
        .route("/api/instances/{id}/kill", post(handlers::instances::kill_instance))
        .route("/api/instances/{id}/restart", post(handlers::instances::restart_instance))
        .route("/api/instances/{id}/status", get(handlers::instances::instance_status))
        .route("/api/system/status", get(handlers::system::system_status))
        .route("/api/system/config", get(handlers::system::system_config))
        .route("/api/system/ports/next", get(handlers::system::next_port))
        .route("/api/system/ports/{port}/available", get(handlers::system::port_available))
        .route("/api/system/versions/installed", get(handlers::system::versions_installed))
        .route("/api/system/versions/available", get(handlers::system::versions_available))
        .route("/api/system/versions/install", post(handlers::system::install_version))
        .route("/api/system/versions/usage", get(handlers::system::versions_usage))
        .route("/api/system/versions/cleanup", post(handlers::system::versions_cleanup))
        .route(
            "/api/system/versions/{version}",
            delete(handlers::system::remove_version),
        )
        .route(
            "/api/system/versions/{version}/available",
            get(handlers::system::version_availability),
        )
        .route("/api/system/auto-update/status", get(handlers::system::auto_update_status))
        .route("/api/system/auto-update/check", post(handlers::system::auto_update_check))
        .route(
            "/api/system/auto-update/instances",
            get(handlers::system::auto_update_instances),
        )
        .with_state(app_state.clone());

    let proxy_state = proxy::ProxyState::new(db.clone());
    let proxy_routes = proxy::router(proxy_state, config.proxy_prefix.clone());

    let auth_state = AuthState {
        username: config.admin_username.clone(),
        password: config.admin_password.clone(),
    };

    // Admin Basic Auth (§6) gates the management surface only — it must
    // never see the proxy subtree, which forwards a caller's own
    // `Authorization` header upstream verbatim (§4.3). So the layer is
    // applied to `management_routes` before `nest_service` pulls the proxy
    // in underneath it.
    let management_routes = management_routes
        .layer(axum::middleware::from_fn_with_state(auth_state, auth::auth_middleware));

    // `proxy_routes` carries its own internal state and is fully resolved to
    // `Router<()>`; `nest_service` mounts it under the configured prefix
    // without forcing it to share `management_routes`' `Arc<AppState>`.
    let app = management_routes
        .nest_service(&format!("/{}", config.proxy_prefix), proxy_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("GOWA Manager listening on http://{addr}");

    let shutdown_instance_manager = instance_manager.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Forceful teardown of every tracked child (§5). Persisted status is
    // left untouched so a restart of the manager itself resumes them.
    shutdown_instance_manager.shutdown_all().await;
    info!("GOWA Manager stopped");

    Ok(())
}

/// Waits for Ctrl-C or, on Unix, SIGTERM.
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, stopping supervised processes");
}
