//! DVR playback server
//!
//! Reads the reverse-engineered TPS recording format off a removable
//! volume (master index + 256 MiB containers of interleaved H.265 and
//! G.711) and serves it to a browser player over HTTP + WebSocket with
//! random-access seeking.

#![allow(dead_code)]

mod cache;
mod config;
mod config_file;
mod error;
mod format;
mod hevc;
mod http;
#[cfg(test)]
mod integration;
mod seek;
mod state;
mod storage;
mod stream;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Options, ServerConfig, PORT_SEARCH_SPAN};
use crate::config_file::{Settings, SETTINGS_FILE};
use crate::error::{DvrError, Result};
use crate::http::create_router;
use crate::state::AppState;

const APP_NAME: &str = "dvr-server";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Options::parse();
    init_logging(opts.debug);

    tracing::info!("{} v{} starting", APP_NAME, VERSION);

    let workdir = std::env::current_dir()?;
    let config = ServerConfig::from_options(&opts, workdir.clone());

    let mut settings = Settings::load(&workdir.join(SETTINGS_FILE));
    if !opts.path.is_empty() {
        settings.storage_path = opts.path.clone();
    }

    let state = Arc::new(AppState::new(config.clone(), settings.clone())?);

    // Mount the configured volume, if any. A missing medium at startup is
    // not fatal; the operator mounts one through the settings UI later.
    if !settings.storage_path.is_empty() {
        let path = settings.storage_path.clone();
        match state.mount_volume(Path::new(&path)) {
            Ok(manager) => {
                state.update_settings(|s| s.remember_path(&path));
                state.spawn_cache_build(manager);
            }
            Err(e) => tracing::warn!(path, error = %e, "initial volume not mounted"),
        }
    }

    let app = create_router(state.clone());

    let (listener, port) = bind_listener(&config).await?;
    tracing::info!("listening on http://{}", config.socket_addr(port));

    if config.open_browser {
        let url = format!("http://{}", config.socket_addr(port));
        if let Err(e) = webbrowser::open(&url) {
            tracing::warn!(error = %e, "browser not opened");
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| DvrError::Config(format!("server error: {}", e)))?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Bind the first free port in `[port, port + PORT_SEARCH_SPAN]`.
async fn bind_listener(config: &ServerConfig) -> Result<(tokio::net::TcpListener, u16)> {
    let last = config.port.saturating_add(PORT_SEARCH_SPAN);
    for port in config.port..=last {
        match tokio::net::TcpListener::bind(config.socket_addr(port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                tracing::debug!(port, error = %e, "port unavailable");
            }
        }
    }
    Err(DvrError::Config(format!(
        "no free port in {}..={}",
        config.port, last
    )))
}

fn init_logging(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
