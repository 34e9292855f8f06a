mod config;
mod error;
mod handler;
mod plugins;
mod registry;
mod routes;
mod scheduler;
mod startup;
mod state;
mod translator;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::task::JoinSet;
use tracing::info;

use config::AppConfig;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Config is loaded before the subscriber is installed so its debug
    // flag can pick the default filter; RUST_LOG still wins.
    let config_path = match config::find_config_path() {
        Some(path) => path,
        None => {
            eprintln!("no config file found; set TLSERVER_CONFIG_PATH or create ./config.toml");
            std::process::exit(1);
        }
    };
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {:#}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    let default_filter = default_log_filter(config.debug);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
    info!("loaded configuration from {}", config_path.display());

    // Every backend is built and validated before any listener binds.
    let registry = match startup::build_registry(&config).await {
        Ok(registry) => registry,
        Err(errors) => {
            startup::log_report(&errors);
            std::process::exit(1);
        }
    };

    let host = config.host.clone();
    let root_port = config.root_port;
    let state = AppState::new(config, registry);

    let mut servers = JoinSet::new();

    for port in state.registry.ports().collect::<Vec<_>>() {
        let backend = state
            .registry
            .resolve_port(port)
            .expect("port registered at startup")
            .clone();
        let app = routes::legacy_routes(state.clone(), backend);
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("legacy listener on {}", addr);
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        });
    }

    let app = routes::api_routes(state.clone());
    let addr: SocketAddr = format!("{host}:{root_port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{root_port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("api listener on {}", addr);
    servers.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    info!("hello, starting up");
    while let Some(served) = servers.join_next().await {
        served.context("server task panicked")??;
    }
    info!("goodbye, shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal; beginning graceful shutdown");
}

fn default_log_filter(debug: bool) -> &'static str {
    if debug {
        "tlserver=debug,tower_http=debug"
    } else {
        "tlserver=info,tower_http=info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_raises_default_log_filter() {
        assert_eq!(default_log_filter(true), "tlserver=debug,tower_http=debug");
        assert_eq!(default_log_filter(false), "tlserver=info,tower_http=info");
    }
}
