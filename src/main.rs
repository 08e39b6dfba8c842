use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod bootstrap;
mod breaker;
mod config;
mod dns;
mod error;
mod facade;
mod health;
mod profiles;
mod providers;
mod registry;
mod router;
mod types;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omnigate=info,tower_http=warn,hickory_server=warn".into()),
        )
        .init();

    // Load config: explicit path wins, then the conventional file, then
    // environment-only (credentials and zones all come from env anyway).
    let config = match std::env::var("OMNIGATE_CONFIG").map(PathBuf::from) {
        Ok(path) => Config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        Err(_) => {
            let default = PathBuf::from("/etc/omnigate/config.toml");
            if default.exists() {
                Config::load(&default)?
            } else {
                warn!("no config file found; running from environment only");
                Config::from_env()?
            }
        }
    };

    let zone = config.server.zone.clone();
    let tunnel_zone = config.tunnel_zone();
    let http_port = config.server.http_port();
    let dns_port = config.server.dns_port();
    let shell_port = config.server.shell_port();

    let (state, mut health) = bootstrap::build(config)?;
    let state = Arc::new(state);

    health.start();
    // Abort before any port opens if a transport cannot reach a model; exit
    // code is nonzero through the error return.
    bootstrap::validate_transports(&state).context("startup validation failed")?;
    let sweeper = state.sessions.spawn_sweeper();

    let http_addr: SocketAddr = format!("0.0.0.0:{http_port}").parse()?;
    let dns_addr: SocketAddr = format!("0.0.0.0:{dns_port}").parse()?;
    let shell_addr: SocketAddr = format!("0.0.0.0:{shell_port}").parse()?;

    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding http on {http_addr}"))?;
    let dns_socket = tokio::net::UdpSocket::bind(dns_addr)
        .await
        .with_context(|| format!("binding dns on {dns_addr}"))?;
    let shell_listener = tokio::net::TcpListener::bind(shell_addr)
        .await
        .with_context(|| format!("binding shell on {shell_addr}"))?;

    info!(%http_addr, "http listening");
    info!(%dns_addr, %zone, tunnel = %tunnel_zone, "dns listening");
    info!(%shell_addr, "shell listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let http_app = api::http::router(Arc::clone(&state))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(trace_layer);

    let dns_handler = dns::DnsHandler::new(
        Arc::clone(&state.chat),
        Arc::clone(&state.tunnel),
        &zone,
        &tunnel_zone,
    );

    tokio::select! {
        result = axum::serve(http_listener, http_app) => {
            result.context("http server error")?;
        }
        result = dns::serve(dns_socket, dns_handler) => {
            result?;
        }
        result = api::shell::serve(shell_listener, Arc::clone(&state)) => {
            result.context("shell server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    health.stop();
    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
