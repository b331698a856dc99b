use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use beach_pier::{
    registry::ConnectHandler, telemetry, ChannelConfig, SessionEvent, SessionRegistry,
};

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Long-polling fallback transport server (echo application)"
)]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: SocketAddr,

    /// URL prefix the channel endpoints live under.
    #[arg(long, env = "BEACH_PIER_BASE", default_value = "/channel")]
    base: String,

    /// Comma-separated host prefixes advertised for subdomain sharding.
    #[arg(long, env = "BEACH_PIER_HOST_PREFIXES", value_delimiter = ',')]
    host_prefixes: Vec<String>,

    /// Seconds between keep-alive noops on an idle back channel.
    #[arg(long, env = "BEACH_PIER_KEEP_ALIVE_SECS", default_value_t = 20)]
    keep_alive_secs: u64,

    /// Seconds a session survives without any back channel bound.
    #[arg(long, env = "BEACH_PIER_SESSION_TIMEOUT_SECS", default_value_t = 30)]
    session_timeout_secs: u64,

    /// Default log filter; RUST_LOG wins when set.
    #[arg(long, env = "BEACH_PIER_LOG", default_value = "info,beach_pier=debug")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_filter.clone());
    telemetry::init_tracing(&filter);

    let config = ChannelConfig {
        base: cli.base.clone(),
        host_prefixes: cli.host_prefixes.clone(),
        keep_alive_interval: Duration::from_secs(cli.keep_alive_secs),
        session_timeout_interval: Duration::from_secs(cli.session_timeout_secs),
    };

    let prometheus = install_metrics_recorder()?;
    let registry = SessionRegistry::new(config, echo_handler());

    info!(
        listen_addr = %cli.listen_addr,
        base = %registry.config().base,
        keep_alive_secs = cli.keep_alive_secs,
        session_timeout_secs = cli.session_timeout_secs,
        "starting beach-pier"
    );

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus);
    let app = Router::new()
        .merge(beach_pier::router(registry))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen_addr)
        .await
        .context("failed to bind listener")?;
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Demo application: echo every map and message back on the same session.
fn echo_handler() -> ConnectHandler {
    Arc::new(|session, mut events| {
        tokio::spawn(async move {
            info!(
                session_id = %session.id(),
                address = %session.address(),
                app_version = ?session.app_version(),
                "channel session opened"
            );
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Map(map) => {
                        let _ = session.send(json!(map)).await;
                    }
                    SessionEvent::Message(message) => {
                        let _ = session.send(message).await;
                    }
                    SessionEvent::StateChanged { .. } => {}
                    SessionEvent::Closed { reason } => {
                        info!(session_id = %session.id(), reason, "channel session closed");
                        break;
                    }
                }
            }
        });
    })
}
