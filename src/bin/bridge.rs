//! Clawbridge server binary
//!
//! Boot order: load config, wait for the gateway's TCP port, establish the
//! gateway session, then serve HTTP until a termination signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use clawbridge::config::Config;
use clawbridge::lifecycle::Lifecycle;
use clawbridge::server::{build_router, AppState};
use clawbridge::session::{wait_for_gateway, GatewaySession};

// ---- CLI ----

#[derive(Parser)]
#[command(
    name = "clawbridge",
    about = "HTTP/SSE bridge for the OpenClaw agent gateway"
)]
struct Args {
    /// Bind address
    #[arg(long, env = "BRIDGE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port
    #[arg(long, short, env = "BRIDGE_PORT", default_value = "8080")]
    port: u16,
}

// ---- Main ----

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_env()?;
    config.validate()?;

    init_tracing(&config);

    info!("Starting {} {}", clawbridge::NAME, clawbridge::VERSION);
    info!("Gateway URL: {}", config.gateway.url);
    if config.server.auth_token.is_none() {
        warn!("BRIDGE_AUTH_TOKEN not set; bridge routes are unauthenticated");
    }

    // The gateway may still be booting; wait for its port before dialling
    let (host, gateway_port) = config.gateway.ready_addr()?;
    info!("Waiting for gateway at {}:{}", host, gateway_port);
    wait_for_gateway(
        &host,
        gateway_port,
        Duration::from_secs(config.gateway.ready_timeout_secs),
    )
    .await
    .context("gateway never became ready")?;

    let session = GatewaySession::spawn(config.gateway.clone());
    let session_key = session
        .wait_ready()
        .await
        .context("gateway handshake failed")?;
    info!("Gateway session ready (sessionKey: {})", session_key);

    let lifecycle = Arc::new(Lifecycle::new());
    let state = AppState {
        session: session.clone(),
        lifecycle: lifecycle.clone(),
        auth_token: config.server.auth_token.clone(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Bridge listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Listener has stopped accepting; finish teardown in order
    lifecycle.begin_shutdown();
    session.close();
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves when SIGTERM or Ctrl+C arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
