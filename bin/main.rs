//! livestatus binary.
#![allow(unreachable_pub, dead_code, clippy::missing_const_for_fn, clippy::option_if_let_else)]
//!
//! Two modes:
//! - `watch`: follows an organization's live status feed and prints every
//!   notification on stdout
//! - `serve`: runs the per-organization notification relay
//!
//! ## Usage
//!
//! ```bash
//! # Relay under /api/v1 on the default port
//! livestatus serve --bind-addr 127.0.0.1:8000
//!
//! # Follow org-1
//! livestatus watch --organization org-1
//!
//! # Start with config file
//! livestatus --config livestatus.toml watch
//! ```

mod config;

use axum::Router;
use livestatus::{
    ChannelEvent, LiveChannel, Payload, SessionStore, ViewerSession, WsTransport, relay,
};
use tokio::{signal, sync::broadcast::error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, Run};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    match Config::load()? {
        Run::Watch(config) => watch(config).await,
        Run::Serve(config) => serve(config).await,
    }
}

/// Follows the configured organization until shutdown.
async fn watch(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(?config, "loaded configuration");
    let channel_config = config.channel()?;
    let organization = config.organization()?;

    let store = SessionStore::new();
    let channel = LiveChannel::spawn(channel_config, WsTransport, store.subscribe());
    let mut events = channel.handle().subscribe();

    store.login(ViewerSession::new(config.viewer.clone(), Some(organization)));

    let printer = async {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Opened { organization, endpoint }) => {
                    info!(%organization, %endpoint, "live feed connected");
                }
                Ok(ChannelEvent::Closed { reason }) => {
                    info!(reason = %reason, "live feed disconnected");
                }
                Ok(ChannelEvent::Message { payload: Payload::Text(text), .. }) => {
                    println!("{text}");
                }
                Ok(ChannelEvent::Message { payload: Payload::Binary(bytes), .. }) => {
                    info!(len = bytes.len(), "binary notification skipped");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        () = printer => {}
        () = shutdown_signal() => {}
    }

    store.logout();
    channel.shutdown().await?;
    info!("watch stopped");
    Ok(())
}

/// Serves the relay until shutdown.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(?config, "loaded configuration");
    let router = Router::new().nest("/api/v1", relay::router(relay::Relay::new()));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "starting relay");

    // Serve with graceful shutdown
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    info!("relay stopped");
    Ok(())
}

/// Waits for SIGINT or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}
