//! dp - dynamic TCP proxy
//!
//! Forwards client connections on each configured port to backends chosen
//! from weighted groups, and serves an HTTP control plane that changes the
//! groups at runtime.
//!
//! This service:
//! - Binds one proxy listener per configured port
//! - Picks a backend per connection from the port's active groups
//! - Drains established connections when groups are reactivated
//! - Optionally terminates TLS and re-originates it to backends

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dynamic_proxy::config::{Config, LogFormat};
use dynamic_proxy::{api, Engine, Listener, ListenerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    config.validate()?;

    // Initialize tracing (prefer RUST_LOG, fallback to --verbose)
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level().into()))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting dynamic proxy");
    info!(
        ports = ?config.ports,
        ctl_port = config.ctl_port,
        tls = config.tls_cert.is_some(),
        "Configuration loaded"
    );

    let tls = config.tls_settings()?;
    let engine = Engine::new(config.ports.iter().copied());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start one listener per port
    let mut listener_handles = Vec::new();
    for port in &config.ports {
        let bind_addr = config.proxy_addr(*port).await?;
        let mut listener_config = ListenerConfig::new(bind_addr);
        listener_config.max_connections = config.max_connections;
        listener_config.connect_timeout = config.connect_timeout();
        listener_config.handshake_timeout = config.handshake_timeout();
        listener_config.tls = tls.clone();

        let listener = match Listener::bind(listener_config, engine.clone()).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                error!(bind_addr = %bind_addr, error = %e, "Failed to bind listener");
                return Err(e).with_context(|| format!("Failed to bind {bind_addr}"));
            }
        };

        let mut shutdown_rx = shutdown_rx.clone();
        listener_handles.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = listener.run_until(shutdown).await {
                error!(error = %e, "Listener error");
            }
        }));
    }

    // Build and run the control plane
    let app = api::create_router(engine);

    let ctl_addr = config.ctl_addr().await?;
    let ctl_listener = tokio::net::TcpListener::bind(ctl_addr)
        .await
        .with_context(|| format!("Failed to bind control plane on {ctl_addr}"))?;
    info!(addr = %ctl_addr, "Control plane listening");

    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(ctl_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Stop accepting; spliced connections end with the process
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    for handle in listener_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Listener did not shut down in time");
        }
    }

    info!("Dynamic proxy shutdown complete");
    Ok(())
}
