//! portfwd agent
//!
//! Binds a local listener and forwards every accepted connection to a remote
//! port through a direct session, until Ctrl-C or the first terminating error.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use portfwd::{DirectSession, ForwarderConfig, PortForwarder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTFWD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        name = %config.name,
        remote_host = %config.remote_host,
        remote_port = config.remote_port,
        buffer_size = config.buffer_size,
        "Configuration loaded"
    );

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };
    info!(bind_addr = %listener.local_addr()?, "Listener bound");

    let session = Arc::new(DirectSession::with_timeout(
        config.remote_host.clone(),
        config.connect_timeout,
    ));
    let forwarder_config = ForwarderConfig {
        buffer_size: config.buffer_size,
        ..ForwarderConfig::default()
    };
    let forwarder = PortForwarder::with_config(
        session,
        config.name.clone(),
        config.remote_port,
        forwarder_config,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_cancel.cancel();
    });

    let reason = forwarder.forward_to_listener(&cancel, &listener).await;

    // Wind down any handlers still relaying.
    cancel.cancel();

    // Each handler closes two streams, each bounded by the close timeout.
    if !forwarder.wait_idle(forwarder.config().close_timeout * 2).await {
        warn!(
            active = forwarder.stats().connections_active.load(Ordering::Relaxed),
            "Handlers still closing at exit"
        );
    }

    let stats = forwarder.stats();
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        bytes_to_remote = stats.bytes_to_remote.load(Ordering::Relaxed),
        bytes_from_remote = stats.bytes_from_remote.load(Ordering::Relaxed),
        "Forwarding stopped"
    );

    if reason.is_cancelled() {
        Ok(())
    } else {
        error!(error = %reason, reason = reason.reason_code(), "Forwarding failed");
        Err(reason.into())
    }
}
