//! Execgate server binary

use execgate::admin::{AdminServer, PKG_NAME, VERSION};
use execgate::config::Config;
use execgate::handler::Handler;
use execgate::server::{load_tls_acceptor, AdapterServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("execgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("execgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let handler = Arc::new(Handler::from_config(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let mut server = AdapterServer::new(
        addr,
        Arc::clone(&handler),
        shutdown_rx.clone(),
        config.server.max_body_bytes,
    );

    if let (Some(cert), Some(key)) = (&config.server.tls_cert, &config.server.tls_key) {
        server = server.with_tls(load_tls_acceptor(cert, key)?);
        info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Adapter server error");
        }
    });

    let admin_handle = if config.server.admin_enabled() {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;
        let admin_server = AdminServer::new(admin_addr, shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting adapter");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_enabled() { Some(config.server.admin_port) } else { None },
        tls = config.server.tls_enabled(),
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        working_dir = ?config.backend.working_dir,
        env_vars = config.backend.env.len(),
        timeout_secs = ?config.backend.timeout_secs,
        "Backend configuration"
    );
    info!(
        allow_origin = %config.cors.allow_origin,
        allow_headers = %config.cors.allow_headers,
        allow_methods = %config.cors.allow_methods,
        on_error = config.cors.on_error,
        "CORS settings"
    );
}
