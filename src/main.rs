use previewd::api::{ApiServer, PKG_NAME, VERSION};
use previewd::config::Config;
use previewd::lifecycle::LifecycleManager;
use previewd::renderer::NginxRenderer;
use previewd::store::{KvStore, MemoryStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewd=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("previewd.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let store: Arc<dyn KvStore> = if config.store.in_memory {
        warn!("Using in-memory store; allocations are lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(&config.store.path).map_err(|e| {
            anyhow::anyhow!("Failed to open store '{}': {}", config.store.path.display(), e)
        })?)
    };

    let renderer = NginxRenderer::from_config(&config.renderer)
        .map_err(|e| anyhow::anyhow!("Failed to initialise renderer: {}", e))?;

    let lifecycle = Arc::new(LifecycleManager::new(
        store,
        config.ports.range()?,
        Arc::new(renderer),
    ));

    let addr = config.server.socket_addr()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api = Arc::new(ApiServer::new(
        lifecycle,
        config.renderer.base_domain.clone(),
        shutdown_rx,
    ));

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run(addr).await {
            error!(error = %e, "API server error");
        }
    });

    wait_for_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

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
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting preview provisioner");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        start = config.ports.start,
        end = config.ports.end,
        "Port pool range"
    );
    info!(
        path = %config.store.path.display(),
        in_memory = config.store.in_memory,
        "Store settings"
    );
    info!(
        output_dir = %config.renderer.output_dir.display(),
        template = ?config.renderer.template,
        reload_command = ?config.renderer.reload_command,
        base_domain = %config.renderer.base_domain,
        "Renderer settings"
    );
}
