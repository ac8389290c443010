use crate::config::{self, Settings};
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    /// Overrides `GATEWAY_CONFIG_PATH` when set.
    pub config_path: Option<std::path::PathBuf>,
}

/// Gateway lifecycle: init → initial table build → watch → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut settings = Settings::from_env();
    if let Some(path) = args.config_path {
        settings.config_path = path;
    }
    info!(
        "bootstrap: starting, port={}, config={}",
        settings.port,
        settings.config_path.display()
    );

    let state = GatewayState::new(settings).await?;

    // Initial table build. A failed first build is not fatal: the
    // gateway serves 503 until a valid config lands, and /startupz
    // reports the attempt either way.
    if let Err(e) = state.supervisor.rebuild() {
        error!("bootstrap: initial config load failed: {}", e);
    }

    let shutdown = Arc::new(Notify::new());
    let watcher = config::watcher::start(
        state.settings.config_path.clone(),
        state.supervisor.clone(),
        shutdown.clone(),
    );

    let server_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_server(state, shutdown).await }
    });

    wait_for_shutdown().await;
    shutdown.notify_waiters();

    // Probes stop and config rebuilds are ignored during shutdown.
    state.health.shutdown();
    state.limiter.shutdown();
    let _ = watcher.await;

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("server: exited with error: {}", e),
        Err(e) => error!("server: task error: {}", e),
    }

    info!("bootstrap: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }
}
