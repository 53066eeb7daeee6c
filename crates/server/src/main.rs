use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matchflow_core::{
    config::ServiceConfig, create_notification_system, load_config, validate_config,
    AnalysisClient, DetectionClient, HttpAnalysisClient, HttpDetectionClient,
    HttpIngestionClient, IngestionClient, LeaseStore, MatchReconciler, MatchStore,
    NotificationStore, SqliteLeaseStore, SqliteMatchStore, SqliteNotificationStore, StageClientError,
    StageEngine, StageServices,
};
use matchflow_server::{api::create_router, state::AppState};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

/// Build the client for one configured service, logging and skipping failures.
fn build_client<C>(
    name: &str,
    config: Option<&ServiceConfig>,
    build: impl FnOnce(&ServiceConfig) -> Result<C, StageClientError>,
) -> Option<C> {
    let Some(config) = config else {
        info!("No {} service configured, stage disabled", name);
        return None;
    };

    match build(config) {
        Ok(client) => {
            info!("Initializing {} client at {}", name, config.url);
            Some(client)
        }
        Err(e) => {
            error!("Failed to create {} client: {}", name, e);
            None
        }
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("matchflow {}", VERSION);

    // Determine config path
    let config_path = std::env::var("MATCHFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(config_hash = &config_hash[..16], "Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    // Stores share one SQLite file
    let match_store: Arc<dyn MatchStore> = Arc::new(
        SqliteMatchStore::new(&config.database.path).context("Failed to create match store")?,
    );
    info!("Match store initialized");

    let lease_store: Arc<dyn LeaseStore> = Arc::new(
        SqliteLeaseStore::new(&config.database.path).context("Failed to create lease store")?,
    );
    info!("Lease store initialized");

    let notification_store: Arc<dyn NotificationStore> = Arc::new(
        SqliteNotificationStore::new(&config.database.path)
            .context("Failed to create notification store")?,
    );
    info!("Notification store initialized");

    // Create notification system and spawn the outbox writer
    let (notification_handle, notification_writer) = create_notification_system(
        Arc::clone(&notification_store),
        config.notifications.buffer_size,
    );
    let writer_handle = tokio::spawn(notification_writer.run());

    // Stage service clients; a missing one disables its stage
    let services = StageServices {
        ingestion: build_client(
            "ingestion",
            config.services.ingestion.as_ref(),
            HttpIngestionClient::new,
        )
        .map(|c| Arc::new(c) as Arc<dyn IngestionClient>),
        detection: build_client(
            "detection",
            config.services.detection.as_ref(),
            HttpDetectionClient::new,
        )
        .map(|c| Arc::new(c) as Arc<dyn DetectionClient>),
        analysis: build_client(
            "analysis",
            config.services.analysis.as_ref(),
            HttpAnalysisClient::new,
        )
        .map(|c| Arc::new(c) as Arc<dyn AnalysisClient>),
    };

    let engine = Arc::new(StageEngine::new(
        match_store,
        lease_store,
        services,
        config.stages.policies(),
        Arc::new(notification_handle.clone()),
        config.reconciler.lease_ttl(),
    ));

    // Create reconciler if enabled
    let reconciler = if config.reconciler.enabled {
        let reconciler = MatchReconciler::new(config.reconciler.clone(), Arc::clone(&engine));
        reconciler.start();
        info!(
            tick_interval_ms = config.reconciler.tick_interval_ms,
            "Match reconciler started"
        );
        Some(Arc::new(reconciler))
    } else {
        info!("Reconciler disabled in config");
        None
    };

    // Create app state
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&engine),
        reconciler.clone(),
        notification_store,
    ));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop reconciler if running
    if let Some(ref reconciler) = reconciler {
        info!("Stopping reconciler...");
        reconciler.stop().await;
        info!("Reconciler stopped");
    }

    info!("Server shutting down...");

    // The engine and reconciler hold notification handles; drop them so the
    // writer's channel closes and it drains what is left.
    drop(reconciler);
    drop(engine);
    drop(notification_handle);

    let _ = writer_handle.await;
    info!("Notification writer stopped");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
