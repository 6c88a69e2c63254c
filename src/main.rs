//! Lead pipeline service.
//!
//! Archives raw analytics payloads, normalizes them into sessions, scores
//! leads, reconciles daily metrics across sources and asks LLM providers for
//! insights. Work moves between stages through a persisted queue drained by a
//! background worker pool.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use api::{router, AppState};
use clickhouse_client::{ClickHouseClient, ClickHouseConfig};
use store::{Store, StoreConfig};
use telemetry::{health, init_tracing, TracingConfig};
use worker::{
    mirror_channel, LedgerMirror, LedgerMirrorConfig, LedgerSink, Pipeline, PipelineConfig,
    WorkerConfig, WorkerScheduler,
};

/// Application configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default)]
    server: ServerConfig,

    #[serde(default)]
    log: TracingConfig,

    #[serde(default)]
    store: StoreConfig,

    /// Optional ledger and metrics mirror
    #[serde(default)]
    clickhouse: ClickHouseConfig,

    #[serde(default)]
    pipeline: PipelineConfig,

    #[serde(default)]
    worker: WorkerConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = load_config()?;
    init_tracing(&config.log.clone().with_env_overrides());

    info!("Starting lead pipeline v{}", env!("CARGO_PKG_VERSION"));

    config
        .pipeline
        .validate()
        .context("Invalid pipeline configuration")?;

    // Relational store holds every layer, the queue and the ledger
    let store = Store::connect(config.store.clone())
        .await
        .context("Failed to open store")?;
    store::init_schema(&store)
        .await
        .context("Failed to initialize store schema")?;

    if store::health::check_connection(&store).await {
        health().store.set_healthy();
        info!("Store connection: healthy");
    } else {
        health().store.set_unhealthy("Connection failed");
        error!("Store connection: unhealthy");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ledger entries are mirrored to ClickHouse when enabled
    let mut ledger = LedgerSink::new(store.clone());
    let mut mirror = None;
    if config.clickhouse.enabled {
        let clickhouse = ClickHouseClient::new(config.clickhouse.clone());
        if let Err(e) = clickhouse_client::health::init_schema(&clickhouse).await {
            // Schema might already exist
            error!("Failed to initialize ClickHouse schema: {}", e);
        }
        check_clickhouse(&clickhouse).await;

        let (sender, receiver) = mirror_channel();
        ledger = ledger.with_mirror(sender);
        let mirror_config = LedgerMirrorConfig {
            batch_size: config.clickhouse.batch_size.max(1),
            flush_interval: Duration::from_secs(config.clickhouse.flush_interval_secs.max(1)),
            ..Default::default()
        };
        mirror = Some((
            clickhouse.clone(),
            LedgerMirror::new(receiver, clickhouse, mirror_config),
        ));
    } else {
        health().clickhouse.set_disabled();
        info!("ClickHouse mirror disabled");
    }

    let pipeline = Pipeline::builder(store.clone(), config.pipeline.clone())
        .ledger(ledger)
        .build()
        .context("Failed to build pipeline")?;

    let mut scheduler = WorkerScheduler::new(config.worker.clone(), pipeline.clone(), shutdown_rx);
    if let Some((clickhouse, ledger_mirror)) = mirror {
        scheduler = scheduler.with_clickhouse(clickhouse, ledger_mirror);
    }
    let worker_handles = scheduler.start();

    let app = router(AppState::new(pipeline));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down...");

    // Workers finish their current task; the ledger mirror drains once the
    // pipeline (and with it every ledger sender) is dropped.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        if let Err(e) = handle.await {
            warn!("Background worker ended abnormally: {}", e);
        }
    }

    store.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("PIPELINE")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Flat overrides for the settings deployments change most
    if let Ok(url) = std::env::var("PIPELINE_STORE_URL") {
        config.store.url = url;
    }
    if let Ok(url) = std::env::var("PIPELINE_CLICKHOUSE_URL") {
        config.clickhouse.url = url;
        config.clickhouse.enabled = true;
    }
    if let Ok(username) = std::env::var("PIPELINE_CLICKHOUSE_USERNAME") {
        config.clickhouse.username = Some(username);
    }
    if let Ok(password) = std::env::var("PIPELINE_CLICKHOUSE_PASSWORD") {
        config.clickhouse.password = Some(password);
    }

    Ok(config)
}

async fn check_clickhouse(clickhouse: &ClickHouseClient) {
    if clickhouse_client::health::check_connection(clickhouse).await {
        health().clickhouse.set_healthy();
        info!("ClickHouse connection: healthy");
    } else {
        health().clickhouse.set_unhealthy("Connection failed");
        error!("ClickHouse connection: unhealthy");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
