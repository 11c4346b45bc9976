mod auth;
mod config;
mod git;
mod http;
mod lfs;
mod metrics;
mod store;
mod vfs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{AccessPolicy, AllowAll};
use crate::config::Config;
use crate::git::{ProcessExecutor, RepoResolver};
use crate::lfs::LfsHandler;
use crate::metrics::MetricsRegistry;
use crate::store::{ObjectStore, S3Store};
use crate::vfs::{MountManager, StoreFs};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitdock", version, about = "Git smart-HTTP + LFS server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitdock/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers. Constructed once at
/// startup; nothing in here is ambient or mutable configuration.
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: Arc<RepoResolver>,
    pub executor: Arc<ProcessExecutor>,
    /// LFS batch handler; present only when an object store is configured.
    pub lfs: Option<Arc<LfsHandler>>,
    /// Capability check consulted before every pack or batch operation.
    pub policy: Arc<dyn AccessPolicy>,
    pub metrics: MetricsRegistry,
    pub mounts: Arc<MountManager>,
    /// Shared store client, used directly by health checks.
    pub store: Option<Arc<dyn ObjectStore>>,
}

// ---------------------------------------------------------------------------
// Store / mount setup
// ---------------------------------------------------------------------------

struct StorageSetup {
    store: Option<Arc<dyn ObjectStore>>,
    lfs: Option<Arc<LfsHandler>>,
    mounts: Arc<MountManager>,
    mounted_fs: Option<Arc<StoreFs>>,
}

/// Build the object-store client, the LFS handler, and (when configured)
/// mount the bucket's repository prefix over `<root>/repositories`.
async fn setup_storage(config: &Config) -> Result<StorageSetup> {
    let mounts = Arc::new(MountManager::new());

    let Some(s3) = &config.storage.s3 else {
        tokio::fs::create_dir_all(config.repositories_dir())
            .await
            .context("failed to create repositories directory")?;
        return Ok(StorageSetup {
            store: None,
            lfs: None,
            mounts,
            mounted_fs: None,
        });
    };

    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::build(s3).await?);

    let lfs = Arc::new(LfsHandler::new(
        Arc::clone(&store),
        s3.lfs_prefix.clone(),
        Duration::from_secs(s3.presigned_url_ttl),
        config.lfs.check_existing_on_upload,
    ));

    let mounted_fs = if s3.mount_repositories {
        let fs = Arc::new(StoreFs::new(
            Arc::clone(&store),
            s3.repositories_prefix.clone(),
            config.vfs.max_cache_bytes,
        ));
        let repos_dir = config.repositories_dir();
        tracing::info!(
            bucket = %s3.bucket,
            mountpoint = %repos_dir.display(),
            "mounting object store over repositories"
        );
        mounts.mount(&repos_dir, Arc::clone(&fs)).await?;
        Some(fs)
    } else {
        tokio::fs::create_dir_all(config.repositories_dir())
            .await
            .context("failed to create repositories directory")?;
        None
    };

    Ok(StorageSetup {
        store: Some(store),
        lfs: Some(lfs),
        mounts,
        mounted_fs,
    })
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    // The middleware chain wraps the protocol core: access logging outermost,
    // then response compression and transparent request decompression.
    let app = http::handler::create_router(Arc::clone(&state))
        .layer(tower_http::decompression::RequestDecompressionLayer::new())
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitdock");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Object store, LFS, mount ----
    let storage = setup_storage(&config).await?;

    // Sample the mount cache size into the gauge while mounted.
    if let Some(fs) = &storage.mounted_fs {
        let fs = Arc::clone(fs);
        let gauge = metrics.metrics.vfs_cache_bytes.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                gauge.set(fs.cached_bytes() as i64);
            }
        });
    }

    // ---- App state ----
    let state = Arc::new(AppState {
        resolver: Arc::new(RepoResolver::new(config.repositories_dir(), &config.git)),
        executor: Arc::new(ProcessExecutor::new(&config.git)),
        lfs: storage.lfs,
        policy: Arc::new(AllowAll),
        metrics,
        mounts: Arc::clone(&storage.mounts),
        store: storage.store,
        config: Arc::clone(&config),
    });

    // ---- Serve until shutdown ----
    let result = run_http_server(Arc::clone(&state)).await;

    // ---- Teardown: flush and release the mount ----
    if let Err(err) = storage.mounts.unmount().await {
        tracing::error!(error = %err, "failed to unmount store-backed repositories");
    }

    result?;
    tracing::info!("gitdock shut down cleanly");
    Ok(())
}
