//! Startup glue shared by the `tileindex-*` binaries.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tileindex_core::config::{Config, Settings};
use tileindex_store::{LanceQueue, LanceTileRegistry, LanceVectorStore};

/// `RUST_LOG` wins; otherwise `info`.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}

pub fn load_settings() -> Result<Settings> {
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {}", e);
        e
    })?;
    Ok(config.settings()?)
}

pub struct Stores {
    pub registry: Arc<LanceTileRegistry>,
    pub queue: Arc<LanceQueue>,
}

impl Stores {
    pub async fn open(settings: &Settings) -> Result<Self> {
        let uri = settings.store.uri_path().to_string_lossy().into_owned();
        let registry = LanceTileRegistry::open(&uri, &settings.store.registry_table).await?;
        let queue = LanceQueue::open(&uri, &settings.store.queue_table, settings.worker.visibility_timeout()).await?;
        tracing::info!(uri = %uri, "opened tile store");
        Ok(Self { registry: Arc::new(registry), queue: Arc::new(queue) })
    }

    pub async fn open_vectors(settings: &Settings) -> Result<Arc<LanceVectorStore>> {
        let uri = settings.store.uri_path().to_string_lossy().into_owned();
        let vectors = LanceVectorStore::open(&uri, &settings.store.vector_table, settings.embedder.dim).await?;
        Ok(Arc::new(vectors))
    }
}

pub fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}") {
        pb.set_style(style);
    }
    pb
}

/// Cancelled on the first Ctrl-C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, finishing current batch");
            child.cancel();
        }
    });
    token
}
