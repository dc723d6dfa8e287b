//! Embedder worker: drains one queue in batches.
//!
//! Per batch, in order:
//! 1. reassert `waiting_for_embedding` for every tile in the batch
//! 2. render each tile; a render failure marks that tile `failed`
//! 3. optionally write renders to the tile cache and record `image_path`
//! 4. one embedding call over the surviving tiles
//! 5. `waiting_for_index` for the survivors
//! 6. upsert vector rows (retried locally); on failure requeue the survivors
//! 7. `indexed` for the survivors
//! 8. ack
//!
//! Registry writes in steps 1, 3 and 5 are best effort. With
//! `require_indexed_before_ack` a failed step 7 withholds the ack and the
//! whole batch is redelivered; otherwise the failure is only logged.
use futures::stream::{self, StreamExt};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tileindex_core::config::{RenderStrategy, WorkerSettings};
use tileindex_core::error::{Error, Result};
use tileindex_core::traits::{Embedder, MessageQueue, TileRegistry, VectorStore};
use tileindex_core::types::{now_millis, Delivery, DeliveryTag, IndexRequest, TileId, TileSource, TileStatus, VectorRow};
use tileindex_render::{TileCache, TileRenderer};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub render_workers: usize,
    pub require_indexed_before_ack: bool,
    pub max_batches: Option<usize>,
    /// Return from `run` on the first empty receive.
    pub stop_when_idle: bool,
    pub retry: RetryPolicy,
}

impl WorkerOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            queue: settings.queue.clone(),
            batch_size: settings.batch_size.max(1),
            batch_timeout: settings.batch_timeout(),
            render_workers: settings.render_workers.max(1),
            require_indexed_before_ack: settings.require_indexed_before_ack,
            max_batches: settings.max_batches,
            stop_when_idle: false,
            retry: RetryPolicy::from_settings(settings),
        }
    }
}

/// Message counts for one batch, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub indexed: usize,
    pub failed: usize,
    pub requeued: usize,
    pub acked: usize,
    /// Undecodable message bodies, acked without touching the registry.
    pub discarded: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: &BatchReport) {
        self.received += other.received;
        self.indexed += other.indexed;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.acked += other.acked;
        self.discarded += other.discarded;
    }
}

struct Job {
    tag: DeliveryTag,
    request: IndexRequest,
}

struct Rendered {
    job: Job,
    image: RgbImage,
    image_path: Option<String>,
}

pub struct EmbedderWorker {
    registry: Arc<dyn TileRegistry>,
    queue: Arc<dyn MessageQueue>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    renderer: Arc<TileRenderer>,
    cache: Option<Arc<TileCache>>,
    options: WorkerOptions,
}

fn tags(jobs: &[&Job]) -> Vec<DeliveryTag> {
    jobs.iter().map(|j| j.tag.clone()).collect()
}

fn ids(jobs: &[&Job]) -> Vec<TileId> {
    jobs.iter().map(|j| j.request.tile_id.clone()).collect()
}

impl EmbedderWorker {
    pub fn new(
        registry: Arc<dyn TileRegistry>,
        queue: Arc<dyn MessageQueue>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        renderer: Arc<TileRenderer>,
        options: WorkerOptions,
    ) -> Self {
        Self { registry, queue, vectors, embedder, renderer, cache: None, options }
    }

    pub fn with_cache(mut self, cache: TileCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// The embedder must produce vectors the store accepts.
    pub fn check_vector_dim(&self) -> Result<()> {
        match self.vectors.dim() {
            Some(expected) if expected != self.embedder.dim() => {
                Err(Error::InvalidConfig(format!(
                    "embedder {}/{} produces {}-d vectors but the vector store holds {}-d vectors",
                    self.embedder.backend(),
                    self.embedder.model(),
                    self.embedder.dim(),
                    expected
                )))
            }
            _ => Ok(()),
        }
    }

    /// Receive and process at most one batch.
    pub async fn run_once(&self) -> Result<BatchReport> {
        self.check_vector_dim()?;
        let deliveries = self
            .queue
            .receive(&self.options.queue, self.options.batch_size, self.options.batch_timeout)
            .await?;
        Ok(self.process_batch(deliveries).await)
    }

    /// Loop until `shutdown` fires, the batch budget is spent or, with
    /// `stop_when_idle`, the queue runs dry. A batch that has been received
    /// always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<BatchReport> {
        self.check_vector_dim()?;
        let mut total = BatchReport::default();
        let mut batches = 0usize;
        tracing::info!(queue = %self.options.queue, backend = self.embedder.backend(), model = self.embedder.model(), "worker started");
        loop {
            if self.options.max_batches.is_some_and(|max| batches >= max) {
                break;
            }
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                r = self.queue.receive(&self.options.queue, self.options.batch_size, self.options.batch_timeout) => r,
            };
            let deliveries = match received {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(queue = %self.options.queue, error = %e, "receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry.delay(1)) => continue,
                    }
                }
            };
            if deliveries.is_empty() {
                if self.options.stop_when_idle {
                    break;
                }
                continue;
            }
            let report = self.process_batch(deliveries).await;
            total.merge(&report);
            batches += 1;
        }
        tracing::info!(
            batches,
            indexed = total.indexed,
            failed = total.failed,
            requeued = total.requeued,
            discarded = total.discarded,
            "worker stopped"
        );
        Ok(total)
    }

    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> BatchReport {
        let mut report = BatchReport { received: deliveries.len(), ..BatchReport::default() };
        if deliveries.is_empty() {
            return report;
        }

        let mut jobs = Vec::with_capacity(deliveries.len());
        let mut poison = Vec::new();
        for d in deliveries {
            match IndexRequest::from_body(&d.body) {
                Ok(request) => jobs.push(Job { tag: d.tag, request }),
                Err(e) => {
                    tracing::warn!(tag = %d.tag, attempt = d.attempt, error = %e, "discarding malformed message");
                    poison.push(d.tag);
                }
            }
        }
        if !poison.is_empty() && self.ack(&poison).await {
            report.discarded += poison.len();
            report.acked += poison.len();
        }
        if jobs.is_empty() {
            return report;
        }

        // 1
        let all: Vec<&Job> = jobs.iter().collect();
        self.best_effort_status(&ids(&all), TileStatus::WaitingForEmbedding).await;

        // 2 + 3
        let (rendered, failed) = self.render_all(jobs).await;
        if !failed.is_empty() {
            self.settle_failed(&failed, &mut report).await;
        }
        for r in &rendered {
            if let Some(path) = &r.image_path {
                if let Err(e) = self.registry.set_image_path(&r.job.request.tile_id, path).await {
                    tracing::warn!(tile_id = %r.job.request.tile_id, error = %e, "could not record image_path");
                }
            }
        }
        if rendered.is_empty() {
            self.log_batch(&report);
            return report;
        }
        let survivors: Vec<&Job> = rendered.iter().map(|r| &r.job).collect();

        // 4
        let vectors = match self.embed(&rendered).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(tiles = survivors.len(), error = %e, "embedding failed, requeueing batch");
                self.requeue(&survivors, &mut report).await;
                self.log_batch(&report);
                return report;
            }
        };

        // 5
        self.best_effort_status(&ids(&survivors), TileStatus::WaitingForIndex).await;

        // 6
        let rows = self.vector_rows(&rendered, vectors);
        let upserted = self.options.retry.run("vector upsert", Error::is_transient, || self.vectors.upsert(&rows)).await;
        if let Err(e) = upserted {
            tracing::error!(tiles = survivors.len(), error = %e, "vector store unavailable, requeueing batch");
            self.requeue(&survivors, &mut report).await;
            self.log_batch(&report);
            return report;
        }

        // 7
        if let Err(e) = self.registry.set_status(&ids(&survivors), TileStatus::Indexed).await {
            if self.options.require_indexed_before_ack {
                tracing::error!(tiles = survivors.len(), error = %e, "indexed status not recorded, withholding ack");
                self.requeue(&survivors, &mut report).await;
                self.log_batch(&report);
                return report;
            }
            tracing::warn!(tiles = survivors.len(), error = %e, "indexed status not recorded, acking anyway");
        }

        // 8
        if self.ack(&tags(&survivors)).await {
            report.acked += survivors.len();
        }
        report.indexed += survivors.len();
        self.log_batch(&report);
        report
    }

    fn log_batch(&self, report: &BatchReport) {
        tracing::info!(
            queue = %self.options.queue,
            received = report.received,
            indexed = report.indexed,
            failed = report.failed,
            requeued = report.requeued,
            discarded = report.discarded,
            "batch done"
        );
    }

    async fn best_effort_status(&self, ids: &[TileId], status: TileStatus) {
        if let Err(e) = self.registry.set_status(ids, status).await {
            tracing::warn!(%status, tiles = ids.len(), error = %e, "registry status write failed");
        }
    }

    async fn ack(&self, tags: &[DeliveryTag]) -> bool {
        match self.queue.ack(&self.options.queue, tags).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(messages = tags.len(), error = %e, "ack failed, messages will be redelivered");
                false
            }
        }
    }

    async fn requeue(&self, jobs: &[&Job], report: &mut BatchReport) {
        match self.queue.nack(&self.options.queue, &tags(jobs)).await {
            Ok(()) => report.requeued += jobs.len(),
            Err(e) => tracing::error!(messages = jobs.len(), error = %e, "nack failed, messages return after their lease"),
        }
    }

    /// Drop any vectors left from an earlier run, mark render failures
    /// `failed` and ack them. If the vectors cannot be dropped, or with
    /// ack-gating the registry write fails, they go back to the queue.
    async fn settle_failed(&self, failed: &[Job], report: &mut BatchReport) {
        report.failed += failed.len();
        let refs: Vec<&Job> = failed.iter().collect();
        let failed_ids = ids(&refs);
        let stale = self.options.retry.run("vector delete", Error::is_transient, || self.vectors.delete(&failed_ids)).await;
        match stale {
            Ok(0) => {}
            Ok(n) => tracing::info!(removed = n, "dropped vectors of tiles that no longer render"),
            Err(e) => {
                tracing::error!(tiles = failed.len(), error = %e, "could not drop stale vectors, requeueing failed tiles");
                self.requeue(&refs, report).await;
                return;
            }
        }
        let written = self.registry.set_status(&failed_ids, TileStatus::Failed).await;
        if let Err(e) = &written {
            tracing::warn!(tiles = failed.len(), error = %e, "could not mark tiles failed");
            if self.options.require_indexed_before_ack {
                self.requeue(&refs, report).await;
                return;
            }
        }
        if self.ack(&tags(&refs)).await {
            report.acked += failed.len();
        }
    }

    fn source_for(&self, request: &IndexRequest) -> Result<TileSource> {
        match (self.renderer.strategy(), request.image_path.as_deref()) {
            (RenderStrategy::Local, Some(path)) if !path.trim().is_empty() => {
                Ok(TileSource::File { path: path.to_string() })
            }
            _ => request.source(),
        }
    }

    /// Render on a bounded pool of blocking tasks, keeping input order.
    async fn render_all(&self, jobs: Vec<Job>) -> (Vec<Rendered>, Vec<Job>) {
        let results: Vec<(Job, Result<(RgbImage, Option<PathBuf>)>)> = stream::iter(jobs)
            .map(|job| {
                let renderer = self.renderer.clone();
                let cache = self.cache.clone();
                let source = self.source_for(&job.request);
                let bbox = job.request.bbox;
                let tile_id = job.request.tile_id.clone();
                async move {
                    let source = match source {
                        Ok(s) => s,
                        Err(e) => return (job, Err(e)),
                    };
                    let task = tokio::task::spawn_blocking(move || -> Result<(RgbImage, Option<PathBuf>)> {
                        let image = renderer.render(&bbox, &source)?;
                        let path = match cache {
                            Some(cache) => match cache.write(&tile_id, &image) {
                                Ok(p) => Some(p),
                                Err(e) => {
                                    tracing::warn!(tile_id = %tile_id, error = %e, "tile cache write failed");
                                    None
                                }
                            },
                            None => None,
                        };
                        Ok((image, path))
                    });
                    let out = match task.await {
                        Ok(r) => r,
                        Err(e) => Err(Error::Render(format!("render task aborted: {}", e))),
                    };
                    (job, out)
                }
            })
            .buffered(self.options.render_workers)
            .collect()
            .await;

        let mut rendered = Vec::new();
        let mut failed = Vec::new();
        for (job, result) in results {
            match result {
                Ok((image, path)) => rendered.push(Rendered {
                    job,
                    image,
                    image_path: path.map(|p| p.to_string_lossy().into_owned()),
                }),
                Err(e) => {
                    tracing::warn!(tile_id = %job.request.tile_id, error = %e, "render failed");
                    failed.push(job);
                }
            }
        }
        (rendered, failed)
    }

    async fn embed(&self, rendered: &[Rendered]) -> Result<Vec<Vec<f32>>> {
        let images: Vec<RgbImage> = rendered.iter().map(|r| r.image.clone()).collect();
        let embedder = self.embedder.clone();
        let expected = images.len();
        let vectors = tokio::task::spawn_blocking(move || embedder.embed_images(&images))
            .await
            .map_err(|e| Error::Embedding(format!("embedding task aborted: {}", e)))?
            .map_err(|e| Error::Embedding(format!("{:#}", e)))?;
        if vectors.len() != expected {
            return Err(Error::Embedding(format!("got {} vectors for {} tiles", vectors.len(), expected)));
        }
        let dim = self.embedder.dim();
        if let Some(v) = vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::DimensionMismatch { expected: dim, got: v.len() });
        }
        Ok(vectors)
    }

    fn vector_rows(&self, rendered: &[Rendered], vectors: Vec<Vec<f32>>) -> Vec<VectorRow> {
        let now = now_millis();
        rendered
            .iter()
            .zip(vectors)
            .map(|(r, vector)| {
                let req = &r.job.request;
                VectorRow {
                    tile_id: req.tile_id.clone(),
                    vector,
                    image_path: r.image_path.clone().or_else(|| req.image_path.clone()),
                    bbox: req.bbox,
                    gid: req.gid,
                    raster_path: req.raster_path.clone(),
                    embedder_backend: Some(self.embedder.backend().to_string()),
                    embedder_model: Some(self.embedder.model().to_string()),
                    run_id: req.run_id.clone(),
                    indexed_at: now,
                }
            })
            .collect()
    }
}
