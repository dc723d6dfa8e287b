//! Request publisher.
//!
//! Registers the whole manifest first, routes every entry, then publishes
//! one index request per tile and target queue. Registration is idempotent,
//! so a run that died halfway is recovered by running it again.
use indicatif::ProgressBar;
use std::collections::BTreeMap;
use std::sync::Arc;

use tileindex_core::error::Result;
use tileindex_core::manifest::ManifestEntry;
use tileindex_core::routing::QueueRouter;
use tileindex_core::traits::{MessageQueue, TileRegistry};
use tileindex_core::types::{now_millis, IndexRequest, TileRecord, TileStatus};

/// `<UTC yyyymmddThhmmssZ>_<10 hex chars>`
pub fn new_run_id() -> String {
    let suffix = rand::random::<u64>() & 0xff_ffff_ffff;
    format!("{}_{:010x}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"), suffix)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub run_id: String,
    pub entries: usize,
    /// Tiles newly created in the registry by this run.
    pub registered: usize,
    pub published: usize,
    pub per_queue: BTreeMap<String, usize>,
}

pub struct Publisher {
    registry: Arc<dyn TileRegistry>,
    queue: Arc<dyn MessageQueue>,
    router: QueueRouter,
    progress: Option<ProgressBar>,
}

impl Publisher {
    pub fn new(registry: Arc<dyn TileRegistry>, queue: Arc<dyn MessageQueue>, router: QueueRouter) -> Self {
        Self { registry, queue, router, progress: None }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn publish(&self, entries: &[ManifestEntry], limit: Option<usize>) -> Result<PublishReport> {
        let entries = match limit {
            Some(n) => &entries[..n.min(entries.len())],
            None => entries,
        };
        let run_id = new_run_id();
        let now = now_millis();

        let records = entries.iter().map(|e| e.to_record(now)).collect::<Result<Vec<_>>>()?;
        let registered = self.registry.insert(&records).await?;
        tracing::info!(run_id = %run_id, entries = entries.len(), registered, "registered manifest");

        let requests: Vec<IndexRequest> = entries.iter().map(|e| e.to_request(Some(run_id.clone()))).collect();
        let mut report = self.publish_requests(&requests).await?;
        report.run_id = run_id;
        report.registered = registered;
        Ok(report)
    }

    /// Publish again every tile currently in `status`, built from registry
    /// contents alone (e.g. `waiting_for_index` after a vector store outage).
    pub async fn republish(&self, status: TileStatus, limit: Option<usize>) -> Result<PublishReport> {
        let page = self.registry.list(Some(status), limit.unwrap_or(usize::MAX), 0).await?;
        tracing::info!(%status, tiles = page.tiles.len(), "republishing");
        self.publish_records(&page.tiles).await
    }

    /// One fresh run over already registered tiles; the registry is not written.
    pub async fn publish_records(&self, records: &[TileRecord]) -> Result<PublishReport> {
        let run_id = new_run_id();
        let requests: Vec<IndexRequest> =
            records.iter().map(|r| IndexRequest::from_record(r, Some(run_id.clone()))).collect();
        let mut report = self.publish_requests(&requests).await?;
        report.run_id = run_id;
        Ok(report)
    }

    /// Route everything before the first publish so a routing error leaves
    /// the queues untouched.
    async fn publish_requests(&self, requests: &[IndexRequest]) -> Result<PublishReport> {
        let mut routed = Vec::with_capacity(requests.len());
        for req in requests {
            let queues = self.router.route_request(req).map_err(|e| {
                tracing::error!(tile_id = %req.tile_id, error = %e, "routing failed");
                e
            })?;
            routed.push((req.to_body()?, queues));
        }

        let total: usize = routed.iter().map(|(_, q)| q.len()).sum();
        if let Some(pb) = &self.progress {
            pb.set_length(total as u64);
        }

        let mut report = PublishReport { entries: requests.len(), ..PublishReport::default() };
        for (body, queues) in routed {
            for queue in queues {
                self.queue.publish(&queue, body.clone()).await?;
                *report.per_queue.entry(queue).or_insert(0) += 1;
                report.published += 1;
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
            }
        }
        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        tracing::info!(published = report.published, queues = report.per_queue.len(), "published index requests");
        Ok(report)
    }
}
