//! Registry maintenance loop.
//!
//! Each tick republishes up to `ready_limit` tiles sitting in `ready_status`
//! and moves them to `waiting_for_embedding`, then (with a TTL) deletes
//! tiles whose `updated_at` is older than the TTL together with their
//! vectors. Vectors go first; a tile whose vectors could not be dropped
//! stays registered and is retried on the next tick.
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tileindex_core::config::DaemonSettings;
use tileindex_core::error::Result;
use tileindex_core::traits::{TileRegistry, VectorStore};
use tileindex_core::types::{now_millis, TileId, TileStatus};

use crate::publisher::Publisher;

#[derive(Debug, Clone)]
pub struct MaintainerOptions {
    pub interval: Duration,
    pub ready_status: TileStatus,
    pub ready_limit: usize,
    pub ttl: Option<Duration>,
    pub ttl_limit: usize,
    pub max_ticks: Option<usize>,
}

impl MaintainerOptions {
    pub fn from_settings(settings: &DaemonSettings) -> Self {
        Self {
            interval: settings.interval(),
            ready_status: settings.ready_status,
            ready_limit: settings.ready_limit,
            ttl: settings.ttl(),
            ttl_limit: settings.ttl_limit,
            max_ticks: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub expired: usize,
}

impl TickReport {
    pub fn merge(&mut self, other: &TickReport) {
        self.published += other.published;
        self.expired += other.expired;
    }
}

pub struct Maintainer {
    registry: Arc<dyn TileRegistry>,
    vectors: Arc<dyn VectorStore>,
    publisher: Publisher,
    options: MaintainerOptions,
}

impl Maintainer {
    pub fn new(
        registry: Arc<dyn TileRegistry>,
        vectors: Arc<dyn VectorStore>,
        publisher: Publisher,
        options: MaintainerOptions,
    ) -> Self {
        Self { registry, vectors, publisher, options }
    }

    pub fn options(&self) -> &MaintainerOptions {
        &self.options
    }

    /// Republish tiles in the ready status; returns the number of messages published.
    pub async fn publish_ready(&self) -> Result<usize> {
        let status = self.options.ready_status;
        let page = self.registry.list(Some(status), self.options.ready_limit, 0).await?;
        if page.tiles.is_empty() {
            return Ok(0);
        }
        let report = self.publisher.publish_records(&page.tiles).await?;
        if status != TileStatus::WaitingForEmbedding {
            let ids: Vec<TileId> = page.tiles.iter().map(|t| t.id.clone()).collect();
            self.registry.set_status(&ids, TileStatus::WaitingForEmbedding).await?;
        }
        tracing::info!(run_id = %report.run_id, %status, tiles = page.tiles.len(), published = report.published, "published ready tiles");
        Ok(report.published)
    }

    /// Delete tiles last updated at or before `cutoff` (epoch ms) along with
    /// their vectors; returns the number of tiles removed.
    pub async fn expire_before(&self, cutoff: i64) -> Result<usize> {
        let expired = self.registry.expired(cutoff, self.options.ttl_limit).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let ids: Vec<TileId> = expired.into_iter().map(|t| t.id).collect();
        let vectors = self.vectors.delete(&ids).await?;
        let tiles = self.registry.delete(&ids).await?;
        tracing::info!(cutoff, tiles, vectors, "expired tiles");
        Ok(tiles)
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let published = self.publish_ready().await?;
        let expired = match self.options.ttl {
            Some(ttl) => {
                let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
                self.expire_before(now_millis().saturating_sub(ttl_ms)).await?
            }
            None => 0,
        };
        Ok(TickReport { published, expired })
    }

    /// Tick every `interval` until `shutdown` fires or the tick budget is
    /// spent. A failed tick is logged and the loop carries on.
    pub async fn run(&self, shutdown: CancellationToken) -> TickReport {
        let mut total = TickReport::default();
        let mut ticks = 0usize;
        tracing::info!(
            ready_status = %self.options.ready_status,
            interval_ms = self.options.interval.as_millis() as u64,
            ttl_secs = self.options.ttl.map(|t| t.as_secs()),
            "maintenance loop started"
        );
        loop {
            match self.tick().await {
                Ok(report) => total.merge(&report),
                Err(e) => tracing::error!(error = %e, "maintenance tick failed"),
            }
            ticks += 1;
            if self.options.max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }
        tracing::info!(ticks, published = total.published, expired = total.expired, "maintenance loop stopped");
        total
    }
}
