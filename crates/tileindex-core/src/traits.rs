use async_trait::async_trait;
use image::RgbImage;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Delivery, DeliveryTag, StatusCounts, TileId, TilePage, TileRecord, TileStatus, VectorRow};

/// Durable per-tile status ledger.
///
/// Writes are absolute sets keyed by id, so repeating them is harmless.
/// Implementations map storage failures to `Error::RegistryUnavailable`.
#[async_trait]
pub trait TileRegistry: Send + Sync {
    /// Register tiles. Ids already present are left untouched, status included.
    /// Returns how many records were newly created.
    async fn insert(&self, records: &[TileRecord]) -> Result<usize>;

    /// Set `status` (and `updated_at`) for every listed id that exists.
    /// Returns the number of ids affected.
    async fn set_status(&self, ids: &[TileId], status: TileStatus) -> Result<usize>;

    async fn set_image_path(&self, id: &str, image_path: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<TileRecord>>;

    /// Records ordered by id, optionally filtered by status.
    async fn list(&self, status: Option<TileStatus>, limit: usize, offset: usize) -> Result<TilePage>;

    async fn summary(&self) -> Result<StatusCounts>;

    /// Up to `limit` records last updated at or before `cutoff` (epoch ms), in no particular order.
    async fn expired(&self, cutoff: i64, limit: usize) -> Result<Vec<TileRecord>>;

    async fn delete(&self, ids: &[TileId]) -> Result<usize>;
}

/// Named queues with explicit acknowledgement.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, queue: &str, body: String) -> Result<()>;

    /// Up to `max` messages; waits at most `wait` for the first one and
    /// returns an empty batch on timeout.
    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> Result<Vec<Delivery>>;

    /// Remove delivered messages for good.
    async fn ack(&self, queue: &str, tags: &[DeliveryTag]) -> Result<()>;

    /// Make delivered messages visible again for redelivery.
    async fn nack(&self, queue: &str, tags: &[DeliveryTag]) -> Result<()>;
}

/// Upsert endpoint of the vector store, keyed by tile id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert-or-replace; returns the number of rows written.
    async fn upsert(&self, rows: &[VectorRow]) -> Result<usize>;

    /// Row count, optionally restricted to one tile id.
    async fn count(&self, tile_id: Option<&str>) -> Result<usize>;

    /// Remove the rows of these tiles; returns how many were removed.
    async fn delete(&self, tile_ids: &[TileId]) -> Result<usize>;

    /// Vector length the store accepts, when it is fixed.
    fn dim(&self) -> Option<usize> {
        None
    }
}

/// Image/text embedding backend.
///
/// Both calls return one vector per input, in input order, each of length `dim()`.
pub trait Embedder: Send + Sync {
    fn backend(&self) -> &str;
    fn model(&self) -> &str;
    fn dim(&self) -> usize;
    fn embed_images(&self, images: &[RgbImage]) -> anyhow::Result<Vec<Vec<f32>>>;
    fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}
