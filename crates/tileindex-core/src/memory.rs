//! In-process registry, queue and vector store.
//!
//! Same contracts as the LanceDB-backed implementations; used by tests and
//! by single-process runs where nothing has to survive a restart.
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::traits::{MessageQueue, TileRegistry, VectorStore};
use crate::types::{
    now_millis, Delivery, DeliveryTag, StatusCounts, TileId, TilePage, TileRecord, TileStatus, VectorRow,
};

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| Error::Operation(format!("{} lock poisoned", what)))
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tiles: Mutex<BTreeMap<TileId, TileRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TileRegistry for MemoryRegistry {
    async fn insert(&self, records: &[TileRecord]) -> Result<usize> {
        let mut tiles = lock(&self.tiles, "registry")?;
        let mut created = 0;
        for r in records {
            if !tiles.contains_key(&r.id) {
                tiles.insert(r.id.clone(), r.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn set_status(&self, ids: &[TileId], status: TileStatus) -> Result<usize> {
        let mut tiles = lock(&self.tiles, "registry")?;
        let now = now_millis();
        let mut affected = 0;
        for id in ids {
            if let Some(r) = tiles.get_mut(id) {
                r.status = status;
                r.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn set_image_path(&self, id: &str, image_path: &str) -> Result<()> {
        let mut tiles = lock(&self.tiles, "registry")?;
        let r = tiles.get_mut(id).ok_or_else(|| Error::NotFound(format!("tile {}", id)))?;
        r.image_path = Some(image_path.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TileRecord>> {
        Ok(lock(&self.tiles, "registry")?.get(id).cloned())
    }

    async fn list(&self, status: Option<TileStatus>, limit: usize, offset: usize) -> Result<TilePage> {
        let tiles = lock(&self.tiles, "registry")?;
        let matching: Vec<&TileRecord> = tiles.values().filter(|r| status.map_or(true, |s| r.status == s)).collect();
        let total = matching.len();
        let tiles = matching.into_iter().skip(offset).take(limit).cloned().collect();
        Ok(TilePage { tiles, total })
    }

    async fn summary(&self) -> Result<StatusCounts> {
        let tiles = lock(&self.tiles, "registry")?;
        let mut counts = StatusCounts::default();
        for r in tiles.values() {
            counts.add(r.status, 1);
        }
        Ok(counts)
    }

    async fn expired(&self, cutoff: i64, limit: usize) -> Result<Vec<TileRecord>> {
        let tiles = lock(&self.tiles, "registry")?;
        Ok(tiles.values().filter(|r| r.updated_at <= cutoff).take(limit).cloned().collect())
    }

    async fn delete(&self, ids: &[TileId]) -> Result<usize> {
        let mut tiles = lock(&self.tiles, "registry")?;
        Ok(ids.iter().filter(|id| tiles.remove(id.as_str()).is_some()).count())
    }
}

#[derive(Debug, Clone)]
struct Pending {
    body: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<DeliveryTag, Pending>,
}

/// Named FIFO queues with leases that last until ack or nack.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_tag: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for delivery.
    pub fn pending(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map_or(0, |s| s.ready.len()))
            .unwrap_or(0)
    }

    /// Messages delivered but not yet acked or nacked.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map_or(0, |s| s.in_flight.len()))
            .unwrap_or(0)
    }

    fn take_ready(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut queues = lock(&self.queues, "queue")?;
        let state = queues.entry(queue.to_string()).or_default();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut msg) = state.ready.pop_front() else { break };
            msg.deliveries += 1;
            let tag = format!("{}#{}", queue, self.next_tag.fetch_add(1, Ordering::Relaxed));
            out.push(Delivery { tag: tag.clone(), body: msg.body.clone(), attempt: msg.deliveries });
            state.in_flight.insert(tag, msg);
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, queue: &str, body: String) -> Result<()> {
        {
            let mut queues = lock(&self.queues, "queue")?;
            queues.entry(queue.to_string()).or_default().ready.push_back(Pending { body, deliveries: 0 });
        }
        tracing::debug!(queue, "published message");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(queue, max)?;
            if !batch.is_empty() {
                tracing::debug!(queue, count = batch.len(), "delivered messages");
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, queue: &str, tags: &[DeliveryTag]) -> Result<()> {
        let mut queues = lock(&self.queues, "queue")?;
        if let Some(state) = queues.get_mut(queue) {
            for tag in tags {
                state.in_flight.remove(tag);
            }
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tags: &[DeliveryTag]) -> Result<()> {
        {
            let mut queues = lock(&self.queues, "queue")?;
            if let Some(state) = queues.get_mut(queue) {
                for tag in tags {
                    if let Some(msg) = state.in_flight.remove(tag) {
                        state.ready.push_back(msg);
                    }
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    rows: Mutex<BTreeMap<TileId, VectorRow>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows ordered by tile id.
    pub fn rows(&self) -> Vec<VectorRow> {
        self.rows.lock().map(|r| r.values().cloned().collect()).unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, rows: &[VectorRow]) -> Result<usize> {
        let mut store = lock(&self.rows, "vector store")?;
        for row in rows {
            store.insert(row.tile_id.clone(), row.clone());
        }
        Ok(rows.len())
    }

    async fn count(&self, tile_id: Option<&str>) -> Result<usize> {
        let store = lock(&self.rows, "vector store")?;
        Ok(match tile_id {
            Some(id) => usize::from(store.contains_key(id)),
            None => store.len(),
        })
    }

    async fn delete(&self, tile_ids: &[TileId]) -> Result<usize> {
        let mut store = lock(&self.rows, "vector store")?;
        Ok(tile_ids.iter().filter(|id| store.remove(id.as_str()).is_some()).count())
    }
}
