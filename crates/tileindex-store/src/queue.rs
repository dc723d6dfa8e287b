//! Durable message queue on a LanceDB table.
//!
//! Every message is a row with a `ready`/`leased` state. `receive` claims up
//! to N ready (or lease-expired) rows for the caller's queue by stamping a
//! fresh lease token and deadline, then reads back the rows carrying that
//! token; a concurrent consumer's claim re-evaluates the predicate and loses.
//! `ack` deletes, `nack` returns rows to `ready`. A crashed consumer's
//! messages reappear once `lease_until` has passed.
use anyhow::{anyhow, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, Table};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tileindex_core::error::Error;
use tileindex_core::traits::MessageQueue;
use tileindex_core::types::{now_millis, Delivery, DeliveryTag};

use crate::schema::build_queue_schema;
use crate::table::{
    ensure_table, i64_col, in_list, open_db, push_bounded, quote, single_batch_reader, str_col, FILTER_CHUNK,
};

const STATE_READY: &str = "ready";
const STATE_LEASED: &str = "leased";
const TAG_SEPARATOR: char = '@';

pub struct LanceQueue {
    conn: Connection,
    table: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    counter: AtomicU64,
}

fn queue_err(e: anyhow::Error) -> Error {
    Error::Queue(format!("{:#}", e))
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn split_tag(tag: &str) -> Result<(&str, &str)> {
    tag.split_once(TAG_SEPARATOR).ok_or_else(|| anyhow!("malformed delivery tag '{}'", tag))
}

/// Rows of `queue` that may be handed out at `now`.
fn claimable(queue: &str, now: i64) -> String {
    format!(
        "queue = {} AND (state = {} OR (state = {} AND lease_until < {}))",
        quote(queue),
        quote(STATE_READY),
        quote(STATE_LEASED),
        now
    )
}

/// `(message_id = 'a' AND lease_token = 't') OR ...`: only the current lease holder may settle.
fn owned_filter(tags: &[DeliveryTag]) -> Result<String> {
    let mut parts = Vec::with_capacity(tags.len());
    for tag in tags {
        let (id, token) = split_tag(tag)?;
        parts.push(format!("(message_id = {} AND lease_token = {})", quote(id), quote(token)));
    }
    Ok(parts.join(" OR "))
}

impl LanceQueue {
    pub async fn open(uri: &str, table: &str, visibility_timeout: Duration) -> Result<Self> {
        let conn = open_db(uri).await?;
        ensure_table(&conn, table, build_queue_schema()).await?;
        Ok(Self {
            conn,
            table: table.to_string(),
            visibility_timeout,
            poll_interval: Duration::from_millis(200),
            counter: AtomicU64::new(0),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn table(&self) -> Result<Table> {
        Ok(self.conn.open_table(&self.table).execute().await?)
    }

    fn fresh_id(&self, salt: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt.as_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&self.counter.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        hasher.update(&nanos.to_le_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    async fn insert(&self, queue: &str, body: String) -> Result<()> {
        let id = self.fresh_id(&body);
        let batch = RecordBatch::try_new(
            build_queue_schema(),
            vec![
                Arc::new(StringArray::from(vec![id])),
                Arc::new(StringArray::from(vec![queue.to_string()])),
                Arc::new(StringArray::from(vec![body])),
                Arc::new(StringArray::from(vec![STATE_READY.to_string()])),
                Arc::new(StringArray::from(vec![None::<String>])),
                Arc::new(Int64Array::from(vec![0i64])),
                Arc::new(Int64Array::from(vec![0i64])),
                Arc::new(Int64Array::from(vec![now_millis()])),
            ],
        )?;
        self.table().await?.add(single_batch_reader(batch)).execute().await?;
        Ok(())
    }

    async fn candidate_ids(&self, t: &Table, queue: &str, max: usize, now: i64) -> Result<Vec<String>> {
        let mut stream = t
            .query()
            .only_if(claimable(queue, now))
            .select(Select::columns(&["message_id", "enqueued_at"]))
            .execute()
            .await?;
        // Oldest first; the table itself is unordered.
        let mut oldest: BinaryHeap<(i64, String)> = BinaryHeap::with_capacity(max.min(FILTER_CHUNK));
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
            let ids = str_col(&batch, "message_id")?;
            let enqueued = i64_col(&batch, "enqueued_at")?;
            for i in 0..batch.num_rows() {
                push_bounded(&mut oldest, max, (enqueued.value(i), ids.value(i).to_string()));
            }
        }
        Ok(oldest.into_sorted_vec().into_iter().map(|(_, id)| id).collect())
    }

    async fn try_claim(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let t = self.table().await?;
        let now = now_millis();
        let ids = self.candidate_ids(&t, queue, max, now).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let token = self.fresh_id(queue);
        let lease_until = now.saturating_add(millis(self.visibility_timeout));
        let _ = t
            .update()
            .only_if(format!("{} AND {}", in_list("message_id", &ids), claimable(queue, now)))
            .column("state", quote(STATE_LEASED))
            .column("lease_token", quote(&token))
            .column("lease_until", lease_until.to_string())
            .column("deliveries", "deliveries + 1")
            .execute()
            .await?;

        let mut stream = t.query().only_if(format!("lease_token = {}", quote(&token))).execute().await?;
        let mut claimed: Vec<(i64, Delivery)> = Vec::new();
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
            let ids = str_col(&batch, "message_id")?;
            let bodies = str_col(&batch, "body")?;
            let deliveries = i64_col(&batch, "deliveries")?;
            let enqueued = i64_col(&batch, "enqueued_at")?;
            for i in 0..batch.num_rows() {
                claimed.push((
                    enqueued.value(i),
                    Delivery {
                        tag: format!("{}{}{}", ids.value(i), TAG_SEPARATOR, token),
                        body: bodies.value(i).to_string(),
                        attempt: u32::try_from(deliveries.value(i)).unwrap_or(u32::MAX),
                    },
                ));
            }
        }
        claimed.sort_by_key(|(at, _)| *at);
        Ok(claimed.into_iter().map(|(_, d)| d).collect())
    }

    async fn settle(&self, tags: &[DeliveryTag], ack: bool) -> Result<()> {
        let t = self.table().await?;
        for chunk in tags.chunks(FILTER_CHUNK) {
            let filter = owned_filter(chunk)?;
            if ack {
                let _ = t.delete(&filter).await?;
            } else {
                let _ = t
                    .update()
                    .only_if(filter)
                    .column("state", quote(STATE_READY))
                    .column("lease_token", "NULL")
                    .column("lease_until", "0")
                    .execute()
                    .await?;
            }
        }
        Ok(())
    }

    /// Messages in `queue` waiting for delivery (including expired leases).
    pub async fn pending(&self, queue: &str) -> Result<usize> {
        Ok(self.table().await?.count_rows(Some(claimable(queue, now_millis()))).await?)
    }

    /// Messages in `queue` under a live lease.
    pub async fn in_flight(&self, queue: &str) -> Result<usize> {
        let filter = format!(
            "queue = {} AND state = {} AND lease_until >= {}",
            quote(queue),
            quote(STATE_LEASED),
            now_millis()
        );
        Ok(self.table().await?.count_rows(Some(filter)).await?)
    }
}

#[async_trait]
impl MessageQueue for LanceQueue {
    async fn publish(&self, queue: &str, body: String) -> tileindex_core::Result<()> {
        self.insert(queue, body).await.map_err(queue_err)?;
        tracing::debug!(queue, "published message");
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> tileindex_core::Result<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.try_claim(queue, max).await.map_err(queue_err)?;
            if !batch.is_empty() {
                tracing::debug!(queue, count = batch.len(), "leased messages");
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, _queue: &str, tags: &[DeliveryTag]) -> tileindex_core::Result<()> {
        self.settle(tags, true).await.map_err(queue_err)
    }

    async fn nack(&self, _queue: &str, tags: &[DeliveryTag]) -> tileindex_core::Result<()> {
        self.settle(tags, false).await.map_err(queue_err)
    }
}
