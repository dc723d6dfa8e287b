//! Lance-backed tile registry.
//!
//! One row per tile in the `tiles` table. Inserts go through `merge_insert`
//! keyed on `id` with insert-if-absent semantics, so re-registering a tile
//! never touches its status. Status changes are predicate updates on
//! `id IN (...)`; each row write is atomic and the last writer wins.
use anyhow::{anyhow, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, Table};
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use tileindex_core::error::Error;
use tileindex_core::traits::TileRegistry;
use tileindex_core::types::{now_millis, BBox, StatusCounts, TileId, TilePage, TileRecord, TileSource, TileStatus};

use crate::schema::build_registry_schema;
use crate::table::{
    ensure_table, f64_col, i64_col, in_list, open_db, opt_i64, opt_str, push_bounded, quote, single_batch_reader,
    str_col, FILTER_CHUNK,
};

pub struct LanceTileRegistry {
    conn: Connection,
    table: String,
}

fn unavailable(e: anyhow::Error) -> Error {
    Error::RegistryUnavailable(format!("{:#}", e))
}

fn source_kind(source: &TileSource) -> &'static str {
    match source {
        TileSource::Raster { .. } => "raster",
        TileSource::Grid { .. } => "grid",
        TileSource::File { .. } => "file",
    }
}

fn records_to_batch(records: &[&TileRecord]) -> Result<RecordBatch> {
    let schema = build_registry_schema();
    let col_str = |f: &dyn Fn(&TileRecord) -> Option<String>| -> StringArray {
        StringArray::from(records.iter().map(|&r| f(r)).collect::<Vec<_>>())
    };
    let col_f64 = |f: &dyn Fn(&BBox) -> f64| Float64Array::from(records.iter().map(|r| f(&r.bbox)).collect::<Vec<_>>());
    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(col_str(&|r| Some(r.id.clone()))),
            Arc::new(col_f64(&|b| b.minx)),
            Arc::new(col_f64(&|b| b.miny)),
            Arc::new(col_f64(&|b| b.maxx)),
            Arc::new(col_f64(&|b| b.maxy)),
            Arc::new(col_str(&|r| Some(source_kind(&r.source).to_string()))),
            Arc::new(col_str(&|r| r.source.raster_path().map(str::to_string))),
            Arc::new(Int64Array::from(records.iter().map(|r| r.source.gid()).collect::<Vec<_>>())),
            Arc::new(col_str(&|r| r.source.file_path().map(str::to_string))),
            Arc::new(col_str(&|r| r.image_path.clone())),
            Arc::new(col_str(&|r| Some(r.status.as_str().to_string()))),
            Arc::new(col_str(&|r| r.embedder_backend.clone())),
            Arc::new(col_str(&|r| r.embedder_model.clone())),
            Arc::new(Int64Array::from(records.iter().map(|r| r.updated_at).collect::<Vec<_>>())),
        ],
    )?)
}

fn records_from_batch(batch: &RecordBatch) -> Result<Vec<TileRecord>> {
    let id = str_col(batch, "id")?;
    let (minx, miny, maxx, maxy) =
        (f64_col(batch, "minx")?, f64_col(batch, "miny")?, f64_col(batch, "maxx")?, f64_col(batch, "maxy")?);
    let kind = str_col(batch, "source_kind")?;
    let raster_path = str_col(batch, "raster_path")?;
    let gid = i64_col(batch, "gid")?;
    let source_path = str_col(batch, "source_path")?;
    let image_path = str_col(batch, "image_path")?;
    let status = str_col(batch, "status")?;
    let backend = str_col(batch, "embedder_backend")?;
    let model = str_col(batch, "embedder_model")?;
    let updated_at = i64_col(batch, "updated_at")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let source = match kind.value(i) {
            "raster" => TileSource::Raster {
                raster_path: opt_str(raster_path, i).ok_or_else(|| anyhow!("raster tile without raster_path"))?,
            },
            "grid" => TileSource::Grid { gid: opt_i64(gid, i).ok_or_else(|| anyhow!("grid tile without gid"))? },
            "file" => TileSource::File { path: opt_str(source_path, i).ok_or_else(|| anyhow!("file tile without path"))? },
            other => return Err(anyhow!("unknown source kind '{}'", other)),
        };
        out.push(TileRecord {
            id: id.value(i).to_string(),
            bbox: BBox::new(minx.value(i), miny.value(i), maxx.value(i), maxy.value(i)),
            source,
            image_path: opt_str(image_path, i),
            status: TileStatus::from_str(status.value(i)).map_err(|e| anyhow!("{}", e))?,
            embedder_backend: opt_str(backend, i),
            embedder_model: opt_str(model, i),
            updated_at: updated_at.value(i),
        });
    }
    Ok(out)
}

impl LanceTileRegistry {
    pub async fn open(uri: &str, table: &str) -> Result<Self> {
        let conn = open_db(uri).await?;
        ensure_table(&conn, table, build_registry_schema()).await?;
        Ok(Self { conn, table: table.to_string() })
    }

    async fn table(&self) -> Result<Table> {
        Ok(self.conn.open_table(&self.table).execute().await?)
    }

    async fn query_records(&self, filter: Option<String>, limit: Option<usize>) -> Result<Vec<TileRecord>> {
        let t = self.table().await?;
        let mut q = t.query();
        if let Some(f) = filter {
            q = q.only_if(f);
        }
        if let Some(n) = limit {
            q = q.limit(n);
        }
        let mut stream = q.execute().await?;
        let mut out = Vec::new();
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
            out.extend(records_from_batch(&batch)?);
        }
        Ok(out)
    }

    async fn insert_rows(&self, records: &[TileRecord]) -> Result<usize> {
        // merge_insert rejects duplicate keys in the source, keep the first.
        let mut seen = HashSet::new();
        let unique: Vec<&TileRecord> = records.iter().filter(|r| seen.insert(r.id.as_str())).collect();
        if unique.is_empty() {
            return Ok(0);
        }
        let t = self.table().await?;
        let reader = single_batch_reader(records_to_batch(&unique)?);
        let mut mi = t.merge_insert(&["id"]);
        mi.when_not_matched_insert_all();
        let res = mi.execute(reader).await?;
        Ok(res.num_inserted_rows as usize)
    }

    async fn update_status(&self, ids: &[TileId], status: TileStatus) -> Result<usize> {
        let t = self.table().await?;
        let now = now_millis();
        let mut affected = 0usize;
        for chunk in ids.chunks(FILTER_CHUNK) {
            let filter = in_list("id", chunk);
            affected += t.count_rows(Some(filter.clone())).await?;
            let _ = t
                .update()
                .only_if(filter)
                .column("status", quote(status.as_str()))
                .column("updated_at", now.to_string())
                .execute()
                .await?;
        }
        Ok(affected)
    }

    async fn update_image_path(&self, id: &str, image_path: &str) -> Result<usize> {
        let t = self.table().await?;
        let filter = format!("id = {}", quote(id));
        let n = t.count_rows(Some(filter.clone())).await?;
        if n > 0 {
            let _ = t.update().only_if(filter).column("image_path", quote(image_path)).execute().await?;
        }
        Ok(n)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let t = self.table().await?;
        let mut stream = t.query().select(Select::columns(&["status"])).execute().await?;
        let mut by_name: BTreeMap<String, usize> = BTreeMap::new();
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
            let col = str_col(&batch, "status")?;
            for i in 0..batch.num_rows() {
                *by_name.entry(col.value(i).to_string()).or_insert(0) += 1;
            }
        }
        let mut counts = StatusCounts::default();
        for (name, n) in by_name {
            match TileStatus::from_str(&name) {
                Ok(status) => counts.add(status, n),
                Err(_) => {
                    tracing::warn!(status = %name, rows = n, "registry rows with unknown status");
                    counts.total += n;
                }
            }
        }
        Ok(counts)
    }

    /// Scans only the `id` column to find the page, then loads those rows.
    async fn page(&self, status: Option<TileStatus>, limit: usize, offset: usize) -> Result<TilePage> {
        let filter = status.map(|s| format!("status = {}", quote(s.as_str())));
        let t = self.table().await?;
        let mut q = t.query().select(Select::columns(&["id"]));
        if let Some(f) = &filter {
            q = q.only_if(f.clone());
        }
        let mut stream = q.execute().await?;
        let keep = offset.saturating_add(limit);
        let mut first: BinaryHeap<String> = BinaryHeap::new();
        let mut total = 0usize;
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
            let ids = str_col(&batch, "id")?;
            total += batch.num_rows();
            for i in 0..batch.num_rows() {
                push_bounded(&mut first, keep, ids.value(i).to_string());
            }
        }
        let wanted: Vec<TileId> = first.into_sorted_vec().into_iter().skip(offset).collect();

        let mut tiles = Vec::with_capacity(wanted.len());
        for chunk in wanted.chunks(FILTER_CHUNK) {
            tiles.extend(self.query_records(Some(in_list("id", chunk)), None).await?);
        }
        tiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(TilePage { tiles, total })
    }

    async fn delete_rows(&self, ids: &[TileId]) -> Result<usize> {
        let t = self.table().await?;
        let mut removed = 0usize;
        for chunk in ids.chunks(FILTER_CHUNK) {
            let filter = in_list("id", chunk);
            let n = t.count_rows(Some(filter.clone())).await?;
            if n > 0 {
                let _ = t.delete(&filter).await?;
                removed += n;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl TileRegistry for LanceTileRegistry {
    async fn insert(&self, records: &[TileRecord]) -> tileindex_core::Result<usize> {
        self.insert_rows(records).await.map_err(unavailable)
    }

    async fn set_status(&self, ids: &[TileId], status: TileStatus) -> tileindex_core::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.update_status(ids, status).await.map_err(unavailable)
    }

    async fn set_image_path(&self, id: &str, image_path: &str) -> tileindex_core::Result<()> {
        match self.update_image_path(id, image_path).await.map_err(unavailable)? {
            0 => Err(Error::NotFound(format!("tile {}", id))),
            _ => Ok(()),
        }
    }

    async fn get(&self, id: &str) -> tileindex_core::Result<Option<TileRecord>> {
        let rows = self
            .query_records(Some(format!("id = {}", quote(id))), Some(1))
            .await
            .map_err(unavailable)?;
        Ok(rows.into_iter().next())
    }

    async fn list(&self, status: Option<TileStatus>, limit: usize, offset: usize) -> tileindex_core::Result<TilePage> {
        self.page(status, limit, offset).await.map_err(unavailable)
    }

    async fn summary(&self) -> tileindex_core::Result<StatusCounts> {
        self.status_counts().await.map_err(unavailable)
    }

    async fn expired(&self, cutoff: i64, limit: usize) -> tileindex_core::Result<Vec<TileRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_records(Some(format!("updated_at <= {}", cutoff)), Some(limit)).await.map_err(unavailable)
    }

    async fn delete(&self, ids: &[TileId]) -> tileindex_core::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.delete_rows(ids).await.map_err(unavailable)
    }
}
