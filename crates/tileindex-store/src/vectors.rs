use anyhow::{anyhow, Result};
use arrow_array::cast::AsArray;
use arrow_array::{FixedSizeListArray, Float64Array, Int64Array, RecordBatch, StringArray};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, Table};
use std::collections::BTreeMap;
use std::sync::Arc;

use tileindex_core::error::Error;
use tileindex_core::traits::VectorStore;
use tileindex_core::types::{BBox, TileId, VectorRow};

use crate::schema::build_vector_schema;
use crate::table::{
    ensure_table, f64_col, i64_col, in_list, open_db, opt_i64, opt_str, quote, single_batch_reader, str_col, FILTER_CHUNK,
};

/// Tile vectors keyed by `tile_id`; upserts replace whole rows.
pub struct LanceVectorStore {
    conn: Connection,
    table: String,
    dim: i32,
}

fn unavailable(e: anyhow::Error) -> Error {
    Error::VectorStoreUnavailable(format!("{:#}", e))
}

impl LanceVectorStore {
    pub async fn open(uri: &str, table: &str, dim: usize) -> Result<Self> {
        let dim = i32::try_from(dim).map_err(|_| anyhow!("vector dim {} out of range", dim))?;
        let conn = open_db(uri).await?;
        ensure_table(&conn, table, build_vector_schema(dim)).await?;
        Ok(Self { conn, table: table.to_string(), dim })
    }

    async fn table(&self) -> Result<Table> {
        Ok(self.conn.open_table(&self.table).execute().await?)
    }

    fn rows_to_batch(&self, rows: &[&VectorRow]) -> Result<RecordBatch> {
        let strs = |f: &dyn Fn(&VectorRow) -> Option<String>| StringArray::from(rows.iter().map(|&r| f(r)).collect::<Vec<_>>());
        let f64s = |f: &dyn Fn(&BBox) -> f64| Float64Array::from(rows.iter().map(|r| f(&r.bbox)).collect::<Vec<_>>());
        let vectors: Vec<Option<Vec<Option<f32>>>> =
            rows.iter().map(|r| Some(r.vector.iter().map(|&x| Some(x)).collect())).collect();
        Ok(RecordBatch::try_new(
            build_vector_schema(self.dim),
            vec![
                Arc::new(strs(&|r| Some(r.tile_id.clone()))),
                Arc::new(FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(
                    vectors.into_iter(),
                    self.dim,
                )),
                Arc::new(strs(&|r| r.image_path.clone())),
                Arc::new(f64s(&|b| b.minx)),
                Arc::new(f64s(&|b| b.miny)),
                Arc::new(f64s(&|b| b.maxx)),
                Arc::new(f64s(&|b| b.maxy)),
                Arc::new(Int64Array::from(rows.iter().map(|r| r.gid).collect::<Vec<_>>())),
                Arc::new(strs(&|r| r.raster_path.clone())),
                Arc::new(strs(&|r| r.embedder_backend.clone())),
                Arc::new(strs(&|r| r.embedder_model.clone())),
                Arc::new(strs(&|r| r.run_id.clone())),
                Arc::new(Int64Array::from(rows.iter().map(|r| r.indexed_at).collect::<Vec<_>>())),
            ],
        )?)
    }

    async fn upsert_rows(&self, rows: &[VectorRow]) -> Result<usize> {
        // Last row per tile wins, as a second upsert would.
        let mut latest: BTreeMap<&str, &VectorRow> = BTreeMap::new();
        for r in rows {
            latest.insert(r.tile_id.as_str(), r);
        }
        if latest.is_empty() {
            return Ok(0);
        }
        let unique: Vec<&VectorRow> = latest.into_values().collect();
        let t = self.table().await?;
        let reader = single_batch_reader(self.rows_to_batch(&unique)?);
        let mut mi = t.merge_insert(&["tile_id"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        let res = mi.execute(reader).await?;
        Ok((res.num_inserted_rows + res.num_updated_rows) as usize)
    }

    /// Read one row back, e.g. to inspect what a worker wrote.
    pub async fn get(&self, tile_id: &str) -> Result<Option<VectorRow>> {
        let t = self.table().await?;
        let mut stream = t.query().only_if(format!("tile_id = {}", quote(tile_id))).limit(1).execute().await?;
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
            if batch.num_rows() == 0 {
                continue;
            }
            let vec_col = batch
                .column_by_name("vector")
                .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
                .ok_or_else(|| anyhow!("vector column missing"))?;
            let list = vec_col.value(0);
            let vector = list.as_primitive::<arrow_array::types::Float32Type>().values().to_vec();
            return Ok(Some(VectorRow {
                tile_id: str_col(&batch, "tile_id")?.value(0).to_string(),
                vector,
                image_path: opt_str(str_col(&batch, "image_path")?, 0),
                bbox: BBox::new(
                    f64_col(&batch, "minx")?.value(0),
                    f64_col(&batch, "miny")?.value(0),
                    f64_col(&batch, "maxx")?.value(0),
                    f64_col(&batch, "maxy")?.value(0),
                ),
                gid: opt_i64(i64_col(&batch, "gid")?, 0),
                raster_path: opt_str(str_col(&batch, "raster_path")?, 0),
                embedder_backend: opt_str(str_col(&batch, "embedder_backend")?, 0),
                embedder_model: opt_str(str_col(&batch, "embedder_model")?, 0),
                run_id: opt_str(str_col(&batch, "run_id")?, 0),
                indexed_at: i64_col(&batch, "indexed_at")?.value(0),
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, rows: &[VectorRow]) -> tileindex_core::Result<usize> {
        let expected = self.dim as usize;
        if let Some(r) = rows.iter().find(|r| r.vector.len() != expected) {
            return Err(Error::DimensionMismatch { expected, got: r.vector.len() });
        }
        self.upsert_rows(rows).await.map_err(unavailable)
    }

    async fn count(&self, tile_id: Option<&str>) -> tileindex_core::Result<usize> {
        let filter = tile_id.map(|id| format!("tile_id = {}", quote(id)));
        async {
            let t = self.table().await?;
            Ok::<_, anyhow::Error>(t.count_rows(filter).await?)
        }
        .await
        .map_err(unavailable)
    }

    async fn delete(&self, tile_ids: &[TileId]) -> tileindex_core::Result<usize> {
        async {
            let t = self.table().await?;
            let mut removed = 0;
            for chunk in tile_ids.chunks(FILTER_CHUNK) {
                let filter = in_list("tile_id", chunk);
                let n = t.count_rows(Some(filter.clone())).await?;
                if n > 0 {
                    let _ = t.delete(&filter).await?;
                    removed += n;
                }
            }
            Ok::<_, anyhow::Error>(removed)
        }
        .await
        .map_err(unavailable)
    }

    fn dim(&self) -> Option<usize> {
        Some(self.dim as usize)
    }
}
