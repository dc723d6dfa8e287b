//! Domain types shared by the registry, the queue and the workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

pub type TileId = String;
pub type DeliveryTag = String;

/// Spatial extent of a tile as `[minx, miny, maxx, maxy]`.
///
/// For raster tiles the numbers are a pixel window into the raster
/// (`col_min, row_min, col_max, row_max`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BBox {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.minx, self.miny, self.maxx, self.maxy]
    }

    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }

    /// All four numbers finite and max >= min on both axes.
    pub fn is_valid(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite()) && self.maxx >= self.minx && self.maxy >= self.miny
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        b.as_array()
    }
}

/// Processing status of a registered tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    WaitingForEmbedding,
    WaitingForIndex,
    Indexed,
    Failed,
}

impl TileStatus {
    pub const ALL: [TileStatus; 4] = [
        TileStatus::WaitingForEmbedding,
        TileStatus::WaitingForIndex,
        TileStatus::Indexed,
        TileStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TileStatus::WaitingForEmbedding => "waiting_for_embedding",
            TileStatus::WaitingForIndex => "waiting_for_index",
            TileStatus::Indexed => "indexed",
            TileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        TileStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| {
                let valid: Vec<&str> = TileStatus::ALL.iter().map(TileStatus::as_str).collect();
                Error::Operation(format!("unknown tile status '{}' (valid: {})", s, valid.join(", ")))
            })
    }
}

/// Where a tile's pixels come from. Exactly one per tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TileSource {
    /// Crop of an orthophoto raster.
    Raster { raster_path: String },
    /// Synthetic grid cell.
    Grid { gid: i64 },
    /// Pre-rendered image on disk.
    File { path: String },
}

impl TileSource {
    /// Resolve the flat wire fields into a source.
    ///
    /// `raster_path` and `gid` are mutually exclusive; `image_path` alone
    /// denotes a local-file tile.
    pub fn from_fields(
        raster_path: Option<&str>,
        gid: Option<i64>,
        image_path: Option<&str>,
    ) -> Result<Self> {
        let raster_path = raster_path.map(str::trim).filter(|s| !s.is_empty());
        let image_path = image_path.map(str::trim).filter(|s| !s.is_empty());
        match (raster_path, gid) {
            (Some(_), Some(_)) => Err(Error::Manifest("tile has both raster_path and gid; exactly one is allowed".into())),
            (Some(p), None) => Ok(TileSource::Raster { raster_path: p.to_string() }),
            (None, Some(gid)) => Ok(TileSource::Grid { gid }),
            (None, None) => match image_path {
                Some(p) => Ok(TileSource::File { path: p.to_string() }),
                None => Err(Error::Manifest("tile needs one of raster_path, gid or image_path".into())),
            },
        }
    }

    pub fn raster_path(&self) -> Option<&str> {
        match self {
            TileSource::Raster { raster_path } => Some(raster_path),
            _ => None,
        }
    }

    pub fn gid(&self) -> Option<i64> {
        match self {
            TileSource::Grid { gid } => Some(*gid),
            _ => None,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match self {
            TileSource::File { path } => Some(path),
            _ => None,
        }
    }
}

/// A registry row.
///
/// - `id`: globally unique, assigned by the manifest
/// - `image_path`: cache path written by a worker, empty until then
/// - `updated_at`: Unix milliseconds of the last status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub id: TileId,
    pub bbox: BBox,
    pub source: TileSource,
    pub image_path: Option<String>,
    pub status: TileStatus,
    pub embedder_backend: Option<String>,
    pub embedder_model: Option<String>,
    pub updated_at: i64,
}

/// Message body published once per tile and target queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub tile_id: TileId,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raster_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedder_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedder_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl IndexRequest {
    pub fn from_record(record: &TileRecord, run_id: Option<String>) -> Self {
        let image_path = record
            .source
            .file_path()
            .map(str::to_string)
            .or_else(|| record.image_path.clone());
        Self {
            tile_id: record.id.clone(),
            bbox: record.bbox,
            raster_path: record.source.raster_path().map(str::to_string),
            gid: record.source.gid(),
            image_path,
            embedder_backend: record.embedder_backend.clone(),
            embedder_model: record.embedder_model.clone(),
            run_id,
        }
    }

    pub fn source(&self) -> Result<TileSource> {
        TileSource::from_fields(self.raster_path.as_deref(), self.gid, self.image_path.as_deref())
    }

    pub fn to_body(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Queue(format!("encode index request: {}", e)))
    }

    pub fn from_body(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| Error::Queue(format!("decode index request: {}", e)))
    }
}

/// One row in the vector store, keyed by `tile_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRow {
    pub tile_id: TileId,
    pub vector: Vec<f32>,
    pub image_path: Option<String>,
    pub bbox: BBox,
    pub gid: Option<i64>,
    pub raster_path: Option<String>,
    pub embedder_backend: Option<String>,
    pub embedder_model: Option<String>,
    pub run_id: Option<String>,
    pub indexed_at: i64,
}

/// A message handed out by a queue, hidden from other consumers until it
/// is acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Registry summary: count per status plus total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub counts: BTreeMap<TileStatus, usize>,
    pub total: usize,
}

impl StatusCounts {
    pub fn get(&self, status: TileStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn add(&mut self, status: TileStatus, n: usize) {
        *self.counts.entry(status).or_insert(0) += n;
        self.total += n;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TilePage {
    pub tiles: Vec<TileRecord>,
    pub total: usize,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_legacy_spellings() {
        assert_eq!("waiting for embedding".parse::<TileStatus>().ok(), Some(TileStatus::WaitingForEmbedding));
        assert_eq!("Indexed".parse::<TileStatus>().ok(), Some(TileStatus::Indexed));
        assert!("done".parse::<TileStatus>().is_err());
    }

    #[test]
    fn source_requires_exactly_one_origin() {
        assert!(TileSource::from_fields(Some("a.tif"), Some(3), None).is_err());
        assert!(TileSource::from_fields(None, None, None).is_err());
        assert_eq!(TileSource::from_fields(None, Some(3), Some("x.png")).ok(), Some(TileSource::Grid { gid: 3 }));
        assert_eq!(
            TileSource::from_fields(Some("  "), None, Some("x.png")).ok(),
            Some(TileSource::File { path: "x.png".into() })
        );
    }

    #[test]
    fn request_body_uses_flat_bbox_array() {
        let req = IndexRequest {
            tile_id: "tile:1".into(),
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            raster_path: None,
            gid: Some(1),
            image_path: None,
            embedder_backend: None,
            embedder_model: None,
            run_id: None,
        };
        let body = req.to_body().expect("encode");
        assert!(body.contains("\"bbox\":[0.0,0.0,10.0,10.0]"), "{body}");
        assert!(!body.contains("raster_path"));
        assert_eq!(IndexRequest::from_body(&body).expect("decode"), req);
    }
}
