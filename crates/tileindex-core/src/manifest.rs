//! JSON Lines tile manifest.
//!
//! One entry per line, either `{id, bbox, raster_path}` or `{id, bbox, gid}`,
//! with optional `image_path`, `embedder_backend`, `embedder_model`. An entry
//! carrying only `image_path` is a local-file tile.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{BBox, IndexRequest, TileRecord, TileSource, TileStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub bbox: BBox,
    #[serde(default)]
    pub raster_path: Option<String>,
    #[serde(default)]
    pub gid: Option<i64>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub embedder_backend: Option<String>,
    #[serde(default)]
    pub embedder_model: Option<String>,
}

impl ManifestEntry {
    pub fn source(&self) -> Result<TileSource> {
        TileSource::from_fields(self.raster_path.as_deref(), self.gid, self.image_path.as_deref())
    }

    /// Registry record in its initial `waiting_for_embedding` state.
    pub fn to_record(&self, now_ms: i64) -> Result<TileRecord> {
        Ok(TileRecord {
            id: self.id.clone(),
            bbox: self.bbox,
            source: self.source()?,
            image_path: None,
            status: TileStatus::WaitingForEmbedding,
            embedder_backend: self.embedder_backend.clone(),
            embedder_model: self.embedder_model.clone(),
            updated_at: now_ms,
        })
    }

    pub fn to_request(&self, run_id: Option<String>) -> IndexRequest {
        IndexRequest {
            tile_id: self.id.clone(),
            bbox: self.bbox,
            raster_path: self.raster_path.clone(),
            gid: self.gid,
            image_path: self.image_path.clone(),
            embedder_backend: self.embedder_backend.clone(),
            embedder_model: self.embedder_model.clone(),
            run_id,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Manifest("empty tile id".into()));
        }
        if !self.bbox.is_valid() {
            return Err(Error::Manifest(format!("tile {} has an invalid bbox {:?}", self.id, self.bbox.as_array())));
        }
        self.source().map(|_| ())
    }
}

/// Parse manifest lines. Blank lines are skipped; repeated ids keep the first entry.
pub fn parse_manifest<R: BufRead>(reader: R) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| Error::Manifest(format!("line {}: {}", line_no, e)))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: ManifestEntry =
            serde_json::from_str(line).map_err(|e| Error::Manifest(format!("line {}: {}", line_no, e)))?;
        entry.validate().map_err(|e| Error::Manifest(format!("line {}: {}", line_no, e)))?;
        if !seen.insert(entry.id.clone()) {
            tracing::warn!(tile_id = %entry.id, line = line_no, "duplicate tile id in manifest, keeping first entry");
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(path).map_err(|e| Error::Manifest(format!("cannot open {}: {}", path.display(), e)))?;
    parse_manifest(BufReader::new(file))
}
