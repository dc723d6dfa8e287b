//! Tile rendering strategies and the tile cache writer.
//!
//! The strategy is chosen once at startup from `render.strategy`:
//! - `orthophoto`: crop a pixel window out of a raster
//! - `synthetic`: deterministic generated imagery keyed by grid id
//! - `local`: decode an image file already on disk
#![deny(warnings)]
#![deny(unused_imports)]

pub mod cache;
pub mod error;
pub mod orthophoto;
pub mod synthetic;

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tileindex_core::config::{expand_path, RenderSettings, RenderStrategy};
use tileindex_core::types::{BBox, TileSource};

pub use cache::TileCache;
pub use error::RenderError;
pub use orthophoto::OrthophotoRenderer;
pub use synthetic::SyntheticRenderer;

#[derive(Debug)]
pub enum TileRenderer {
    Orthophoto(OrthophotoRenderer),
    Synthetic(SyntheticRenderer),
    Local,
}

impl TileRenderer {
    pub fn from_settings(settings: &RenderSettings) -> Self {
        match settings.strategy {
            RenderStrategy::Orthophoto => TileRenderer::Orthophoto(OrthophotoRenderer::new(
                settings.default_raster_path.as_deref().map(expand_path),
                Some(settings.tile_size),
            )),
            RenderStrategy::Synthetic => TileRenderer::Synthetic(SyntheticRenderer::new(settings.tile_size)),
            RenderStrategy::Local => TileRenderer::Local,
        }
    }

    pub fn strategy(&self) -> RenderStrategy {
        match self {
            TileRenderer::Orthophoto(_) => RenderStrategy::Orthophoto,
            TileRenderer::Synthetic(_) => RenderStrategy::Synthetic,
            TileRenderer::Local => RenderStrategy::Local,
        }
    }

    /// Produce RGB8 pixels for one tile. Blocking; call from a blocking pool.
    pub fn render(&self, bbox: &BBox, source: &TileSource) -> Result<RgbImage, RenderError> {
        match self {
            TileRenderer::Orthophoto(r) => r.render(bbox, source.raster_path()),
            TileRenderer::Synthetic(r) => match source {
                TileSource::Grid { gid } => Ok(r.render(*gid, bbox)),
                TileSource::Raster { .. } => Err(RenderError::NotGridTile("raster")),
                TileSource::File { .. } => Err(RenderError::NotGridTile("file")),
            },
            TileRenderer::Local => {
                let path = source.file_path().ok_or(RenderError::MissingImagePath)?;
                if is_remote(path) {
                    fetch_image(path)
                } else {
                    load_image(&expand_path(path))
                }
            }
        }
    }
}

pub fn load_image(path: &Path) -> Result<RgbImage, RenderError> {
    Ok(image::open(path)
        .map_err(|source| RenderError::Decode { path: path.to_path_buf(), source })?
        .to_rgb8())
}

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_remote(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Download and decode an image. Blocking; never call from async code.
pub fn fetch_image(url: &str) -> Result<RgbImage, RenderError> {
    let fetch_err = |reason: String| RenderError::Fetch { url: url.to_string(), reason };
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| fetch_err(format!("failed to create HTTP client: {}", e)))?;
    let response = client.get(url).send().map_err(|e| fetch_err(format!("request failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(fetch_err(format!("HTTP {}", response.status())));
    }
    let bytes = response.bytes().map_err(|e| fetch_err(format!("failed to read response: {}", e)))?;
    tracing::debug!(url, bytes = bytes.len(), "fetched tile image");
    Ok(image::load_from_memory(&bytes)
        .map_err(|source| RenderError::Decode { path: PathBuf::from(url), source })?
        .to_rgb8())
}
