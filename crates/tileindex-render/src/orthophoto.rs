//! Pixel-window crops out of orthophoto rasters.
//!
//! The tile bbox is read as `[col_min, row_min, col_max, row_max]`. Offsets
//! and lengths are rounded, then the window is intersected with the raster
//! extent. The most recently used decoded rasters are kept in a small LRU.
use image::imageops::{self, FilterType};
use image::RgbImage;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tileindex_core::types::BBox;

use crate::error::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Round the bbox into a window and clamp it to a `width x height` raster.
/// Returns `None` when nothing of the window overlaps the raster.
pub fn pixel_window(bbox: &BBox, width: u32, height: u32) -> Option<PixelWindow> {
    let col_off = bbox.minx.round();
    let row_off = bbox.miny.round();
    let col_end = col_off + bbox.width().round();
    let row_end = row_off + bbox.height().round();

    let x0 = col_off.max(0.0);
    let y0 = row_off.max(0.0);
    let x1 = col_end.min(f64::from(width));
    let y1 = row_end.min(f64::from(height));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    // Bounded by the raster dimensions above, so the casts are lossless.
    Some(PixelWindow {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Decoded rasters kept in memory at once.
pub const RASTER_CACHE_CAPACITY: usize = 2;

#[derive(Debug)]
pub struct OrthophotoRenderer {
    default_raster: Option<PathBuf>,
    resize_to: Option<u32>,
    rasters: Mutex<LruCache<PathBuf, Arc<RgbImage>>>,
}

impl OrthophotoRenderer {
    pub fn new(default_raster: Option<PathBuf>, resize_to: Option<u32>) -> Self {
        Self::with_capacity(default_raster, resize_to, RASTER_CACHE_CAPACITY)
    }

    pub fn with_capacity(default_raster: Option<PathBuf>, resize_to: Option<u32>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { default_raster, resize_to, rasters: Mutex::new(LruCache::new(capacity)) }
    }

    /// Number of decoded rasters currently held.
    pub fn cached_rasters(&self) -> usize {
        self.rasters.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn raster(&self, path: &Path) -> Result<Arc<RgbImage>, RenderError> {
        if let Ok(mut cache) = self.rasters.lock() {
            if let Some(img) = cache.get(path) {
                return Ok(img.clone());
            }
        }
        tracing::debug!(path = %path.display(), "decoding raster");
        let img = image::open(path)
            .map_err(|source| RenderError::Decode { path: path.to_path_buf(), source })?
            .to_rgb8();
        let img = Arc::new(img);
        if let Ok(mut cache) = self.rasters.lock() {
            cache.put(path.to_path_buf(), img.clone());
        }
        Ok(img)
    }

    pub fn render(&self, bbox: &BBox, raster_path: Option<&str>) -> Result<RgbImage, RenderError> {
        if !bbox.is_valid() {
            return Err(RenderError::InvalidBBox(bbox.as_array()));
        }
        let path = raster_path
            .map(tileindex_core::config::expand_path)
            .or_else(|| self.default_raster.clone())
            .ok_or(RenderError::MissingRaster)?;
        let raster = self.raster(&path)?;
        let window = pixel_window(bbox, raster.width(), raster.height()).ok_or_else(|| RenderError::EmptyWindow {
            path: path.clone(),
            window: bbox.as_array(),
            width: raster.width(),
            height: raster.height(),
        })?;
        let crop = imageops::crop_imm(raster.as_ref(), window.x, window.y, window.width, window.height).to_image();
        Ok(match self.resize_to {
            Some(size) if crop.width() != size || crop.height() != size => {
                imageops::resize(&crop, size, size, FilterType::Triangle)
            }
            _ => crop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_rounded_and_clamped() {
        let w = pixel_window(&BBox::new(-3.4, 10.6, 20.2, 30.0), 16, 64).expect("window");
        assert_eq!(w, PixelWindow { x: 0, y: 11, width: 16, height: 19 });
    }

    #[test]
    fn window_outside_raster_is_none() {
        assert!(pixel_window(&BBox::new(100.0, 0.0, 120.0, 10.0), 64, 64).is_none());
        assert!(pixel_window(&BBox::new(5.0, 5.0, 5.2, 9.0), 64, 64).is_none());
    }
}
