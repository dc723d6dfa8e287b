//! On-disk tile cache.
//!
//! Each render is encoded into a temp file inside the cache directory and
//! then renamed over `<dir>/<tile>.<ext>`, so a reader never sees a partial
//! file and concurrent writers of the same tile leave one complete image.
use image::{ImageFormat, RgbImage};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use tileindex_core::config::{expand_path, CacheFormat, CacheSettings};

use crate::error::RenderError;

#[derive(Debug, Clone)]
pub struct TileCache {
    dir: PathBuf,
    format: CacheFormat,
}

/// Tile ids like `tile:12` are not valid file names everywhere.
fn file_stem(tile_id: &str) -> String {
    tile_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RenderError + '_ {
    move |source| RenderError::Io { path: path.to_path_buf(), source }
}

impl TileCache {
    pub fn new(dir: impl Into<PathBuf>, format: CacheFormat) -> Self {
        Self { dir: dir.into(), format }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(expand_path(&settings.dir), settings.format)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tile_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(tile_id), self.format.extension()))
    }

    pub fn write(&self, tile_id: &str, img: &RgbImage) -> Result<PathBuf, RenderError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let target = self.path_for(tile_id);
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            let format = match self.format {
                CacheFormat::Png => ImageFormat::Png,
                CacheFormat::Jpeg => ImageFormat::Jpeg,
            };
            img.write_to(&mut w, format)
                .map_err(|source| RenderError::Encode { tile_id: tile_id.to_string(), source })?;
            w.flush().map_err(io_err(&target))?;
        }
        tmp.persist(&target).map_err(|e| RenderError::Io { path: target.clone(), source: e.error })?;
        tracing::debug!(tile_id, path = %target.display(), "cached tile");
        Ok(target)
    }
}
