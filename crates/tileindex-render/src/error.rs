use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no raster path on the request and no default raster configured")]
    MissingRaster,

    #[error("window {window:?} lies outside raster {path} ({width}x{height})")]
    EmptyWindow { path: PathBuf, window: [f64; 4], width: u32, height: u32 },

    #[error("local strategy needs an image_path")]
    MissingImagePath,

    #[error("synthetic strategy needs a grid tile, got a {0} source")]
    NotGridTile(&'static str),

    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("invalid bbox {0:?}")]
    InvalidBBox([f64; 4]),

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode tile {tile_id}: {source}")]
    Encode {
        tile_id: String,
        #[source]
        source: image::ImageError,
    },

    #[error("cache I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<RenderError> for tileindex_core::Error {
    fn from(e: RenderError) -> Self {
        tileindex_core::Error::Render(e.to_string())
    }
}
