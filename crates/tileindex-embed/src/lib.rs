//! Embedding backends for the worker.
//!
//! `fake` needs no weights and is what tests run against; `clip` loads a
//! candle CLIP ViT-B/32 from a local model directory.

pub mod clip;
pub mod device;
pub mod fake;
pub mod preprocess;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use tileindex_core::config::EmbedderSettings;
use tileindex_core::traits::Embedder;

pub use clip::ClipEmbedder;
pub use fake::FakeEmbedder;

pub fn build_embedder(settings: &EmbedderSettings) -> Result<Arc<dyn Embedder>> {
    match settings.backend.trim().to_ascii_lowercase().as_str() {
        "fake" => {
            tracing::info!(dim = settings.dim, "using FakeEmbedder");
            Ok(Arc::new(FakeEmbedder::new(settings.model.clone(), settings.dim)))
        }
        "clip" => {
            let dir = clip::resolve_model_dir(settings.model_dir.as_deref())?;
            Ok(Arc::new(ClipEmbedder::load(&dir, &settings.model, settings.dim)?))
        }
        other => Err(anyhow!("unknown embedder backend '{}' (expected fake or clip)", other)),
    }
}
