use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;

use tileindex_core::traits::Embedder;

use crate::device::select_device;
use crate::preprocess::batch_tensor;

const END_OF_TEXT: &str = "<|endoftext|>";

/// CLIP image/text tower loaded from `model.safetensors` + `tokenizer.json`.
pub struct ClipEmbedder {
    model: ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    config: ClipConfig,
    model_name: String,
    dim: usize,
    pad_id: u32,
}

fn l2_normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(1)?.sqrt()?;
    let eps = Tensor::new(&[1e-12f32], t.device())?.unsqueeze(0)?;
    Ok(t.broadcast_div(&norm.broadcast_add(&eps)?)?)
}

impl ClipEmbedder {
    pub fn load(model_dir: &Path, model_name: &str, dim: usize) -> Result<Self> {
        let config = match model_name {
            "ViT-B-32" | "vit-base-patch32" | "openai/clip-vit-base-patch32" => ClipConfig::vit_base_patch32(),
            other => return Err(anyhow!("unsupported CLIP model '{}'", other)),
        };
        let device = select_device();
        tracing::info!(dir = %model_dir.display(), model = model_name, "loading CLIP model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;
        let pad_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| anyhow!("tokenizer has no {} token", END_OF_TEXT))?;

        let weights_path = model_dir.join("model.safetensors");
        let weights = candle_core::safetensors::load(&weights_path, &device)
            .map_err(|e| anyhow!("Failed to load weights from {}: {}", weights_path.display(), e))?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = ClipModel::new(vb, &config)?;
        tracing::info!("CLIP model loaded");

        Ok(Self { model, tokenizer, device, config, model_name: model_name.to_string(), dim, pad_id })
    }

    fn to_rows(&self, features: &Tensor, expected: usize) -> Result<Vec<Vec<f32>>> {
        let rows = l2_normalize(features)?.to_device(&Device::Cpu)?.to_vec2::<f32>()?;
        if rows.len() != expected {
            return Err(anyhow!("model returned {} vectors for {} inputs", rows.len(), expected));
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != self.dim) {
            return Err(anyhow!("dim mismatch: got {} expected {}", bad.len(), self.dim));
        }
        Ok(rows)
    }

    fn tokenize(&self, texts: &[String]) -> Result<Tensor> {
        let max_len = self.config.text_config.max_position_embeddings;
        let mut batch = Vec::with_capacity(texts.len());
        for text in texts {
            let enc = self.tokenizer.encode(text.as_str(), true).map_err(|e| anyhow!("Tokenization failed: {}", e))?;
            let mut ids = enc.get_ids().to_vec();
            ids.truncate(max_len);
            batch.push(ids);
        }
        let width = batch.iter().map(Vec::len).max().unwrap_or(1).max(1);
        let mut flat = Vec::with_capacity(batch.len() * width);
        for mut ids in batch {
            ids.resize(width, self.pad_id);
            flat.extend(ids);
        }
        Ok(Tensor::from_vec(flat, (texts.len(), width), &self.device)?)
    }
}

impl Embedder for ClipEmbedder {
    fn backend(&self) -> &str {
        "clip"
    }

    fn model(&self) -> &str {
        &self.model_name
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let pixels = batch_tensor(images, self.config.image_size as u32, &self.device)?;
        let features = self.model.get_image_features(&pixels)?;
        let rows = self.to_rows(&features, images.len())?;
        tracing::debug!(count = images.len(), elapsed_ms = start.elapsed().as_millis() as u64, "embedded images");
        Ok(rows)
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let input_ids = self.tokenize(texts)?;
        let features = self.model.get_text_features(&input_ids)?;
        self.to_rows(&features, texts.len())
    }
}

/// Configured directory, else `$MODEL_DIR`, else `models/clip-vit-base-patch32`.
pub fn resolve_model_dir(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = configured {
        let p = tileindex_core::config::expand_path(dir);
        if p.exists() {
            return Ok(p);
        }
        return Err(anyhow!("model_dir {} does not exist", p.display()));
    }
    if let Ok(dir) = std::env::var("MODEL_DIR") {
        let p = PathBuf::from(&dir);
        if p.exists() {
            tracing::info!(dir = %p.display(), "using MODEL_DIR");
            return Ok(p);
        }
    }
    let default = Path::new("models/clip-vit-base-patch32");
    if default.exists() {
        return Ok(default.to_path_buf());
    }
    Err(anyhow!("Could not locate CLIP model directory"))
}
