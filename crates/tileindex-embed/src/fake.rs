use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

use image::RgbImage;
use tileindex_core::traits::Embedder;

/// Deterministic, weight-free embedder for tests and dry runs.
///
/// Images hash their dimensions and raw pixels; texts hash whitespace tokens
/// into buckets. Every output is L2-normalised.
#[derive(Debug, Clone)]
pub struct FakeEmbedder {
    model: String,
    dim: usize,
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    for x in &mut v {
        *x /= norm;
    }
    v
}

impl FakeEmbedder {
    pub fn new(model: impl Into<String>, dim: usize) -> Self {
        Self { model: model.into(), dim: dim.max(1) }
    }

    fn embed_image(&self, img: &RgbImage) -> Vec<f32> {
        let mut hasher = XxHash64::with_seed(0);
        img.dimensions().hash(&mut hasher);
        hasher.write(img.as_raw());
        let seed = hasher.finish();
        let v = (0..self.dim)
            .map(|i| {
                let mut h = XxHash64::with_seed(seed);
                h.write_usize(i);
                (h.finish() >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0
            })
            .collect();
        l2_normalize(v)
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            let val = ((h >> 32) as u32) as f32 / u32::MAX as f32;
            v[idx] += val + (i as f32 % 3.0) * 0.01;
        }
        l2_normalize(v)
    }
}

impl Embedder for FakeEmbedder {
    fn backend(&self) -> &str {
        "fake"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_images(&self, images: &[RgbImage]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(images.iter().map(|img| self.embed_image(img)).collect())
    }

    fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
