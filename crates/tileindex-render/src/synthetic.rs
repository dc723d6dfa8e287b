use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hash::Hasher;
use twox_hash::XxHash64;

use tileindex_core::types::BBox;

const NOISE_AMPLITUDE: f32 = 0.2;

/// Deterministic stand-in for satellite imagery: a diagonal gradient plus
/// noise seeded from `(gid, bbox)`.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticRenderer {
    size: u32,
}

pub fn tile_seed(gid: i64, bbox: &BBox) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write_i64(gid);
    for v in bbox.as_array() {
        hasher.write_u64(v.to_bits());
    }
    hasher.finish()
}

impl SyntheticRenderer {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn render(&self, gid: i64, bbox: &BBox) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(tile_seed(gid, bbox));
        let span = (self.size.saturating_sub(1)).max(1) as f32;
        let mut img = RgbImage::new(self.size, self.size);
        for y in 0..self.size {
            for x in 0..self.size {
                let base = (x as f32 / span + y as f32 / span) / 2.0;
                let mut px = [0u8; 3];
                for c in &mut px {
                    let v = (base + rng.gen::<f32>() * NOISE_AMPLITUDE).clamp(0.0, 1.0);
                    *c = (v * 255.0 + 0.5) as u8;
                }
                img.put_pixel(x, y, Rgb(px));
            }
        }
        img
    }
}
