//! CLIP image preprocessing: resize to 224x224 (bilinear), scale to [0,1],
//! normalise with the CLIP channel mean/std, lay out as CHW.
use anyhow::Result;
use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Planar `[3 * size * size]` values for one image.
pub fn normalize_chw(img: &RgbImage, size: u32) -> Vec<f32> {
    let resized;
    let img = if img.dimensions() == (size, size) {
        img
    } else {
        resized = imageops::resize(img, size, size, FilterType::Triangle);
        &resized
    };
    let plane = (size * size) as usize;
    let mut out = vec![0f32; plane * 3];
    for (i, px) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (f32::from(px[c]) / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    out
}

/// Stack a batch into a `(B, 3, size, size)` tensor.
pub fn batch_tensor(images: &[RgbImage], size: u32, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(images.len() * (3 * size * size) as usize);
    for img in images {
        data.extend(normalize_chw(img, size));
    }
    let s = size as usize;
    Ok(Tensor::from_vec(data, (images.len(), 3, s, s), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn output_is_planar_and_normalised() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 128]));
        let v = normalize_chw(&img, 2);
        assert_eq!(v.len(), 12);
        assert!((v[0] - (1.0 - CLIP_MEAN[0]) / CLIP_STD[0]).abs() < 1e-5);
        assert!((v[4] - (0.0 - CLIP_MEAN[1]) / CLIP_STD[1]).abs() < 1e-5);
    }
}
