use image::{Rgb, RgbImage};

use tileindex_core::config::EmbedderSettings;
use tileindex_embed::build_embedder;

fn settings(backend: &str) -> EmbedderSettings {
    EmbedderSettings { backend: backend.into(), model: "ViT-B-32".into(), model_dir: None, dim: 64 }
}

#[test]
fn fake_embedder_shapes_and_determinism() {
    let embedder = build_embedder(&settings("fake")).expect("embedder");
    assert_eq!(embedder.backend(), "fake");
    assert_eq!(embedder.dim(), 64);

    let a = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
    let b = RgbImage::from_pixel(8, 8, Rgb([10, 20, 31]));
    let embs = embedder.embed_images(&[a.clone(), b, a]).expect("embed_images");
    assert_eq!(embs.len(), 3);
    assert_eq!(embs[0].len(), 64);

    let norm: f32 = embs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");

    assert_eq!(embs[0], embs[2], "same pixels, same vector");
    assert_ne!(embs[0], embs[1], "order preserved and inputs distinguished");
}

#[test]
fn fake_text_embeddings_are_deterministic() {
    let embedder = build_embedder(&settings("fake")).expect("embedder");
    let texts = vec!["solar panels on a roof".to_string(), "solar panels on a roof".to_string()];
    let embs = embedder.embed_texts(&texts).expect("embed_texts");
    for (x, y) in embs[0].iter().zip(embs[1].iter()) {
        assert!((x - y).abs() <= 1e-6);
    }
}

#[test]
fn unknown_backend_and_missing_clip_weights_fail() {
    assert!(build_embedder(&settings("siglip")).is_err());
    let mut clip = settings("clip");
    clip.model_dir = Some("/definitely/not/here".into());
    assert!(build_embedder(&clip).is_err());
}

#[test]
fn corrupt_clip_weights_are_a_load_error() {
    let dir = tempfile::TempDir::new().expect("tmp");
    let tokenizer = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"<|endoftext|>": 0, "roof": 1}, "unk_token": "<|endoftext|>"}
    }"#;
    std::fs::write(dir.path().join("tokenizer.json"), tokenizer).expect("tokenizer");
    std::fs::write(dir.path().join("model.safetensors"), b"not a safetensors file").expect("weights");

    let mut clip = settings("clip");
    clip.model_dir = Some(dir.path().to_string_lossy().into_owned());
    let err = build_embedder(&clip).err().expect("load error");
    assert!(format!("{err:#}").contains("Failed to load weights"), "{err:#}");
}
