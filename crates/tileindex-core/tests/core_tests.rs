use std::time::Duration;

use tileindex_core::error::Error;
use tileindex_core::manifest::{parse_manifest, read_manifest};
use tileindex_core::memory::{MemoryQueue, MemoryRegistry, MemoryVectorStore};
use tileindex_core::traits::{MessageQueue, TileRegistry, VectorStore};
use tileindex_core::types::{BBox, TileStatus, VectorRow};

const MANIFEST: &str = r#"{"id":"tile:0","bbox":[0,0,64,64],"gid":0}
{"id":"tile:1","bbox":[64,0,128,64],"gid":1}
{"id":"tile:2","bbox":[0,64,64,128],"gid":2}
"#;

#[tokio::test]
async fn reinserting_registered_id_keeps_status() {
    let registry = MemoryRegistry::new();
    let entries = parse_manifest(MANIFEST.as_bytes()).expect("manifest");
    let records: Vec<_> = entries.iter().map(|e| e.to_record(1).expect("record")).collect();

    assert_eq!(registry.insert(&records).await.expect("insert"), 3);
    registry.set_status(&["tile:1".to_string()], TileStatus::Indexed).await.expect("set");

    assert_eq!(registry.insert(&records).await.expect("re-insert"), 0, "no duplicates");
    let tile = registry.get("tile:1").await.expect("get").expect("present");
    assert_eq!(tile.status, TileStatus::Indexed);

    let summary = registry.summary().await.expect("summary");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.get(TileStatus::WaitingForEmbedding), 2);
    assert_eq!(summary.get(TileStatus::Indexed), 1);
}

#[tokio::test]
async fn list_filters_and_pages() {
    let registry = MemoryRegistry::new();
    let entries = parse_manifest(MANIFEST.as_bytes()).expect("manifest");
    let records: Vec<_> = entries.iter().map(|e| e.to_record(1).expect("record")).collect();
    registry.insert(&records).await.expect("insert");
    registry.set_status(&["tile:0".to_string(), "tile:missing".to_string()], TileStatus::Failed).await.expect("set");

    let waiting = registry.list(Some(TileStatus::WaitingForEmbedding), 1, 1).await.expect("list");
    assert_eq!(waiting.total, 2);
    assert_eq!(waiting.tiles.len(), 1);
    assert_eq!(waiting.tiles[0].id, "tile:2");

    assert_eq!(registry.delete(&["tile:0".to_string(), "tile:9".to_string()]).await.expect("delete"), 1);
    assert!(registry.get("tile:0").await.expect("get").is_none());
}

#[tokio::test]
async fn queue_redelivers_nacked_messages() {
    let queue = MemoryQueue::new();
    queue.publish("q", "a".into()).await.expect("publish");
    queue.publish("q", "b".into()).await.expect("publish");

    let first = queue.receive("q", 10, Duration::from_millis(10)).await.expect("receive");
    assert_eq!(first.len(), 2);
    assert_eq!(queue.in_flight("q"), 2);

    queue.ack("q", &[first[0].tag.clone()]).await.expect("ack");
    queue.nack("q", &[first[1].tag.clone()]).await.expect("nack");

    let again = queue.receive("q", 10, Duration::from_millis(10)).await.expect("receive");
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].body, "b");
    assert_eq!(again[0].attempt, 2);
}

#[tokio::test]
async fn receive_times_out_empty_and_wakes_on_publish() {
    let queue = std::sync::Arc::new(MemoryQueue::new());
    let empty = queue.receive("q", 4, Duration::from_millis(20)).await.expect("receive");
    assert!(empty.is_empty());

    let q2 = queue.clone();
    let waiter = tokio::spawn(async move { q2.receive("q", 4, Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.publish("q", "late".into()).await.expect("publish");
    let got = waiter.await.expect("join").expect("receive");
    assert_eq!(got.len(), 1);
}

#[tokio::test]
async fn vector_upsert_replaces_by_tile_id() {
    let store = MemoryVectorStore::new();
    let row = |v: f32| VectorRow {
        tile_id: "tile:0".into(),
        vector: vec![v; 4],
        image_path: None,
        bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
        gid: Some(0),
        raster_path: None,
        embedder_backend: None,
        embedder_model: None,
        run_id: None,
        indexed_at: 0,
    };
    store.upsert(&[row(0.1)]).await.expect("upsert");
    store.upsert(&[row(0.2)]).await.expect("upsert");
    assert_eq!(store.count(None).await.expect("count"), 1);
    assert_eq!(store.count(Some("tile:0")).await.expect("count"), 1);
    assert_eq!(store.rows()[0].vector[0], 0.2);
}

#[test]
fn read_manifest_from_disk() {
    let dir = tempfile::tempdir().expect("tmp");
    let path = dir.path().join("manifest.jsonl");
    std::fs::write(&path, MANIFEST).expect("write");
    let entries = read_manifest(&path).expect("read");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].gid, Some(2));

    let err = read_manifest(&dir.path().join("missing.jsonl")).expect_err("missing file");
    assert!(matches!(err, Error::Manifest(_)));
}
