use std::time::Duration;
use tempfile::TempDir;

use tileindex_core::error::Error;
use tileindex_core::traits::{MessageQueue, TileRegistry, VectorStore};
use tileindex_core::types::{BBox, TileRecord, TileSource, TileStatus, VectorRow};
use tileindex_store::{LanceQueue, LanceTileRegistry, LanceVectorStore};

fn db_uri(tmp: &TempDir) -> String {
    tmp.path().join("lancedb").to_string_lossy().into_owned()
}

fn record(id: &str, source: TileSource) -> TileRecord {
    TileRecord {
        id: id.to_string(),
        bbox: BBox::new(0.0, 0.0, 256.0, 256.0),
        source,
        image_path: None,
        status: TileStatus::WaitingForEmbedding,
        embedder_backend: Some("clip".into()),
        embedder_model: None,
        updated_at: 1,
    }
}

fn vector_row(id: &str, v: f32) -> VectorRow {
    VectorRow {
        tile_id: id.to_string(),
        vector: vec![v; 8],
        image_path: Some(format!("/cache/{id}.png")),
        bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
        gid: Some(4),
        raster_path: None,
        embedder_backend: Some("fake".into()),
        embedder_model: Some("ViT-B-32".into()),
        run_id: Some("run".into()),
        indexed_at: 10,
    }
}

#[tokio::test]
async fn registry_insert_is_idempotent_and_round_trips_sources() {
    let tmp = TempDir::new().expect("tmp");
    let registry = LanceTileRegistry::open(&db_uri(&tmp), "tiles").await.expect("open");

    let records = vec![
        record("tile:0", TileSource::Raster { raster_path: "ortho.tif".into() }),
        record("tile:1", TileSource::Grid { gid: 1 }),
        record("tile:2", TileSource::File { path: "/img/o'neil.png".into() }),
    ];
    assert_eq!(registry.insert(&records).await.expect("insert"), 3);
    assert_eq!(registry.set_status(&["tile:1".into()], TileStatus::Indexed).await.expect("set"), 1);

    assert_eq!(registry.insert(&records).await.expect("re-insert"), 0);
    let t1 = registry.get("tile:1").await.expect("get").expect("exists");
    assert_eq!(t1.status, TileStatus::Indexed);
    assert!(t1.updated_at > 1);

    let t2 = registry.get("tile:2").await.expect("get").expect("exists");
    assert_eq!(t2.source, TileSource::File { path: "/img/o'neil.png".into() });
    assert_eq!(t2.embedder_backend.as_deref(), Some("clip"));
    assert!(registry.get("tile:9").await.expect("get").is_none());
}

#[tokio::test]
async fn registry_maintenance_surface() {
    let tmp = TempDir::new().expect("tmp");
    let registry = LanceTileRegistry::open(&db_uri(&tmp), "tiles").await.expect("open");
    let records: Vec<_> = (0..5).map(|i| record(&format!("tile:{i}"), TileSource::Grid { gid: i })).collect();
    registry.insert(&records).await.expect("insert");

    let failed = registry
        .set_status(&["tile:3".into(), "tile:4".into(), "tile:missing".into()], TileStatus::Failed)
        .await
        .expect("set");
    assert_eq!(failed, 2);

    let summary = registry.summary().await.expect("summary");
    assert_eq!(summary.total, 5);
    assert_eq!(summary.get(TileStatus::WaitingForEmbedding), 3);
    assert_eq!(summary.get(TileStatus::Failed), 2);

    let page = registry.list(Some(TileStatus::WaitingForEmbedding), 2, 1).await.expect("list");
    assert_eq!(page.total, 3);
    let ids: Vec<_> = page.tiles.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["tile:1", "tile:2"]);

    registry.set_image_path("tile:0", "/cache/tile_0.png").await.expect("image path");
    let t0 = registry.get("tile:0").await.expect("get").expect("exists");
    assert_eq!(t0.image_path.as_deref(), Some("/cache/tile_0.png"));
    assert!(matches!(registry.set_image_path("nope", "/x.png").await, Err(Error::NotFound(_))));

    assert_eq!(registry.delete(&["tile:3".into(), "tile:4".into()]).await.expect("delete"), 2);
    assert_eq!(registry.summary().await.expect("summary").total, 3);
}

#[tokio::test]
async fn vector_upsert_overwrites_by_tile_id() {
    let tmp = TempDir::new().expect("tmp");
    let store = LanceVectorStore::open(&db_uri(&tmp), "tile_vectors", 8).await.expect("open");

    store.upsert(&[vector_row("tile:0", 0.1), vector_row("tile:1", 0.1)]).await.expect("upsert");
    store.upsert(&[vector_row("tile:0", 0.5)]).await.expect("upsert again");

    assert_eq!(store.count(None).await.expect("count"), 2);
    assert_eq!(store.count(Some("tile:0")).await.expect("count"), 1);
    let row = store.get("tile:0").await.expect("get").expect("row");
    assert!((row.vector[0] - 0.5).abs() < 1e-6);
    assert_eq!(row.run_id.as_deref(), Some("run"));

    let mut bad = vector_row("tile:2", 0.1);
    bad.vector.truncate(3);
    let err = store.upsert(&[bad]).await.expect_err("short vector");
    assert!(matches!(err, Error::DimensionMismatch { expected: 8, got: 3 }));
    assert!(!err.is_transient());
    assert_eq!(store.dim(), Some(8));
}

#[tokio::test]
async fn vector_delete_removes_only_named_tiles() {
    let tmp = TempDir::new().expect("tmp");
    let store = LanceVectorStore::open(&db_uri(&tmp), "tile_vectors", 8).await.expect("open");
    store
        .upsert(&[vector_row("tile:0", 0.1), vector_row("tile:1", 0.2), vector_row("tile:2", 0.3)])
        .await
        .expect("upsert");

    let removed = store.delete(&["tile:0".into(), "tile:2".into(), "tile:9".into()]).await.expect("delete");
    assert_eq!(removed, 2);
    assert_eq!(store.count(None).await.expect("count"), 1);
    assert!(store.get("tile:0").await.expect("get").is_none());
    assert_eq!(store.delete(&[]).await.expect("empty delete"), 0);
}

#[tokio::test]
async fn registry_pages_are_ordered_and_expiry_uses_updated_at() {
    let tmp = TempDir::new().expect("tmp");
    let registry = LanceTileRegistry::open(&db_uri(&tmp), "tiles").await.expect("open");
    // Inserted out of order across two writes, so rows span fragments.
    let ids = ["tile:07", "tile:02", "tile:09", "tile:00", "tile:05"];
    let records: Vec<_> = ids.iter().map(|id| record(id, TileSource::Grid { gid: 0 })).collect();
    registry.insert(&records[..2]).await.expect("insert");
    registry.insert(&records[2..]).await.expect("insert");

    let page = registry.list(None, 2, 1).await.expect("list");
    assert_eq!(page.total, 5);
    let got: Vec<_> = page.tiles.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(got, vec!["tile:02", "tile:05"]);

    let all = registry.list(None, usize::MAX, 0).await.expect("list all");
    assert_eq!(all.tiles.len(), 5);
    assert!(registry.list(None, 10, 5).await.expect("past the end").tiles.is_empty());

    // A status write refreshes updated_at, taking the tile out of the expired set.
    registry.set_status(&["tile:00".into()], TileStatus::Indexed).await.expect("set");
    let mut expired: Vec<_> = registry.expired(1, 10).await.expect("expired").into_iter().map(|t| t.id).collect();
    expired.sort();
    assert_eq!(expired, vec!["tile:02", "tile:05", "tile:07", "tile:09"]);
    assert_eq!(registry.expired(1, 2).await.expect("limited").len(), 2);
    assert!(registry.expired(0, 10).await.expect("none").is_empty());
}

#[tokio::test]
async fn queue_leases_acks_and_redelivers() {
    let tmp = TempDir::new().expect("tmp");
    let queue = LanceQueue::open(&db_uri(&tmp), "queue_messages", Duration::from_secs(60))
        .await
        .expect("open")
        .with_poll_interval(Duration::from_millis(10));

    queue.publish("tiles.a", "one".into()).await.expect("publish");
    queue.publish("tiles.a", "two".into()).await.expect("publish");
    queue.publish("tiles.b", "other".into()).await.expect("publish");

    let got = queue.receive("tiles.a", 10, Duration::from_millis(50)).await.expect("receive");
    assert_eq!(got.len(), 2);
    assert!(got.iter().all(|d| d.attempt == 1));
    assert_eq!(queue.in_flight("tiles.a").await.expect("in flight"), 2);
    assert!(queue.receive("tiles.a", 10, Duration::from_millis(30)).await.expect("receive").is_empty());

    let (one, two) = if got[0].body == "one" { (&got[0], &got[1]) } else { (&got[1], &got[0]) };
    queue.ack("tiles.a", &[one.tag.clone()]).await.expect("ack");
    queue.nack("tiles.a", &[two.tag.clone()]).await.expect("nack");

    let again = queue.receive("tiles.a", 10, Duration::from_millis(50)).await.expect("receive");
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].body, "two");
    assert_eq!(again[0].attempt, 2);

    // A stale tag from the first lease can no longer settle the message.
    queue.ack("tiles.a", &[two.tag.clone()]).await.expect("stale ack");
    assert_eq!(queue.in_flight("tiles.a").await.expect("in flight"), 1);
    assert_eq!(queue.pending("tiles.b").await.expect("pending"), 1);
}

#[tokio::test]
async fn expired_lease_is_redelivered() {
    let tmp = TempDir::new().expect("tmp");
    let queue = LanceQueue::open(&db_uri(&tmp), "queue_messages", Duration::from_millis(50))
        .await
        .expect("open")
        .with_poll_interval(Duration::from_millis(10));
    queue.publish("q", "body".into()).await.expect("publish");

    let first = queue.receive("q", 1, Duration::from_millis(50)).await.expect("receive");
    assert_eq!(first.len(), 1);
    // No ack: simulate a crashed consumer.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let second = queue.receive("q", 1, Duration::from_millis(200)).await.expect("receive");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].body, "body");
    assert_eq!(second[0].attempt, 2);
    assert_ne!(second[0].tag, first[0].tag);
}
