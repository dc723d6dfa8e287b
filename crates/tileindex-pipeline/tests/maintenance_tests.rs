use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tileindex_core::memory::{MemoryQueue, MemoryRegistry, MemoryVectorStore};
use tileindex_core::routing::QueueRouter;
use tileindex_core::traits::{TileRegistry, VectorStore};
use tileindex_core::types::{now_millis, BBox, TileRecord, TileSource, TileStatus, VectorRow};
use tileindex_pipeline::{Maintainer, MaintainerOptions, Publisher};

const QUEUE: &str = "tiles.to_index";

struct Fixture {
    registry: Arc<MemoryRegistry>,
    queue: Arc<MemoryQueue>,
    vectors: Arc<MemoryVectorStore>,
}

fn options(ttl: Option<Duration>) -> MaintainerOptions {
    MaintainerOptions {
        interval: Duration::from_millis(10),
        ready_status: TileStatus::WaitingForIndex,
        ready_limit: 100,
        ttl,
        ttl_limit: 100,
        max_ticks: None,
    }
}

fn record(id: &str, status: TileStatus, updated_at: i64) -> TileRecord {
    TileRecord {
        id: id.to_string(),
        bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
        source: TileSource::Grid { gid: 1 },
        image_path: None,
        status,
        embedder_backend: None,
        embedder_model: None,
        updated_at,
    }
}

fn row(id: &str) -> VectorRow {
    VectorRow {
        tile_id: id.to_string(),
        vector: vec![0.5; 4],
        image_path: None,
        bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
        gid: Some(1),
        raster_path: None,
        embedder_backend: Some("fake".into()),
        embedder_model: Some("fake-4".into()),
        run_id: None,
        indexed_at: 1,
    }
}

impl Fixture {
    fn new() -> Self {
        Self {
            registry: Arc::new(MemoryRegistry::new()),
            queue: Arc::new(MemoryQueue::new()),
            vectors: Arc::new(MemoryVectorStore::new()),
        }
    }

    fn maintainer(&self, options: MaintainerOptions) -> Maintainer {
        let router = QueueRouter::parse(&format!("default={QUEUE}")).expect("router");
        let publisher = Publisher::new(self.registry.clone(), self.queue.clone(), router);
        Maintainer::new(self.registry.clone(), self.vectors.clone(), publisher, options)
    }

    async fn status(&self, id: &str) -> TileStatus {
        self.registry.get(id).await.expect("get").expect("registered").status
    }
}

#[tokio::test]
async fn ready_tiles_are_published_and_moved_on() {
    let f = Fixture::new();
    let now = now_millis();
    f.registry
        .insert(&[
            record("a", TileStatus::WaitingForIndex, now),
            record("b", TileStatus::WaitingForIndex, now),
            record("c", TileStatus::Indexed, now),
        ])
        .await
        .expect("insert");
    let m = f.maintainer(options(None));

    assert_eq!(m.publish_ready().await.expect("publish"), 2);
    assert_eq!(f.queue.pending(QUEUE), 2);
    assert_eq!(f.status("a").await, TileStatus::WaitingForEmbedding);
    assert_eq!(f.status("c").await, TileStatus::Indexed);

    // Already moved out of the ready status, so nothing is sent twice.
    assert_eq!(m.publish_ready().await.expect("again"), 0);
    assert_eq!(f.queue.pending(QUEUE), 2);
}

#[tokio::test]
async fn ready_limit_caps_one_tick() {
    let f = Fixture::new();
    let now = now_millis();
    let records: Vec<_> = (0..5).map(|i| record(&format!("t{i}"), TileStatus::Failed, now)).collect();
    f.registry.insert(&records).await.expect("insert");
    let mut opts = options(None);
    opts.ready_status = TileStatus::Failed;
    opts.ready_limit = 3;

    assert_eq!(f.maintainer(opts).publish_ready().await.expect("publish"), 3);
    assert_eq!(f.registry.summary().await.expect("summary").get(TileStatus::Failed), 2);
}

#[tokio::test]
async fn expiry_drops_old_tiles_and_their_vectors() {
    let f = Fixture::new();
    let now = now_millis();
    f.registry
        .insert(&[
            record("old", TileStatus::Indexed, now - 120_000),
            record("fresh", TileStatus::Indexed, now),
        ])
        .await
        .expect("insert");
    f.vectors.upsert(&[row("old"), row("fresh")]).await.expect("upsert");

    let report = f.maintainer(options(Some(Duration::from_secs(60)))).tick().await.expect("tick");
    assert_eq!(report.expired, 1);
    assert!(f.registry.get("old").await.expect("get").is_none());
    assert_eq!(f.vectors.count(Some("old")).await.expect("count"), 0);
    assert_eq!(f.vectors.count(Some("fresh")).await.expect("count"), 1);
    assert_eq!(f.status("fresh").await, TileStatus::Indexed);
}

#[tokio::test]
async fn expiry_is_off_without_ttl() {
    let f = Fixture::new();
    f.registry.insert(&[record("old", TileStatus::Indexed, 1)]).await.expect("insert");

    let report = f.maintainer(options(None)).tick().await.expect("tick");
    assert_eq!(report, Default::default());
    assert!(f.registry.get("old").await.expect("get").is_some());
}

#[tokio::test]
async fn run_ticks_until_cancelled() {
    let f = Fixture::new();
    f.registry.insert(&[record("a", TileStatus::WaitingForIndex, now_millis())]).await.expect("insert");
    let m = f.maintainer(options(None));

    let token = CancellationToken::new();
    let handle = {
        let token = token.clone();
        tokio::spawn(async move { m.run(token).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();
    let total = handle.await.expect("join");
    assert_eq!(total.published, 1);

    let mut once = options(None);
    once.max_ticks = Some(1);
    f.registry.set_status(&["a".into()], TileStatus::WaitingForIndex).await.expect("reset");
    let total = f.maintainer(once).run(CancellationToken::new()).await;
    assert_eq!(total.published, 1);
}
