use anyhow::Result;
use clap::Parser;

use tileindex_cli::{init_logging, load_settings, shutdown_on_ctrl_c, Stores};
use tileindex_embed::build_embedder;
use tileindex_pipeline::{EmbedderWorker, WorkerOptions};
use tileindex_render::{TileCache, TileRenderer};

/// Consume index requests from one queue: render, embed, upsert, ack.
#[derive(Debug, Parser)]
#[command(name = "tileindex-worker")]
struct Args {
    /// Queue to consume (defaults to `worker.queue`).
    #[arg(long)]
    queue: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Stop after this many non-empty batches.
    #[arg(long)]
    max_batches: Option<usize>,
    /// Exit once a receive comes back empty.
    #[arg(long)]
    until_idle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let mut settings = load_settings()?;
    if let Some(queue) = args.queue {
        settings.worker.queue = queue;
    }
    if let Some(n) = args.batch_size {
        settings.worker.batch_size = n;
    }
    if args.max_batches.is_some() {
        settings.worker.max_batches = args.max_batches;
    }
    settings.validate()?;

    let embedder = build_embedder(&settings.embedder)?;
    let renderer = std::sync::Arc::new(TileRenderer::from_settings(&settings.render));
    let stores = Stores::open(&settings).await?;
    let vectors = Stores::open_vectors(&settings).await?;

    let mut options = WorkerOptions::from_settings(&settings.worker);
    options.stop_when_idle = args.until_idle;
    let mut worker = EmbedderWorker::new(stores.registry, stores.queue, vectors, embedder, renderer, options);
    if settings.cache.enabled {
        let cache = TileCache::from_settings(&settings.cache);
        println!("Tile cache: {}", cache.dir().display());
        worker = worker.with_cache(cache);
    }

    println!("Worker on queue '{}' ({:?} renderer)", worker.options().queue, settings.render.strategy);
    let total = worker.run(shutdown_on_ctrl_c()).await?;
    println!("\n✅ Worker stopped");
    println!(
        "📊 received {}, indexed {}, failed {}, requeued {}, discarded {}",
        total.received, total.indexed, total.failed, total.requeued, total.discarded
    );
    Ok(())
}
