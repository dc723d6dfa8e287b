use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use tileindex_cli::{init_logging, load_settings, progress_bar, Stores};
use tileindex_core::config::expand_path;
use tileindex_core::manifest::read_manifest;
use tileindex_pipeline::Publisher;

/// Register a tile manifest and publish one index request per tile.
#[derive(Debug, Parser)]
#[command(name = "tileindex-publish")]
struct Args {
    /// JSON-lines manifest (defaults to `publisher.manifest_path`).
    manifest: Option<PathBuf>,
    /// Only take the first N manifest entries.
    #[arg(long)]
    limit: Option<usize>,
    /// Override the routing table, e.g. `clip=tiles.clip,pe_core=tiles.pe`.
    #[arg(long)]
    routing: Option<String>,
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let mut settings = load_settings()?;
    if let Some(table) = args.routing {
        settings.routing.table = table;
    }
    let router = settings.router()?;

    let manifest = args.manifest.unwrap_or_else(|| expand_path(&settings.publisher.manifest_path));
    let entries = read_manifest(&manifest)?;
    println!("Manifest: {} ({} tiles)", manifest.display(), entries.len());

    let stores = Stores::open(&settings).await?;
    let mut publisher = Publisher::new(stores.registry.clone(), stores.queue.clone(), router);
    if !args.no_progress {
        publisher = publisher.with_progress(progress_bar());
    }
    let report = publisher.publish(&entries, args.limit.or(settings.publisher.limit)).await?;

    println!("\n✅ Publish complete (run {})", report.run_id);
    println!("📊 {} entries, {} newly registered, {} requests published", report.entries, report.registered, report.published);
    for (queue, n) in &report.per_queue {
        println!("   {:<24} {}", queue, n);
    }
    Ok(())
}
