use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use tileindex_cli::{init_logging, load_settings, shutdown_on_ctrl_c, Stores};
use tileindex_core::traits::{TileRegistry, VectorStore};
use tileindex_core::types::{TileRecord, TileStatus};
use tileindex_pipeline::{Maintainer, MaintainerOptions, Publisher};

/// Inspect and repair the tile registry.
#[derive(Debug, Parser)]
#[command(name = "tileindex-admin")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Tile counts per status.
    Summary,
    /// Tiles ordered by id.
    List {
        #[arg(long)]
        status: Option<TileStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// One tile with its vector row count.
    Show { id: String },
    /// Force a status, e.g. `failed` back to `waiting_for_embedding`.
    SetStatus {
        status: TileStatus,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Remove tiles from the registry and drop their vectors.
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Publish fresh index requests for every tile in a status.
    Republish {
        #[arg(long, default_value = "waiting_for_index")]
        status: TileStatus,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Periodically republish ready tiles and expire stale ones (`daemon.*` settings).
    Daemon {
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        ready_status: Option<TileStatus>,
        /// Tiles per tick, for both republish and expiry.
        #[arg(long)]
        limit: Option<usize>,
        /// 0 turns expiry off.
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
}

fn print_row(r: &TileRecord) {
    let [minx, miny, maxx, maxy] = r.bbox.as_array();
    println!(
        "{:<28} {:<22} [{}, {}, {}, {}] {}",
        r.id,
        r.status,
        minx,
        miny,
        maxx,
        maxy,
        r.image_path.as_deref().unwrap_or("-")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let settings = load_settings()?;
    let stores = Stores::open(&settings).await?;
    let registry = stores.registry.clone();

    match args.command {
        Command::Summary => {
            let counts = registry.summary().await?;
            println!("📊 {} tiles", counts.total);
            for status in TileStatus::ALL {
                println!("   {:<22} {}", status, counts.get(status));
            }
        }
        Command::List { status, limit, offset } => {
            let page = registry.list(status, limit, offset).await?;
            for r in &page.tiles {
                print_row(r);
            }
            println!("-- {} of {} (offset {})", page.tiles.len(), page.total, offset);
        }
        Command::Show { id } => {
            let Some(record) = registry.get(&id).await? else {
                bail!("tile '{}' is not registered", id);
            };
            let vectors = Stores::open_vectors(&settings).await?;
            print_row(&record);
            println!("source:   {:?}", record.source);
            println!(
                "embedder: {} / {}",
                record.embedder_backend.as_deref().unwrap_or("-"),
                record.embedder_model.as_deref().unwrap_or("-")
            );
            println!("vectors:  {}", vectors.count(Some(&id)).await?);
        }
        Command::SetStatus { status, ids } => {
            let n = registry.set_status(&ids, status).await?;
            println!("✅ {} of {} tiles set to {}", n, ids.len(), status);
        }
        Command::Delete { ids } => {
            let vectors = Stores::open_vectors(&settings).await?;
            let dropped = vectors.delete(&ids).await?;
            let n = registry.delete(&ids).await?;
            println!("✅ deleted {} of {} tiles ({} vector rows)", n, ids.len(), dropped);
        }
        Command::Republish { status, limit } => {
            let publisher = Publisher::new(registry, stores.queue.clone(), settings.router()?);
            let report = publisher.republish(status, limit).await?;
            println!("✅ republished {} requests (run {})", report.published, report.run_id);
            for (queue, n) in &report.per_queue {
                println!("   {:<24} {}", queue, n);
            }
        }
        Command::Daemon { interval_ms, ready_status, limit, ttl_secs, once } => {
            let mut daemon = settings.daemon.clone();
            if let Some(ms) = interval_ms {
                daemon.interval_ms = ms.max(1);
            }
            if let Some(status) = ready_status {
                daemon.ready_status = status;
            }
            if let Some(n) = limit {
                daemon.ready_limit = n;
                daemon.ttl_limit = n;
            }
            if let Some(secs) = ttl_secs {
                daemon.ttl_secs = secs;
            }
            let mut options = MaintainerOptions::from_settings(&daemon);
            if once {
                options.max_ticks = Some(1);
            }
            let vectors = Stores::open_vectors(&settings).await?;
            let publisher = Publisher::new(registry.clone(), stores.queue.clone(), settings.router()?);
            let maintainer = Maintainer::new(registry, vectors, publisher, options);

            println!(
                "Maintenance: ready_status={}, interval={}ms, ttl={}",
                daemon.ready_status,
                daemon.interval_ms,
                daemon.ttl().map_or_else(|| "off".to_string(), |t| format!("{}s", t.as_secs()))
            );
            let total = maintainer.run(shutdown_on_ctrl_c()).await;
            println!("\n✅ Maintenance stopped");
            println!("📊 published {}, expired {}", total.published, total.expired);
        }
    }
    Ok(())
}
