//! Configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge built-in defaults, `config.toml`,
//! `config.<env>.toml` and `TILEINDEX_*` env vars (nested keys joined with
//! `__`, e.g. `TILEINDEX_WORKER__QUEUE`). Settings are extracted once at
//! startup and passed by reference from there on.
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::routing::QueueRouter;
use crate::types::TileStatus;

pub const ENV_PREFIX: &str = "TILEINDEX_";

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(Self { figment })
    }

    /// Wrap an already assembled figment (tests, embedding in other tools).
    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    /// Extract and validate the full settings tree.
    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub routing: RoutingSettings,
    pub publisher: PublisherSettings,
    pub worker: WorkerSettings,
    pub render: RenderSettings,
    pub cache: CacheSettings,
    pub embedder: EmbedderSettings,
    pub daemon: DaemonSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.worker.batch_size == 0 {
            return Err(Error::InvalidConfig("worker.batch_size must be > 0".into()));
        }
        if self.worker.queue.trim().is_empty() {
            return Err(Error::InvalidConfig("worker.queue must not be empty".into()));
        }
        if self.render.tile_size == 0 {
            return Err(Error::InvalidConfig("render.tile_size must be > 0".into()));
        }
        if self.embedder.dim == 0 {
            return Err(Error::InvalidConfig("embedder.dim must be > 0".into()));
        }
        if self.daemon.interval_ms == 0 {
            return Err(Error::InvalidConfig("daemon.interval_ms must be > 0".into()));
        }
        self.router().map(|_| ())
    }

    pub fn router(&self) -> Result<QueueRouter> {
        Ok(QueueRouter::parse(&self.routing.table)?.with_broadcast(self.routing.broadcast_unrouted))
    }
}

/// LanceDB location and table names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub uri: String,
    pub registry_table: String,
    pub vector_table: String,
    pub queue_table: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            uri: "data/lancedb".into(),
            registry_table: "tiles".into(),
            vector_table: "tile_vectors".into(),
            queue_table: "queue_messages".into(),
        }
    }
}

impl StoreSettings {
    pub fn uri_path(&self) -> PathBuf {
        expand_path(&self.uri)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// `backend[:model]=queue` entries, comma separated.
    pub table: String,
    pub broadcast_unrouted: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self { table: "default=tiles.to_index".into(), broadcast_unrouted: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub manifest_path: String,
    pub limit: Option<usize>,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self { manifest_path: "data/manifest.jsonl".into(), limit: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub queue: String,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub visibility_timeout_ms: u64,
    pub render_workers: usize,
    pub upsert_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Withhold the ack until the `indexed` registry write succeeds.
    pub require_indexed_before_ack: bool,
    pub max_batches: Option<usize>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: "tiles.to_index".into(),
            batch_size: 32,
            batch_timeout_ms: 1000,
            visibility_timeout_ms: 300_000,
            render_workers: 4,
            upsert_retries: 3,
            retry_base_delay_ms: 200,
            require_indexed_before_ack: false,
            max_batches: None,
        }
    }
}

impl WorkerSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStrategy {
    Orthophoto,
    Synthetic,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub strategy: RenderStrategy,
    pub default_raster_path: Option<String>,
    pub tile_size: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self { strategy: RenderStrategy::Synthetic, default_raster_path: None, tile_size: 224 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheFormat {
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
}

impl CacheFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CacheFormat::Png => "png",
            CacheFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: String,
    pub format: CacheFormat,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { enabled: false, dir: "data/tiles_cache".into(), format: CacheFormat::Png }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    /// `fake` or `clip`.
    pub backend: String,
    pub model: String,
    pub model_dir: Option<String>,
    pub dim: usize,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self { backend: "fake".into(), model: "ViT-B-32".into(), model_dir: None, dim: 512 }
    }
}

/// Maintenance loop: periodic republish of one status plus TTL expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub interval_ms: u64,
    pub ready_status: TileStatus,
    pub ready_limit: usize,
    /// Tiles untouched for this long are deleted; 0 turns expiry off.
    pub ttl_secs: u64,
    pub ttl_limit: usize,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            ready_status: TileStatus::WaitingForIndex,
            ready_limit: 500,
            ttl_secs: 0,
            ttl_limit: 500,
        }
    }
}

impl DaemonSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.router().expect("router").queues(), ["tiles.to_index".to_string()]);
        assert!(!settings.worker.require_indexed_before_ack);
    }

    #[test]
    fn toml_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [routing]
                table = "clip=tiles.clip,pe_core=tiles.pe"

                [cache]
                enabled = true
                format = "jpg"
                "#,
            )?;
            jail.set_env("TILEINDEX_WORKER__QUEUE", "tiles.clip");
            jail.set_env("TILEINDEX_WORKER__REQUIRE_INDEXED_BEFORE_ACK", "true");

            let figment = Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file("config.toml"))
                .merge(Env::prefixed(ENV_PREFIX).split("__"));
            let settings = Config::from_figment(figment).settings().map_err(|e| e.to_string())?;

            assert_eq!(settings.worker.queue, "tiles.clip");
            assert!(settings.worker.require_indexed_before_ack);
            assert_eq!(settings.worker.batch_size, 32);
            assert!(settings.cache.enabled);
            assert_eq!(settings.cache.format, CacheFormat::Jpeg);
            assert_eq!(settings.router().map_err(|e| e.to_string())?.queues().len(), 2);
            Ok(())
        });
    }

    #[test]
    fn daemon_ttl_zero_disables_expiry() {
        let mut settings = DaemonSettings::default();
        assert_eq!(settings.ttl(), None);
        settings.ttl_secs = 90;
        assert_eq!(settings.ttl(), Some(Duration::from_secs(90)));

        let mut all = Settings::default();
        all.daemon.interval_ms = 0;
        assert!(matches!(all.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn invalid_routing_table_fails_validation() {
        let mut settings = Settings::default();
        settings.routing.table = "clip".into();
        assert!(matches!(settings.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn expand_path_keeps_plain_relative_paths() {
        assert_eq!(expand_path("data/lancedb"), PathBuf::from("data/lancedb"));
    }
}
