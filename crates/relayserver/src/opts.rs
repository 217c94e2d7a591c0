// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{crate_version, Args, Parser, ValueEnum};
use serde::Deserialize;
use tracing::info;

use relay_cache::{CacheLimits, DiskRelayCache, InMemoryRelayCache, RelayCache};

use crate::bridge::BridgeSettings;
use crate::router::RelaySettings;
use crate::server::HttpSettings;

#[derive(Debug, Parser)]
#[clap(
    name = "relayserver",
    about = "Relay broker for peer announcements and blob transfers",
    version = crate_version!()
)]
pub struct Opts {
    #[arg(
        long,
        env = "RELAY_CFG_PATH",
        help = "The path to the server config TOML",
        exclusive = true
    )]
    pub cfg_path: Option<PathBuf>,

    #[command(flatten)]
    pub config: Config,
}

impl Opts {
    /// The config from `--cfg-path` if given, otherwise from the command line.
    pub async fn load_config(self) -> anyhow::Result<Config> {
        match self.cfg_path {
            Some(path) => Config::read_toml(&path).await,
            None => Ok(self.config),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Never cache; every blob comes from a peer
    None,
    Memory,
    Disk,
}

#[derive(Clone, Debug, PartialEq, Eq, Args, Deserialize)]
pub struct Config {
    #[arg(
        short,
        long,
        env = "RELAY_PORT",
        help = "Address to listen on; if only a port is specified, all IPv4 addresses are used.",
        value_parser = parse_port_or_socket_addr,
        default_value_t = Config::default_port()
    )]
    #[serde(default = "Config::default_port")]
    pub port: SocketAddr,

    #[arg(
        long,
        help = "Maximum simultaneous connections that may be accepted before the server returns 503.",
        env = "RELAY_MAX_CONNECTIONS",
        default_value_t = Config::default_max_connections()
    )]
    #[serde(default = "Config::default_max_connections")]
    pub max_connections: usize,

    #[arg(
        long,
        help = "Path prefix every relay endpoint lives under",
        env = "RELAY_BASE_PATH",
        default_value_t = Config::default_base_path()
    )]
    #[serde(default = "Config::default_base_path")]
    pub base_path: String,

    #[arg(
        long,
        value_enum,
        help = "Where to cache announcements and blobs",
        env = "RELAY_CACHE",
        default_value_t = Config::default_cache()
    )]
    #[serde(default = "Config::default_cache")]
    pub cache: CacheBackend,

    #[arg(
        long,
        help = "Directory for the disk cache",
        env = "RELAY_CACHE_DIR",
        required_if_eq("cache", "disk")
    )]
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Budget for cached blob bytes; 0 is unbounded",
        env = "RELAY_CACHE_MAX_BYTES",
        default_value_t = Config::default_cache_max_bytes()
    )]
    #[serde(default = "Config::default_cache_max_bytes")]
    pub cache_max_bytes: u64,

    #[arg(
        long,
        help = "Blobs larger than the budget divided by this are never cached",
        env = "RELAY_CACHE_MAX_BLOB_DIVISOR",
        default_value_t = CacheLimits::DEFAULT_MAX_BLOB_DIVISOR
    )]
    #[serde(default = "Config::default_cache_max_blob_divisor")]
    pub cache_max_blob_divisor: u64,

    #[arg(
        long,
        help = "Throttle for blob downloads, in bytes per second per response; 0 is unthrottled",
        env = "RELAY_SERVE_BYTES_PER_SECOND",
        default_value_t = 0
    )]
    #[serde(default)]
    pub serve_bytes_per_second: u64,

    #[arg(
        long,
        help = "Chunks buffered per transfer before an uploading peer has to wait",
        env = "RELAY_QUEUE_CAPACITY",
        default_value_t = Config::default_queue_capacity()
    )]
    #[serde(default = "Config::default_queue_capacity")]
    pub queue_capacity: usize,

    #[arg(
        long,
        help = "Largest chunk fed from an upload into a transfer",
        env = "RELAY_CHUNK_SIZE",
        default_value_t = Config::default_chunk_size()
    )]
    #[serde(default = "Config::default_chunk_size")]
    pub chunk_size: usize,

    #[arg(
        long,
        help = "Seconds an uploading peer may wait for the receiver to accept a chunk",
        env = "RELAY_OFFER_TIMEOUT_SECS",
        default_value_t = Config::default_offer_timeout_secs()
    )]
    #[serde(default = "Config::default_offer_timeout_secs")]
    pub offer_timeout_secs: u64,

    #[arg(
        long,
        help = "Seconds an uploading peer may wait to signal the end of its upload",
        env = "RELAY_EOF_TIMEOUT_SECS",
        default_value_t = Config::default_eof_timeout_secs()
    )]
    #[serde(default = "Config::default_eof_timeout_secs")]
    pub eof_timeout_secs: u64,

    #[arg(
        long,
        help = "Seconds a peer gets to start uploading a requested blob before the next one is asked",
        env = "RELAY_FIRST_CHUNK_TIMEOUT_SECS",
        default_value_t = Config::default_first_chunk_timeout_secs()
    )]
    #[serde(default = "Config::default_first_chunk_timeout_secs")]
    pub first_chunk_timeout_secs: u64,

    #[arg(
        long,
        help = "Seconds a download may stall before it's ended",
        env = "RELAY_IDLE_TIMEOUT_SECS",
        default_value_t = Config::default_idle_timeout_secs()
    )]
    #[serde(default = "Config::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[arg(
        long,
        help = "Most peers asked for one blob download",
        env = "RELAY_MAX_PEER_ATTEMPTS",
        default_value_t = Config::default_max_peer_attempts()
    )]
    #[serde(default = "Config::default_max_peer_attempts")]
    pub max_peer_attempts: usize,

    #[arg(
        long,
        help = "Cancelled transfers remembered before old ones are forgotten",
        env = "RELAY_CANCELLED_RETENTION",
        default_value_t = Config::default_cancelled_retention()
    )]
    #[serde(default = "Config::default_cancelled_retention")]
    pub cancelled_retention: usize,

    #[arg(
        long,
        help = "Seconds a cancelled transfer is remembered once there are too many",
        env = "RELAY_CANCELLED_TTL_SECS",
        default_value_t = Config::default_cancelled_ttl_secs()
    )]
    #[serde(default = "Config::default_cancelled_ttl_secs")]
    pub cancelled_ttl_secs: u64,
}

impl Config {
    pub fn default_port() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 8080))
    }

    pub fn default_max_connections() -> usize {
        1024
    }

    pub fn default_base_path() -> String {
        "/relay/".into()
    }

    pub fn default_cache() -> CacheBackend {
        CacheBackend::Memory
    }

    pub fn default_cache_max_bytes() -> u64 {
        1 << 30
    }

    pub fn default_cache_max_blob_divisor() -> u64 {
        CacheLimits::DEFAULT_MAX_BLOB_DIVISOR
    }

    pub fn default_queue_capacity() -> usize {
        100
    }

    pub fn default_chunk_size() -> usize {
        32 * 1024
    }

    pub fn default_offer_timeout_secs() -> u64 {
        120
    }

    pub fn default_eof_timeout_secs() -> u64 {
        5
    }

    pub fn default_first_chunk_timeout_secs() -> u64 {
        5
    }

    pub fn default_idle_timeout_secs() -> u64 {
        30
    }

    pub fn default_max_peer_attempts() -> usize {
        3
    }

    pub fn default_cancelled_retention() -> usize {
        1000
    }

    pub fn default_cancelled_ttl_secs() -> u64 {
        5 * 60
    }

    pub async fn read_toml(path: &Path) -> anyhow::Result<Self> {
        let config = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Couldn't open config TOML: {path:?}"))?;
        let config: Config =
            toml::from_str(&config).with_context(|| format!("Couldn't parse as TOML: {path:?}"))?;
        let parent_path = path.parent().unwrap_or(".".as_ref());
        Ok(config.relative_to(parent_path))
    }

    /// Resolves relative paths against `base`, the directory of the config file.
    fn relative_to(mut self, base: &Path) -> Self {
        self.cache_dir = self.cache_dir.map(|dir| base.join(dir));
        self
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_size_bytes: self.cache_max_bytes,
            max_blob_divisor: self.cache_max_blob_divisor,
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            bridge: BridgeSettings {
                queue_capacity: self.queue_capacity,
                offer_timeout: Duration::from_secs(self.offer_timeout_secs),
                eof_timeout: Duration::from_secs(self.eof_timeout_secs),
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                cancelled_retention: self.cancelled_retention,
                cancelled_ttl: Duration::from_secs(self.cancelled_ttl_secs),
            },
            chunk_size: self.chunk_size,
            first_chunk_timeout: Duration::from_secs(self.first_chunk_timeout_secs),
            max_peer_attempts: self.max_peer_attempts,
            shuffle_candidates: true,
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            base_path: normalize_base_path(&self.base_path),
            max_connections: self.max_connections,
            serve_bytes_per_second: self.serve_bytes_per_second,
        }
    }

    pub async fn open_cache(&self) -> anyhow::Result<Option<Arc<dyn RelayCache>>> {
        let limits = self.cache_limits();
        let cache: Arc<dyn RelayCache> = match self.cache {
            CacheBackend::None => {
                info!("Caching is disabled");
                return Ok(None);
            }
            CacheBackend::Memory => Arc::new(InMemoryRelayCache::new(limits)),
            CacheBackend::Disk => {
                let dir = self
                    .cache_dir
                    .as_ref()
                    .context("cache_dir is required for the disk cache")?;
                let cache = DiskRelayCache::open(dir, limits)
                    .await
                    .with_context(|| format!("opening disk cache in {dir:?}"))?;
                Arc::new(cache)
            }
        };
        info!("Using {:?} cache with {limits:?}", self.cache);
        Ok(Some(cache))
    }
}

/// Base paths always start and end with a slash.
fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim_matches('/');
    if trimmed.is_empty() {
        "/".into()
    } else {
        format!("/{trimmed}/")
    }
}

fn parse_port_or_socket_addr(arg: &str) -> Result<SocketAddr, <SocketAddr as FromStr>::Err> {
    match u16::from_str(arg) {
        Ok(port) => Ok(SocketAddr::from(([0, 0, 0, 0], port))),
        Err(_) => SocketAddr::from_str(arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        match Opts::try_parse_from(args) {
            Ok(opts) => opts,
            Err(err) => panic!("{err}"),
        }
    }

    #[test]
    fn defaults_match_the_relay_defaults() {
        let config = parse(&["relayserver"]).config;
        assert_eq!(config.port, Config::default_port());
        assert_eq!(config.cache, CacheBackend::Memory);
        assert_eq!(config.cache_limits(), CacheLimits::with_budget(1 << 30));

        assert_eq!(config.relay_settings(), RelaySettings::default());
        assert_eq!(config.http_settings().base_path, "/relay/");
    }

    #[test]
    fn accepts_addressless_ports() {
        let config = parse(&["relayserver", "-p", "9000"]).config;
        assert_eq!(config.port, "0.0.0.0:9000".parse().unwrap());
        let config = parse(&["relayserver", "--port", "127.0.0.1:9001"]).config;
        assert_eq!(config.port, "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn disk_cache_needs_a_directory() {
        assert!(Opts::try_parse_from(["relayserver", "--cache", "disk"]).is_err());
        let config = parse(&["relayserver", "--cache", "disk", "--cache-dir", "/tmp/relay"]).config;
        assert_eq!(config.cache, CacheBackend::Disk);
    }

    #[test]
    fn cfg_path_excludes_other_options() {
        let opts = parse(&["relayserver", "--cfg-path", "relay.toml"]);
        assert_eq!(opts.cfg_path, Some("relay.toml".into()));
        assert!(
            Opts::try_parse_from(["relayserver", "--cfg-path", "relay.toml", "-p", "80"]).is_err()
        );
    }

    #[test]
    fn toml_configs_fall_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            port = "127.0.0.1:7000"
            cache = "none"
            first_chunk_timeout_secs = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.port, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.cache, CacheBackend::None);
        assert_eq!(config.relay_settings().first_chunk_timeout, Duration::from_secs(1));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.base_path, "/relay/");
        assert_eq!(config.cache_dir, None);
    }

    #[tokio::test]
    async fn reads_toml_with_paths_relative_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "cache = \"disk\"\ncache_dir = \"blobs\"\n").unwrap();

        let config = Config::read_toml(&path).await.unwrap();
        assert_eq!(config.cache_dir, Some(dir.path().join("blobs")));

        let missing = Config::read_toml(&dir.path().join("nope.toml")).await;
        assert!(missing.unwrap_err().to_string().contains("Couldn't open config TOML"));
    }

    #[tokio::test]
    async fn opens_the_configured_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = parse(&["relayserver"]).config;
        assert!(config.open_cache().await.unwrap().is_some());

        config.cache = CacheBackend::None;
        assert!(config.open_cache().await.unwrap().is_none());

        config.cache = CacheBackend::Disk;
        config.cache_dir = Some(dir.path().to_owned());
        let cache = config.open_cache().await.unwrap().unwrap();
        assert_eq!(cache.current_size().await, 0);
        assert!(dir.path().join("blobs").is_dir());
    }

    #[test]
    fn normalizes_base_paths() {
        assert_eq!(normalize_base_path("relay"), "/relay/");
        assert_eq!(normalize_base_path("/a/b/"), "/a/b/");
        assert_eq!(normalize_base_path(""), "/");
    }
}
