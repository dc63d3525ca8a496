//! Centralized configuration for the torrent web cache.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::streaming::parse_byte_size;

/// Central configuration for all cache components.
///
/// Groups related settings into sections. Supports environment variable
/// overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub store: StoreConfig,
    pub pools: PoolConfig,
    pub preload: PreloadConfig,
    pub streaming: StreamingConfig,
    pub network: NetworkConfig,
    pub web: WebConfig,
}

/// Object store connection and layout.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Spread pieces over `<bucket>-<xx>` buckets by info-hash prefix
    pub bucket_spread: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "cache".to_string(),
            bucket_spread: false,
        }
    }
}

/// How long decoded torrent metadata stays cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataLifetime {
    /// Evicted when the request that loaded it finishes.
    Request,
    /// Evicted after this long without access.
    Idle(Duration),
}

/// Lifetimes of the in-memory pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Completed-piece records, measured from first load
    pub completed_pieces_ttl: Duration,
    pub metadata_lifetime: MetadataLifetime,
    /// At most one store touch per torrent within this window
    pub touch_window: Duration,
    /// Idle time after which a session's prefetch queue is closed
    pub prefetch_queue_ttl: Duration,
    /// How often reapers purge expired entries
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            completed_pieces_ttl: Duration::from_secs(10),
            metadata_lifetime: MetadataLifetime::Idle(Duration::from_secs(60)),
            touch_window: Duration::from_secs(600),
            prefetch_queue_ttl: Duration::from_secs(60),
            reap_interval: Duration::from_secs(1),
        }
    }
}

/// On-disk preload cache.
#[derive(Debug, Clone)]
pub struct PreloadConfig {
    pub dir: PathBuf,
    /// Idle time after which a piece is forgotten by the in-memory pool
    pub entry_ttl: Duration,
    /// Size cap enforced by the background sweep
    pub max_size: u64,
    pub sweep_interval: Duration,
    /// Remove the whole directory on shutdown
    pub remove_on_shutdown: bool,
    /// Delete a piece's file when its pool entry expires
    pub evict_on_expiry: bool,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            entry_ttl: Duration::from_secs(5),
            max_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            sweep_interval: Duration::from_secs(10),
            remove_on_shutdown: true,
            evict_on_expiry: false,
        }
    }
}

/// Size of the prefetch window ahead of a reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookaheadPolicy {
    /// A share of the file length, capped at `max_bytes`.
    FileShare { ratio: f64, max_bytes: u64 },
    /// A fixed number of pieces.
    Pieces(u32),
}

impl LookaheadPolicy {
    /// Number of pieces to warm ahead of the current one.
    pub fn piece_count(&self, file_length: u64, piece_length: u64) -> u32 {
        match *self {
            LookaheadPolicy::Pieces(count) => count,
            LookaheadPolicy::FileShare { ratio, max_bytes } => {
                if piece_length == 0 {
                    return 0;
                }
                let bytes = ((file_length as f64 * ratio) as u64).min(max_bytes);
                bytes.div_ceil(piece_length) as u32
            }
        }
    }
}

/// Range reader behavior.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Number of reusable copy buffers shared by all readers
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub lookahead: LookaheadPolicy,
    /// Workers per session prefetch queue
    pub prefetch_workers: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1000,
            buffer_size: 32 * 1024, // 32 KiB
            lookahead: LookaheadPolicy::FileShare {
                ratio: 0.05,
                max_bytes: 64 * 1024 * 1024, // 64 MiB
            },
            prefetch_workers: 3,
        }
    }
}

/// Origin HTTP client.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for establishing an origin connection
    pub connect_timeout: Duration,
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: "torrent-web-cache/0.1.0",
        }
    }
}

/// HTTP front end.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Origin base URL used when requests carry no `X-Source-Url`
    pub source_url: Option<String>,
    /// Response byte rate used when requests carry no `X-Download-Rate`
    pub download_rate: Option<u64>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            source_url: None,
            download_rate: None,
        }
    }
}

impl CacheConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Store configuration overrides
        if let Ok(value) = std::env::var("TWC_AWS_ACCESS_KEY_ID") {
            config.store.access_key_id = Some(value);
        }
        if let Ok(value) = std::env::var("TWC_AWS_SECRET_ACCESS_KEY") {
            config.store.secret_access_key = Some(value);
        }
        if let Ok(value) = std::env::var("TWC_AWS_ENDPOINT") {
            config.store.endpoint = Some(value);
        }
        if let Ok(value) = std::env::var("TWC_AWS_REGION") {
            config.store.region = value;
        }
        if let Ok(value) = std::env::var("TWC_AWS_BUCKET") {
            config.store.bucket = value;
        }
        if let Ok(value) = std::env::var("TWC_AWS_BUCKET_SPREAD") {
            config.store.bucket_spread = value.parse().unwrap_or(false);
        }

        // Preload configuration overrides
        if let Ok(value) = std::env::var("TWC_PRELOAD_DIR") {
            config.preload.dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("TWC_PRELOAD_MAX_SIZE") {
            if let Ok(size) = parse_byte_size(&value) {
                config.preload.max_size = size;
            }
        }
        if let Ok(value) = std::env::var("TWC_PRELOAD_KEEP_DIR") {
            config.preload.remove_on_shutdown = !value.parse().unwrap_or(false);
        }

        // Streaming configuration overrides
        if let Ok(value) = std::env::var("TWC_PREFETCH_PIECES") {
            if let Ok(count) = value.parse::<u32>() {
                config.streaming.lookahead = LookaheadPolicy::Pieces(count);
            }
        }

        // Pool configuration overrides
        if let Ok(value) = std::env::var("TWC_METADATA_TTL") {
            if let Ok(seconds) = value.parse::<u64>() {
                config.pools.metadata_lifetime = if seconds == 0 {
                    MetadataLifetime::Request
                } else {
                    MetadataLifetime::Idle(Duration::from_secs(seconds))
                };
            }
        }

        // Web configuration overrides
        if let Ok(value) = std::env::var("SOURCE_URL") {
            config.web.source_url = Some(value);
        }
        if let Ok(value) = std::env::var("DOWNLOAD_RATE") {
            if let Ok(rate) = parse_byte_size(&value) {
                config.web.download_rate = Some(rate);
            }
        }

        config
    }

    /// Creates a configuration with short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            pools: PoolConfig {
                completed_pieces_ttl: Duration::from_millis(200),
                metadata_lifetime: MetadataLifetime::Idle(Duration::from_millis(500)),
                touch_window: Duration::from_secs(1),
                prefetch_queue_ttl: Duration::from_millis(500),
                reap_interval: Duration::from_millis(20),
            },
            preload: PreloadConfig {
                entry_ttl: Duration::from_millis(500),
                max_size: 1024 * 1024,
                sweep_interval: Duration::from_millis(50),
                ..PreloadConfig::default()
            },
            streaming: StreamingConfig {
                buffer_count: 16,
                buffer_size: 4096,
                lookahead: LookaheadPolicy::Pieces(2),
                prefetch_workers: 2,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = CacheConfig::default();

        assert_eq!(config.pools.completed_pieces_ttl, Duration::from_secs(10));
        assert_eq!(config.pools.touch_window, Duration::from_secs(600));
        assert_eq!(config.streaming.buffer_count, 1000);
        assert_eq!(config.streaming.buffer_size, 32768);
        assert_eq!(config.streaming.prefetch_workers, 3);
        assert_eq!(config.preload.dir, PathBuf::from("cache"));
        assert_eq!(config.web.port, 8080);
        assert!(config.preload.entry_ttl < Duration::from_secs(10));
    }

    #[test]
    fn test_lookahead_file_share_is_capped() {
        let policy = LookaheadPolicy::FileShare {
            ratio: 0.05,
            max_bytes: 1024 * 1024,
        };
        // 5% of 100 MiB is 5 MiB, capped to 1 MiB = 4 pieces of 256 KiB
        assert_eq!(policy.piece_count(100 * 1024 * 1024, 256 * 1024), 4);
        // 5% of 1 MB rounds up to a single piece
        assert_eq!(policy.piece_count(1_000_000, 256 * 1024), 1);
        assert_eq!(LookaheadPolicy::Pieces(3).piece_count(0, 16384), 3);
    }

    #[test]
    fn test_testing_preset_is_fast() {
        let config = CacheConfig::for_testing();
        assert!(config.pools.reap_interval < Duration::from_secs(1));
        assert_eq!(config.streaming.lookahead, LookaheadPolicy::Pieces(2));
    }
}
