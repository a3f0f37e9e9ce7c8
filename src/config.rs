//! Service configuration loaded from the environment.
//!
//! Every key has a default so the binary comes up with no configuration at
//! all; `.env` files are honored by the binary before this module reads the
//! environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Default TTL for generic TTL-store entries.
    pub default_ttl: Duration,
    /// Cadence of the expired-entry sweep.
    pub cleanup_interval: Duration,
    /// TTL for per-request contexts; must exceed worst-case processing time.
    pub client_context_ttl: Duration,

    /// Single-upload body limit in bytes.
    pub max_file_size: usize,
    /// Batch limits.
    pub batch_max_files: usize,
    pub batch_max_file_size: usize,

    pub default_quality: u8,

    /// Worker pool sizing.
    pub queue_concurrency: usize,
    pub pool_min_threads: usize,
    pub pool_idle_timeout: Duration,
    pub queue_max_depth: usize,

    /// Attempts for the blob-store upload.
    pub max_retries: u32,

    /// Base URL prepended to minted keys to form `downloadUrl`.
    pub download_base_url: String,

    /// Where inbound uploads are spooled.
    pub upload_dir: PathBuf,
    /// Local blob-sink root; also backs the legacy download endpoint.
    pub storage_dir: PathBuf,

    /// TTF/OTF file used for watermark text; watermarking is unavailable
    /// without it.
    pub watermark_font_path: Option<PathBuf>,

    /// Grace period between a terminal SSE event and stream close.
    pub sse_grace: Duration,
    /// Idle expiry for per-id SSE channels.
    pub sse_idle_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            default_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_millis(300_000),
            client_context_ttl: Duration::from_secs(3600),
            max_file_size: 52_428_800,
            batch_max_files: 10,
            batch_max_file_size: 10_485_760,
            default_quality: 80,
            queue_concurrency: 4,
            pool_min_threads: 1,
            pool_idle_timeout: Duration::from_millis(5000),
            queue_max_depth: 10_000,
            max_retries: 3,
            download_base_url: "http://localhost:3000/image-optimization/download".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            storage_dir: PathBuf::from("./optimized"),
            watermark_font_path: None,
            sse_grace: Duration::from_secs(5),
            sse_idle_ttl: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults for
    /// anything unset or unparseable (unparseable values are logged).
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            host: env_or("HOST", defaults.host),
            port: env_or("PORT", defaults.port),
            default_ttl: Duration::from_secs(env_or("DEFAULT_TTL", 3600u64)),
            cleanup_interval: Duration::from_millis(env_or("CLEANUP_INTERVAL", 300_000u64)),
            client_context_ttl: Duration::from_secs(env_or("CLIENT_CONTEXT_TTL", 3600u64)),
            max_file_size: env_or("MAX_FILE_SIZE", defaults.max_file_size),
            batch_max_files: env_or("BATCH_MAX_FILES", defaults.batch_max_files),
            batch_max_file_size: env_or("BATCH_MAX_FILE_SIZE", defaults.batch_max_file_size),
            default_quality: env_or("DEFAULT_QUALITY", defaults.default_quality),
            queue_concurrency: env_or("QUEUE_CONCURRENCY", defaults.queue_concurrency),
            pool_min_threads: env_or("POOL_MIN_THREADS", defaults.pool_min_threads),
            pool_idle_timeout: Duration::from_millis(env_or("POOL_IDLE_TIMEOUT_MS", 5000u64)),
            queue_max_depth: env_or("QUEUE_MAX_DEPTH", defaults.queue_max_depth),
            max_retries: env_or("MAX_RETRIES", defaults.max_retries),
            download_base_url: env_or("S3_CUSTOM_DOMAIN", defaults.download_base_url),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "./uploads".to_string())),
            storage_dir: PathBuf::from(env_or("STORAGE_DIR", "./optimized".to_string())),
            watermark_font_path: std::env::var("WATERMARK_FONT_PATH").ok().map(PathBuf::from),
            sse_grace: Duration::from_secs(env_or("SSE_GRACE_SECONDS", 5u64)),
            sse_idle_ttl: Duration::from_secs(env_or("SSE_IDLE_TTL_SECONDS", 3600u64)),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw, "ignoring unparseable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}
