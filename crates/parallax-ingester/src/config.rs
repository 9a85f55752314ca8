//! Configuration types for the ingestion engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::Deserialize;

use crate::IngestError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default directory for write-ahead block files.
pub const DEFAULT_WAL_PATH: &str = "./data/wal";

/// Default directory for completed local blocks.
pub const DEFAULT_BLOCKS_PATH: &str = "./data/blocks";

/// Default idle time after which a live trace is cut to the head block.
pub const DEFAULT_MAX_TRACE_IDLE_SECS: u64 = 10;

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

/// Default maximum age of a head block before it is cut.
pub const DEFAULT_MAX_BLOCK_DURATION_SECS: u64 = 30 * 60;

/// Default maximum head-block size before it is cut (500 MiB).
pub const DEFAULT_MAX_BLOCK_BYTES: u64 = 500 * 1024 * 1024;

/// Default time a flushed block is kept locally before deletion.
pub const DEFAULT_COMPLETE_BLOCK_TIMEOUT_SECS: u64 = 15 * 60;

/// Default permissible skew between span timestamps and wall-clock time.
pub const DEFAULT_INGESTION_SLACK_SECS: u64 = 2 * 60;

/// Default maximum backend flush retry attempts per sweep.
pub const DEFAULT_FLUSH_MAX_RETRIES: u32 = 3;

/// Default initial flush retry delay in milliseconds.
pub const DEFAULT_FLUSH_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum flush retry delay in milliseconds.
pub const DEFAULT_FLUSH_MAX_DELAY_MS: u64 = 10_000;

/// Default per-tenant live-trace limit (before division by healthy peers).
pub const DEFAULT_MAX_LOCAL_TRACES_PER_USER: usize = 10_000;

/// Default per-trace byte limit.
pub const DEFAULT_MAX_BYTES_PER_TRACE: usize = 5_000_000;

/// Default per-request byte limit. Zero means unlimited.
pub const DEFAULT_MAX_BYTES_PER_REQUEST: usize = 0;

/// Ingestion engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    /// Write-ahead log configuration.
    pub wal: WalConfig,
    /// Block lifecycle cadence and flush behaviour.
    pub lifecycle: LifecycleConfig,
    /// Per-tenant limits and overrides.
    pub limits: LimitsConfig,
    /// Backend object storage for flushed blocks.
    pub storage: StorageConfig,
}

impl IngesterConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `parallax.toml` in the current directory
    /// 3. Environment variables prefixed with `PARALLAX_`
    pub fn load() -> Result<Self, IngestError> {
        Figment::new()
            .merge(Toml::file("parallax.toml"))
            .merge(Env::prefixed("PARALLAX_").split("_"))
            .extract()
            .map_err(|e| IngestError::Config(e.to_string()))
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> Result<Self, IngestError> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PARALLAX_").split("_"))
            .extract()
            .map_err(|e| IngestError::Config(e.to_string()))
    }
}

/// Write-ahead log configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding write-ahead block files.
    pub path: PathBuf,
    /// Directory holding completed local blocks.
    pub blocks_path: PathBuf,
    /// Permissible skew between span timestamps and wall-clock time, in
    /// seconds. Records outside the window are clamped to now.
    pub ingestion_slack_secs: u64,
}

impl WalConfig {
    /// The ingestion slack as a duration.
    pub const fn ingestion_slack(&self) -> Duration {
        Duration::from_secs(self.ingestion_slack_secs)
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_WAL_PATH),
            blocks_path: PathBuf::from(DEFAULT_BLOCKS_PATH),
            ingestion_slack_secs: DEFAULT_INGESTION_SLACK_SECS,
        }
    }
}

/// Block lifecycle cadence and backend flush behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Idle time after which a live trace is cut to the head block.
    pub max_trace_idle_secs: u64,
    /// Interval between background sweeps.
    pub sweep_interval_secs: u64,
    /// Maximum age of the head block before it is cut.
    pub max_block_duration_secs: u64,
    /// Maximum head-block size in bytes before it is cut.
    pub max_block_bytes: u64,
    /// How long a flushed block is kept locally before deletion.
    pub complete_block_timeout_secs: u64,
    /// Maximum backend flush retry attempts per sweep.
    ///
    /// A block that still fails is retried on the next sweep; it is never
    /// deleted locally until a flush succeeds.
    pub flush_max_retries: u32,
    /// Initial flush retry delay in milliseconds.
    ///
    /// The delay doubles after each failed attempt, up to
    /// `flush_max_delay_ms`.
    pub flush_initial_delay_ms: u64,
    /// Maximum flush retry delay in milliseconds.
    pub flush_max_delay_ms: u64,
}

impl LifecycleConfig {
    /// Live-trace idle cutoff as a duration.
    pub const fn max_trace_idle(&self) -> Duration {
        Duration::from_secs(self.max_trace_idle_secs)
    }

    /// Sweep interval as a duration.
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Maximum head-block lifetime as a duration.
    pub const fn max_block_duration(&self) -> Duration {
        Duration::from_secs(self.max_block_duration_secs)
    }

    /// Local retention of flushed blocks as a duration.
    pub const fn complete_block_timeout(&self) -> Duration {
        Duration::from_secs(self.complete_block_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_trace_idle_secs: DEFAULT_MAX_TRACE_IDLE_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_block_duration_secs: DEFAULT_MAX_BLOCK_DURATION_SECS,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            complete_block_timeout_secs: DEFAULT_COMPLETE_BLOCK_TIMEOUT_SECS,
            flush_max_retries: DEFAULT_FLUSH_MAX_RETRIES,
            flush_initial_delay_ms: DEFAULT_FLUSH_INITIAL_DELAY_MS,
            flush_max_delay_ms: DEFAULT_FLUSH_MAX_DELAY_MS,
        }
    }
}

/// Per-tenant limits, with optional per-tenant overrides.
///
/// A zero value means "unlimited" for all three limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum live traces per tenant across the whole ring.
    pub max_local_traces_per_user: usize,
    /// Maximum accumulated bytes per trace.
    pub max_bytes_per_trace: usize,
    /// Maximum bytes per bulk push request.
    pub max_bytes_per_request: usize,
    /// Per-tenant overrides, keyed by tenant ID.
    pub overrides: HashMap<String, LimitOverrides>,
}

impl LimitsConfig {
    /// Resolve the effective limits for one tenant.
    pub fn for_tenant(&self, tenant: &str) -> TenantLimits {
        let o = self.overrides.get(tenant);
        TenantLimits {
            max_local_traces_per_user: o
                .and_then(|o| o.max_local_traces_per_user)
                .unwrap_or(self.max_local_traces_per_user),
            max_bytes_per_trace: o
                .and_then(|o| o.max_bytes_per_trace)
                .unwrap_or(self.max_bytes_per_trace),
            max_bytes_per_request: o
                .and_then(|o| o.max_bytes_per_request)
                .unwrap_or(self.max_bytes_per_request),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_local_traces_per_user: DEFAULT_MAX_LOCAL_TRACES_PER_USER,
            max_bytes_per_trace: DEFAULT_MAX_BYTES_PER_TRACE,
            max_bytes_per_request: DEFAULT_MAX_BYTES_PER_REQUEST,
            overrides: HashMap::new(),
        }
    }
}

/// Overrides for a single tenant. Unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    /// Override for the live-trace limit.
    pub max_local_traces_per_user: Option<usize>,
    /// Override for the per-trace byte limit.
    pub max_bytes_per_trace: Option<usize>,
    /// Override for the per-request byte limit.
    pub max_bytes_per_request: Option<usize>,
}

/// Effective limits for one tenant after override resolution.
#[derive(Debug, Clone, Copy)]
pub struct TenantLimits {
    /// Maximum live traces per tenant across the whole ring.
    pub max_local_traces_per_user: usize,
    /// Maximum accumulated bytes per trace.
    pub max_bytes_per_trace: usize,
    /// Maximum bytes per bulk push request.
    pub max_bytes_per_request: usize,
}

/// Storage backend configuration for flushed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Local {
        /// Path to storage directory.
        path: PathBuf,
    },
    /// AWS S3 or S3-compatible storage (MinIO, Garage, etc.).
    S3 {
        /// S3 bucket name.
        bucket: String,
        /// AWS region or custom region for S3-compatible services.
        region: Option<String>,
        /// Custom endpoint URL for S3-compatible services.
        endpoint: Option<String>,
        /// Allow HTTP (non-TLS) connections (for local development).
        #[serde(default)]
        allow_http: bool,
    },
    /// In-memory storage (for testing).
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("./data/backend"),
        }
    }
}

/// Create an object store from configuration.
///
/// # Errors
///
/// Returns an error if the object store cannot be created (e.g. invalid
/// path, missing credentials for cloud storage).
pub fn create_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, IngestError> {
    match config {
        StorageConfig::Local { path } => {
            std::fs::create_dir_all(path)?;
            let store = LocalFileSystem::new_with_prefix(path)?;
            Ok(Arc::new(store))
        }
        StorageConfig::Memory => Ok(Arc::new(InMemory::new())),
        #[cfg(feature = "s3")]
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            allow_http,
        } => {
            use object_store::aws::AmazonS3Builder;

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(r) = region {
                builder = builder.with_region(r);
            }
            if let Some(ref ep) = endpoint {
                builder = builder.with_endpoint(ep);
            }
            if *allow_http {
                builder = builder.with_allow_http(true);
            }

            let store = builder.build()?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => Err(IngestError::Config(
            "S3 storage requires the 's3' feature to be enabled".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = IngesterConfig::default();
        assert_eq!(config.wal.path, PathBuf::from(DEFAULT_WAL_PATH));
        assert_eq!(
            config.lifecycle.max_block_duration(),
            Duration::from_secs(DEFAULT_MAX_BLOCK_DURATION_SECS)
        );
        assert_eq!(
            config.limits.max_local_traces_per_user,
            DEFAULT_MAX_LOCAL_TRACES_PER_USER
        );
    }

    #[test]
    fn storage_defaults_to_local() {
        match StorageConfig::default() {
            StorageConfig::Local { path } => {
                assert_eq!(path, PathBuf::from("./data/backend"));
            }
            other => panic!("expected local storage as default, got {other:?}"),
        }
    }

    #[test]
    fn overrides_fall_back_to_defaults() {
        let mut limits = LimitsConfig::default();
        limits.overrides.insert(
            "acme".to_owned(),
            LimitOverrides {
                max_bytes_per_trace: Some(123),
                ..Default::default()
            },
        );

        let acme = limits.for_tenant("acme");
        assert_eq!(acme.max_bytes_per_trace, 123);
        assert_eq!(
            acme.max_local_traces_per_user,
            DEFAULT_MAX_LOCAL_TRACES_PER_USER
        );

        let other = limits.for_tenant("other");
        assert_eq!(other.max_bytes_per_trace, DEFAULT_MAX_BYTES_PER_TRACE);
    }

    #[tokio::test]
    async fn create_memory_store() {
        let store = create_object_store(&StorageConfig::Memory).unwrap();

        let path = object_store::path::Path::from("probe");
        store.put(&path, "hello".into()).await.unwrap();
        let result = store.get(&path).await.unwrap();
        let bytes = result.bytes().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn create_local_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::Local {
            path: temp_dir.path().to_path_buf(),
        };
        let store = create_object_store(&config).unwrap();

        let path = object_store::path::Path::from("probe");
        store.put(&path, "hello".into()).await.unwrap();
        assert!(store.get(&path).await.is_ok());
    }
}
