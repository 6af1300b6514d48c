//! Application configuration.

use serde::Deserialize;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Cache (Redis) configuration.
    pub cache: CacheConfig,
    /// Blob storage configuration.
    pub storage: StorageConfig,
    /// Audit event queue configuration.
    pub audit: AuditConfig,
    /// Trash retention configuration.
    #[serde(default)]
    pub trash: TrashConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    pub url: String,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Cache connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache host.
    #[serde(default = "default_cache_host")]
    pub host: String,
    /// Cache port.
    #[serde(default = "default_cache_port")]
    pub port: u16,
    /// Cache logical database index.
    #[serde(default)]
    pub db: u8,
    /// Cache password, if the deployment requires one.
    #[serde(default)]
    pub password: Option<String>,
    /// Key prefix for all cache keys.
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
}

/// Blob storage configuration (§4.C2, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Which driver backs the blob store.
    pub driver: StorageDriver,
    /// Local-disk upload root; required when `driver = local`.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    /// Per-user storage limit in bytes, absent a per-user override.
    #[serde(default = "default_storage_limit")]
    pub storage_limit: u64,
    /// S3-compatible endpoint URL; required when `driver = s3`.
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    /// S3 bucket name.
    #[serde(default)]
    pub s3_bucket: Option<String>,
    /// S3 access key id.
    #[serde(default)]
    pub s3_access_key: Option<String>,
    /// S3 secret access key.
    #[serde(default)]
    pub s3_secret_key: Option<String>,
    /// S3 region.
    #[serde(default)]
    pub s3_region: Option<String>,
    /// Whether to address the bucket with path-style URLs (required by
    /// most non-AWS S3-compatible providers).
    #[serde(default)]
    pub s3_force_path_style: bool,
    /// Base64-encoded 256-bit key used to derive the process-level data
    /// key for local-driver encryption (§4.C5).
    pub encryption_key: String,
}

/// Which blob store driver to select at startup (§9 "dynamic dispatch of
/// storage drivers" — chosen once, never switched at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// Local-disk driver, encrypted at rest.
    Local,
    /// S3-compatible object storage driver.
    S3,
}

/// Audit event queue configuration (§4.C9).
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Redis URL backing the apalis job queue.
    pub queue_url: String,
    /// Number of concurrent audit-job workers.
    #[serde(default = "default_audit_concurrency")]
    pub concurrency: u32,
    /// Job time-to-live in seconds; must stay under 86 400 (§6).
    #[serde(default = "default_audit_job_ttl")]
    pub job_ttl_secs: u64,
}

/// Trash retention configuration (§4.C10).
#[derive(Debug, Clone, Deserialize)]
pub struct TrashConfig {
    /// Days a soft-deleted row survives before the expiry sweep purges it.
    #[serde(default = "default_trash_retention_days")]
    pub retention_days: i64,
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            retention_days: default_trash_retention_days(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_cache_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_cache_port() -> u16 {
    6379
}

fn default_cache_prefix() -> String {
    "nimbus".to_string()
}

fn default_upload_dir() -> String {
    "./data/uploads".to_string()
}

const fn default_storage_limit() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

const fn default_audit_concurrency() -> u32 {
    4
}

const fn default_audit_job_ttl() -> u64 {
    3600
}

const fn default_trash_retention_days() -> i64 {
    15
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `NIMBUS_ENV`)
    /// 3. Environment variables with `NIMBUS_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("NIMBUS_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("NIMBUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("NIMBUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trash_config_default_is_fifteen_days() {
        assert_eq!(TrashConfig::default().retention_days, 15);
    }

    #[test]
    fn storage_driver_parses_lowercase() {
        let local: StorageDriver = serde_json::from_str("\"local\"").unwrap();
        let s3: StorageDriver = serde_json::from_str("\"s3\"").unwrap();
        assert_eq!(local, StorageDriver::Local);
        assert_eq!(s3, StorageDriver::S3);
    }
}
