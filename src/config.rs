//! Application configuration.
//!
//! Loaded once at startup from a YAML file and frozen for the life of the
//! process. Every section has sensible defaults so an empty (or missing)
//! file yields a working local server.

use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Default object-size cap: 5 GiB, the S3 single-PUT limit.
const DEFAULT_MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Default HTTP-layer body cap: 128 MiB.
const DEFAULT_MAX_BODY_SIZE: usize = 128 * 1024 * 1024;
/// Default multipart upload expiry: 7 days.
const DEFAULT_UPLOAD_EXPIRY_SECONDS: u64 = 604_800;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub metadata: MetadataConfig,
    pub storage: StorageConfig,
    pub multipart: MultipartConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Region reported by GetBucketLocation and checked by SigV4 scopes.
    pub region: String,
    /// Per-object size cap enforced by the handlers.
    pub max_object_size: u64,
    /// HTTP-layer request body cap.
    pub max_body_size: usize,
    /// Seconds the drain is allowed before the watchdog hard-exits.
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 9000,
            region: "us-east-1".to_string(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            shutdown_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// When false, requests dispatch without signature verification.
    pub enabled: bool,
    pub access_key: String,
    pub secret_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            enabled: true,
            access_key: "bleepstore".to_string(),
            secret_key: "bleepstore".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataEngine {
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub engine: MetadataEngine,
    pub sqlite: SqliteMetadataConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        MetadataConfig {
            engine: MetadataEngine::Sqlite,
            sqlite: SqliteMetadataConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteMetadataConfig {
    pub path: String,
}

impl Default for SqliteMetadataConfig {
    fn default() -> Self {
        SqliteMetadataConfig {
            path: "./data/metadata.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Local,
    Memory,
    Sqlite,
    Aws,
    Gcp,
    Azure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub local: LocalStorageConfig,
    pub sqlite: SqliteStorageConfig,
    pub aws: AwsStorageConfig,
    pub gcp: GcpStorageConfig,
    pub azure: AzureStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackendKind::Local,
            local: LocalStorageConfig::default(),
            sqlite: SqliteStorageConfig::default(),
            aws: AwsStorageConfig::default(),
            gcp: GcpStorageConfig::default(),
            azure: AzureStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    pub root: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        LocalStorageConfig {
            root: "./data/storage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    pub path: String,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        SqliteStorageConfig {
            path: "./data/storage.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AwsStorageConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub endpoint_url: Option<String>,
    pub use_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GcpStorageConfig {
    pub bucket: String,
    pub project: String,
    pub prefix: String,
    pub credentials_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AzureStorageConfig {
    pub container: String,
    pub account: String,
    pub prefix: String,
    pub connection_string: Option<String>,
    pub use_managed_identity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    /// Uploads older than this are reaped at startup.
    pub upload_expiry_seconds: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        MultipartConfig {
            upload_expiry_seconds: DEFAULT_UPLOAD_EXPIRY_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics: bool,
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        ObservabilityConfig {
            metrics: true,
            health_check: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from the first of: the given path, the
    /// `BLEEPSTORE_CONFIG` environment variable, `./bleepstore.yaml`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let candidate = path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("BLEEPSTORE_CONFIG").ok().map(Into::into))
            .unwrap_or_else(|| "bleepstore.yaml".into());
        if candidate.exists() {
            let content = std::fs::read_to_string(&candidate)?;
            let config: AppConfig = serde_yaml::from_str(&content)?;
            info!("loaded configuration from {}", candidate.display());
            Ok(config)
        } else {
            warn!(
                "config file {} not found, using defaults",
                candidate.display()
            );
            Ok(AppConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.region, "us-east-1");
        assert_eq!(config.server.max_object_size, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.server.shutdown_timeout, 30);
        assert!(config.auth.enabled);
        assert_eq!(config.multipart.upload_expiry_seconds, 604_800);
        assert_eq!(config.storage.backend, StorageBackendKind::Local);
        assert_eq!(config.metadata.engine, MetadataEngine::Sqlite);
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_partial_yaml_keeps_section_defaults() {
        let yaml = "server:\n  port: 9100\nstorage:\n  backend: memory\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9100);
        // Unset keys inside a present section still default.
        assert_eq!(config.server.region, "us-east-1");
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.storage.local.root, "./data/storage");
    }

    #[test]
    fn test_cloud_sections_parse() {
        let yaml = "storage:\n  backend: aws\n  aws:\n    bucket: upstream\n    region: eu-west-1\n    prefix: 'bs/'\n    use_path_style: true\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Aws);
        assert_eq!(config.storage.aws.bucket, "upstream");
        assert_eq!(config.storage.aws.prefix, "bs/");
        assert!(config.storage.aws.use_path_style);
        assert!(config.storage.aws.endpoint_url.is_none());
    }
}
