use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{MedusaError, MedusaResult};

/// Top-level configuration (loaded from medusa.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MedusaConfig {
    pub storage: StorageConfig,
    pub checks: ChecksConfig,
    pub logging: LoggingConfig,
}

impl MedusaConfig {
    /// Reject settings the storage layer cannot work with.
    pub fn validate(&self) -> MedusaResult<()> {
        if self.storage.bucket_name.contains('/') {
            return Err(MedusaError::Configuration(format!(
                "bucket_name must not contain '/': {}",
                self.storage.bucket_name
            )));
        }
        if self.storage.prefix.contains('/') {
            return Err(MedusaError::Configuration(format!(
                "prefix must not contain '/': {}",
                self.storage.prefix
            )));
        }
        if self.storage.concurrent_transfers == 0 {
            return Err(MedusaError::Configuration(
                "concurrent_transfers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    S3,
    Local,
    Memory,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::Local => "local",
            StorageProvider::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_provider: StorageProvider,
    pub bucket_name: String,
    /// Optional key prefix shared by every node of the cluster
    pub prefix: String,
    /// This node's name in storage keys
    pub fqdn: String,
    /// Root directory for the "local" provider
    pub base_path: PathBuf,
    /// S3-compatible endpoint (empty = provider default)
    pub endpoint: String,
    pub region: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
    /// Worker pool size for file transfers
    pub concurrent_transfers: usize,
    /// Retry attempts for failed storage operations
    pub max_retries: usize,
    /// Write chunk size handed to the storage backend
    pub multipart_chunk_size: usize,
    /// HTTP(S) proxy applied once when the driver is built
    pub proxy_url: Option<String>,
    /// Client-side encryption key (passphrase or base64)
    #[serde(skip_serializing)]
    pub cse_key: Option<String>,
    pub key_namespace: String,
    pub key_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_provider: StorageProvider::S3,
            bucket_name: "medusa".into(),
            prefix: String::new(),
            fqdn: "localhost".into(),
            base_path: PathBuf::from("/var/lib/medusa"),
            endpoint: String::new(),
            region: "us-east-1".into(),
            enforce_tls: false,
            concurrent_transfers: 1,
            max_retries: 5,
            multipart_chunk_size: 8 * 1024 * 1024,
            proxy_url: None,
            cse_key: None,
            key_namespace: "medusa-cse-keys".into(),
            key_name: "medusa-aes-wrapping-key".into(),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("storage_provider", &self.storage_provider)
            .field("bucket_name", &self.bucket_name)
            .field("prefix", &self.prefix)
            .field("fqdn", &self.fqdn)
            .field("base_path", &self.base_path)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("enforce_tls", &self.enforce_tls)
            .field("concurrent_transfers", &self.concurrent_transfers)
            .field("max_retries", &self.max_retries)
            .field("multipart_chunk_size", &self.multipart_chunk_size)
            .field("proxy_url", &self.proxy_url)
            .field("cse_key", &self.cse_key.as_ref().map(|_| "[REDACTED]"))
            .field("key_namespace", &self.key_namespace)
            .field("key_name", &self.key_name)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// Compare MD5 digests when deciding whether a file changed
    pub enable_md5_checks: bool,
    /// Size difference in bytes still treated as unchanged
    pub threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
