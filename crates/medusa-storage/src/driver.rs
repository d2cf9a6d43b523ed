//! The narrow interface the backup core needs from a storage backend

use medusa_core::{ByteStream, MedusaResult};

/// An object as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub key: String,
    pub size: u64,
    /// Content digest if the backend reports one (hex or base64)
    pub md5: Option<String>,
}

impl Blob {
    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

/// A freshly written object, with size and MD5 of the bytes actually stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub key: String,
    pub size: u64,
    pub md5: String,
}

impl From<Blob> for BlobRef {
    fn from(blob: Blob) -> Self {
        Self {
            key: blob.key,
            size: blob.size,
            md5: blob.md5.unwrap_or_default(),
        }
    }
}

/// Raw blob I/O. Implementations own retries; callers never retry.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Short backend name, bound into encryption contexts
    fn provider_name(&self) -> &str;

    /// Every object under `prefix`, recursively, sorted by key.
    async fn list_blobs(&self, prefix: &str) -> MedusaResult<Vec<Blob>>;

    /// Names of the folders directly under `prefix`, sorted. Objects and
    /// deeper levels are not visited.
    async fn list_dirs(&self, prefix: &str) -> MedusaResult<Vec<String>>;

    /// Stream `source` into `key`.
    async fn put_blob(&self, source: ByteStream, key: &str) -> MedusaResult<BlobRef>;

    async fn get_blob(&self, key: &str) -> MedusaResult<ByteStream>;

    async fn delete_blob(&self, blob: &BlobRef) -> MedusaResult<()>;
}
