//! `StorageDriver` over an OpenDAL operator

use bytes::Bytes;
use medusa_core::config::StorageConfig;
use medusa_core::{ByteStream, MedusaError, MedusaResult};
use opendal::{ErrorKind, Metadata, Operator};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::driver::{Blob, BlobRef, StorageDriver};
use crate::operator::{apply_proxy_env, build_operator, S3Credentials};

/// Default read size for ranged downloads
pub const DEFAULT_READ_CHUNK: usize = 4 * 1024 * 1024;

const COPY_BUF: usize = 64 * 1024;

pub struct OpendalDriver {
    op: Operator,
    provider: String,
    write_chunk: usize,
    read_chunk: usize,
}

impl OpendalDriver {
    pub fn new(op: Operator, provider: impl Into<String>) -> Self {
        Self {
            op,
            provider: provider.into(),
            write_chunk: 8 * 1024 * 1024,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Build the operator for `storage`, applying proxy settings first.
    pub fn from_config(
        storage: &StorageConfig,
        credentials: Option<&S3Credentials>,
    ) -> MedusaResult<Self> {
        apply_proxy_env(storage.proxy_url.as_deref());
        let op = build_operator(storage, credentials)?;
        Ok(Self::new(op, storage.storage_provider.as_str())
            .with_write_chunk(storage.multipart_chunk_size))
    }

    pub fn with_write_chunk(mut self, bytes: usize) -> Self {
        self.write_chunk = bytes.max(1);
        self
    }

    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

/// Content digest reported by the backend: Content-MD5 first, then a
/// single-part ETag. Multipart ETags (`<hex>-<parts>`) are not digests.
fn reported_md5(meta: &Metadata) -> Option<String> {
    if let Some(md5) = meta.content_md5().filter(|m| !m.is_empty()) {
        return Some(md5.to_string());
    }
    meta.etag()
        .map(|etag| etag.trim_matches('"'))
        .filter(|etag| !etag.is_empty() && !etag.contains('-'))
        .map(str::to_string)
}

fn dir_path(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{trimmed}/")
    }
}

#[async_trait::async_trait]
impl StorageDriver for OpendalDriver {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn list_blobs(&self, prefix: &str) -> MedusaResult<Vec<Blob>> {
        let dir = dir_path(prefix);
        let entries = match self.op.list_with(&dir).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MedusaError::transfer(format!("listing {dir}"), e)),
        };

        let mut blobs = Vec::new();
        for entry in entries {
            let path = entry.path();
            if path.ends_with('/') {
                continue;
            }
            let meta = self
                .op
                .stat(path)
                .await
                .map_err(|e| MedusaError::transfer(format!("stat {path}"), e))?;
            blobs.push(Blob {
                key: path.to_string(),
                size: meta.content_length(),
                md5: reported_md5(&meta),
            });
        }
        blobs.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(prefix = %dir, count = blobs.len(), "listed blobs");
        Ok(blobs)
    }

    async fn list_dirs(&self, prefix: &str) -> MedusaResult<Vec<String>> {
        let dir = dir_path(prefix);
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MedusaError::transfer(format!("listing {dir}"), e)),
        };

        let mut names: Vec<String> = entries
            .iter()
            .map(|entry| entry.path())
            // the listed folder itself comes back as an entry
            .filter(|path| *path != dir)
            .filter_map(|path| path.strip_suffix('/'))
            .filter_map(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn put_blob(&self, mut source: ByteStream, key: &str) -> MedusaResult<BlobRef> {
        let mut writer = self
            .op
            .writer_with(key)
            .chunk(self.write_chunk)
            .await
            .map_err(|e| MedusaError::transfer(format!("opening writer for {key}"), e))?;

        let mut digest = md5::Context::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(MedusaError::from(e));
                }
            };
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            size += n as u64;
            if let Err(e) = writer.write(Bytes::copy_from_slice(&buf[..n])).await {
                let _ = writer.abort().await;
                return Err(MedusaError::transfer(format!("writing {key}"), e));
            }
        }
        writer
            .close()
            .await
            .map_err(|e| MedusaError::transfer(format!("finishing {key}"), e))?;

        Ok(BlobRef {
            key: key.to_string(),
            size,
            md5: format!("{:x}", digest.compute()),
        })
    }

    async fn get_blob(&self, key: &str) -> MedusaResult<ByteStream> {
        let size = self
            .op
            .stat(key)
            .await
            .map_err(|e| MedusaError::transfer(format!("stat {key}"), e))?
            .content_length();

        let state = RangedRead {
            op: self.op.clone(),
            key: key.to_string(),
            offset: 0,
            size,
            chunk: self.read_chunk as u64,
        };
        let chunks = futures::stream::try_unfold(state, |mut st| async move {
            let next = st.next_range().await.map_err(MedusaError::into_io)?;
            Ok::<_, std::io::Error>(next.map(|chunk| (chunk, st)))
        });
        Ok(Box::new(StreamReader::new(Box::pin(chunks))))
    }

    async fn delete_blob(&self, blob: &BlobRef) -> MedusaResult<()> {
        self.op
            .delete(&blob.key)
            .await
            .map_err(|e| MedusaError::transfer(format!("deleting {}", blob.key), e))
    }
}

struct RangedRead {
    op: Operator,
    key: String,
    offset: u64,
    size: u64,
    chunk: u64,
}

impl RangedRead {
    async fn next_range(&mut self) -> MedusaResult<Option<Bytes>> {
        if self.offset >= self.size {
            return Ok(None);
        }
        let end = (self.offset + self.chunk).min(self.size);
        let buf = self
            .op
            .read_with(&self.key)
            .range(self.offset..end)
            .await
            .map_err(|e| MedusaError::transfer(format!("reading {}", self.key), e))?;

        let bytes = buf.to_bytes();
        if bytes.len() as u64 != end - self.offset {
            return Err(MedusaError::Transfer(format!(
                "short read of {} at offset {}: got {} bytes, expected {}",
                self.key,
                self.offset,
                bytes.len(),
                end - self.offset
            )));
        }
        self.offset = end;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn memory_driver() -> OpendalDriver {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        OpendalDriver::new(op, "memory")
    }

    fn source(data: &[u8]) -> ByteStream {
        Box::new(Cursor::new(data.to_vec()))
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_reports_size_and_md5() {
        let driver = memory_driver();
        let blob = driver.put_blob(source(b"hello"), "a/b/c.db").await.unwrap();

        assert_eq!(blob.key, "a/b/c.db");
        assert_eq!(blob.size, 5);
        assert_eq!(blob.md5, format!("{:x}", md5::compute(b"hello")));
    }

    #[tokio::test]
    async fn test_get_reads_in_ranges() {
        let driver = memory_driver().with_read_chunk(7);
        let data: Vec<u8> = (0..100u8).collect();
        driver.put_blob(source(&data), "obj").await.unwrap();

        let back = read_all(driver.get_blob("obj").await.unwrap()).await;
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_get_empty_object() {
        let driver = memory_driver();
        driver.put_blob(source(b""), "empty").await.unwrap();
        assert!(read_all(driver.get_blob("empty").await.unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_is_transfer_error() {
        let driver = memory_driver();
        let err = driver.get_blob("missing").await.err().unwrap();
        assert!(matches!(err, MedusaError::Transfer(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_list_is_recursive_and_sorted() {
        let driver = memory_driver();
        for key in ["p/node/b2/data/ks/cf/z.db", "p/node/b1/data/ks/cf/a.db", "other/x.db"] {
            driver.put_blob(source(b"12345"), key).await.unwrap();
        }

        let blobs = driver.list_blobs("p/node").await.unwrap();
        let keys: Vec<_> = blobs.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, ["p/node/b1/data/ks/cf/a.db", "p/node/b2/data/ks/cf/z.db"]);
        assert!(blobs.iter().all(|b| b.size == 5));
        assert_eq!(blobs[0].file_name(), Some("a.db"));
    }

    #[tokio::test]
    async fn test_list_dirs_is_one_level() {
        let driver = memory_driver();
        for key in [
            "p/node/b2/meta/manifest.json",
            "p/node/b1/data/ks/cf/a.db",
            "p/node/b1/meta/manifest.json",
            "p/node/loose.db",
        ] {
            driver.put_blob(source(b"x"), key).await.unwrap();
        }

        assert_eq!(driver.list_dirs("p/node").await.unwrap(), ["b1", "b2"]);
        assert_eq!(driver.list_dirs("p/node/b1").await.unwrap(), ["data", "meta"]);
        assert!(driver.list_dirs("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let driver = memory_driver();
        assert!(driver.list_blobs("nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let driver = memory_driver();
        let blob = driver.put_blob(source(b"x"), "d/x.db").await.unwrap();
        driver.delete_blob(&blob).await.unwrap();
        assert!(driver.list_blobs("d").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            storage_provider: medusa_core::config::StorageProvider::Local,
            base_path: dir.path().to_path_buf(),
            bucket_name: "bucket".into(),
            ..Default::default()
        };
        let driver = OpendalDriver::from_config(&storage, None).unwrap();
        assert_eq!(driver.provider_name(), "local");

        driver.put_blob(source(b"on disk"), "n/b/f.db").await.unwrap();
        assert!(dir.path().join("bucket/n/b/f.db").exists());
        assert_eq!(read_all(driver.get_blob("n/b/f.db").await.unwrap()).await, b"on disk");
    }

    #[test]
    fn test_dir_path() {
        assert_eq!(dir_path(""), "/");
        assert_eq!(dir_path("a/b"), "a/b/");
        assert_eq!(dir_path("/a/b/"), "a/b/");
    }
}
