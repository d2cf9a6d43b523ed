//! Upload/download pipeline: compare → maybe encrypt → transfer

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use medusa_core::config::MedusaConfig;
use medusa_core::{ByteStream, ManifestObject, MedusaError, MedusaResult};
use medusa_crypto::EncryptionManager;
use medusa_storage::{BlobRef, StorageDriver};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::compare::{
    digests_match, file_matches_storage, is_content_digest, size_within_threshold, ComparePolicy,
    LocalIdentity, Verdict,
};
use crate::digest::{md5_file, HashingReader};
use crate::pool::run_batch;

/// Outcome of one file of an upload batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub object: ManifestObject,
    /// False when storage already held identical content
    pub transferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Plaintext bytes written
    pub bytes: u64,
}

pub struct StorageFacade {
    driver: Arc<dyn StorageDriver>,
    encryption: Arc<EncryptionManager>,
    policy: ComparePolicy,
    concurrency: usize,
}

impl StorageFacade {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        encryption: Arc<EncryptionManager>,
        policy: ComparePolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            driver,
            encryption,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(
        driver: Arc<dyn StorageDriver>,
        encryption: Arc<EncryptionManager>,
        config: &MedusaConfig,
    ) -> Self {
        Self::new(
            driver,
            encryption,
            ComparePolicy::from_checks(&config.checks),
            config.storage.concurrent_transfers,
        )
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn encryption(&self) -> &EncryptionManager {
        &self.encryption
    }

    /// Upload `paths` under `dest_prefix`, skipping files whose content is
    /// already stored there.
    pub async fn upload_files(
        &self,
        paths: &[PathBuf],
        dest_prefix: &str,
    ) -> MedusaResult<Vec<UploadedFile>> {
        self.upload_files_with_cache(paths, dest_prefix, &BTreeMap::new())
            .await
    }

    /// Like [`upload_files`](Self::upload_files), but also compare against
    /// `cache` (filename → object from earlier backups). A skipped file is
    /// returned as its cached object, so the new manifest references it.
    ///
    /// Stored objects only count when they sit exactly at `{dest_prefix}/{name}`;
    /// same-named files in deeper folders are ignored.
    pub async fn upload_files_with_cache(
        &self,
        paths: &[PathBuf],
        dest_prefix: &str,
        cache: &BTreeMap<String, ManifestObject>,
    ) -> MedusaResult<Vec<UploadedFile>> {
        let dest_prefix = dest_prefix.trim_end_matches('/').to_string();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let name = local_file_name(path)?;
            items.push((path.display().to_string(), (path.clone(), name)));
        }

        // read-only snapshot shared by every worker, keyed by destination key
        let mut existing: HashMap<String, ManifestObject> = HashMap::new();
        for blob in self.driver.list_blobs(&dest_prefix).await? {
            let blob = BlobRef::from(blob);
            existing.insert(blob.key.clone(), ManifestObject::new(blob.key, blob.size, blob.md5));
        }
        existing.extend(
            cache
                .iter()
                .map(|(name, obj)| (destination_key(&dest_prefix, name), obj.clone())),
        );
        let existing = Arc::new(existing);

        let results = run_batch("upload", items, self.concurrency, |(path, name)| {
            let job = UploadJob {
                driver: self.driver.clone(),
                encryption: self.encryption.clone(),
                policy: self.policy,
                existing: existing.clone(),
                dest_prefix: dest_prefix.clone(),
            };
            async move { job.run(path, name).await }
        })
        .await?;

        let transferred = results.iter().filter(|r| r.transferred).count();
        info!(
            prefix = %dest_prefix,
            files = results.len(),
            transferred,
            skipped = results.len() - transferred,
            "upload batch complete"
        );
        Ok(results)
    }

    /// Download `remote_paths` into `dest_dir`, keeping only each file name.
    pub async fn download_files(
        &self,
        remote_paths: &[String],
        dest_dir: &Path,
    ) -> MedusaResult<Vec<DownloadedFile>> {
        let items = remote_paths
            .iter()
            .map(|key| (key.clone(), (key.clone(), None)))
            .collect();
        self.download(items, dest_dir).await
    }

    /// Download manifest objects, verifying each file's size and MD5 against
    /// the recorded source identity.
    pub async fn download_objects(
        &self,
        objects: &[ManifestObject],
        dest_dir: &Path,
    ) -> MedusaResult<Vec<DownloadedFile>> {
        let items = objects
            .iter()
            .map(|obj| {
                let expected = expected_plaintext(obj, self.encryption.is_enabled());
                (obj.path.clone(), (obj.path.clone(), expected))
            })
            .collect();
        self.download(items, dest_dir).await
    }

    async fn download(
        &self,
        items: Vec<(String, (String, Option<Expected>))>,
        dest_dir: &Path,
    ) -> MedusaResult<Vec<DownloadedFile>> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let items = items
            .into_iter()
            .enumerate()
            .map(|(slot, (label, (key, expected)))| (label, (slot, key, expected)))
            .collect();
        let results = run_batch("download", items, self.concurrency, |(slot, key, expected)| {
            let driver = self.driver.clone();
            let encryption = self.encryption.clone();
            let dest_dir = dest_dir.to_path_buf();
            async move { download_one(driver, encryption, slot, key, dest_dir, expected).await }
        })
        .await?;

        let bytes: u64 = results.iter().map(|r| r.bytes).sum();
        info!(dir = %dest_dir.display(), files = results.len(), bytes, "download batch complete");
        Ok(results)
    }

    /// Remove `objects` from storage. Returns how many were deleted.
    pub async fn delete_objects(&self, objects: &[ManifestObject]) -> MedusaResult<usize> {
        let items = objects
            .iter()
            .map(|obj| {
                let blob = BlobRef {
                    key: obj.path.clone(),
                    size: obj.size,
                    md5: obj.md5.clone(),
                };
                (obj.path.clone(), blob)
            })
            .collect();
        let deleted = run_batch("delete", items, self.concurrency, |blob: BlobRef| {
            let driver = self.driver.clone();
            async move {
                driver.delete_blob(&blob).await?;
                debug!(key = %blob.key, "deleted");
                Ok::<_, MedusaError>(())
            }
        })
        .await?;
        Ok(deleted.len())
    }
}

fn destination_key(dest_prefix: &str, name: &str) -> String {
    if dest_prefix.is_empty() {
        name.to_string()
    } else {
        format!("{dest_prefix}/{name}")
    }
}

fn local_file_name(path: &Path) -> MedusaResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            MedusaError::Configuration(format!("{} has no usable file name", path.display()))
        })
}

struct UploadJob {
    driver: Arc<dyn StorageDriver>,
    encryption: Arc<EncryptionManager>,
    policy: ComparePolicy,
    existing: Arc<HashMap<String, ManifestObject>>,
    dest_prefix: String,
}

impl UploadJob {
    async fn run(self, path: PathBuf, name: String) -> MedusaResult<UploadedFile> {
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| MedusaError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?
            .len();
        let key = destination_key(&self.dest_prefix, &name);
        let existing = self.existing.get(&key);

        // hashing is only worth it when the size already matches
        let md5 = match existing {
            Some(obj)
                if self.policy.check_digest
                    && size_within_threshold(size, obj.source_identity().0, self.policy.threshold) =>
            {
                Some(md5_file(&path).await?)
            }
            _ => None,
        };

        let verdict = file_matches_storage(&LocalIdentity { size, md5 }, existing, &self.policy);
        let reason = match (verdict, existing) {
            (Verdict::Unchanged, Some(obj)) => {
                debug!(path = %path.display(), "skip: unchanged in storage");
                return Ok(UploadedFile {
                    object: obj.clone(),
                    transferred: false,
                });
            }
            (Verdict::Changed(reason), _) => reason.to_string(),
            (Verdict::Unchanged, None) => "not in storage".to_string(),
        };
        debug!(path = %path.display(), reason = %reason, "uploading");

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| MedusaError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
        let (reader, handle) = HashingReader::new(file);
        let source: ByteStream = Box::new(reader);
        let stream = self
            .encryption
            .encrypt_stream(source, &key, self.driver.provider_name())?;
        let blob = self.driver.put_blob(stream, &key).await?;

        let (read, source_md5) = handle.finish();
        info!(
            local = %path.display(),
            remote = %blob.key,
            bytes = read,
            stored = blob.size,
            "uploaded"
        );
        Ok(UploadedFile {
            object: ManifestObject::new(blob.key, blob.size, blob.md5).with_source(read, source_md5),
            transferred: true,
        })
    }
}

/// Plaintext size and digest a download must reproduce
#[derive(Debug, Clone)]
struct Expected {
    size: u64,
    md5: Option<String>,
}

fn expected_plaintext(obj: &ManifestObject, encrypted: bool) -> Option<Expected> {
    if obj.source_size.is_none() && encrypted {
        // stored identity describes ciphertext; nothing to check the plaintext against
        return None;
    }
    let (size, md5) = obj.source_identity();
    Some(Expected {
        size,
        md5: md5.filter(|d| is_content_digest(d)).map(str::to_string),
    })
}

async fn download_one(
    driver: Arc<dyn StorageDriver>,
    encryption: Arc<EncryptionManager>,
    slot: usize,
    key: String,
    dest_dir: PathBuf,
    expected: Option<Expected>,
) -> MedusaResult<DownloadedFile> {
    let name = key
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| MedusaError::Configuration(format!("remote path {key:?} has no file name")))?;
    let local_path = dest_dir.join(name);
    let tmp = dest_dir.join(temp_name(name, slot));

    let written = write_verified(&driver, &encryption, &key, &tmp, expected.as_ref()).await;
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
    };
    tokio::fs::rename(&tmp, &local_path).await?;

    info!(remote = %key, local = %local_path.display(), bytes, "downloaded");
    Ok(DownloadedFile {
        remote_path: key,
        local_path,
        bytes,
    })
}

/// Per-job temp name, so jobs restoring the same file name never share one
fn temp_name(name: &str, slot: usize) -> String {
    format!(".{name}.{slot}.medusa_tmp")
}

async fn write_verified(
    driver: &Arc<dyn StorageDriver>,
    encryption: &EncryptionManager,
    key: &str,
    tmp: &Path,
    expected: Option<&Expected>,
) -> MedusaResult<u64> {
    let raw = driver.get_blob(key).await?;
    let plain = encryption.decrypt_stream_expecting(raw, key).await?;
    let (mut reader, handle) = HashingReader::new(plain);

    let mut file = tokio::fs::File::create(tmp).await?;
    tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let (size, md5) = handle.finish();
    if let Some(expected) = expected {
        if size != expected.size {
            return Err(MedusaError::Integrity(format!(
                "{key}: downloaded {size} bytes, manifest says {}",
                expected.size
            )));
        }
        if let Some(want) = &expected.md5 {
            if !digests_match(&md5, want) {
                return Err(MedusaError::Integrity(format!(
                    "{key}: MD5 {md5} does not match manifest {want}"
                )));
            }
        }
    }
    Ok(size)
}
