use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::{MedusaError, MedusaResult};

/// An owned byte stream passed between the encryption layer and storage drivers
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// One file as recorded in a backup manifest.
///
/// `size`/`md5` describe the object as stored (possibly encrypted);
/// `source_size`/`source_md5` describe the local file before transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestObject {
    /// Storage-relative key
    pub path: String,
    pub size: u64,
    #[serde(rename = "MD5")]
    pub md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    #[serde(rename = "source_MD5", default, skip_serializing_if = "Option::is_none")]
    pub source_md5: Option<String>,
}

impl ManifestObject {
    pub fn new(path: impl Into<String>, size: u64, md5: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            md5: md5.into(),
            source_size: None,
            source_md5: None,
        }
    }

    pub fn with_source(mut self, size: u64, md5: impl Into<String>) -> Self {
        self.source_size = Some(size);
        self.source_md5 = Some(md5.into());
        self
    }

    /// Final path segment; the aggregation key across backups.
    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    /// Size and digest of the original file content.
    ///
    /// Falls back to the stored identity when no source identity was tracked.
    /// An empty digest string is reported as unknown.
    pub fn source_identity(&self) -> (u64, Option<&str>) {
        let (size, digest) = match self.source_size {
            Some(size) => (size, self.source_md5.as_deref()),
            None => (self.size, Some(self.md5.as_str())),
        };
        (size, digest.filter(|d| !d.is_empty()))
    }
}

/// Objects of one table inside a backup manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSection {
    pub keyspace: String,
    #[serde(rename = "columnfamily")]
    pub table: String,
    pub objects: Vec<ManifestObject>,
}

/// A node backup as read back from storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub name: String,
    pub is_differential: bool,
    /// Unix seconds when the backup started, if known
    pub started_at: Option<u64>,
    pub manifest: Vec<ManifestSection>,
}

impl Backup {
    pub fn new(name: impl Into<String>, is_differential: bool, manifest: Vec<ManifestSection>) -> Self {
        Self {
            name: name.into(),
            is_differential,
            started_at: None,
            manifest,
        }
    }

    pub fn with_started_at(mut self, started_at: u64) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Parse a persisted manifest document.
    pub fn from_manifest_json(
        name: impl Into<String>,
        is_differential: bool,
        json: &str,
    ) -> MedusaResult<Self> {
        let name = name.into();
        let manifest: Vec<ManifestSection> = serde_json::from_str(json)
            .map_err(|e| MedusaError::Aggregation(format!("manifest of backup {name}: {e}")))?;
        Ok(Self::new(name, is_differential, manifest))
    }

    pub fn manifest_json(&self) -> MedusaResult<String> {
        serde_json::to_string(&self.manifest)
            .map_err(|e| MedusaError::Aggregation(format!("serializing manifest {}: {e}", self.name)))
    }

    /// Every (keyspace, table, object) triple in manifest order
    pub fn objects(&self) -> impl Iterator<Item = (&str, &str, &ManifestObject)> {
        self.manifest.iter().flat_map(|section| {
            section
                .objects
                .iter()
                .map(move |obj| (section.keyspace.as_str(), section.table.as_str(), obj))
        })
    }
}
