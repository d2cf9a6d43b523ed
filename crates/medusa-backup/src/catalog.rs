//! Backup metadata layout on storage
//!
//! ```text
//! {prefix}/{fqdn}/{backup}/meta/manifest.json
//! {prefix}/{fqdn}/{backup}/meta/differential     (present for differential backups)
//! {prefix}/{fqdn}/{backup}/meta/started          (unix seconds)
//! {prefix}/{fqdn}/{backup}/data/{keyspace}/{table}/{file}
//! ```
//!
//! Metadata objects are written through the driver directly and are never
//! encrypted.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

use medusa_core::config::StorageConfig;
use medusa_core::{Backup, ByteStream, MedusaError, MedusaResult};
use medusa_storage::StorageDriver;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const MANIFEST: &str = "meta/manifest.json";
const DIFFERENTIAL: &str = "meta/differential";
const STARTED: &str = "meta/started";

pub struct BackupCatalog {
    driver: Arc<dyn StorageDriver>,
    prefix: String,
    fqdn: String,
}

impl BackupCatalog {
    pub fn new(driver: Arc<dyn StorageDriver>, prefix: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            driver,
            prefix: prefix.into(),
            fqdn: fqdn.into(),
        }
    }

    pub fn from_config(driver: Arc<dyn StorageDriver>, storage: &StorageConfig) -> Self {
        Self::new(driver, storage.prefix.clone(), storage.fqdn.clone())
    }

    /// `{prefix}/{fqdn}`, or just `{fqdn}` without a prefix
    pub fn node_root(&self) -> String {
        if self.prefix.is_empty() {
            self.fqdn.clone()
        } else {
            format!("{}/{}", self.prefix, self.fqdn)
        }
    }

    pub fn backup_root(&self, backup: &str) -> String {
        format!("{}/{backup}", self.node_root())
    }

    /// Destination prefix for the SSTables of one table
    pub fn data_prefix(&self, backup: &str, keyspace: &str, table: &str) -> String {
        format!("{}/data/{keyspace}/{table}", self.backup_root(backup))
    }

    fn meta_key(&self, backup: &str, leaf: &str) -> String {
        format!("{}/{leaf}", self.backup_root(backup))
    }

    /// Persist the manifest and markers of `backup`. The manifest goes last so
    /// a backup only becomes listable once complete.
    pub async fn write_backup(&self, backup: &Backup) -> MedusaResult<()> {
        if let Some(started) = backup.started_at {
            self.put_text(&self.meta_key(&backup.name, STARTED), started.to_string())
                .await?;
        }
        if backup.is_differential {
            self.put_text(&self.meta_key(&backup.name, DIFFERENTIAL), String::new())
                .await?;
        }
        self.put_text(&self.meta_key(&backup.name, MANIFEST), backup.manifest_json()?)
            .await?;
        info!(backup = %backup.name, differential = backup.is_differential, "backup metadata written");
        Ok(())
    }

    pub async fn load_backup(&self, name: &str) -> MedusaResult<Backup> {
        let listing = self.meta_listing(name).await?;
        self.load_with_listing(name, &listing).await
    }

    /// Every backup of this node with a manifest, oldest first
    /// (by start time, then name; unknown start times sort first).
    ///
    /// Only the backup folders and their `meta/` objects are listed, never
    /// the data.
    pub async fn list_node_backups(&self) -> MedusaResult<Vec<Backup>> {
        let root = self.node_root();
        let names = self.driver.list_dirs(&root).await?;

        let mut backups = Vec::with_capacity(names.len());
        for name in &names {
            let keys = self.meta_listing(name).await?;
            if !keys.contains(&self.meta_key(name, MANIFEST)) {
                debug!(backup = %name, "no manifest, skipping");
                continue;
            }
            backups.push(self.load_with_listing(name, &keys).await?);
        }
        backups.sort_by(|a, b| (a.started_at, &a.name).cmp(&(b.started_at, &b.name)));
        debug!(node = %root, count = backups.len(), "listed node backups");
        Ok(backups)
    }

    async fn meta_listing(&self, name: &str) -> MedusaResult<BTreeSet<String>> {
        Ok(self
            .driver
            .list_blobs(&format!("{}/meta", self.backup_root(name)))
            .await?
            .into_iter()
            .map(|blob| blob.key)
            .collect())
    }

    async fn load_with_listing(&self, name: &str, keys: &BTreeSet<String>) -> MedusaResult<Backup> {
        let manifest_key = self.meta_key(name, MANIFEST);
        if !keys.contains(&manifest_key) {
            return Err(MedusaError::Aggregation(format!(
                "backup {name} has no manifest at {manifest_key}"
            )));
        }
        let json = self.get_text(&manifest_key).await?;
        let is_differential = keys.contains(&self.meta_key(name, DIFFERENTIAL));
        let mut backup = Backup::from_manifest_json(name, is_differential, &json)?;

        let started_key = self.meta_key(name, STARTED);
        if keys.contains(&started_key) {
            let raw = self.get_text(&started_key).await?;
            let started = raw.trim().parse::<u64>().map_err(|e| {
                MedusaError::Aggregation(format!("backup {name}: bad start time {raw:?}: {e}"))
            })?;
            backup = backup.with_started_at(started);
        }
        Ok(backup)
    }

    async fn put_text(&self, key: &str, text: String) -> MedusaResult<()> {
        let source: ByteStream = Box::new(Cursor::new(text.into_bytes()));
        self.driver.put_blob(source, key).await?;
        Ok(())
    }

    async fn get_text(&self, key: &str) -> MedusaResult<String> {
        let mut stream = self.driver.get_blob(key).await?;
        let mut text = String::new();
        stream.read_to_string(&mut text).await?;
        Ok(text)
    }
}
