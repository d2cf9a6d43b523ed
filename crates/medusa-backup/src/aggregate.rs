//! Folding a chain of backup manifests into the latest view of each file
//!
//! Backups are supplied oldest first. For every (keyspace, table, filename)
//! the entry from the last backup in that order wins. Callers own the order;
//! backups whose `started_at` goes backwards are rejected rather than
//! silently producing a stale view. Ties and unknown start times keep the
//! given order.

use std::collections::BTreeMap;

use medusa_core::{Backup, ManifestObject, MedusaError, MedusaResult};
use tracing::debug;

type TableFiles = BTreeMap<String, ManifestObject>;

/// keyspace → table → filename → latest object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMap {
    keyspaces: BTreeMap<String, BTreeMap<String, TableFiles>>,
}

impl FileMap {
    pub fn get(&self, keyspace: &str, table: &str, file_name: &str) -> Option<&ManifestObject> {
        self.table(keyspace, table)?.get(file_name)
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<&TableFiles> {
        self.keyspaces.get(keyspace)?.get(table)
    }

    /// Number of files across every table
    pub fn len(&self) -> usize {
        self.keyspaces
            .values()
            .flat_map(|tables| tables.values())
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (keyspace, table, filename, object), sorted
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, &ManifestObject)> {
        self.keyspaces.iter().flat_map(|(ks, tables)| {
            tables.iter().flat_map(move |(table, files)| {
                files
                    .iter()
                    .map(move |(name, obj)| (ks.as_str(), table.as_str(), name.as_str(), obj))
            })
        })
    }

    fn insert(&mut self, keyspace: &str, table: &str, file_name: &str, obj: &ManifestObject) {
        self.keyspaces
            .entry(keyspace.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .insert(file_name.to_string(), obj.clone());
    }
}

/// Latest entry per file across every backup, full and differential.
pub fn fold_all_backups(backups: &[Backup]) -> MedusaResult<FileMap> {
    fold(backups, |_| true)
}

/// Latest entry per file across differential backups only.
///
/// Full backups are skipped entirely, so files that only ever appeared in a
/// full backup are absent from the result.
pub fn fold_differential_only(backups: &[Backup]) -> MedusaResult<FileMap> {
    fold(backups, |backup| backup.is_differential)
}

fn fold(backups: &[Backup], include: impl Fn(&Backup) -> bool) -> MedusaResult<FileMap> {
    check_chronology(backups)?;

    let mut files = FileMap::default();
    for backup in backups.iter().filter(|b| include(b)) {
        for (keyspace, table, obj) in backup.objects() {
            let name = obj.file_name().ok_or_else(|| {
                MedusaError::Aggregation(format!(
                    "backup {}: object path {:?} has no file name",
                    backup.name, obj.path
                ))
            })?;
            files.insert(keyspace, table, name, obj);
        }
    }
    debug!(backups = backups.len(), files = files.len(), "folded manifests");
    Ok(files)
}

fn check_chronology(backups: &[Backup]) -> MedusaResult<()> {
    let mut last: Option<(&str, u64)> = None;
    for backup in backups {
        let Some(started) = backup.started_at else {
            continue;
        };
        if let Some((prev_name, prev_started)) = last {
            if started < prev_started {
                return Err(MedusaError::Aggregation(format!(
                    "backups out of order: {} started at {started}, before {prev_name} ({prev_started})",
                    backup.name
                )));
            }
        }
        last = Some((&backup.name, started));
    }
    Ok(())
}
