//! medusa-backup: incremental backup core
//!
//! - [`compare`]: decides whether a local file must be uploaded
//! - [`aggregate`]: folds a manifest chain into the latest view of each file
//! - [`catalog`]: backup metadata layout on storage
//! - [`facade`]: bounded, optionally encrypted, upload and download batches

pub mod aggregate;
pub mod catalog;
pub mod compare;
pub mod digest;
pub mod facade;
pub mod pool;

pub use aggregate::{fold_all_backups, fold_differential_only, FileMap};
pub use catalog::BackupCatalog;
pub use compare::{ComparePolicy, LocalIdentity, Verdict};
pub use facade::{DownloadedFile, StorageFacade, UploadedFile};
