//! Storage health check
//!
//! Lists one level under the configured prefix. This needs list permission
//! on the bucket and a reachable endpoint, nothing more.

use std::time::{Duration, Instant};

use medusa_core::{MedusaError, MedusaResult};
use tracing::{debug, warn};

use crate::driver::StorageDriver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub provider: String,
    pub prefix: String,
    /// Folders found directly under the prefix (node names for a backup root)
    pub folders: Vec<String>,
    pub elapsed: Duration,
}

/// Check `prefix` through `driver`. An empty or missing prefix is healthy.
pub async fn check_health(driver: &dyn StorageDriver, prefix: &str) -> MedusaResult<HealthReport> {
    let started = Instant::now();
    let folders = driver.list_dirs(prefix).await.map_err(|e| {
        warn!(provider = driver.provider_name(), prefix, error = %e, "health check failed");
        MedusaError::transfer(
            format!("storage health check on {}:{prefix:?}", driver.provider_name()),
            e,
        )
    })?;
    let elapsed = started.elapsed();
    debug!(provider = driver.provider_name(), prefix, folders = folders.len(), ?elapsed, "storage healthy");
    Ok(HealthReport {
        provider: driver.provider_name().to_string(),
        prefix: prefix.to_string(),
        folders,
        elapsed,
    })
}
