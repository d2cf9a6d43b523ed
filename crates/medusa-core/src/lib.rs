pub mod config;
pub mod error;
pub mod types;

pub use error::{BatchFailure, MedusaError, MedusaResult, TransferFailure};
pub use types::{Backup, ByteStream, ManifestObject, ManifestSection};
