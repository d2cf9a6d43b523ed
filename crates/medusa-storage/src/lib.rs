//! medusa-storage: storage driver interface and its OpenDAL implementation

pub mod backend;
pub mod driver;
pub mod health;
pub mod operator;

pub use backend::OpendalDriver;
pub use driver::{Blob, BlobRef, StorageDriver};
pub use health::{check_health, HealthReport};
pub use operator::{apply_proxy_env, build_operator, S3Credentials};
