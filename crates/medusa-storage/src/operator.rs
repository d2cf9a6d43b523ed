//! OpenDAL Operator factory for medusa storage backends

use medusa_core::config::{StorageConfig, StorageProvider};
use medusa_core::{MedusaError, MedusaResult};
use opendal::Operator;

/// S3 access keys. When absent, opendal falls back to the AWS environment.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an OpenDAL Operator for the configured provider.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_operator(
    storage: &StorageConfig,
    credentials: Option<&S3Credentials>,
) -> MedusaResult<Operator> {
    match storage.storage_provider {
        StorageProvider::S3 => {
            check_endpoint_tls(storage)?;
            // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
            let mut builder = opendal::services::S3::default()
                .region(&storage.region)
                .bucket(&storage.bucket_name);
            if !storage.endpoint.is_empty() {
                builder = builder.endpoint(&storage.endpoint);
            }
            if let Some(creds) = credentials {
                builder = builder
                    .access_key_id(&creds.access_key_id)
                    .secret_access_key(&creds.secret_access_key);
            }
            finish(builder, storage)
        }
        StorageProvider::Local => {
            let root = storage.base_path.join(&storage.bucket_name);
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            finish(builder, storage)
        }
        StorageProvider::Memory => finish(opendal::services::Memory::default(), storage),
    }
}

fn finish<B: opendal::Builder>(builder: B, storage: &StorageConfig) -> MedusaResult<Operator> {
    let op = Operator::new(builder)
        .map_err(|e| {
            MedusaError::Configuration(format!(
                "creating OpenDAL {} operator: {e}",
                storage.storage_provider
            ))
        })?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(storage.max_retries)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

fn check_endpoint_tls(storage: &StorageConfig) -> MedusaResult<()> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            return Err(MedusaError::Configuration(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }
    Ok(())
}

/// Export `proxy_url` as `HTTP_PROXY`/`HTTPS_PROXY`. Leaves the environment
/// untouched when no proxy is configured.
pub fn apply_proxy_env(proxy_url: Option<&str>) {
    if let Some(url) = proxy_url.filter(|u| !u.is_empty()) {
        tracing::info!(proxy = %url, "routing storage traffic through proxy");
        std::env::set_var("HTTP_PROXY", url);
        std::env::set_var("HTTPS_PROXY", url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3(endpoint: &str, enforce_tls: bool) -> StorageConfig {
        StorageConfig {
            storage_provider: StorageProvider::S3,
            endpoint: endpoint.into(),
            enforce_tls,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_s3_operator() {
        let creds = S3Credentials {
            access_key_id: "test-key".into(),
            secret_access_key: "test-secret".into(),
        };
        let op = build_operator(&s3("https://s3.example.com", true), Some(&creds));
        assert!(op.is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_http_endpoint_warns_without_enforce_tls() {
        assert!(build_operator(&s3("http://localhost:9000", false), None).is_ok());
    }

    #[test]
    fn test_http_endpoint_with_enforce_tls() {
        let err = build_operator(&s3("http://insecure:9000", true), None).unwrap_err();
        assert!(err.is_configuration());
        assert!(
            err.to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }

    #[test]
    fn test_build_local_operator() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            storage_provider: StorageProvider::Local,
            base_path: dir.path().to_path_buf(),
            bucket_name: "bucket".into(),
            ..Default::default()
        };
        assert!(build_operator(&storage, None).is_ok());
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = S3Credentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "very-secret".into(),
        };
        assert!(!format!("{creds:?}").contains("very-secret"));
    }

    #[test]
    fn test_proxy_env() {
        let before_http = std::env::var("HTTP_PROXY").ok();
        apply_proxy_env(None);
        assert_eq!(std::env::var("HTTP_PROXY").ok(), before_http);

        apply_proxy_env(Some("http://proxy.example:3128"));
        assert_eq!(std::env::var("HTTP_PROXY").unwrap(), "http://proxy.example:3128");
        assert_eq!(std::env::var("HTTPS_PROXY").unwrap(), "http://proxy.example:3128");
    }
}
