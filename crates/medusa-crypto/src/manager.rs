use medusa_core::{ByteStream, MedusaError, MedusaResult};
use tracing::{debug, info, warn};

use crate::config::EncryptionConfig;
use crate::context::EncryptionContext;
use crate::keyring::RawAesKeyring;
use crate::stream;
use crate::{DEFAULT_FRAME_LEN, MAX_FRAME_LEN};

enum Strategy {
    /// Streams pass through untouched
    NoOp,
    Envelope(RawAesKeyring),
}

/// Applies (or skips) client-side encryption to object streams.
///
/// The strategy is chosen once at construction and never changes.
pub struct EncryptionManager {
    strategy: Strategy,
    frame_len: u32,
}

impl EncryptionManager {
    /// Select the strategy for `config`.
    ///
    /// No key, or a key without an available backend, yields the no-op
    /// strategy. A key with an available backend that cannot be turned into
    /// a keyring is an error.
    pub fn new(config: &EncryptionConfig) -> MedusaResult<Self> {
        if !config.has_key() {
            info!("client-side encryption disabled: no key configured");
            return Ok(Self::disabled());
        }
        if !config.backend().is_available() {
            warn!("cse_key is set but envelope encryption is not available in this build; objects will be stored unencrypted");
            return Ok(Self::disabled());
        }

        let keyring = RawAesKeyring::new(config.key_namespace(), config.key_name(), config.get_key()?)?;
        info!(
            namespace = %keyring.namespace(),
            name = %keyring.name(),
            "client-side encryption initialized"
        );
        Ok(Self {
            strategy: Strategy::Envelope(keyring),
            frame_len: DEFAULT_FRAME_LEN,
        })
    }

    pub fn disabled() -> Self {
        Self {
            strategy: Strategy::NoOp,
            frame_len: DEFAULT_FRAME_LEN,
        }
    }

    /// Override the plaintext bytes per frame for new ciphertexts.
    pub fn with_frame_len(mut self, frame_len: u32) -> MedusaResult<Self> {
        if frame_len == 0 || frame_len > MAX_FRAME_LEN {
            return Err(MedusaError::Configuration(format!(
                "frame length must be within 1..={MAX_FRAME_LEN}, got {frame_len}"
            )));
        }
        self.frame_len = frame_len;
        Ok(self)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.strategy, Strategy::Envelope(_))
    }

    pub fn create_context(&self, object_key: &str, storage_provider: &str) -> EncryptionContext {
        EncryptionContext::for_object(object_key, storage_provider)
    }

    pub fn encrypt_stream(
        &self,
        source: ByteStream,
        object_key: &str,
        storage_provider: &str,
    ) -> MedusaResult<ByteStream> {
        match &self.strategy {
            Strategy::NoOp => Ok(source),
            Strategy::Envelope(keyring) => {
                debug!(key = %object_key, provider = %storage_provider, "encrypting stream");
                let ctx = self.create_context(object_key, storage_provider);
                stream::encrypt(source, keyring, ctx, self.frame_len)
            }
        }
    }

    /// Decrypt a stream produced by [`encrypt_stream`](Self::encrypt_stream).
    ///
    /// The header is read and authenticated before this returns; frame
    /// failures surface as read errors on the returned stream.
    pub async fn decrypt_stream(&self, source: ByteStream) -> MedusaResult<ByteStream> {
        match &self.strategy {
            Strategy::NoOp => Ok(source),
            Strategy::Envelope(keyring) => Ok(stream::decrypt(source, keyring).await?.stream),
        }
    }

    /// Like [`decrypt_stream`](Self::decrypt_stream), but also require the
    /// authenticated context to name `object_key`.
    pub async fn decrypt_stream_expecting(
        &self,
        source: ByteStream,
        object_key: &str,
    ) -> MedusaResult<ByteStream> {
        match &self.strategy {
            Strategy::NoOp => Ok(source),
            Strategy::Envelope(keyring) => {
                let decrypted = stream::decrypt(source, keyring).await?;
                match decrypted.context.object_key() {
                    Some(found) if found == object_key => Ok(decrypted.stream),
                    found => Err(MedusaError::Integrity(format!(
                        "object {object_key} carries encryption context for {}",
                        found.unwrap_or("<none>")
                    ))),
                }
            }
        }
    }
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("enabled", &self.is_enabled())
            .field("frame_len", &self.frame_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendAvailability, KeyMaterial};
    use std::io::Cursor;
    use tokio::io::{AsyncRead, AsyncReadExt};

    fn config(key: Option<&str>, backend: BackendAvailability) -> EncryptionConfig {
        EncryptionConfig::new(
            key.map(KeyMaterial::from),
            "medusa-cse-keys",
            "medusa-aes-wrapping-key",
            backend,
        )
    }

    fn enabled(key: &str) -> EncryptionManager {
        EncryptionManager::new(&config(Some(key), BackendAvailability::Available)).unwrap()
    }

    fn source(data: &[u8]) -> ByteStream {
        Box::new(Cursor::new(data.to_vec()))
    }

    fn addr(stream: &ByteStream) -> *const u8 {
        (&**stream as *const (dyn AsyncRead + Send + Unpin)).cast::<u8>()
    }

    async fn read_all(mut stream: ByteStream) -> MedusaResult<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_noop_returns_same_stream() {
        let manager = EncryptionManager::new(&config(None, BackendAvailability::Available)).unwrap();
        assert!(!manager.is_enabled());

        let input = source(b"plain");
        let before = addr(&input);
        let encrypted = manager.encrypt_stream(input, "a/b.db", "s3").unwrap();
        assert_eq!(addr(&encrypted), before);

        let decrypted = manager.decrypt_stream(encrypted).await.unwrap();
        assert_eq!(addr(&decrypted), before);
        assert_eq!(read_all(decrypted).await.unwrap(), b"plain");
    }

    #[test]
    fn test_key_without_backend_degrades_to_noop() {
        let manager =
            EncryptionManager::new(&config(Some("secret"), BackendAvailability::Unavailable)).unwrap();
        assert!(!manager.is_enabled());
    }

    #[test]
    fn test_setup_failure_is_fatal() {
        let cfg = EncryptionConfig::new(
            Some(KeyMaterial::from("secret")),
            "",
            "medusa-aes-wrapping-key",
            BackendAvailability::Available,
        );
        assert!(EncryptionManager::new(&cfg).unwrap_err().is_configuration());
    }

    #[test]
    fn test_create_context() {
        let ctx = EncryptionManager::disabled().create_context("a/b.db", "s3");
        assert_eq!(ctx.get("storage_provider"), Some("s3"));
        assert_eq!(ctx.get("object_key"), Some("a/b.db"));
        assert_eq!(ctx.get("medusa"), Some("backup"));
    }

    #[tokio::test]
    async fn test_envelope_roundtrip() {
        let manager = enabled("my-test-key").with_frame_len(8).unwrap();
        let plaintext = b"Hello, World! This is a test of encryption.".to_vec();

        let encrypted = manager.encrypt_stream(source(&plaintext), "test/file.txt", "s3").unwrap();
        let ciphertext = read_all(encrypted).await.unwrap();
        assert_ne!(ciphertext, plaintext);

        let decrypted = manager.decrypt_stream(source(&ciphertext)).await.unwrap();
        assert_eq!(read_all(decrypted).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_configuration() {
        let encrypted = enabled("key-one").encrypt_stream(source(b"data"), "k", "s3").unwrap();
        let ciphertext = read_all(encrypted).await.unwrap();

        let err = enabled("key-two")
            .decrypt_stream(source(&ciphertext))
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_expecting_checks_object_key() {
        let manager = enabled("my-test-key");
        let encrypted = manager.encrypt_stream(source(b"data"), "ks/cf/a.db", "s3").unwrap();
        let ciphertext = read_all(encrypted).await.unwrap();

        let ok = manager
            .decrypt_stream_expecting(source(&ciphertext), "ks/cf/a.db")
            .await
            .unwrap();
        assert_eq!(read_all(ok).await.unwrap(), b"data");

        let err = manager
            .decrypt_stream_expecting(source(&ciphertext), "ks/cf/b.db")
            .await
            .err()
            .unwrap();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_frame_len_bounds() {
        assert!(EncryptionManager::disabled().with_frame_len(0).is_err());
        assert!(EncryptionManager::disabled().with_frame_len(MAX_FRAME_LEN + 1).is_err());
        assert!(EncryptionManager::disabled().with_frame_len(1024).is_ok());
    }
}
