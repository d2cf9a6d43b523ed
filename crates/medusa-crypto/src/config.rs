//! Encryption settings and key normalization
//!
//! The configured key is normalized once, at construction, to exactly
//! [`KEY_SIZE`] bytes:
//!
//! 1. text that decodes as base64 is replaced by the decoded bytes;
//! 2. otherwise the UTF-8 bytes of the text (or the raw bytes) are used;
//! 3. shorter keys are right-padded with zeros, longer keys truncated.
//!
//! Base64 decoding is the lenient kind existing keys were produced with:
//! non-ASCII text is never base64, characters outside the alphabet are
//! skipped, decoding stops after the first padded group, and a dangling
//! partial group without padding is an error.
//!
//! Step 3 means two keys sharing a 32-byte prefix collide. It is kept so
//! existing backups stay readable.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use medusa_core::config::StorageConfig;
use medusa_core::{MedusaError, MedusaResult};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;
use zeroize::Zeroizing;

use crate::keys::SecretKey;
use crate::KEY_SIZE;

/// Unpadded base64 that tolerates non-zero trailing bits
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

/// Key material as supplied by the operator
pub enum KeyMaterial {
    /// Passphrase or base64-encoded key
    Text(SecretString),
    /// Raw key bytes, used as-is before padding/truncation
    Bytes(Zeroizing<Vec<u8>>),
}

impl From<&str> for KeyMaterial {
    fn from(text: &str) -> Self {
        KeyMaterial::Text(SecretString::from(text.to_string()))
    }
}

impl From<String> for KeyMaterial {
    fn from(text: String) -> Self {
        KeyMaterial::Text(SecretString::from(text))
    }
}

impl From<Vec<u8>> for KeyMaterial {
    fn from(bytes: Vec<u8>) -> Self {
        KeyMaterial::Bytes(Zeroizing::new(bytes))
    }
}

/// Whether this build can perform envelope encryption.
///
/// Resolved once at startup and handed to [`EncryptionConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendAvailability {
    Available,
    Unavailable,
}

impl BackendAvailability {
    pub fn detect() -> Self {
        if cfg!(feature = "envelope") {
            BackendAvailability::Available
        } else {
            BackendAvailability::Unavailable
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, BackendAvailability::Available)
    }
}

/// Client-side encryption settings with the key already normalized
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    key: Option<SecretKey>,
    key_namespace: String,
    key_name: String,
    backend: BackendAvailability,
}

impl EncryptionConfig {
    pub fn new(
        key: Option<KeyMaterial>,
        key_namespace: impl Into<String>,
        key_name: impl Into<String>,
        backend: BackendAvailability,
    ) -> Self {
        Self {
            key: key.as_ref().map(|material| SecretKey::from_bytes(normalize_key(material))),
            key_namespace: key_namespace.into(),
            key_name: key_name.into(),
            backend,
        }
    }

    /// Build from the `[storage]` section. An empty `cse_key` counts as unset.
    pub fn from_storage_config(storage: &StorageConfig, backend: BackendAvailability) -> Self {
        let key = storage
            .cse_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(KeyMaterial::from);
        Self::new(key, &storage.key_namespace, &storage.key_name, backend)
    }

    /// True iff a key was supplied and the backend is available.
    pub fn is_enabled(&self) -> bool {
        self.key.is_some() && self.backend.is_available()
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// The normalized 32-byte key.
    pub fn get_key(&self) -> MedusaResult<&[u8; KEY_SIZE]> {
        self.key
            .as_ref()
            .map(SecretKey::as_bytes)
            .ok_or_else(|| MedusaError::Configuration("no encryption key configured".into()))
    }

    pub fn key_namespace(&self) -> &str {
        &self.key_namespace
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn backend(&self) -> BackendAvailability {
        self.backend
    }
}

/// Normalize key material to exactly 32 bytes.
pub fn normalize_key(material: &KeyMaterial) -> [u8; KEY_SIZE] {
    let bytes: Zeroizing<Vec<u8>> = match material {
        KeyMaterial::Text(text) => {
            let text = text.expose_secret();
            decode_base64_key(text).unwrap_or_else(|| Zeroizing::new(text.as_bytes().to_vec()))
        }
        KeyMaterial::Bytes(raw) => raw.clone(),
    };

    if bytes.len() < KEY_SIZE {
        warn!(
            len = bytes.len(),
            "encryption key shorter than {KEY_SIZE} bytes, padding with zeros"
        );
    } else if bytes.len() > KEY_SIZE {
        warn!(
            len = bytes.len(),
            "encryption key longer than {KEY_SIZE} bytes, truncating"
        );
    }

    let mut key = [0u8; KEY_SIZE];
    let n = bytes.len().min(KEY_SIZE);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// `None` means "not base64"; the caller falls back to the UTF-8 bytes.
fn decode_base64_key(text: &str) -> Option<Zeroizing<Vec<u8>>> {
    if !text.is_ascii() {
        return None;
    }
    let mut digits = Zeroizing::new(String::with_capacity(text.len()));
    let mut pads = 0;
    let mut closed = false;
    for c in text.chars() {
        if c == '=' {
            // padding only counts once a group holds at least two digits
            let pos = digits.len() % 4;
            if pos >= 2 {
                pads += 1;
                if pos + pads >= 4 {
                    closed = true;
                    break;
                }
            }
        } else if c.is_ascii_alphanumeric() || c == '+' || c == '/' {
            digits.push(c);
            pads = 0;
        }
    }
    if !closed && digits.len() % 4 != 0 {
        return None;
    }
    LENIENT_BASE64.decode(digits.as_bytes()).ok().map(Zeroizing::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use proptest::prelude::*;

    fn text(s: &str) -> KeyMaterial {
        KeyMaterial::from(s)
    }

    #[test]
    fn test_base64_key_decoded() {
        let raw = [0x5Au8; KEY_SIZE];
        let encoded = STANDARD.encode(raw);
        assert_eq!(normalize_key(&text(&encoded)), raw);
    }

    #[test]
    fn test_short_base64_is_decoded_then_padded() {
        // "abcd" is valid base64 for three bytes
        let key = normalize_key(&text("abcd"));
        assert_eq!(&key[..3], &[0x69, 0xB7, 0x1D]);
        assert!(key[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_passphrase_falls_back_to_utf8() {
        let phrase = "my secret passphrase!";
        let key = normalize_key(&text(phrase));
        assert_eq!(&key[..phrase.len()], phrase.as_bytes());
        assert!(key[phrase.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_long_passphrase_truncated() {
        let phrase = "x".repeat(50);
        assert_eq!(normalize_key(&text(&phrase)), [b'x'; KEY_SIZE]);
    }

    #[test]
    fn test_symbols_only_text_decodes_to_empty_key() {
        // nothing survives the alphabet filter, which is an empty but valid decode
        assert_eq!(normalize_key(&text("---")), [0u8; KEY_SIZE]);
    }

    #[test]
    fn test_non_ascii_passphrase_uses_utf8_bytes() {
        let key = normalize_key(&text("éabcd"));
        assert_eq!(&key[..6], &[0xC3, 0xA9, b'a', b'b', b'c', b'd']);
        assert!(key[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decoding_stops_after_first_padded_group() {
        let key = normalize_key(&text("YQ==YQ=="));
        assert_eq!(key[0], b'a');
        assert!(key[1..].iter().all(|b| *b == 0));

        let key = normalize_key(&text("YWI=trailing garbage"));
        assert_eq!(&key[..2], b"ab");
        assert!(key[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_whitespace_inside_base64_is_skipped() {
        let key = normalize_key(&text(" YWJj\nZGVm\t"));
        assert_eq!(&key[..6], b"abcdef");
        assert!(key[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unpadded_partial_group_is_not_base64() {
        // five digits: one left over with no padding
        let key = normalize_key(&text("abcde"));
        assert_eq!(&key[..5], b"abcde");
        let key = normalize_key(&text("YWI"));
        assert_eq!(&key[..3], b"YWI");
    }

    #[test]
    fn test_stray_padding_before_data_is_ignored() {
        // a lone '=' at the start of a group is skipped, not an end marker
        let key = normalize_key(&text("=YWJj"));
        assert_eq!(&key[..3], b"abc");
    }

    #[test]
    fn test_get_key_without_key_is_configuration_error() {
        let config = EncryptionConfig::new(None, "ns", "name", BackendAvailability::Available);
        assert!(!config.is_enabled());
        assert!(config.get_key().unwrap_err().is_configuration());
    }

    #[test]
    fn test_enabled_requires_backend() {
        let on = EncryptionConfig::new(Some(text("k")), "ns", "n", BackendAvailability::Available);
        let off = EncryptionConfig::new(Some(text("k")), "ns", "n", BackendAvailability::Unavailable);
        assert!(on.is_enabled());
        assert!(!off.is_enabled());
        assert!(off.get_key().is_ok(), "key is still normalized when the backend is missing");
    }

    #[test]
    fn test_from_storage_config() {
        let mut storage = StorageConfig::default();
        storage.cse_key = Some(String::new());
        let config = EncryptionConfig::from_storage_config(&storage, BackendAvailability::Available);
        assert!(!config.has_key(), "empty key counts as unset");

        storage.cse_key = Some("passphrase".into());
        let config = EncryptionConfig::from_storage_config(&storage, BackendAvailability::Available);
        assert!(config.is_enabled());
        assert_eq!(config.key_namespace(), "medusa-cse-keys");
        assert_eq!(config.key_name(), "medusa-aes-wrapping-key");
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let config = EncryptionConfig::new(
            Some(KeyMaterial::from(vec![0xEE; KEY_SIZE])),
            "ns",
            "n",
            BackendAvailability::Available,
        );
        let rendered = format!("{config:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("238"));
    }

    proptest! {
        #[test]
        fn prop_raw_bytes_pad_or_truncate(raw in proptest::collection::vec(any::<u8>(), 0..96)) {
            let key = normalize_key(&KeyMaterial::from(raw.clone()));
            let n = raw.len().min(KEY_SIZE);
            prop_assert_eq!(&key[..n], &raw[..n]);
            prop_assert!(key[n..].iter().all(|b| *b == 0));
        }

        #[test]
        fn prop_base64_text_uses_decoded_bytes(raw in proptest::collection::vec(any::<u8>(), 1..64)) {
            let key = normalize_key(&text(&STANDARD.encode(&raw)));
            let n = raw.len().min(KEY_SIZE);
            prop_assert_eq!(&key[..n], &raw[..n]);
            prop_assert!(key[n..].iter().all(|b| *b == 0));
        }

        #[test]
        fn prop_get_key_is_stable(phrase in "[ -~]{0,80}") {
            let config = EncryptionConfig::new(
                Some(text(&phrase)),
                "ns",
                "n",
                BackendAvailability::Available,
            );
            let first = *config.get_key().unwrap();
            prop_assert_eq!(&first, config.get_key().unwrap());
            prop_assert_eq!(first, normalize_key(&text(&phrase)));
        }
    }
}
