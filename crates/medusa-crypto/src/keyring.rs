//! Raw AES keyring: wraps per-object data keys under the configured key
//!
//! Wrapped key = AES-256-GCM(wrapping_key, iv, data_key, AAD = namespace || 0x00 || name)

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use medusa_core::{MedusaError, MedusaResult};
use rand::RngCore;
use zeroize::Zeroize;

use crate::keys::SecretKey;
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// A data key as stored in a message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub namespace: String,
    pub name: String,
    pub iv: [u8; IV_SIZE],
    /// Encrypted data key followed by the GCM tag
    pub ciphertext: Vec<u8>,
}

/// Keyring identified by (namespace, name) holding one wrapping key
pub struct RawAesKeyring {
    namespace: String,
    name: String,
    wrapping_key: SecretKey,
}

impl RawAesKeyring {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, key: &[u8; KEY_SIZE]) -> MedusaResult<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() || name.is_empty() {
            return Err(MedusaError::Configuration(
                "keyring namespace and name must not be empty".into(),
            ));
        }
        if namespace.len() > u16::MAX as usize || name.len() > u16::MAX as usize {
            return Err(MedusaError::Configuration(
                "keyring namespace or name too long".into(),
            ));
        }
        Ok(Self {
            namespace,
            name,
            wrapping_key: SecretKey::from_bytes(*key),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn aad(namespace: &str, name: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(namespace.len() + 1 + name.len());
        aad.extend_from_slice(namespace.as_bytes());
        aad.push(0);
        aad.extend_from_slice(name.as_bytes());
        aad
    }

    /// Wrap a data key under a fresh random IV.
    pub fn wrap(&self, data_key: &SecretKey) -> MedusaResult<WrappedKey> {
        let cipher = Aes256Gcm::new(self.wrapping_key.as_bytes().into());

        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let aad = Self::aad(&self.namespace, &self.name);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: data_key.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| MedusaError::Configuration(format!("data key wrapping failed: {e}")))?;

        Ok(WrappedKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            iv,
            ciphertext,
        })
    }

    /// Unwrap a data key. Fails with a configuration error when the key was
    /// wrapped by another keyring or under a different wrapping key.
    pub fn unwrap(&self, wrapped: &WrappedKey) -> MedusaResult<SecretKey> {
        if wrapped.namespace != self.namespace || wrapped.name != self.name {
            return Err(MedusaError::Configuration(format!(
                "data key was wrapped by keyring {}/{}, configured keyring is {}/{}",
                wrapped.namespace, wrapped.name, self.namespace, self.name
            )));
        }
        if wrapped.ciphertext.len() != KEY_SIZE + TAG_SIZE {
            return Err(MedusaError::Configuration(format!(
                "wrapped data key has wrong size: {} bytes (expected {})",
                wrapped.ciphertext.len(),
                KEY_SIZE + TAG_SIZE
            )));
        }

        let cipher = Aes256Gcm::new(self.wrapping_key.as_bytes().into());
        let aad = Self::aad(&wrapped.namespace, &wrapped.name);
        let mut plaintext = cipher
            .decrypt(
                Nonce::from_slice(&wrapped.iv),
                Payload {
                    msg: &wrapped.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                MedusaError::Configuration(
                    "unable to unwrap data key: wrong encryption key or corrupted header".into(),
                )
            })?;

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(&plaintext);
        plaintext.zeroize();

        Ok(SecretKey::from_bytes(key_bytes))
    }
}

impl std::fmt::Debug for RawAesKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAesKeyring")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("wrapping_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;

    fn keyring(byte: u8) -> RawAesKeyring {
        RawAesKeyring::new("medusa-cse-keys", "medusa-aes-wrapping-key", &[byte; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let ring = keyring(42);
        let data_key = generate_key();

        let wrapped = ring.wrap(&data_key).unwrap();
        let unwrapped = ring.unwrap(&wrapped).unwrap();

        assert_eq!(data_key.as_bytes(), unwrapped.as_bytes());
        assert_eq!(wrapped.ciphertext.len(), KEY_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_wrap_uses_fresh_iv() {
        let ring = keyring(42);
        let data_key = generate_key();
        let a = ring.wrap(&data_key).unwrap();
        let b = ring.wrap(&data_key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_unwrap_wrong_key_is_configuration_error() {
        let wrapped = keyring(1).wrap(&generate_key()).unwrap();
        let err = keyring(2).unwrap(&wrapped).unwrap_err();
        assert!(err.is_configuration(), "got {err:?}");
    }

    #[test]
    fn test_unwrap_foreign_keyring_name() {
        let other = RawAesKeyring::new("medusa-cse-keys", "other-key", &[1u8; KEY_SIZE]).unwrap();
        let wrapped = other.wrap(&generate_key()).unwrap();
        let err = keyring(1).unwrap(&wrapped).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("other-key"));
    }

    #[test]
    fn test_tampered_wrapped_key_fails() {
        let ring = keyring(1);
        let mut wrapped = ring.wrap(&generate_key()).unwrap();
        wrapped.ciphertext[0] ^= 0x01;
        assert!(ring.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(RawAesKeyring::new("", "name", &[0u8; KEY_SIZE]).is_err());
        assert!(RawAesKeyring::new("ns", "", &[0u8; KEY_SIZE]).is_err());
    }
}
