//! Key types, data key generation, per-message key derivation

use hkdf::Hkdf;
use medusa_core::{MedusaError, MedusaResult};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{COMMITMENT_SIZE, KEY_SIZE, MESSAGE_ID_SIZE};

/// A 256-bit AES key. Zeroized on drop.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit data key.
pub fn generate_key() -> SecretKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretKey::from_bytes(bytes)
}

pub(crate) fn generate_message_id() -> [u8; MESSAGE_ID_SIZE] {
    let mut id = [0u8; MESSAGE_ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Frame key and key commitment derived from a data key.
pub(crate) struct MessageKeys {
    pub frame_key: SecretKey,
    pub commitment: [u8; COMMITMENT_SIZE],
}

/// Derive the per-message keys with HKDF-SHA256, salted by the message id.
pub(crate) fn derive_message_keys(
    data_key: &SecretKey,
    message_id: &[u8; MESSAGE_ID_SIZE],
    algorithm: u16,
) -> MedusaResult<MessageKeys> {
    let hkdf = Hkdf::<Sha256>::new(Some(message_id), data_key.as_bytes());

    let mut info = Vec::with_capacity(11);
    info.extend_from_slice(&algorithm.to_be_bytes());
    info.extend_from_slice(b"DERIVEKEY");
    let mut frame_key = [0u8; KEY_SIZE];
    hkdf.expand(&info, &mut frame_key)
        .map_err(|e| MedusaError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;

    let mut commitment = [0u8; COMMITMENT_SIZE];
    hkdf.expand(b"COMMITKEY", &mut commitment)
        .map_err(|e| MedusaError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;

    Ok(MessageKeys {
        frame_key: SecretKey::from_bytes(frame_key),
        commitment,
    })
}

/// Equality without early exit on the first differing byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
