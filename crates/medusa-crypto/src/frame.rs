//! Per-frame AES-256-GCM encryption
//!
//! Frame format (binary):
//! ```text
//! [1 byte: kind (0 = regular, 1 = final)][4 bytes: seq BE][4 bytes: ct_len BE][ct_len bytes: ciphertext + tag]
//! IV  = seq, big-endian, right-aligned in 12 bytes (seq starts at 1)
//! AAD = message_id (32) || kind (1) || seq (4, BE) || plaintext_len (8, BE)
//! ```
//!
//! The AAD binds each frame to its message, position, and length, so frames
//! cannot be reordered, dropped, or spliced across messages.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use bytes::{BufMut, Bytes, BytesMut};
use medusa_core::{MedusaError, MedusaResult};

use crate::keys::SecretKey;
use crate::{IV_SIZE, MESSAGE_ID_SIZE, TAG_SIZE};

/// kind + seq + ct_len
pub const FRAME_PREFIX_LEN: usize = 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Regular,
    Final,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Regular => 0,
            FrameKind::Final => 1,
        }
    }

    pub fn from_byte(byte: u8) -> MedusaResult<Self> {
        match byte {
            0 => Ok(FrameKind::Regular),
            1 => Ok(FrameKind::Final),
            other => Err(MedusaError::Integrity(format!("unknown frame kind {other}"))),
        }
    }
}

/// Frame cipher for one message
pub struct FrameCipher {
    cipher: Aes256Gcm,
    message_id: [u8; MESSAGE_ID_SIZE],
}

impl FrameCipher {
    pub fn new(frame_key: &SecretKey, message_id: [u8; MESSAGE_ID_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(frame_key.as_bytes().into()),
            message_id,
        }
    }

    /// Encrypt one frame and return it with its prefix.
    pub fn seal(&self, kind: FrameKind, seq: u32, plaintext: &[u8]) -> MedusaResult<Bytes> {
        let aad = self.aad(kind, seq, plaintext.len() as u64);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&frame_iv(seq)),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| MedusaError::Other(anyhow::anyhow!("frame encryption failed: {e}")))?;

        let ct_len = u32::try_from(ciphertext.len())
            .map_err(|_| MedusaError::Other(anyhow::anyhow!("frame too large")))?;

        let mut out = BytesMut::with_capacity(FRAME_PREFIX_LEN + ciphertext.len());
        out.put_u8(kind.as_byte());
        out.put_u32(seq);
        out.put_u32(ct_len);
        out.extend_from_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Authenticate and decrypt one frame body (ciphertext + tag).
    pub fn open(&self, kind: FrameKind, seq: u32, ciphertext: &[u8]) -> MedusaResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(MedusaError::Integrity(format!(
                "frame {seq} too short: {} bytes",
                ciphertext.len()
            )));
        }
        let plaintext_len = (ciphertext.len() - TAG_SIZE) as u64;
        let aad = self.aad(kind, seq, plaintext_len);

        self.cipher
            .decrypt(
                Nonce::from_slice(&frame_iv(seq)),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| MedusaError::Integrity(format!("frame {seq} failed authentication")))
    }

    fn aad(&self, kind: FrameKind, seq: u32, plaintext_len: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(MESSAGE_ID_SIZE + 1 + 4 + 8);
        aad.extend_from_slice(&self.message_id);
        aad.push(kind.as_byte());
        aad.extend_from_slice(&seq.to_be_bytes());
        aad.extend_from_slice(&plaintext_len.to_be_bytes());
        aad
    }
}

fn frame_iv(seq: u32) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv[IV_SIZE - 4..].copy_from_slice(&seq.to_be_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;

    fn body(frame: &Bytes) -> &[u8] {
        &frame[FRAME_PREFIX_LEN..]
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = FrameCipher::new(&generate_key(), [0xAB; MESSAGE_ID_SIZE]);
        let frame = cipher.seal(FrameKind::Regular, 1, b"hello, encrypted world!").unwrap();

        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..5], &1u32.to_be_bytes());
        let opened = cipher.open(FrameKind::Regular, 1, body(&frame)).unwrap();
        assert_eq!(opened, b"hello, encrypted world!");
    }

    #[test]
    fn test_empty_final_frame() {
        let cipher = FrameCipher::new(&generate_key(), [0; MESSAGE_ID_SIZE]);
        let frame = cipher.seal(FrameKind::Final, 3, b"").unwrap();
        // prefix + tag only
        assert_eq!(frame.len(), FRAME_PREFIX_LEN + TAG_SIZE);
        assert!(cipher.open(FrameKind::Final, 3, body(&frame)).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_seq_fails() {
        let cipher = FrameCipher::new(&generate_key(), [0; MESSAGE_ID_SIZE]);
        let frame = cipher.seal(FrameKind::Regular, 1, b"secret data").unwrap();
        let err = cipher.open(FrameKind::Regular, 2, body(&frame)).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_wrong_kind_fails() {
        let cipher = FrameCipher::new(&generate_key(), [0; MESSAGE_ID_SIZE]);
        let frame = cipher.seal(FrameKind::Regular, 1, b"secret data").unwrap();
        assert!(cipher.open(FrameKind::Final, 1, body(&frame)).is_err(), "a regular frame cannot pose as final");
    }

    #[test]
    fn test_other_message_id_fails() {
        let key = generate_key();
        let a = FrameCipher::new(&key, [0xAA; MESSAGE_ID_SIZE]);
        let b = FrameCipher::new(&key, [0xBB; MESSAGE_ID_SIZE]);
        let frame = a.seal(FrameKind::Final, 1, b"secret data").unwrap();
        assert!(b.open(FrameKind::Final, 1, body(&frame)).is_err());
    }

    #[test]
    fn test_tampered_ciphertext() {
        let cipher = FrameCipher::new(&generate_key(), [0; MESSAGE_ID_SIZE]);
        let frame = cipher.seal(FrameKind::Regular, 1, b"secret data").unwrap();
        let mut tampered = body(&frame).to_vec();
        tampered[0] ^= 0xFF;
        assert!(cipher.open(FrameKind::Regular, 1, &tampered).unwrap_err().is_integrity());
    }

    #[test]
    fn test_unknown_kind_byte() {
        assert!(FrameKind::from_byte(7).unwrap_err().is_integrity());
    }
}
