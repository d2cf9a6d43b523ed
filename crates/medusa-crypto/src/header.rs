//! Message header
//!
//! ```text
//! magic "MDSE" | version u8 | algorithm u16 | message_id [32]
//! | context: count u16, {klen u16, key, vlen u16, value}* (sorted by key)
//! | key_namespace: len u16, bytes | key_name: len u16, bytes
//! | wrap_iv [12] | wrapped_len u16 | wrapped data key
//! | frame_len u32 | commitment [32] | header_tag [16]
//! ```
//!
//! All integers are big-endian. The header tag is AES-256-GCM under the
//! frame key over an empty plaintext, with everything before it as AAD and
//! an all-zero IV (frames start at IV 1).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use medusa_core::{MedusaError, MedusaResult};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::context::EncryptionContext;
use crate::keyring::WrappedKey;
use crate::keys::{constant_time_eq, SecretKey};
use crate::{
    ALGORITHM_AES256_GCM_HKDF_SHA256_COMMIT, COMMITMENT_SIZE, IV_SIZE, MAX_FRAME_LEN,
    MESSAGE_ID_SIZE, TAG_SIZE,
};

pub const MAGIC: &[u8; 4] = b"MDSE";
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub algorithm: u16,
    pub message_id: [u8; MESSAGE_ID_SIZE],
    pub context: EncryptionContext,
    pub wrapped_key: WrappedKey,
    pub frame_len: u32,
    pub commitment: [u8; COMMITMENT_SIZE],
}

/// A header read from a stream together with the bytes its tag covers
#[derive(Debug)]
pub struct ParsedHeader {
    pub header: MessageHeader,
    pub body: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl MessageHeader {
    /// Serialize everything up to (not including) the header tag.
    pub fn encode_body(&self) -> MedusaResult<Vec<u8>> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.algorithm.to_be_bytes());
        out.extend_from_slice(&self.message_id);

        put_len(&mut out, self.context.len(), "encryption context")?;
        for (key, value) in self.context.iter() {
            put_str(&mut out, key, "context key")?;
            put_str(&mut out, value, "context value")?;
        }

        put_str(&mut out, &self.wrapped_key.namespace, "key namespace")?;
        put_str(&mut out, &self.wrapped_key.name, "key name")?;
        out.extend_from_slice(&self.wrapped_key.iv);
        put_len(&mut out, self.wrapped_key.ciphertext.len(), "wrapped key")?;
        out.extend_from_slice(&self.wrapped_key.ciphertext);

        out.extend_from_slice(&self.frame_len.to_be_bytes());
        out.extend_from_slice(&self.commitment);
        Ok(out)
    }

    /// Read and structurally validate a header. Authentication happens later,
    /// once the data key has been unwrapped.
    pub async fn read_from<R>(reader: &mut R) -> MedusaResult<ParsedHeader>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut r = HeaderReader {
            inner: reader,
            body: Vec::with_capacity(256),
        };

        let magic: [u8; 4] = r.array().await?;
        if &magic != MAGIC {
            return Err(MedusaError::Integrity(
                "not an encrypted object (bad magic)".into(),
            ));
        }
        let version = r.u8().await?;
        if version != FORMAT_VERSION {
            return Err(MedusaError::Configuration(format!(
                "unsupported envelope version {version}"
            )));
        }
        let algorithm = r.u16().await?;
        if algorithm != ALGORITHM_AES256_GCM_HKDF_SHA256_COMMIT {
            return Err(MedusaError::Configuration(format!(
                "unsupported algorithm suite {algorithm:#06x}"
            )));
        }
        let message_id: [u8; MESSAGE_ID_SIZE] = r.array().await?;

        let count = r.u16().await?;
        let mut context = EncryptionContext::new();
        let mut previous: Option<String> = None;
        for _ in 0..count {
            let key = r.string().await?;
            let value = r.string().await?;
            if previous.as_deref().is_some_and(|p| p >= key.as_str()) {
                return Err(MedusaError::Integrity(
                    "encryption context keys are not sorted and unique".into(),
                ));
            }
            previous = Some(key.clone());
            context.insert(key, value);
        }

        let namespace = r.string().await?;
        let name = r.string().await?;
        let iv: [u8; IV_SIZE] = r.array().await?;
        let wrapped_len = r.u16().await? as usize;
        let ciphertext = r.bytes(wrapped_len).await?;

        let frame_len = r.u32().await?;
        if frame_len == 0 || frame_len > MAX_FRAME_LEN {
            return Err(MedusaError::Integrity(format!(
                "invalid frame length {frame_len}"
            )));
        }
        let commitment: [u8; COMMITMENT_SIZE] = r.array().await?;

        let body = std::mem::take(&mut r.body);
        let tag: [u8; TAG_SIZE] = r.array().await?;

        Ok(ParsedHeader {
            header: MessageHeader {
                algorithm,
                message_id,
                context,
                wrapped_key: WrappedKey {
                    namespace,
                    name,
                    iv,
                    ciphertext,
                },
                frame_len,
                commitment,
            },
            body,
            tag,
        })
    }

    /// Check the stored commitment against the one derived from the data key.
    pub fn verify_commitment(&self, derived: &[u8; COMMITMENT_SIZE]) -> MedusaResult<()> {
        if constant_time_eq(&self.commitment, derived) {
            Ok(())
        } else {
            Err(MedusaError::Integrity("key commitment mismatch".into()))
        }
    }
}

/// Compute the header tag over `body`.
pub fn header_tag(frame_key: &SecretKey, body: &[u8]) -> MedusaResult<[u8; TAG_SIZE]> {
    let cipher = Aes256Gcm::new(frame_key.as_bytes().into());
    let tag = cipher
        .encrypt(
            Nonce::from_slice(&[0u8; IV_SIZE]),
            Payload { msg: &[], aad: body },
        )
        .map_err(|e| MedusaError::Other(anyhow::anyhow!("header authentication failed: {e}")))?;

    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

pub fn verify_header_tag(frame_key: &SecretKey, parsed: &ParsedHeader) -> MedusaResult<()> {
    let expected = header_tag(frame_key, &parsed.body)?;
    if constant_time_eq(&expected, &parsed.tag) {
        Ok(())
    } else {
        Err(MedusaError::Integrity("header authentication failed".into()))
    }
}

fn put_len(out: &mut Vec<u8>, len: usize, what: &str) -> MedusaResult<()> {
    let len = u16::try_from(len)
        .map_err(|_| MedusaError::Configuration(format!("{what} too long for envelope header")))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str, what: &str) -> MedusaResult<()> {
    put_len(out, s.len(), what)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Reads header fields, keeping a copy of every byte for tag verification
struct HeaderReader<'a, R: ?Sized> {
    inner: &'a mut R,
    body: Vec<u8>,
}

impl<R: AsyncRead + Unpin + ?Sized> HeaderReader<'_, R> {
    async fn bytes(&mut self, n: usize) -> MedusaResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        read_exact_or_truncated(&mut *self.inner, &mut buf, "header").await?;
        self.body.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn array<const N: usize>(&mut self) -> MedusaResult<[u8; N]> {
        let mut buf = [0u8; N];
        read_exact_or_truncated(&mut *self.inner, &mut buf, "header").await?;
        self.body.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn u8(&mut self) -> MedusaResult<u8> {
        Ok(self.array::<1>().await?[0])
    }

    async fn u16(&mut self) -> MedusaResult<u16> {
        Ok(u16::from_be_bytes(self.array().await?))
    }

    async fn u32(&mut self) -> MedusaResult<u32> {
        Ok(u32::from_be_bytes(self.array().await?))
    }

    async fn string(&mut self) -> MedusaResult<String> {
        let len = self.u16().await? as usize;
        let raw = self.bytes(len).await?;
        String::from_utf8(raw)
            .map_err(|_| MedusaError::Integrity("header string is not UTF-8".into()))
    }
}

/// `read_exact` where a short read means the message was cut off.
pub(crate) async fn read_exact_or_truncated<R>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> MedusaResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(MedusaError::Integrity(format!("truncated {what}")))
        }
        Err(e) => Err(MedusaError::from(e)),
    }
}
