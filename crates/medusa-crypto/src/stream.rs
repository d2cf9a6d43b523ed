//! Streaming envelope encryption
//!
//! Both directions hold at most one frame in memory. Errors raised inside a
//! stream travel as `io::Error` wrapping a `MedusaError` and convert back
//! with `MedusaError::from`.

use bytes::Bytes;
use medusa_core::{ByteStream, MedusaError, MedusaResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::context::EncryptionContext;
use crate::frame::{FrameCipher, FrameKind, FRAME_PREFIX_LEN};
use crate::header::{header_tag, read_exact_or_truncated, verify_header_tag, MessageHeader};
use crate::keyring::RawAesKeyring;
use crate::keys::{derive_message_keys, generate_key, generate_message_id};
use crate::{ALGORITHM_AES256_GCM_HKDF_SHA256_COMMIT, MAX_FRAME_LEN, TAG_SIZE};

/// Plaintext stream plus the context authenticated in its header
pub struct Decrypted {
    pub context: EncryptionContext,
    pub stream: ByteStream,
}

/// Encrypt `source` under a fresh data key wrapped by `keyring`.
pub fn encrypt(
    source: ByteStream,
    keyring: &RawAesKeyring,
    context: EncryptionContext,
    frame_len: u32,
) -> MedusaResult<ByteStream> {
    if frame_len == 0 || frame_len > MAX_FRAME_LEN {
        return Err(MedusaError::Configuration(format!(
            "frame length must be within 1..={MAX_FRAME_LEN}, got {frame_len}"
        )));
    }

    let algorithm = ALGORITHM_AES256_GCM_HKDF_SHA256_COMMIT;
    let data_key = generate_key();
    let message_id = generate_message_id();
    let keys = derive_message_keys(&data_key, &message_id, algorithm)?;

    let header = MessageHeader {
        algorithm,
        message_id,
        context,
        wrapped_key: keyring.wrap(&data_key)?,
        frame_len,
        commitment: keys.commitment,
    };
    let mut head = header.encode_body()?;
    let tag = header_tag(&keys.frame_key, &head)?;
    head.extend_from_slice(&tag);

    let state = EncryptState {
        source,
        cipher: FrameCipher::new(&keys.frame_key, message_id),
        frame_len: frame_len as usize,
        seq: 0,
        header: Some(Bytes::from(head)),
        done: false,
    };
    let chunks = futures::stream::try_unfold(state, |mut st| async move {
        let next = st.next_chunk().await.map_err(MedusaError::into_io)?;
        Ok::<_, std::io::Error>(next.map(|chunk| (chunk, st)))
    });
    Ok(Box::new(StreamReader::new(Box::pin(chunks))))
}

/// Read and authenticate the header, then return a stream of verified plaintext.
pub async fn decrypt(mut source: ByteStream, keyring: &RawAesKeyring) -> MedusaResult<Decrypted> {
    let parsed = MessageHeader::read_from(&mut source).await?;
    let data_key = keyring.unwrap(&parsed.header.wrapped_key)?;
    let keys = derive_message_keys(&data_key, &parsed.header.message_id, parsed.header.algorithm)?;
    parsed.header.verify_commitment(&keys.commitment)?;
    verify_header_tag(&keys.frame_key, &parsed)?;

    let header = parsed.header;
    let state = DecryptState {
        source,
        cipher: FrameCipher::new(&keys.frame_key, header.message_id),
        frame_len: header.frame_len as usize,
        next_seq: 1,
        finished: false,
    };
    let chunks = futures::stream::try_unfold(state, |mut st| async move {
        let next = st.next_chunk().await.map_err(MedusaError::into_io)?;
        Ok::<_, std::io::Error>(next.map(|chunk| (chunk, st)))
    });

    Ok(Decrypted {
        context: header.context,
        stream: Box::new(StreamReader::new(Box::pin(chunks))),
    })
}

struct EncryptState {
    source: ByteStream,
    cipher: FrameCipher,
    frame_len: usize,
    seq: u32,
    header: Option<Bytes>,
    done: bool,
}

impl EncryptState {
    async fn next_chunk(&mut self) -> MedusaResult<Option<Bytes>> {
        if let Some(header) = self.header.take() {
            return Ok(Some(header));
        }
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.frame_len];
        let n = fill(&mut self.source, &mut buf).await?;
        // A full frame may be followed by EOF; that case ends with an empty final frame.
        let kind = if n < self.frame_len {
            FrameKind::Final
        } else {
            FrameKind::Regular
        };

        self.seq = self.seq.checked_add(1).ok_or_else(|| {
            MedusaError::Other(anyhow::anyhow!("stream exceeds the maximum frame count"))
        })?;
        let frame = self.cipher.seal(kind, self.seq, &buf[..n])?;
        if kind == FrameKind::Final {
            self.done = true;
        }
        Ok(Some(frame))
    }
}

struct DecryptState {
    source: ByteStream,
    cipher: FrameCipher,
    frame_len: usize,
    next_seq: u32,
    finished: bool,
}

impl DecryptState {
    async fn next_chunk(&mut self) -> MedusaResult<Option<Bytes>> {
        if self.finished {
            let mut probe = [0u8; 1];
            if self.source.read(&mut probe).await? != 0 {
                return Err(MedusaError::Integrity(
                    "trailing bytes after final frame".into(),
                ));
            }
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        read_exact_or_truncated(&mut self.source, &mut prefix, "message (missing final frame)")
            .await?;
        let kind = FrameKind::from_byte(prefix[0])?;
        let seq = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
        let ct_len = u32::from_be_bytes([prefix[5], prefix[6], prefix[7], prefix[8]]) as usize;

        if seq != self.next_seq {
            return Err(MedusaError::Integrity(format!(
                "frame out of order: expected {}, got {seq}",
                self.next_seq
            )));
        }
        let plaintext_len = ct_len.checked_sub(TAG_SIZE).ok_or_else(|| {
            MedusaError::Integrity(format!("frame {seq} shorter than its tag"))
        })?;
        let len_ok = match kind {
            FrameKind::Regular => plaintext_len == self.frame_len,
            FrameKind::Final => plaintext_len <= self.frame_len,
        };
        if !len_ok {
            return Err(MedusaError::Integrity(format!(
                "frame {seq} has invalid length {plaintext_len}"
            )));
        }

        let mut ciphertext = vec![0u8; ct_len];
        read_exact_or_truncated(&mut self.source, &mut ciphertext, "frame").await?;
        let plaintext = self.cipher.open(kind, seq, &ciphertext)?;

        match kind {
            FrameKind::Final => self.finished = true,
            FrameKind::Regular => {
                self.next_seq = seq.checked_add(1).ok_or_else(|| {
                    MedusaError::Integrity("frame sequence overflow".into())
                })?;
            }
        }
        Ok(Some(Bytes::from(plaintext)))
    }
}

/// Read until `buf` is full or the source is exhausted.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;
    use std::io::Cursor;

    const SMALL_FRAME: u32 = 16;

    fn keyring(byte: u8) -> RawAesKeyring {
        RawAesKeyring::new("medusa-cse-keys", "medusa-aes-wrapping-key", &[byte; KEY_SIZE]).unwrap()
    }

    fn source(data: &[u8]) -> ByteStream {
        Box::new(Cursor::new(data.to_vec()))
    }

    async fn read_all(mut stream: ByteStream) -> MedusaResult<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    async fn seal(data: &[u8], ring: &RawAesKeyring, frame_len: u32) -> Vec<u8> {
        let ctx = EncryptionContext::for_object("ks/cf/f.db", "s3");
        read_all(encrypt(source(data), ring, ctx, frame_len).unwrap())
            .await
            .unwrap()
    }

    async fn open(ciphertext: Vec<u8>, ring: &RawAesKeyring) -> MedusaResult<Vec<u8>> {
        let decrypted = decrypt(Box::new(Cursor::new(ciphertext)), ring).await?;
        read_all(decrypted.stream).await
    }

    async fn header_len(ciphertext: &[u8]) -> usize {
        let mut rest = ciphertext;
        MessageHeader::read_from(&mut rest).await.unwrap();
        ciphertext.len() - rest.len()
    }

    fn frame_size(plaintext_len: usize) -> usize {
        FRAME_PREFIX_LEN + plaintext_len + TAG_SIZE
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        let ring = keyring(1);
        let frame = SMALL_FRAME as usize;
        for size in [0, 1, frame - 1, frame, frame + 1, frame * 3 + 7] {
            let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let ciphertext = seal(&data, &ring, SMALL_FRAME).await;
            assert_eq!(open(ciphertext, &ring).await.unwrap(), data, "size {size}");
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_final_frame() {
        let ring = keyring(1);
        let data = vec![0x42u8; SMALL_FRAME as usize * 2];
        let ciphertext = seal(&data, &ring, SMALL_FRAME).await;

        let head = header_len(&ciphertext).await;
        let expected = head + 2 * frame_size(SMALL_FRAME as usize) + frame_size(0);
        assert_eq!(ciphertext.len(), expected);
        // last frame is final
        assert_eq!(ciphertext[ciphertext.len() - frame_size(0)], 1);
    }

    #[tokio::test]
    async fn test_same_input_differs_every_time() {
        let ring = keyring(1);
        let a = seal(b"identical plaintext", &ring, SMALL_FRAME).await;
        let b = seal(b"identical plaintext", &ring, SMALL_FRAME).await;
        assert_ne!(a, b);
        assert_eq!(open(a, &ring).await.unwrap(), b"identical plaintext");
        assert_eq!(open(b, &ring).await.unwrap(), b"identical plaintext");
    }

    #[tokio::test]
    async fn test_context_recovered_from_header() {
        let ring = keyring(1);
        let ciphertext = seal(b"data", &ring, SMALL_FRAME).await;
        let decrypted = decrypt(Box::new(Cursor::new(ciphertext)), &ring).await.unwrap();
        assert_eq!(decrypted.context.object_key(), Some("ks/cf/f.db"));
        assert_eq!(decrypted.context.get("storage_provider"), Some("s3"));
    }

    #[tokio::test]
    async fn test_wrong_key_is_configuration_error() {
        let ciphertext = seal(b"secret", &keyring(1), SMALL_FRAME).await;
        let err = open(ciphertext, &keyring(2)).await.unwrap_err();
        assert!(err.is_configuration(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_tampered_frame_is_integrity_error() {
        let ring = keyring(1);
        let mut ciphertext = seal(&[7u8; 40], &ring, SMALL_FRAME).await;
        let head = header_len(&ciphertext).await;
        ciphertext[head + FRAME_PREFIX_LEN + 3] ^= 0x01;

        let err = open(ciphertext, &ring).await.unwrap_err();
        assert!(err.is_integrity(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_final_frame() {
        let ring = keyring(1);
        let data = vec![9u8; 40];
        let ciphertext = seal(&data, &ring, SMALL_FRAME).await;
        // drop the final frame (8 plaintext bytes)
        let cut = ciphertext[..ciphertext.len() - frame_size(8)].to_vec();

        let err = open(cut, &ring).await.unwrap_err();
        assert!(err.is_integrity(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_trailing_bytes_rejected() {
        let ring = keyring(1);
        let mut ciphertext = seal(b"payload", &ring, SMALL_FRAME).await;
        ciphertext.extend_from_slice(b"junk");

        let err = open(ciphertext, &ring).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_reordered_frames_rejected() {
        let ring = keyring(1);
        let ciphertext = seal(&[5u8; 40], &ring, SMALL_FRAME).await;
        let head = header_len(&ciphertext).await;
        let f = frame_size(SMALL_FRAME as usize);

        let mut swapped = ciphertext[..head].to_vec();
        swapped.extend_from_slice(&ciphertext[head + f..head + 2 * f]);
        swapped.extend_from_slice(&ciphertext[head..head + f]);
        swapped.extend_from_slice(&ciphertext[head + 2 * f..]);

        let err = open(swapped, &ring).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_plaintext_is_not_a_message() {
        let err = open(b"just some plaintext bytes".to_vec(), &keyring(1))
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_zero_frame_len_rejected() {
        let ctx = EncryptionContext::new();
        assert!(encrypt(source(b""), &keyring(1), ctx, 0).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048), frame_len in 1u32..512) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let ring = keyring(3);
            let recovered = rt.block_on(async {
                let ciphertext = seal(&data, &ring, frame_len).await;
                open(ciphertext, &ring).await
            }).unwrap();
            prop_assert_eq!(recovered, data);
        }
    }
}
