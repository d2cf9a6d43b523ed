//! MD5 helpers for local files and streams in flight

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use medusa_core::{MedusaError, MedusaResult};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_BUF: usize = 64 * 1024;

struct Tally {
    bytes: u64,
    md5: md5::Context,
}

impl Default for Tally {
    fn default() -> Self {
        Self {
            bytes: 0,
            md5: md5::Context::new(),
        }
    }
}

/// Handle to the running size/digest of a [`HashingReader`].
///
/// Stays valid after the reader has been moved into another stream.
#[derive(Clone)]
pub struct DigestHandle(Arc<Mutex<Tally>>);

impl DigestHandle {
    /// Bytes read so far and the hex MD5 over them
    pub fn finish(&self) -> (u64, String) {
        let tally = self.0.lock().unwrap_or_else(|e| e.into_inner());
        (tally.bytes, format!("{:x}", tally.md5.clone().compute()))
    }
}

/// `AsyncRead` adapter that hashes every byte passing through it
pub struct HashingReader<R> {
    inner: R,
    tally: Arc<Mutex<Tally>>,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        let tally = Arc::new(Mutex::new(Tally::default()));
        (
            Self {
                inner,
                tally: tally.clone(),
            },
            DigestHandle(tally),
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                let mut tally = self.tally.lock().unwrap_or_else(|e| e.into_inner());
                tally.bytes += fresh.len() as u64;
                tally.md5.consume(fresh);
            }
        }
        poll
    }
}

/// Hex MD5 of a local file, streamed
pub async fn md5_file(path: &Path) -> MedusaResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| MedusaError::Io(io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}
