use crate::fs::FsError;
use bytes::Bytes;
use futures_util::Stream;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Marker error yielded when the streamed body does not hash to the value
/// the client declared. Handlers look for it in error source chains.
#[derive(Debug)]
pub struct DigestMismatch {
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for DigestMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "content sha256 mismatch: expected {}, got {}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for DigestMismatch {}

/// Tees a byte stream into a SHA-256 hasher and fails the stream at EOF when
/// the hex digest differs from the expected value. Bytes flow through
/// unmodified, so the backend may already hold them when the mismatch
/// surfaces; callers must not commit metadata on error.
pub struct Sha256Verifier<S> {
    inner: S,
    hasher: Sha256,
    expected: String,
    finished: bool,
}

impl<S> Sha256Verifier<S> {
    pub fn new(inner: S, expected: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected: expected.into(),
            finished: false,
        }
    }
}

impl<S> Stream for Sha256Verifier<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.hasher.update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                let actual = hex::encode(self.hasher.clone().finalize());
                if actual != self.expected {
                    let mismatch = DigestMismatch {
                        expected: self.expected.clone(),
                        actual,
                    };
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        mismatch,
                    ))));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Walks the error chain looking for a [`DigestMismatch`], however deeply a
/// backend wrapped it. `io::Error` hides its payload behind `get_ref`, so
/// plain `source()` traversal is not enough.
pub fn is_digest_mismatch(err: &FsError) -> bool {
    match err {
        FsError::Io(io_err) => io_chain_has_mismatch(io_err),
        FsError::Http(http_err) => {
            let mut source = std::error::Error::source(http_err);
            while let Some(node) = source {
                if node.downcast_ref::<DigestMismatch>().is_some() {
                    return true;
                }
                if let Some(io_err) = node.downcast_ref::<io::Error>() {
                    if io_chain_has_mismatch(io_err) {
                        return true;
                    }
                }
                source = node.source();
            }
            false
        }
        _ => false,
    }
}

fn io_chain_has_mismatch(err: &io::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> =
        err.get_ref().map(|inner| inner as _);
    while let Some(node) = current {
        if node.downcast_ref::<DigestMismatch>().is_some() {
            return true;
        }
        current = match node.downcast_ref::<io::Error>() {
            Some(io_err) => io_err.get_ref().map(|inner| inner as _),
            None => node.source(),
        };
    }
    false
}
