//! Maximum-size enforcement for framed messages.
//!
//! An oversized body is never buffered. [`SizeGuard::drain`] reads it into
//! one reusable chunk buffer and throws it away, so memory stays bounded by
//! the chunk size no matter what `Content-Length` the peer declared.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Default maximum message size (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default drain chunk size (64 KiB).
pub const DEFAULT_DRAIN_CHUNK_SIZE: usize = 64 * 1024;

/// Result of [`SizeGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Ok,
    TooLarge { declared: usize, limit: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct SizeGuard {
    max_size: usize,
    chunk_size: usize,
}

impl Default for SizeGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_DRAIN_CHUNK_SIZE)
    }
}

impl SizeGuard {
    /// A zero `chunk_size` is raised to 1.
    pub fn new(max_size: usize, chunk_size: usize) -> Self {
        Self {
            max_size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn check(&self, declared: usize) -> SizeCheck {
        if declared > self.max_size {
            SizeCheck::TooLarge {
                declared,
                limit: self.max_size,
            }
        } else {
            SizeCheck::Ok
        }
    }

    /// Read and discard exactly `len` bytes, at most one chunk at a time.
    ///
    /// Returns the number of bytes discarded. Hitting EOF first is an
    /// `UnexpectedEof` error: the stream can no longer be resynchronized.
    pub async fn drain<R>(&self, reader: &mut R, len: usize) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.chunk_size.min(len.max(1))];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended with {remaining} of {len} oversized bytes undrained"),
                ));
            }
            remaining -= n;
        }
        debug!(bytes = len, "drained oversized message");
        Ok(len)
    }
}
