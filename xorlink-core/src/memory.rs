use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::transport::Connection;

/// An in-memory [`Connection`] backed by [`tokio::io::duplex`].
///
/// Used by session and client tests in place of a socket.
pub struct MemoryConnection {
    stream: DuplexStream,
    peer: String,
}

impl MemoryConnection {
    /// Creates two connected ends. `capacity` is the per-direction buffer
    /// size; writers block once it is full until the other end reads.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            Self {
                stream: a,
                peer: "memory:b".into(),
            },
            Self {
                stream: b,
                peer: "memory:a".into(),
            },
        )
    }
}

impl Connection for MemoryConnection {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from in-memory connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to in-memory connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down in-memory connection")
        }
    }
}
