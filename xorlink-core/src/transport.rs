use std::future::Future;

use crate::error::SessionError;

/// A transport-agnostic byte-stream connection.
///
/// Provides identity (`peer`) and byte-level I/O (`read`, `write_all`,
/// `shutdown`) so sessions can run over TCP or an in-memory pipe without
/// knowing which one they hold.
pub trait Connection: Send + 'static {
    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"127.0.0.1:54321"`).
    fn peer(&self) -> String;

    /// Reads up to `buf.len()` bytes into `buf`, returning how many bytes
    /// were read.
    ///
    /// Returns `Ok(0)` when the remote end has closed the connection.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;

    /// Writes the entirety of `buf` to the connection.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half of the connection, signalling to the
    /// remote end that no more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// Helpers layered on top of [`Connection`].
pub trait ConnectionExt: Connection {
    /// Fills `buf` completely, issuing as many reads as needed.
    ///
    /// Every fixed-size protocol field goes through here. A peer that
    /// closes before the buffer is full yields
    /// [`SessionError::ConnectionClosed`] carrying the byte counts.
    fn read_full<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'a
    where
        Self: Sized,
    {
        async move {
            let mut filled = 0;
            while filled < buf.len() {
                let n = self
                    .read(&mut buf[filled..])
                    .await
                    .map_err(SessionError::from_transport)?;
                if n == 0 {
                    return Err(SessionError::ConnectionClosed {
                        expected: buf.len(),
                        received: filled,
                    });
                }
                filled += n;
            }
            Ok(())
        }
    }

    /// Like [`Connection::write_all`], but maps failures into
    /// [`SessionError::Transport`].
    fn send_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'a
    where
        Self: Sized,
    {
        async move {
            self.write_all(buf)
                .await
                .map_err(SessionError::from_transport)
        }
    }
}

impl<C: Connection> ConnectionExt for C {}

/// An async listener that accepts incoming [`Connection`]s.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local address the listener is bound to
    /// (e.g. `"127.0.0.1:55555"`).
    fn local_addr(&self) -> String;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// Separating creation from usage lets the engine remain generic: pass a
/// TCP factory in production and an in-memory one in tests.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    ///
    /// Use `"<ip>:0"` to let the OS assign an available port.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}

/// Factory for creating outbound [`Connection`]s (client side).
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to the given address.
    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;

    #[tokio::test]
    async fn given_split_writes_when_read_full_then_buffer_is_assembled() {
        let (mut a, mut b) = MemoryConnection::pair(64);
        a.write_all(b"CH").await.unwrap();
        a.write_all(b"AT\0\0\0\0").await.unwrap();

        let mut token = [0u8; 8];
        b.read_full(&mut token).await.unwrap();
        assert_eq!(&token, b"CHAT\0\0\0\0");
    }

    #[tokio::test]
    async fn given_peer_closes_early_when_read_full_then_connection_closed() {
        let (mut a, mut b) = MemoryConnection::pair(64);
        a.write_all(b"abc").await.unwrap();
        a.shutdown().await.unwrap();

        let mut buf = [0u8; 8];
        let err = b.read_full(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ConnectionClosed {
                expected: 8,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn given_empty_buffer_when_read_full_then_returns_immediately() {
        let (_a, mut b) = MemoryConnection::pair(8);
        let mut buf = [0u8; 0];
        b.read_full(&mut buf).await.unwrap();
    }
}
