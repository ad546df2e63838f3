use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use xorlink_core::transport::{Connection, Connector, Listener, ListenerFactory};

/// A TCP connection wrapping a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: String,
}

impl TcpConnection {
    fn new(stream: net::TcpStream, peer_addr: String) -> Self {
        // Tokens and acks are tiny and strictly request/response.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Could not disable Nagle");
        }
        Self { stream, peer_addr }
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TCP connection")
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
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            let peer_addr = addr.to_string();
            debug!(peer = %peer_addr, "Accepted TCP connection");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}

/// Factory that binds [`TcpListener`] instances on the given address.
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, "TCP listener bound");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Opens outbound [`TcpConnection`]s.
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let stream = net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            let peer_addr = stream
                .peer_addr()
                .context("failed to retrieve peer address")?
                .to_string();
            debug!(peer = %peer_addr, "TCP connection established");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}
