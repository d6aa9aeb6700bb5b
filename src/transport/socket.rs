//! TCP socket transports.
//!
//! ```no_run
//! use objwire::transport::{SocketListener, SocketTransport};
//!
//! # async fn demo() -> objwire::Result<()> {
//! let listener = SocketListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?;
//! let client = SocketTransport::connect(addr).await?;
//! let (server, _peer) = listener.accept().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::{Transport, TransportConfig};
use crate::error::Result;

/// Payload size above which socket transports compress (when enabled).
pub const SOCKET_COMPRESSION_THRESHOLD: usize = 4 * 1024;

fn socket_config() -> TransportConfig {
    TransportConfig::new().with_compression_threshold(SOCKET_COMPRESSION_THRESHOLD)
}

/// Constructors for transports over TCP connections.
pub struct SocketTransport;

impl SocketTransport {
    /// Connect to a listening server.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Transport> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_tcp(stream)
    }

    /// Wrap an already-connected stream.
    pub fn from_tcp(stream: TcpStream) -> Result<Transport> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Transport::with_config(reader, writer, socket_config()))
    }
}

/// TCP listener producing one [`Transport`] per accepted connection.
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(Transport, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!(%peer, "accepted connection");
        Ok((SocketTransport::from_tcp(stream)?, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
