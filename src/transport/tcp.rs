//! TCP transport.
//!
//! TCP is reliable and ordered, so endpoints over TCP normally use raw
//! framing; MNP framing still works for bridges that forward serial bytes
//! unchanged.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::Result;

/// Port the desktop dock listens on.
pub const DOCK_PORT: u16 = 3679;

/// Connect to a listening dock.
pub async fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Listener for incoming dock connections.
pub struct DockListener {
    listener: TcpListener,
}

impl DockListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!("listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!("accepted dock connection from {}", peer);
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
