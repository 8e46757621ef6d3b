//! Transport module - duplex byte streams a dock endpoint can run over.
//!
//! - TCP (Newton Connection Utilities port, emulators, bridges)
//! - Unix Domain Sockets (local serial bridges, Linux/macOS)
//!
//! Anything else implementing [`DockStream`] (a serial device opened with a
//! tokio-compatible driver, `tokio::io::duplex` in tests) works as well.

#[cfg(unix)]
mod local;
mod tcp;

use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(unix)]
pub use local::{generate_socket_path, LocalListener, SocketCleanup};
pub use tcp::{connect, DockListener, DOCK_PORT};

/// Byte-level duplex stream consumed by an endpoint.
pub trait DockStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DockStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
