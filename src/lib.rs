//! # newtdock
//!
//! Dock communications core for Newton devices.
//!
//! This crate carries dock events between a desktop and a Newton over any
//! duplex byte stream (TCP, a local socket, a serial line bridge).
//!
//! ## Architecture
//!
//! - **Buffers** ([`buffer`]): growable chunk FIFO and a fixed ring with
//!   record markers
//! - **Link layer** ([`link`]): MNP-style framing, CRC-16, sequenced
//!   transfers with acknowledgement and retransmission (T401) and an
//!   inactivity timer (T403)
//! - **Event layer** ([`protocol`]): 16-byte `newt`/`ntp ` headers, padded
//!   payloads and streamed (indeterminate-length) payloads
//! - **Endpoint** ([`Endpoint`]): reader, protocol and writer tasks tying it
//!   together behind `send_event` / `receive_event`
//!
//! ## Example
//!
//! ```ignore
//! use newtdock::protocol::{commands, status, DockEvent};
//! use newtdock::{Endpoint, Framing};
//!
//! #[tokio::main]
//! async fn main() -> newtdock::Result<()> {
//!     let mut endpoint = Endpoint::connect_tcp(("127.0.0.1", 3679), Framing::Raw).await?;
//!
//!     endpoint.send_event(&DockEvent::new(commands::CONNECT)).await?;
//!     let reply = endpoint.receive_event(None).await?;
//!     assert_eq!(reply.value(), Some(status::OK));
//!
//!     endpoint.close().await
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod link;
pub mod progress;
pub mod protocol;
pub mod transport;

mod backpressure;
mod endpoint;
mod writer;

pub use config::{EndpointConfig, Framing};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{DockError, Result};
pub use link::{DisconnectReason, Role};
pub use progress::ProgressObserver;
pub use protocol::{DockEvent, Tag};
