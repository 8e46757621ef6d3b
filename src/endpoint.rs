//! Endpoint builder and runtime tasks.
//!
//! An [`Endpoint`] owns one connection to a Newton device and exposes it as
//! a stream of [`DockEvent`]s. Three tasks share the work:
//!
//! ```text
//!              ┌─────────────┐  bytes   ┌────────────────┐  events  ┌──────────┐
//! Transport ──►│ reader task │─────────►│ protocol task  │─────────►│ Endpoint │
//!              └─────────────┘          │ LinkEngine     │◄─────────│ (caller) │
//!              ┌─────────────┐  pages   │ EventBuffer    │ requests └──────────┘
//! Transport ◄──│ writer task │◄─────────│ T401/T403      │
//!              └─────────────┘          └────────────────┘
//! ```
//!
//! With [`Framing::Raw`] the protocol task decodes transport bytes directly
//! and sends go straight to the writer task, so a stalled peer shows up as
//! [`DockError::BackpressureTimeout`] on the send that could not be queued.
//! With [`Framing::Mnp`] bytes pass through the [`LinkEngine`] first, and the
//! task sleeps until the engine's next timer deadline.
//!
//! # Example
//!
//! ```ignore
//! use newtdock::protocol::{commands, status, DockEvent};
//! use newtdock::{Endpoint, Framing};
//!
//! let mut endpoint = Endpoint::builder()
//!     .framing(Framing::Mnp)
//!     .listen_tcp(("0.0.0.0", newtdock::transport::DOCK_PORT))
//!     .await?;
//!
//! let request = endpoint.receive_event(None).await?;
//! endpoint
//!     .send_event(&DockEvent::with_value(commands::RESULT, status::OK))
//!     .await?;
//! ```

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{EndpointConfig, EventConfig, Framing, LinkConfig, WriterConfig};
use crate::error::{DockError, Result};
use crate::link::{DisconnectReason, LinkEngine, LinkEvent, Role};
use crate::progress::{ProgressObserver, ProgressReporter};
use crate::protocol::{DockEvent, EventBuffer, Tag};
use crate::transport::{self, DockListener, DockStream};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Transport read size.
const READ_BUFFER_SIZE: usize = 4096;

/// Largest page handed to the protocol task or writer by one send.
const SEND_PAGE_SIZE: usize = 4096;

/// Decoded events held by the protocol task before it stops reading.
const MAX_QUEUED_EVENTS: usize = 64;

/// Events buffered between the protocol task and the caller.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Application bytes the link may hold before sends start waiting.
const MAX_LINK_BACKLOG: usize = 64 * 1024;

/// How long close waits for the LD frame to reach the transport.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

enum Request {
    Send(Bytes),
    Flush(oneshot::Sender<Result<()>>),
}

/// Builder for configuring and creating an endpoint.
pub struct EndpointBuilder {
    config: EndpointConfig,
    role: Role,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            config: EndpointConfig::default(),
            role: Role::Responder,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: [`Framing::Raw`]
    pub fn framing(mut self, framing: Framing) -> Self {
        self.config.framing = framing;
        self
    }

    /// Whether this side sends the first LR.
    ///
    /// Only meaningful with MNP framing. Default: responder, the desktop
    /// waits for the Newton to open the link.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Default wait for `receive_event(None)`.
    ///
    /// Default: 30 seconds
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    pub fn link(mut self, link: LinkConfig) -> Self {
        self.config.link = link;
        self
    }

    pub fn event(mut self, event: EventConfig) -> Self {
        self.config.event = event;
        self
    }

    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.config.writer = writer;
        self
    }

    /// Run over an already connected stream.
    pub fn build<S: DockStream>(self, stream: S) -> Result<Endpoint> {
        Endpoint::start(stream, self.config, self.role)
    }

    /// Connect to a listening dock. The link is opened from this side.
    pub async fn connect_tcp(mut self, addr: impl ToSocketAddrs) -> Result<Endpoint> {
        let stream = transport::connect(addr).await?;
        self.role = Role::Initiator;
        self.build(stream)
    }

    /// Wait for a single device connection.
    pub async fn listen_tcp(self, addr: impl ToSocketAddrs) -> Result<Endpoint> {
        let listener = DockListener::bind(addr).await?;
        let (stream, _peer) = listener.accept().await?;
        self.build(stream)
    }

    /// Wait for a single connection on a local socket.
    #[cfg(unix)]
    pub async fn listen_local(self, path: impl AsRef<Path>) -> Result<Endpoint> {
        let listener = transport::LocalListener::bind(path).await?;
        let stream = listener.accept().await?;
        self.build(stream)
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running dock connection.
///
/// One caller at a time: sends and receives take `&mut self`.
pub struct Endpoint {
    config: EndpointConfig,
    requests: mpsc::Sender<Request>,
    events: mpsc::Receiver<Result<DockEvent>>,
    /// Writer used by raw framing; MNP pages go through the link engine.
    direct: Option<WriterHandle>,
    /// Event taken off the channel by `is_event_ready`.
    ready: Option<Result<DockEvent>>,
    status: watch::Receiver<Option<DisconnectReason>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    suppress_count: usize,
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Run over an already connected stream with default configuration.
    pub fn from_stream<S: DockStream>(stream: S, framing: Framing) -> Result<Self> {
        EndpointBuilder::new().framing(framing).build(stream)
    }

    pub async fn connect_tcp(addr: impl ToSocketAddrs, framing: Framing) -> Result<Self> {
        EndpointBuilder::new().framing(framing).connect_tcp(addr).await
    }

    pub async fn listen_tcp(addr: impl ToSocketAddrs, framing: Framing) -> Result<Self> {
        EndpointBuilder::new().framing(framing).listen_tcp(addr).await
    }

    fn start<S: DockStream>(stream: S, config: EndpointConfig, role: Role) -> Result<Self> {
        config.validate()?;

        let link = match config.framing {
            Framing::Raw => None,
            Framing::Mnp => {
                let mut engine = LinkEngine::new(config.link.clone())?;
                if role == Role::Initiator {
                    engine.open(Instant::now())?;
                }
                Some(engine)
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(write_half, &config.writer);
        let direct = (config.framing == Framing::Raw).then(|| writer.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(config.writer.channel_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(None);

        tokio::spawn(read_loop(read_half, inbound_tx, shutdown_rx.clone()));

        let session = Session {
            link,
            events: EventBuffer::with_max_payload(config.event.max_payload_size),
            writer,
            queued: VecDeque::new(),
            flush_waiters: Vec::new(),
            drain_timeout: config.writer.backpressure_timeout,
        };
        let task = tokio::spawn(session.run(Channels {
            inbound: inbound_rx,
            requests: requests_rx,
            events: events_tx,
            status: status_tx,
            shutdown: shutdown_rx,
        }));

        tracing::debug!("endpoint started ({:?}, {:?})", config.framing, role);

        Ok(Self {
            config,
            requests: requests_tx,
            events: events_rx,
            direct,
            ready: None,
            status: status_rx,
            shutdown: shutdown_tx,
            task: Some(task),
            suppress_count: 0,
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.status.borrow()
    }

    fn check_connected(&self) -> Result<()> {
        match self.disconnect_reason() {
            Some(reason) => Err(reason.to_error()),
            None => Ok(()),
        }
    }

    /// Queue an event for sending.
    ///
    /// Returns once the event is queued; use [`flush`](Self::flush) to wait
    /// until the peer has it.
    pub async fn send_event(&mut self, event: &DockEvent) -> Result<()> {
        let bytes = event.encode_with_segment_size(self.config.event.stream_segment_size);
        self.send_pages(bytes, None).await
    }

    /// Queue an event, reporting progress at most once per `frequency` bytes.
    pub async fn send_event_with_progress(
        &mut self,
        event: &DockEvent,
        observer: &dyn ProgressObserver,
        frequency: usize,
    ) -> Result<()> {
        let bytes = event.encode_with_segment_size(self.config.event.stream_segment_size);
        let mut reporter = ProgressReporter::new(observer, bytes.len(), frequency);
        self.send_pages(bytes, Some(&mut reporter)).await
    }

    /// Send the contents of a file as one event.
    pub async fn send_file(&mut self, tag: Tag, path: impl AsRef<Path>) -> Result<()> {
        let event = DockEvent::from_file(tag, path).await?;
        self.send_event(&event).await
    }

    async fn send_pages(
        &mut self,
        bytes: Bytes,
        mut reporter: Option<&mut ProgressReporter<'_>>,
    ) -> Result<()> {
        self.check_connected()?;
        if let Some(reporter) = reporter.as_deref_mut() {
            reporter.advance(0);
        }
        if let Some(writer) = &self.direct {
            // Every page is reserved before the first one is queued, so a
            // backpressure failure leaves nothing of the event on the wire.
            let pages = bytes
                .len()
                .div_ceil(SEND_PAGE_SIZE)
                .clamp(1, writer.max_pending());
            let page_size = bytes.len().div_ceil(pages).max(1);
            let mut reservation = writer.reserve(pages).await?;
            let mut offset = 0;
            while offset < bytes.len() {
                let end = (offset + page_size).min(bytes.len());
                reservation.send(bytes.slice(offset..end)).await?;
                offset = end;
                if let Some(reporter) = reporter.as_deref_mut() {
                    reporter.advance(offset);
                }
            }
            return Ok(());
        }

        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + SEND_PAGE_SIZE).min(bytes.len());
            self.requests
                .send(Request::Send(bytes.slice(offset..end)))
                .await
                .map_err(|_| self.closed_error())?;
            offset = end;
            if let Some(reporter) = reporter.as_deref_mut() {
                reporter.advance(offset);
            }
        }
        Ok(())
    }

    /// Wait until everything sent so far has reached the peer.
    ///
    /// With MNP framing this means acknowledged by the peer; with raw
    /// framing, written to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_connected()?;
        if let Some(writer) = &self.direct {
            return writer.drain(self.config.writer.backpressure_timeout).await;
        }
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Flush(tx))
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Next event from the peer.
    ///
    /// `None` waits for the configured receive timeout, or without limit
    /// while timeouts are suppressed.
    pub async fn receive_event(&mut self, timeout: Option<Duration>) -> Result<DockEvent> {
        if let Some(ready) = self.ready.take() {
            return ready;
        }
        let timeout = match timeout {
            Some(timeout) => Some(timeout),
            None if self.suppress_count > 0 => None,
            None => Some(self.config.receive_timeout),
        };
        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.events.recv())
                .await
                .map_err(|_| DockError::Timeout)?,
            None => self.events.recv().await,
        };
        match received {
            Some(result) => result,
            None => Err(self.closed_error()),
        }
    }

    /// Whether `receive_event` would return without waiting.
    pub fn is_event_ready(&mut self) -> bool {
        if self.ready.is_none() {
            self.ready = self.events.try_recv().ok();
        }
        self.ready.is_some()
    }

    /// Suspend (`true`) or restore (`false`) the default receive timeout.
    ///
    /// Calls nest: the timeout applies again once every suspension has been
    /// matched by a restore.
    pub fn suppress_timeout(&mut self, suppress: bool) {
        if suppress {
            self.suppress_count += 1;
        } else {
            self.suppress_count = self.suppress_count.saturating_sub(1);
        }
    }

    pub fn is_timeout_suppressed(&self) -> bool {
        self.suppress_count > 0
    }

    /// Resolves once the connection has ended.
    pub async fn disconnected(&self) -> DisconnectReason {
        let mut status = self.status.clone();
        let reason = match status.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        reason.unwrap_or(DisconnectReason::TransportClosed)
    }

    /// Disconnect and wait for the runtime tasks to finish.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.direct.take() {
            let _ = writer.drain(CLOSE_DRAIN_TIMEOUT).await;
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("protocol task failed: {}", e);
            }
        }
        Ok(())
    }

    fn closed_error(&self) -> DockError {
        self.disconnect_reason()
            .map(DisconnectReason::to_error)
            .unwrap_or(DockError::Disconnected)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Read transport bytes until end of stream, error, or shutdown.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    inbound: mpsc::Sender<std::io::Result<Bytes>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            result = reader.read(&mut buf) => result,
        };
        let item = match result {
            Ok(0) => return,
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if inbound.send(item).await.is_err() || failed {
            return;
        }
    }
}

struct Channels {
    inbound: mpsc::Receiver<std::io::Result<Bytes>>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Sender<Result<DockEvent>>,
    status: watch::Sender<Option<DisconnectReason>>,
    shutdown: watch::Receiver<bool>,
}

/// State owned by the protocol task.
struct Session {
    link: Option<LinkEngine>,
    events: EventBuffer,
    writer: WriterHandle,
    queued: VecDeque<Result<DockEvent>>,
    flush_waiters: Vec<oneshot::Sender<Result<()>>>,
    drain_timeout: Duration,
}

impl Session {
    async fn run(mut self, mut channels: Channels) {
        let reason = match self.serve(&mut channels).await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!("endpoint failed: {}", e);
                let reason = if e.is_link_fatal() {
                    DisconnectReason::TransportClosed
                } else {
                    self.close_link().await;
                    DisconnectReason::Failed
                };
                self.queued.push_back(Err(e));
                reason
            }
        };
        tracing::debug!("endpoint disconnected: {:?}", reason);
        channels.status.send_replace(Some(reason));

        let error = reason.to_error();
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(reason.to_error()));
        }
        if reason == DisconnectReason::LocalRequest {
            return;
        }

        // Hand over what was decoded before the link ended.
        self.queued.push_back(Err(error));
        while let Some(item) = self.queued.pop_front() {
            tokio::select! {
                _ = channels.shutdown.changed() => return,
                sent = channels.events.send(item) => if sent.is_err() { return },
            }
        }
    }

    async fn serve(&mut self, channels: &mut Channels) -> Result<DisconnectReason> {
        if let Some(reason) = self.service_link().await? {
            return Ok(reason);
        }
        loop {
            let deadline = self.link.as_ref().and_then(LinkEngine::next_deadline);
            let sleep_until = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            // Raw endpoints never send requests; they write pages directly.
            let accepting = self
                .link
                .as_ref()
                .is_some_and(|link| link.queued_len() < MAX_LINK_BACKLOG);

            tokio::select! {
                _ = channels.shutdown.changed() => {
                    self.close_link().await;
                    return Ok(DisconnectReason::LocalRequest);
                }
                inbound = channels.inbound.recv(), if self.queued.len() < MAX_QUEUED_EVENTS => {
                    match inbound {
                        Some(Ok(data)) => self.on_inbound(&data)?,
                        Some(Err(e)) => {
                            tracing::error!("transport read failed: {}", e);
                            return Ok(DisconnectReason::TransportClosed);
                        }
                        None => {
                            tracing::debug!("transport closed by peer");
                            return Ok(DisconnectReason::TransportClosed);
                        }
                    }
                }
                request = channels.requests.recv(), if accepting => {
                    match request {
                        Some(Request::Send(page)) => self.on_send(&page)?,
                        Some(Request::Flush(waiter)) => self.on_flush(waiter).await,
                        None => {
                            self.close_link().await;
                            return Ok(DisconnectReason::LocalRequest);
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    if let Some(link) = self.link.as_mut() {
                        link.handle_timeout(Instant::now())?;
                    }
                }
                permit = channels.events.reserve(), if !self.queued.is_empty() => {
                    match (permit, self.queued.pop_front()) {
                        (Ok(permit), Some(item)) => permit.send(item),
                        (Err(_), _) => {
                            self.close_link().await;
                            return Ok(DisconnectReason::LocalRequest);
                        }
                        (Ok(_), None) => {}
                    }
                }
            }

            if let Some(reason) = self.service_link().await? {
                return Ok(reason);
            }
        }
    }

    fn on_inbound(&mut self, data: &[u8]) -> Result<()> {
        match self.link.as_mut() {
            Some(link) => link.receive(data, Instant::now()),
            None => {
                self.decode(data);
                Ok(())
            }
        }
    }

    fn on_send(&mut self, page: &[u8]) -> Result<()> {
        match self.link.as_mut() {
            Some(link) => link.send(page, Instant::now()),
            None => Ok(()),
        }
    }

    async fn on_flush(&mut self, waiter: oneshot::Sender<Result<()>>) {
        match &self.link {
            Some(link) if link.has_unacknowledged() => self.flush_waiters.push(waiter),
            _ => {
                let _ = waiter.send(self.writer.drain(self.drain_timeout).await);
            }
        }
    }

    fn decode(&mut self, data: &[u8]) {
        self.events.extend(data);
        loop {
            match self.events.next_event() {
                Ok(Some(event)) => {
                    tracing::trace!("received '{}' ({} bytes)", event.tag(), event.data_len());
                    self.queued.push_back(Ok(event));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("dropped event: {}", e);
                    self.queued.push_back(Err(e));
                }
            }
        }
    }

    /// Move bytes between the link engine and the other queues.
    ///
    /// Returns the reason once the link has gone down.
    async fn service_link(&mut self) -> Result<Option<DisconnectReason>> {
        let Some(link) = self.link.as_mut() else {
            return Ok(None);
        };
        let outbound = link.take_outbound();
        let delivered = link.take_delivered();
        let mut reason = None;
        while let Some(event) = link.poll_event() {
            match event {
                LinkEvent::Connected => tracing::debug!("link connected"),
                LinkEvent::Disconnected(r) => reason = Some(r),
            }
        }
        let settled = !link.has_unacknowledged();

        if let Some(page) = outbound {
            self.queue_link_frames(page)?;
        }
        if let Some(data) = delivered {
            self.decode(&data);
        }
        if settled && !self.flush_waiters.is_empty() {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
        if reason.is_some() {
            let _ = self.writer.drain(CLOSE_DRAIN_TIMEOUT).await;
        }
        Ok(reason)
    }

    /// Send LD (MNP framing) and give it a chance to reach the transport.
    async fn close_link(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.close() {
            tracing::debug!("link close failed: {}", e);
        }
        if let Some(page) = link.take_outbound() {
            if self.queue_link_frames(page).is_ok() {
                let _ = self.writer.drain(CLOSE_DRAIN_TIMEOUT).await;
            }
        }
    }

    /// Hand link frames to the writer without blocking the protocol task.
    ///
    /// Frames dropped on a full queue are recovered by T401 on whichever
    /// side is waiting for them.
    fn queue_link_frames(&self, page: Bytes) -> Result<()> {
        match self.writer.try_send(page) {
            Err(DockError::BackpressureTimeout) => {
                tracing::debug!(
                    "writer queue full ({} pages), dropped link frames",
                    self.writer.pending_count()
                );
                Ok(())
            }
            other => other,
        }
    }
}
