//! Dedicated writer task for outbound pages.
//!
//! The endpoint never writes to the transport directly. Encoded events (raw
//! framing) are split into pages under one reservation, MNP frames (link
//! framing) go one per page; the writer task drains the channel in batches
//! and hands them to the transport with scatter/gather I/O.
//!
//! # Architecture
//!
//! ```text
//! Endpoint / protocol task ─► mpsc::Sender<Bytes> ─► Writer Task ─► Transport
//!                         │
//!                  BackpressureController (pending pages)
//! ```

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, BackpressureGuard};
use crate::config::WriterConfig;
use crate::error::{DockError, Result};

/// Maximum pages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending pages to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<Bytes>, backpressure: BackpressureController) -> Self {
        Self { tx, backpressure }
    }

    /// Reserve slots for the pages of one event, waiting while the queue is
    /// full.
    ///
    /// Fails with [`DockError::BackpressureTimeout`] before anything is
    /// queued, so the caller may retry the whole event once the peer drains.
    pub async fn reserve(&self, pages: usize) -> Result<Reservation<'_>> {
        let pages = pages.max(1);
        self.backpressure.reserve_many(pages).await?;
        Ok(Reservation {
            tx: &self.tx,
            backpressure: &self.backpressure,
            guard: BackpressureGuard::with_count(self.backpressure.clone(), pages),
        })
    }

    /// Queue a page without waiting.
    ///
    /// Used for link frames, which the link layer retransmits if they are
    /// dropped here.
    pub fn try_send(&self, page: Bytes) -> Result<()> {
        if page.is_empty() {
            return Ok(());
        }
        self.backpressure.try_reserve()?;
        let guard = BackpressureGuard::new(self.backpressure.clone());
        self.tx.try_send(page).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DockError::BackpressureTimeout,
            mpsc::error::TrySendError::Closed(_) => DockError::Disconnected,
        })?;
        guard.disarm();
        Ok(())
    }

    /// Wait until every queued page has reached the transport.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        self.backpressure.wait_idle(timeout).await.map_err(|pending| {
            tracing::debug!("drain gave up with {} pages pending", pending);
            DockError::Timeout
        })
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Pages that may be queued before senders wait.
    #[inline]
    pub fn max_pending(&self) -> usize {
        self.backpressure.max_pending()
    }
}

/// Writer slots held for one event.
///
/// Unused slots are released on drop.
pub struct Reservation<'a> {
    tx: &'a mpsc::Sender<Bytes>,
    backpressure: &'a BackpressureController,
    guard: BackpressureGuard,
}

impl Reservation<'_> {
    /// Queue the next page of the event.
    pub async fn send(&mut self, page: Bytes) -> Result<()> {
        if page.is_empty() {
            return Ok(());
        }
        if self.guard.remaining() == 0 {
            self.backpressure.reserve().await?;
            self.guard.add(1);
        }
        self.tx
            .send(page)
            .await
            .map_err(|_| DockError::Disconnected)?;
        self.guard.hand_over();
        Ok(())
    }
}

/// Spawn the writer task and return a handle for sending pages.
///
/// The task ends cleanly once every handle is dropped, or with the first
/// transport error.
pub fn spawn_writer_task<W>(writer: W, config: &WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_pages, config.backpressure_timeout);

    let handle = WriterHandle::new(tx, backpressure.clone());
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(page) => batch.push(page),
                Err(_) => break,
            }
        }

        let count = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(count);
        batch.clear();

        if let Err(e) = result {
            tracing::error!("writer task failed: {}", e);
            // Release whatever is still queued so waiters do not stall.
            rx.close();
            while rx.try_recv().is_ok() {
                backpressure.release();
            }
            return Err(e);
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of pages using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(DockError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes`.
fn remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for page in batch {
        let end = offset + page.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&page[start..]));
        }
        offset = end;
    }

    slices
}
