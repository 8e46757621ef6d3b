//! Fixed-capacity byte ring with record-boundary markers.
//!
//! Producers write raw bytes into the ring as they arrive and stamp a
//! [`MarkerEntry`] wherever a logical record ends. Consumers then pull exactly
//! one record at a time with [`CircleBuffer::copy_out`] without rescanning the
//! bytes, because the boundary was recorded when the record was assembled.
//!
//! Both the byte ring and the marker ring keep one slot empty, so
//! `buffer_space() + buffer_count() == capacity() - 1` at all times.
//!
//! ```text
//!   get_index            pending_put_index
//!      │   committed bytes    │ staged bytes (invisible to readers)
//!      ▼───────────────────▼──▼
//!  ────[r1 r1 r1|r2 r2 r2 r2]·····──── ring
//!                ▲           ▲
//!            marker 0     marker 1
//!                        put_index
//! ```

use crate::buffer::ChunkBuffer;
use crate::error::{DockError, Result};

/// Alignment flag: records start on 4-byte boundaries.
///
/// When set, every end-of-record marker is followed by padding up to the next
/// long, written with the marker and skipped by the reader once the record
/// has been consumed. A record whose padding does not fit is refused with
/// `BufferFull` before anything is marked.
pub const ALIGN_RECORDS: u8 = 0x01;

/// End-of-record marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerEntry {
    /// Ring offset one past the last byte of the record.
    pub offset: u32,
    /// Caller-defined tag stored with the boundary.
    pub aux: u32,
}

/// Outcome of a successful read from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// Data was transferred and the read stopped short of any boundary.
    Ok,
    /// The read ended exactly on a marker; the marker's aux value is returned
    /// and the marker has been consumed.
    RecordComplete(u32),
    /// The caller's request was satisfied in full.
    Drained,
}

/// Circular byte FIFO with an auxiliary ring of record markers.
#[derive(Debug, Default)]
pub struct CircleBuffer {
    buf: Vec<u8>,
    get_index: usize,
    put_index: usize,
    /// Put cursor for staged writes, committed by `put_next_commit`.
    pending_put_index: usize,
    alignment_flags: u8,
    markers: Vec<MarkerEntry>,
    get_marker_index: usize,
    put_marker_index: usize,
}

#[inline]
fn align_long(n: usize) -> usize {
    (n + 3) & !3
}

impl CircleBuffer {
    /// Allocate a ring of at least `byte_capacity` bytes (rounded up to a
    /// multiple of four) able to hold `marker_capacity` pending markers.
    ///
    /// A marker capacity of zero disables markers.
    pub fn allocate(byte_capacity: usize, marker_capacity: usize) -> Result<Self> {
        let mut ring = Self::default();
        ring.reallocate(byte_capacity, marker_capacity, 0)?;
        Ok(ring)
    }

    /// Allocate with alignment flags (see [`ALIGN_RECORDS`]).
    pub fn allocate_aligned(
        byte_capacity: usize,
        marker_capacity: usize,
        alignment_flags: u8,
    ) -> Result<Self> {
        let mut ring = Self::default();
        ring.reallocate(byte_capacity, marker_capacity, alignment_flags)?;
        Ok(ring)
    }

    /// Replace the backing storage, discarding any buffered data.
    pub fn reallocate(
        &mut self,
        byte_capacity: usize,
        marker_capacity: usize,
        alignment_flags: u8,
    ) -> Result<()> {
        self.deallocate();

        let len = align_long(byte_capacity.max(1));
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| DockError::OutOfMemory)?;
        buf.resize(len, 0);

        let mut markers = Vec::new();
        if marker_capacity != 0 {
            let slots = marker_capacity + 1;
            markers
                .try_reserve_exact(slots)
                .map_err(|_| DockError::OutOfMemory)?;
            markers.resize(
                slots,
                MarkerEntry {
                    offset: u32::MAX,
                    aux: 0,
                },
            );
        }

        self.buf = buf;
        self.markers = markers;
        self.alignment_flags = alignment_flags;
        self.reset();
        Ok(())
    }

    /// Free the backing storage. The ring reports zero capacity afterwards.
    pub fn deallocate(&mut self) {
        self.buf = Vec::new();
        self.markers = Vec::new();
        self.reset();
    }

    /// Clear all cursors without releasing storage.
    pub fn reset(&mut self) {
        self.get_index = 0;
        self.put_index = 0;
        self.pending_put_index = 0;
        self.get_marker_index = 0;
        self.put_marker_index = 0;
    }

    /// Rewind the get cursor to the start of the ring.
    pub fn reset_start(&mut self) {
        self.get_index = 0;
    }

    /// Size of the ring in bytes (one more than can be buffered).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of markers the ring can hold at once.
    #[inline]
    pub fn marker_capacity(&self) -> usize {
        self.markers.len().saturating_sub(1)
    }

    /// Bytes currently buffered.
    pub fn buffer_count(&self) -> usize {
        let len = self.buf.len();
        if len == 0 {
            return 0;
        }
        (self.put_index + len - self.get_index) % len
    }

    /// Bytes that can still be written.
    pub fn buffer_space(&self) -> usize {
        let len = self.buf.len();
        if len == 0 {
            return 0;
        }
        (self.get_index + len - self.put_index - 1) % len
    }

    /// Check a record of `required` bytes (with its marker and alignment
    /// padding, when enabled) fits.
    pub fn check_space(&self, required: usize) -> Result<()> {
        if !self.markers.is_empty() && self.marker_space() == 0 {
            return Err(DockError::MarkersFull);
        }
        let end = (self.put_index + required) & 3;
        if self.buffer_space() < required + self.record_padding(end) {
            return Err(DockError::BufferFull);
        }
        Ok(())
    }

    #[inline]
    fn aligns_records(&self) -> bool {
        self.alignment_flags & ALIGN_RECORDS != 0
    }

    /// Padding that follows a record ending at ring offset `end`.
    #[inline]
    fn record_padding(&self, end: usize) -> usize {
        if self.aligns_records() {
            (4 - (end & 3)) & 3
        } else {
            0
        }
    }

    /// Free bytes if the put cursor were at `put`.
    fn space_from(&self, put: usize) -> usize {
        let len = self.buf.len();
        if len == 0 {
            return 0;
        }
        (self.get_index + len - put - 1) % len
    }

    /// Markers waiting to be consumed.
    pub fn marker_count(&self) -> usize {
        let n = self.markers.len();
        if n == 0 {
            return 0;
        }
        (self.put_marker_index + n - self.get_marker_index) % n
    }

    /// Markers that can still be queued.
    pub fn marker_space(&self) -> usize {
        let n = self.markers.len();
        if n == 0 {
            return 0;
        }
        (self.get_marker_index + n - self.put_marker_index - 1) % n
    }

    #[inline]
    fn advance(&self, index: usize, delta: usize) -> usize {
        let i = index + delta;
        if i >= self.buf.len() {
            i - self.buf.len()
        } else {
            i
        }
    }

    /// Copy `src` into the ring at the put cursor, splitting at the wrap.
    fn write_at_put(&mut self, src: &[u8]) {
        let first = src.len().min(self.buf.len() - self.put_index);
        self.buf[self.put_index..self.put_index + first].copy_from_slice(&src[..first]);
        self.buf[..src.len() - first].copy_from_slice(&src[first..]);
        self.put_index = self.advance(self.put_index, src.len());
    }

    /// Copy from the get cursor into `dst` without consuming.
    fn read_at_get(&self, dst: &mut [u8]) {
        let first = dst.len().min(self.buf.len() - self.get_index);
        dst[..first].copy_from_slice(&self.buf[self.get_index..self.get_index + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.buf[..rest]);
    }

    /// Copy as much of `src` as fits.
    ///
    /// With `eom = Some(aux)` a marker is placed after the last byte, but only
    /// when all of `src` was stored; a partial copy leaves the record open so
    /// the caller can finish it once space frees up. On an aligned ring the
    /// last byte is held back until the record's padding fits as well.
    ///
    /// Returns the number of bytes copied. Fails with `BufferFull` when not a
    /// single byte fits and with `MarkersFull` (before copying anything) when a
    /// marker was requested but the marker ring is saturated.
    pub fn copy_in(&mut self, src: &[u8], eom: Option<u32>) -> Result<usize> {
        if eom.is_some() && self.marker_space() == 0 {
            return Err(DockError::MarkersFull);
        }
        let space = self.buffer_space();
        let mut n = src.len().min(space);
        if eom.is_some() && n == src.len() && n > 0 {
            let end = self.advance(self.put_index, n);
            if space < n + self.record_padding(end) {
                n -= 1;
            }
        }
        if n == 0 && !src.is_empty() {
            return Err(DockError::BufferFull);
        }
        self.write_at_put(&src[..n]);
        if let Some(aux) = eom {
            if n == src.len() {
                self.put_eom(aux)?;
            }
        }
        Ok(n)
    }

    /// Move up to `*remaining` bytes out of a [`ChunkBuffer`], decrementing
    /// `*remaining` by the amount moved.
    pub fn copy_in_from_chunks(
        &mut self,
        src: &mut ChunkBuffer,
        remaining: &mut usize,
    ) -> Result<usize> {
        let wanted = (*remaining).min(src.size());
        let n = wanted.min(self.buffer_space());
        if n == 0 && wanted != 0 {
            return Err(DockError::BufferFull);
        }

        let first = n.min(self.buf.len() - self.put_index);
        let put = self.put_index;
        let mut copied = src.read(&mut self.buf[put..put + first]);
        if copied == first {
            copied += src.read(&mut self.buf[..n - first]);
        }
        self.put_index = self.advance(self.put_index, copied);
        *remaining -= copied;
        Ok(copied)
    }

    /// Copy into `dst` up to the next marker or `dst.len()`, whichever is
    /// smaller.
    ///
    /// Returns the byte count and [`CopyStatus::RecordComplete`] when the copy
    /// reached a marker exactly, [`CopyStatus::Drained`] when `dst` was filled,
    /// or [`CopyStatus::Ok`] when the ring ran dry first.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> Result<(usize, CopyStatus)> {
        let (count, bounded) = self.buffer_count_to_next_marker();
        let n = count.min(dst.len());
        self.read_at_get(&mut dst[..n]);
        self.get_index = self.advance(self.get_index, n);

        if bounded && n == count {
            let aux = self.take_marker().map_or(0, |m| m.aux);
            if self.aligns_records() {
                self.align_get_long();
            }
            return Ok((n, CopyStatus::RecordComplete(aux)));
        }
        if n == dst.len() {
            return Ok((n, CopyStatus::Drained));
        }
        Ok((n, CopyStatus::Ok))
    }

    /// Bytes up to the next marker (or all buffered bytes if no marker lies
    /// within them), and whether a marker bounds the count.
    pub fn buffer_count_to_next_marker(&self) -> (usize, bool) {
        let count = self.buffer_count();
        if let Some(marker) = self.peek_next_marker() {
            let len = self.buf.len();
            let to_marker = (marker.offset as usize + len - self.get_index) % len;
            if to_marker <= count {
                return (to_marker, true);
            }
        }
        (count, false)
    }

    /// Queue a marker at `offset`.
    pub fn put_eom_mark(&mut self, offset: usize, aux: u32) -> Result<()> {
        debug_assert!(offset < self.buf.len());
        if self.marker_space() == 0 {
            return Err(DockError::MarkersFull);
        }
        self.markers[self.put_marker_index] = MarkerEntry {
            offset: offset as u32,
            aux,
        };
        self.put_marker_index = (self.put_marker_index + 1) % self.markers.len();
        Ok(())
    }

    /// Mark the current put position as the end of a record.
    pub fn put_eom(&mut self, aux: u32) -> Result<()> {
        self.close_record(self.put_index, aux)
    }

    /// Mark the end of the staged record and commit it.
    pub fn put_next_eom(&mut self, aux: u32) -> Result<()> {
        self.close_record(self.pending_put_index, aux)
    }

    /// Mark a record ending at `end`, publish it and write its padding.
    ///
    /// Nothing changes unless both the marker and the padding fit.
    fn close_record(&mut self, end: usize, aux: u32) -> Result<()> {
        if self.marker_space() == 0 {
            return Err(DockError::MarkersFull);
        }
        let padding = self.record_padding(end);
        if self.space_from(end) < padding {
            return Err(DockError::BufferFull);
        }
        self.put_eom_mark(end, aux)?;
        self.put_index = self.advance(end, padding);
        self.pending_put_index = self.put_index;
        Ok(())
    }

    /// Look at the next marker without consuming it.
    pub fn peek_next_marker(&self) -> Option<MarkerEntry> {
        if self.marker_count() == 0 {
            return None;
        }
        Some(self.markers[self.get_marker_index])
    }

    /// Consume the next marker.
    pub fn take_marker(&mut self) -> Option<MarkerEntry> {
        let marker = self.peek_next_marker()?;
        self.markers[self.get_marker_index].offset = u32::MAX;
        self.get_marker_index = (self.get_marker_index + 1) % self.markers.len();
        Some(marker)
    }

    /// Discard bytes up to and including the next marker, returning its aux
    /// value.
    pub fn flush_to_next_marker(&mut self) -> Result<u32> {
        let marker = self.take_marker().ok_or(DockError::NoMarker)?;
        self.get_index = marker.offset as usize;
        if self.aligns_records() {
            self.align_get_long();
        }
        Ok(marker.aux)
    }

    /// Discard every buffered byte and marker.
    pub fn flush_bytes(&mut self) {
        while self.take_marker().is_some() {}
        self.get_index = self.put_index;
    }

    /// Move as many bytes as fit from `src` into this ring.
    ///
    /// Fails with `BufferEmpty` when `src` has nothing and `BufferFull` when
    /// this ring has no room.
    pub fn get_bytes(&mut self, src: &mut CircleBuffer) -> Result<usize> {
        let available = src.buffer_count();
        if available == 0 {
            return Err(DockError::BufferEmpty);
        }
        let n = available.min(self.buffer_space());
        if n == 0 {
            return Err(DockError::BufferFull);
        }
        for _ in 0..n {
            self.buf[self.put_index] = src.buf[src.get_index];
            self.put_index = self.advance(self.put_index, 1);
            src.get_index = src.advance(src.get_index, 1);
        }
        Ok(n)
    }

    /// Consume one byte. A marker reached by the byte is consumed silently.
    pub fn get_next_byte(&mut self) -> Result<u8> {
        self.get_next_byte_marked().map(|(byte, _)| byte)
    }

    /// Consume one byte, reporting `RecordComplete` when it was the last
    /// byte of a record.
    pub fn get_next_byte_marked(&mut self) -> Result<(u8, CopyStatus)> {
        if self.get_index == self.put_index {
            return Err(DockError::BufferEmpty);
        }
        let byte = self.buf[self.get_index];
        let next = self.advance(self.get_index, 1);
        self.get_index = next;
        match self.peek_next_marker() {
            Some(marker) if marker.offset as usize == next => {
                self.take_marker();
                if self.aligns_records() {
                    self.align_get_long();
                }
                Ok((byte, CopyStatus::RecordComplete(marker.aux)))
            }
            _ => Ok((byte, CopyStatus::Ok)),
        }
    }

    /// Look at the next byte without consuming it.
    pub fn peek_next_byte(&self) -> Result<u8> {
        if self.get_index == self.put_index {
            return Err(DockError::BufferEmpty);
        }
        Ok(self.buf[self.get_index])
    }

    /// Look at the next byte and whether it ends a record. Nothing is
    /// consumed, including the marker.
    pub fn peek_next_byte_marked(&self) -> Result<(u8, CopyStatus)> {
        let byte = self.peek_next_byte()?;
        let next = self.advance(self.get_index, 1);
        match self.peek_next_marker() {
            Some(marker) if marker.offset as usize == next => {
                Ok((byte, CopyStatus::RecordComplete(marker.aux)))
            }
            _ => Ok((byte, CopyStatus::Ok)),
        }
    }

    /// Append one byte.
    pub fn put_next_byte(&mut self, byte: u8) -> Result<()> {
        let next = self.advance(self.put_index, 1);
        if next == self.get_index || self.buf.is_empty() {
            return Err(DockError::BufferFull);
        }
        self.buf[self.put_index] = byte;
        self.put_index = next;
        Ok(())
    }

    /// Append one byte and close the record with `aux`.
    pub fn put_next_byte_marked(&mut self, byte: u8, aux: u32) -> Result<()> {
        self.check_space(1)?;
        if self.markers.is_empty() {
            return Err(DockError::MarkersFull);
        }
        self.put_next_byte(byte)?;
        self.put_eom(aux)
    }

    /// Begin a staged record at the put cursor.
    pub fn put_next_start(&mut self) {
        self.pending_put_index = self.put_index;
    }

    /// Begin a staged record and stage its first byte.
    pub fn put_first_possible(&mut self, byte: u8) -> Result<()> {
        self.put_next_start();
        self.put_next_possible(byte)
    }

    /// Stage one byte. Staged bytes are invisible to readers until
    /// [`put_next_commit`](Self::put_next_commit) or
    /// [`put_next_eom`](Self::put_next_eom).
    pub fn put_next_possible(&mut self, byte: u8) -> Result<()> {
        let next = self.advance(self.pending_put_index, 1);
        if next == self.get_index || self.buf.is_empty() {
            return Err(DockError::BufferFull);
        }
        self.buf[self.pending_put_index] = byte;
        self.pending_put_index = next;
        Ok(())
    }

    /// Number of bytes staged since the last `put_next_start`.
    pub fn staged_count(&self) -> usize {
        let len = self.buf.len();
        if len == 0 {
            return 0;
        }
        (self.pending_put_index + len - self.put_index) % len
    }

    /// Publish the staged bytes.
    pub fn put_next_commit(&mut self) {
        self.put_index = self.pending_put_index;
    }

    /// Round the get cursor up to the next 4-byte boundary, never past the
    /// put cursor.
    pub fn align_get_long(&mut self) {
        let skip = ((4 - (self.get_index & 3)) & 3).min(self.buffer_count());
        self.get_index = self.advance(self.get_index, skip);
    }

    /// Round the put cursor up to the next 4-byte boundary.
    ///
    /// Fails with `BufferFull`, leaving the cursor alone, when the padding
    /// would run into the get cursor.
    pub fn align_put_long(&mut self) -> Result<()> {
        let padding = (4 - (self.put_index & 3)) & 3;
        if padding > self.buffer_space() {
            return Err(DockError::BufferFull);
        }
        self.put_index = self.advance(self.put_index, padding);
        self.pending_put_index = self.put_index;
        Ok(())
    }
}
