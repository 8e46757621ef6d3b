//! Growable FIFO of fixed-size chunks.
//!
//! Bytes are appended to the last chunk and consumed from the first one.
//! A fresh chunk is allocated only when the last one is full, and an
//! exhausted chunk is released from the front, except when it is the only
//! one left, in which case it is rewound so steady-state traffic does not
//! churn the allocator.
//!
//! # Example
//!
//! ```
//! use newtdock::buffer::ChunkBuffer;
//!
//! let mut buf = ChunkBuffer::new();
//! buf.write(b"hello").unwrap();
//!
//! let mut out = [0u8; 5];
//! assert_eq!(buf.read(&mut out), 5);
//! assert_eq!(&out, b"hello");
//! assert!(buf.is_empty());
//! ```

use std::collections::VecDeque;

use crate::error::{DockError, Result};

/// Capacity of a single chunk in bytes.
pub const CHUNK_SIZE: usize = 1024;

/// One block of the buffer.
///
/// Invariant: `out_cursor <= in_cursor <= CHUNK_SIZE`.
struct Chunk {
    data: Vec<u8>,
    in_cursor: usize,
    out_cursor: usize,
}

impl Chunk {
    fn new() -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(CHUNK_SIZE)
            .map_err(|_| DockError::OutOfMemory)?;
        data.resize(CHUNK_SIZE, 0);
        Ok(Self {
            data,
            in_cursor: 0,
            out_cursor: 0,
        })
    }

    fn rewind(&mut self) {
        self.in_cursor = 0;
        self.out_cursor = 0;
    }

    #[inline]
    fn filled(&self) -> usize {
        self.in_cursor - self.out_cursor
    }

    #[inline]
    fn space(&self) -> usize {
        CHUNK_SIZE - self.in_cursor
    }

    fn write(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.space());
        self.data[self.in_cursor..self.in_cursor + src.len()].copy_from_slice(src);
        self.in_cursor += src.len();
    }

    /// Returns true once the chunk has been drained.
    fn read(&mut self, dst: &mut [u8]) -> bool {
        debug_assert!(dst.len() <= self.filled());
        dst.copy_from_slice(&self.data[self.out_cursor..self.out_cursor + dst.len()]);
        self.out_cursor += dst.len();
        self.out_cursor >= self.in_cursor
    }
}

/// Unbounded byte FIFO.
#[derive(Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Chunk>,
}

impl ChunkBuffer {
    /// Create an empty buffer. No chunk is allocated until the first write.
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    /// Total number of bytes available to read.
    ///
    /// Walks every chunk; callers on a hot path should track the size
    /// themselves.
    pub fn size(&self) -> usize {
        self.chunks.iter().map(Chunk::filled).sum()
    }

    /// Check if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.filled() == 0)
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Return the chunk being written to, growing the buffer when it is full.
    fn tail_with_space(&mut self) -> Result<&mut Chunk> {
        let needs_chunk = self.chunks.back().map_or(true, |c| c.space() == 0);
        if needs_chunk {
            self.chunks
                .try_reserve(1)
                .map_err(|_| DockError::OutOfMemory)?;
            self.chunks.push_back(Chunk::new()?);
        }
        self.chunks.back_mut().ok_or(DockError::OutOfMemory)
    }

    /// Append all of `src`.
    ///
    /// Fails only if a new chunk cannot be allocated; bytes written before
    /// the failure stay in the buffer.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < src.len() {
            let chunk = self.tail_with_space()?;
            let n = (src.len() - written).min(chunk.space());
            chunk.write(&src[written..written + n]);
            written += n;
        }
        Ok(written)
    }

    /// Remove `dst.len()` bytes from the front into `dst`.
    ///
    /// The caller is expected to have checked `dst.len() <= size()`; if it
    /// did not, the read stops short and the returned count says so.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        debug_assert!(dst.len() <= self.size());
        let mut read = 0;
        while read < dst.len() {
            let single = self.chunks.len() == 1;
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let n = (dst.len() - read).min(chunk.filled());
            if n == 0 {
                break;
            }
            if chunk.read(&mut dst[read..read + n]) {
                if single {
                    chunk.rewind();
                } else {
                    self.chunks.pop_front();
                }
            }
            read += n;
        }
        read
    }

    /// Release every chunk, returning to the just-constructed state.
    pub fn flush(&mut self) {
        self.chunks.clear();
        self.chunks.shrink_to_fit();
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("chunks", &self.chunks.len())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = ChunkBuffer::new();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.chunk_count(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_grows_one_chunk_at_a_time() {
        let mut buf = ChunkBuffer::new();

        buf.write(&[1u8; CHUNK_SIZE]).unwrap();
        assert_eq!(buf.chunk_count(), 1);

        buf.write(&[2u8; 1]).unwrap();
        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(buf.size(), CHUNK_SIZE + 1);
    }

    #[test]
    fn test_read_across_chunk_boundary_drops_front_chunk() {
        let mut buf = ChunkBuffer::new();
        let data: Vec<u8> = (0..CHUNK_SIZE + 10).map(|i| i as u8).collect();
        buf.write(&data).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE + 5];
        assert_eq!(buf.read(&mut out), CHUNK_SIZE + 5);
        assert_eq!(&out[..], &data[..CHUNK_SIZE + 5]);
        assert_eq!(buf.chunk_count(), 1);
        assert_eq!(buf.size(), 5);
    }

    #[test]
    fn test_draining_sole_chunk_rewinds_it() {
        let mut buf = ChunkBuffer::new();
        buf.write(b"abc").unwrap();

        let mut out = [0u8; 3];
        buf.read(&mut out);

        // The chunk is kept and reused from the start.
        assert_eq!(buf.chunk_count(), 1);
        buf.write(&[7u8; CHUNK_SIZE]).unwrap();
        assert_eq!(buf.chunk_count(), 1);
    }

    #[test]
    fn test_flush_releases_everything() {
        let mut buf = ChunkBuffer::new();
        buf.write(&[0u8; 3 * CHUNK_SIZE]).unwrap();
        assert_eq!(buf.chunk_count(), 3);

        buf.flush();
        assert_eq!(buf.chunk_count(), 0);
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn test_empty_write_allocates_nothing() {
        let mut buf = ChunkBuffer::new();
        assert_eq!(buf.write(&[]).unwrap(), 0);
        assert_eq!(buf.chunk_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_fifo_order_survives_arbitrary_splits(
            data in proptest::collection::vec(any::<u8>(), 0..5000),
            write_sizes in proptest::collection::vec(1usize..700, 1..20),
            read_sizes in proptest::collection::vec(1usize..900, 1..20),
        ) {
            let mut buf = ChunkBuffer::new();
            let mut out = Vec::new();
            let mut written = 0;
            let mut w = write_sizes.iter().cycle();
            let mut r = read_sizes.iter().cycle();

            while written < data.len() || !buf.is_empty() {
                if written < data.len() {
                    let n = (*w.next().unwrap()).min(data.len() - written);
                    buf.write(&data[written..written + n]).unwrap();
                    written += n;
                }

                let available = buf.size();
                let n = (*r.next().unwrap()).min(available);
                let mut chunk = vec![0u8; n];
                prop_assert_eq!(buf.read(&mut chunk), n);
                prop_assert_eq!(buf.size(), available - n);
                out.extend_from_slice(&chunk);
            }

            prop_assert_eq!(out, data);
        }
    }
}
