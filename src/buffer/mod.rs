//! Buffer module - the two byte stores the link layer is built on.
//!
//! - [`ChunkBuffer`]: unbounded FIFO made of fixed-size chunks
//! - [`CircleBuffer`]: fixed-capacity ring with record-boundary markers
//!
//! Neither type locks internally. Each instance is owned by exactly one task;
//! bytes cross between tasks over channels only.

mod chunk;
mod circle;

pub use chunk::{ChunkBuffer, CHUNK_SIZE};
pub use circle::{CircleBuffer, CopyStatus, MarkerEntry, ALIGN_RECORDS};
